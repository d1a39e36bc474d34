//! Framed envelope I/O over a byte stream.
//!
//! Both the server and the client speak the same framing: a stream of
//! [`protocol`] frames, each carrying one MessagePack [`Envelope`].

use std::io;

use bytes::{Buf, BytesMut};
use protocol::{Envelope, FrameCodec, Message, ProtocolError, FRAME_HEADER_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Initial capacity of a reader's buffer.
const READ_BUFFER_CAPACITY: usize = 8 * 1024;

/// Magic plus length, the part of the header that precedes the flags byte.
const PREFIX_LEN: usize = FRAME_HEADER_SIZE - 1;

/// Errors that can occur on a bridge connection.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A frame or envelope could not be decoded or encoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The peer sent something other than what the exchange expects.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    /// The daemon refused the request.
    #[error("daemon error: {0}")]
    Remote(String),

    /// The operation did not complete in time.
    #[error("operation timed out")]
    Timeout,
}

impl BridgeError {
    /// Whether the byte stream can no longer be trusted and must be closed.
    pub fn is_fatal(&self) -> bool {
        match self {
            BridgeError::Io(_) => true,
            BridgeError::Protocol(e) => e.is_stream_corrupt(),
            _ => false,
        }
    }
}

/// Reads envelopes from a byte stream.
pub struct FrameReader<R> {
    inner: R,
    buffer: BytesMut,
    codec: FrameCodec,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, codec: FrameCodec) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            codec,
        }
    }

    /// Reads the next envelope.
    ///
    /// Returns `Ok(None)` on a clean end of stream. A frame whose envelope
    /// fails to decode is consumed, so the caller may keep reading after a
    /// non-fatal error.
    pub async fn read_envelope(&mut self) -> Result<Option<Envelope>, BridgeError> {
        loop {
            match self.codec.try_decode(&self.buffer) {
                Ok(Some((frame, consumed))) => {
                    self.buffer.advance(consumed);
                    return Ok(Some(Envelope::from_frame(&frame)?));
                }
                Ok(None) => {}
                Err(e) => {
                    if !e.is_stream_corrupt() {
                        self.skip_frame();
                    }
                    return Err(e.into());
                }
            }

            let read = self.inner.read_buf(&mut self.buffer).await?;
            if read == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(
                    ProtocolError::ConnectionClosed("stream ended inside a frame".to_string())
                        .into(),
                );
            }
        }
    }

    /// Drops a complete but undecodable frame from the buffer.
    fn skip_frame(&mut self) {
        if self.buffer.len() < PREFIX_LEN {
            return;
        }
        let len = u32::from_be_bytes([self.buffer[4], self.buffer[5], self.buffer[6], self.buffer[7]]);
        let total = (PREFIX_LEN + len as usize).min(self.buffer.len());
        self.buffer.advance(total);
    }
}

/// Writes envelopes to a byte stream, numbering them consecutively.
pub struct FrameWriter<W> {
    inner: W,
    codec: FrameCodec,
    next_sequence: u64,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, codec: FrameCodec) -> Self {
        Self {
            inner,
            codec,
            next_sequence: 1,
        }
    }

    /// Wraps `message` in the next envelope and writes it out.
    pub async fn send(&mut self, message: Message) -> Result<u64, BridgeError> {
        let sequence = self.next_sequence;
        let bytes = Envelope::new(sequence, message).encode_frame(&self.codec)?;

        self.inner.write_all(&bytes).await?;
        self.inner.flush().await?;

        self.next_sequence += 1;
        Ok(sequence)
    }

    /// Flushes and closes the write side.
    pub async fn shutdown(&mut self) -> Result<(), BridgeError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::messages::{Ping, TerminalInput};
    use protocol::{Frame, PROTOCOL_VERSION};

    #[tokio::test]
    async fn test_write_then_read() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client, FrameCodec::new());
        let mut reader = FrameReader::new(server, FrameCodec::new());

        assert_eq!(writer.send(Message::Ping(Ping { timestamp: 1 })).await.unwrap(), 1);
        assert_eq!(
            writer
                .send(Message::TerminalInput(TerminalInput { data: b"ls\n".to_vec() }))
                .await
                .unwrap(),
            2
        );

        let first = reader.read_envelope().await.unwrap().unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(first.payload, Message::Ping(Ping { timestamp: 1 }));

        let second = reader.read_envelope().await.unwrap().unwrap();
        assert_eq!(second.sequence, 2);
    }

    #[tokio::test]
    async fn test_large_message_split_across_reads() {
        // Smaller than the frame, so the reader has to assemble it
        let (client, server) = tokio::io::duplex(64);
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let expected = data.clone();

        let write = tokio::spawn(async move {
            let mut writer = FrameWriter::new(client, FrameCodec::new());
            writer
                .send(Message::TerminalInput(TerminalInput { data }))
                .await
                .unwrap();
        });

        let mut reader = FrameReader::new(server, FrameCodec::new());
        let envelope = reader.read_envelope().await.unwrap().unwrap();
        match envelope.payload {
            Message::TerminalInput(input) => assert_eq!(input.data, expected),
            other => panic!("unexpected message: {:?}", other),
        }
        write.await.unwrap();
    }

    #[tokio::test]
    async fn test_clean_eof() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);

        let mut reader = FrameReader::new(server, FrameCodec::new());
        assert!(reader.read_envelope().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_fatal() {
        let (mut client, server) = tokio::io::duplex(1024);
        let bytes = Envelope::new(1, Message::Ping(Ping { timestamp: 9 }))
            .encode_frame(&FrameCodec::new())
            .unwrap();
        client.write_all(&bytes[..bytes.len() - 2]).await.unwrap();
        drop(client);

        let mut reader = FrameReader::new(server, FrameCodec::new());
        let err = reader.read_envelope().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_bad_envelope_is_recoverable() {
        let (mut client, server) = tokio::io::duplex(1024);
        let codec = FrameCodec::new();

        let garbage = codec.encode(&Frame::new(vec![0xC1, 0xC1])).unwrap();
        client.write_all(&garbage).await.unwrap();

        let mut wrong_version = Envelope::new(1, Message::Ping(Ping { timestamp: 0 }));
        wrong_version.version = PROTOCOL_VERSION + 1;
        let frame = Frame::new(wrong_version.to_msgpack().unwrap());
        client.write_all(&codec.encode(&frame).unwrap()).await.unwrap();

        let good = Envelope::new(2, Message::Ping(Ping { timestamp: 5 }))
            .encode_frame(&codec)
            .unwrap();
        client.write_all(&good).await.unwrap();

        let mut reader = FrameReader::new(server, FrameCodec::new());

        let err = reader.read_envelope().await.unwrap_err();
        assert!(!err.is_fatal());
        let err = reader.read_envelope().await.unwrap_err();
        assert!(!err.is_fatal());

        let envelope = reader.read_envelope().await.unwrap().unwrap();
        assert_eq!(envelope.sequence, 2);
    }

    #[tokio::test]
    async fn test_corrupt_compressed_frame_is_skipped() {
        let (mut client, server) = tokio::io::duplex(1024);

        // Claims to be compressed but is not valid LZ4
        let mut bad = Vec::new();
        bad.extend_from_slice(&protocol::FRAME_MAGIC);
        bad.extend_from_slice(&5u32.to_be_bytes());
        bad.push(protocol::FrameFlags::COMPRESSED);
        bad.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
        client.write_all(&bad).await.unwrap();

        let good = Envelope::new(3, Message::Ping(Ping { timestamp: 5 }))
            .encode_frame(&FrameCodec::new())
            .unwrap();
        client.write_all(&good).await.unwrap();

        let mut reader = FrameReader::new(server, FrameCodec::new());
        let err = reader.read_envelope().await.unwrap_err();
        assert!(!err.is_fatal());

        let envelope = reader.read_envelope().await.unwrap().unwrap();
        assert_eq!(envelope.sequence, 3);
    }

    #[tokio::test]
    async fn test_bad_magic_is_fatal() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let mut reader = FrameReader::new(server, FrameCodec::new());
        let err = reader.read_envelope().await.unwrap_err();
        assert!(err.is_fatal());
    }
}
