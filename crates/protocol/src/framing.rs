//! Frame codec for length-prefixed framing with optional LZ4 compression.
//!
//! # Frame Format
//!
//! Each frame consists of:
//! - 4 bytes: magic bytes "PTYB"
//! - 4 bytes: content length (big-endian, includes flags byte)
//! - 1 byte: flags (bit 0 = compressed)
//! - N bytes: payload (possibly LZ4 compressed)
//!
//! Terminal output is bursty: a keystroke echo is a handful of bytes while a
//! `cat` of a log file produces full 4 KiB reads. Payloads larger than
//! [`COMPRESSION_THRESHOLD`] are LZ4 compressed when that makes them smaller.

use crate::error::{ProtocolError, Result};

/// Magic bytes identifying a ptybridge frame.
pub const FRAME_MAGIC: [u8; 4] = *b"PTYB";

/// Compression threshold in bytes. Payloads larger than this are compressed.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Maximum frame size (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame header size: 4 (magic) + 4 (length) + 1 (flags) = 9 bytes.
pub const FRAME_HEADER_SIZE: usize = 9;

/// Bytes preceding the content: magic + length.
const PREFIX_SIZE: usize = 8;

/// Flags indicating frame properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Flag indicating the payload is LZ4 compressed.
    pub const COMPRESSED: u8 = 0b0000_0001;

    /// Create a new empty flags set.
    #[inline]
    pub fn new() -> Self {
        Self(0)
    }

    /// Create flags from a raw byte value.
    #[inline]
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Get the raw byte value of the flags.
    #[inline]
    pub fn as_byte(self) -> u8 {
        self.0
    }

    #[inline]
    pub fn is_compressed(self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    /// Return a copy with the compressed bit set or cleared.
    #[inline]
    pub fn with_compressed(self, compressed: bool) -> Self {
        if compressed {
            Self(self.0 | Self::COMPRESSED)
        } else {
            Self(self.0 & !Self::COMPRESSED)
        }
    }
}

/// A frame carrying one encoded envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame flags.
    pub flags: FrameFlags,
    /// The payload data (uncompressed form).
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            flags: FrameFlags::new(),
            payload,
        }
    }
}

/// Encoder and decoder for frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    /// Whether to enable compression for large payloads.
    compression_enabled: bool,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a new frame codec with compression enabled.
    pub fn new() -> Self {
        Self {
            compression_enabled: true,
        }
    }

    /// Create a new frame codec with compression disabled.
    pub fn without_compression() -> Self {
        Self {
            compression_enabled: false,
        }
    }

    /// Whether large payloads get compressed on encode.
    pub fn compression_enabled(&self) -> bool {
        self.compression_enabled
    }

    /// Encode a frame into bytes.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        let payload = &frame.payload;

        if payload.len() > MAX_FRAME_SIZE - FRAME_HEADER_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len() + FRAME_HEADER_SIZE,
                max: MAX_FRAME_SIZE,
            });
        }

        let compressed = if self.compression_enabled && payload.len() > COMPRESSION_THRESHOLD {
            let compressed = lz4_flex::compress_prepend_size(payload);
            // Only use compression if it actually reduces size
            (compressed.len() < payload.len()).then_some(compressed)
        } else {
            None
        };

        let (body, flags): (&[u8], FrameFlags) = match compressed.as_deref() {
            Some(bytes) => (bytes, frame.flags.with_compressed(true)),
            None => (payload, frame.flags.with_compressed(false)),
        };

        let content_len = 1 + body.len();
        let mut output = Vec::with_capacity(PREFIX_SIZE + content_len);
        output.extend_from_slice(&FRAME_MAGIC);
        output.extend_from_slice(&(content_len as u32).to_be_bytes());
        output.push(flags.as_byte());
        output.extend_from_slice(body);

        Ok(output)
    }

    /// Decode a frame from bytes.
    ///
    /// Returns the decoded frame and the number of bytes consumed.
    pub fn decode(&self, data: &[u8]) -> Result<(Frame, usize)> {
        match self.try_decode(data)? {
            Some(decoded) => Ok(decoded),
            None => Err(ProtocolError::Deserialization(format!(
                "insufficient data for frame: have {} bytes",
                data.len()
            ))),
        }
    }

    /// Try to decode a frame from bytes, returning None if there isn't enough data.
    ///
    /// Used by the socket readers, which accumulate partial frames.
    pub fn try_decode(&self, data: &[u8]) -> Result<Option<(Frame, usize)>> {
        let content_len = match parse_prefix(data)? {
            Some(len) => len,
            None => return Ok(None),
        };

        let total = PREFIX_SIZE + content_len;
        if data.len() < total {
            return Ok(None);
        }

        if content_len < 1 {
            return Err(ProtocolError::Deserialization(
                "invalid frame: content length must be at least 1 for flags byte".to_string(),
            ));
        }

        let flags = FrameFlags::from_byte(data[PREFIX_SIZE]);
        let body = &data[FRAME_HEADER_SIZE..total];

        let payload = if flags.is_compressed() {
            lz4_flex::decompress_size_prepended(body).map_err(|e| {
                ProtocolError::Deserialization(format!("failed to decompress payload: {}", e))
            })?
        } else {
            body.to_vec()
        };

        // The payload is handed out decompressed, so the compressed bit is cleared.
        Ok(Some((
            Frame {
                flags: flags.with_compressed(false),
                payload,
            },
            total,
        )))
    }
}

/// Validates magic and length, returning the content length once 8 bytes are
/// available.
fn parse_prefix(data: &[u8]) -> Result<Option<usize>> {
    if data.len() < PREFIX_SIZE {
        // A wrong magic can be reported as soon as four bytes are in.
        if data.len() >= 4 && data[..4] != FRAME_MAGIC {
            return Err(bad_magic(&data[..4]));
        }
        return Ok(None);
    }

    if data[..4] != FRAME_MAGIC {
        return Err(bad_magic(&data[..4]));
    }

    let content_len = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
    let total = PREFIX_SIZE + content_len;
    if total > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: total,
            max: MAX_FRAME_SIZE,
        });
    }

    Ok(Some(content_len))
}

fn bad_magic(magic: &[u8]) -> ProtocolError {
    ProtocolError::InvalidFrameMagic {
        expected: u32::from_be_bytes(FRAME_MAGIC),
        got: u32::from_be_bytes([magic[0], magic[1], magic[2], magic[3]]),
    }
}
