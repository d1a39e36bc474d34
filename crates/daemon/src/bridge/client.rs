//! Bridge client for driving a terminal channel over the daemon's socket.
//!
//! Used by the `ptybridged status`/`stop` commands and by anything that wants
//! to attach to a shell. One client is one channel: dropping it tears the
//! channel's shell down.

use std::collections::VecDeque;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use protocol::messages::{
    DaemonStatus, Ping, Shutdown, StatusRequest, TerminalInit, TerminalInput, TerminalResize,
};
use protocol::{FrameCodec, Message};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use super::connection::{BridgeError, FrameReader, FrameWriter};

/// Default timeout for client operations in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// How long a caller should wait before reconnecting after the channel
/// dropped. The daemon does not enforce it.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// A client connected to the bridge.
pub struct BridgeClient {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
    timeout: Duration,
    /// Terminal events that arrived while waiting for a control reply.
    pending: VecDeque<Message>,
}

impl BridgeClient {
    /// Connect to the daemon at the specified socket path.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    /// This typically indicates that the daemon is not running.
    pub async fn connect(path: &Path) -> Result<Self, BridgeError> {
        Self::connect_with_timeout(path, Duration::from_secs(DEFAULT_TIMEOUT_SECS)).await
    }

    /// Connect to the daemon with a custom timeout for connect and replies.
    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, BridgeError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| BridgeError::Timeout)??;
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            reader: FrameReader::new(read_half, FrameCodec::new()),
            writer: FrameWriter::new(write_half, FrameCodec::new()),
            timeout,
            pending: VecDeque::new(),
        })
    }

    /// Set the timeout for operations.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Sends a message without waiting for anything back.
    pub async fn send(&mut self, message: Message) -> Result<(), BridgeError> {
        self.writer.send(message).await.map(|_| ())
    }

    /// Starts (or restarts) the channel's shell.
    pub async fn init(&mut self) -> Result<(), BridgeError> {
        self.send(Message::TerminalInit(TerminalInit {})).await
    }

    /// Sends bytes to the shell.
    pub async fn input(&mut self, data: impl Into<Vec<u8>>) -> Result<(), BridgeError> {
        self.send(Message::TerminalInput(TerminalInput { data: data.into() }))
            .await
    }

    pub async fn resize(&mut self, cols: u16, rows: u16) -> Result<(), BridgeError> {
        self.send(Message::TerminalResize(TerminalResize { cols, rows }))
            .await
    }

    /// Receives the next message from the daemon.
    ///
    /// Returns `Ok(None)` once the daemon closed the channel and
    /// [`BridgeError::Timeout`] if nothing arrived in time.
    pub async fn next_message(&mut self) -> Result<Option<Message>, BridgeError> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(Some(message));
        }
        self.read_message().await
    }

    /// Checks that the daemon answers.
    pub async fn ping(&mut self) -> Result<bool, BridgeError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        self.request(Message::Ping(Ping { timestamp }), |reply| match reply {
            Message::Pong(pong) => Some(pong.timestamp == timestamp),
            _ => None,
        })
        .await
    }

    /// Fetches the daemon's status.
    pub async fn status(&mut self) -> Result<DaemonStatus, BridgeError> {
        self.request(Message::StatusRequest(StatusRequest {}), |reply| match reply {
            Message::Status(status) => Some(status.clone()),
            _ => None,
        })
        .await
    }

    /// Asks the daemon to shut down and waits for its acknowledgment.
    pub async fn shutdown(&mut self) -> Result<(), BridgeError> {
        self.request(Message::Shutdown(Shutdown {}), |reply| match reply {
            Message::Stopping(_) => Some(()),
            _ => None,
        })
        .await
    }

    /// Sends `message` and waits for the reply `extract` accepts. Terminal
    /// events arriving in between are kept for [`next_message`](Self::next_message).
    async fn request<T, F>(&mut self, message: Message, extract: F) -> Result<T, BridgeError>
    where
        F: Fn(&Message) -> Option<T>,
    {
        self.send(message).await?;

        loop {
            let reply = self.read_message().await?.ok_or_else(|| {
                BridgeError::UnexpectedMessage("daemon closed the connection".to_string())
            })?;

            if let Some(value) = extract(&reply) {
                return Ok(value);
            }

            match reply {
                Message::Error(err) => return Err(BridgeError::Remote(err.message)),
                Message::TerminalOutput(_) | Message::TerminalExit(_) => {
                    self.pending.push_back(reply)
                }
                other => {
                    return Err(BridgeError::UnexpectedMessage(format!("{:?}", other)));
                }
            }
        }
    }

    async fn read_message(&mut self) -> Result<Option<Message>, BridgeError> {
        let envelope = tokio::time::timeout(self.timeout, self.reader.read_envelope())
            .await
            .map_err(|_| BridgeError::Timeout)??;
        Ok(envelope.map(|e| e.payload))
    }
}
