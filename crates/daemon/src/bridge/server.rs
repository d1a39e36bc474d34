//! Bridge server: one Unix socket connection per caller channel.
//!
//! Every accepted connection gets its own [`SessionManager`]. Inbound frames
//! are applied to the session in arrival order; output and exit events flow
//! back through a per-connection writer task.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use protocol::messages::{
    DaemonStatus, ErrorMessage, Pong, Stopping, TerminalExit, TerminalOutput,
};
use protocol::{ErrorCode, FrameCodec, Message, ProtocolError};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::connection::{BridgeError, FrameReader, FrameWriter};
use super::registry::{ChannelId, ChannelRegistry};
use crate::config::Config;
use crate::session::{SessionEvent, SessionManager, ShellCommand, TerminalSettings};

/// Control replies queued per connection.
const REPLY_QUEUE: usize = 32;

/// How long open channels get to wind down on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a closing channel's writer may keep flushing.
const OUTBOUND_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause after a failed accept, so descriptor exhaustion does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Settings the server applies to every channel.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub settings: TerminalSettings,
    pub shell: ShellCommand,
    pub max_channels: usize,
    pub compression: bool,
}

impl ServerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            settings: config.terminal.settings(),
            shell: ShellCommand::platform_default(),
            max_channels: config.bridge.max_channels,
            compression: config.bridge.compression,
        }
    }

    fn codec(&self) -> FrameCodec {
        if self.compression {
            FrameCodec::new()
        } else {
            FrameCodec::without_compression()
        }
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

struct Shared {
    registry: ChannelRegistry,
    options: ServerOptions,
    started_at: Instant,
    shutdown: CancellationToken,
}

impl Shared {
    async fn status(&self) -> DaemonStatus {
        DaemonStatus {
            pid: std::process::id(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            channels: self.registry.len(),
            running_shells: self.registry.running_shells().await,
        }
    }
}

/// A server that bridges caller connections to PTY sessions.
pub struct BridgeServer {
    listener: UnixListener,
    path: PathBuf,
    shared: Arc<Shared>,
}

impl BridgeServer {
    /// Bind the server to the specified socket path.
    ///
    /// Creates missing parent directories and replaces a stale socket file.
    pub async fn bind(path: &Path, options: ServerOptions) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;

        Ok(Self {
            listener,
            path: path.to_path_buf(),
            shared: Arc::new(Shared {
                registry: ChannelRegistry::new(options.max_channels),
                options,
                started_at: Instant::now(),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Token that stops the server when cancelled. A caller's `Shutdown`
    /// message cancels it too.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    /// Accepts callers until shutdown, then tears down every open channel
    /// and removes the socket file.
    pub async fn run(self) -> Result<(), io::Error> {
        let tracker = TaskTracker::new();
        tracing::info!(path = %self.path.display(), "Bridge listening");

        loop {
            tokio::select! {
                _ = self.shared.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        tracker.spawn(serve_channel(stream, Arc::clone(&self.shared)));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        tracing::info!(channels = self.shared.registry.len(), "Bridge shutting down");
        tracker.close();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!("Channels did not close within the shutdown timeout");
        }

        drop(self.listener);
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove socket");
            }
        }

        Ok(())
    }
}

impl From<SessionEvent> for Message {
    fn from(event: SessionEvent) -> Self {
        match event {
            SessionEvent::Output { generation, data } => {
                Message::TerminalOutput(TerminalOutput { generation, data })
            }
            SessionEvent::Exit { generation, exit } => Message::TerminalExit(TerminalExit {
                generation,
                code: exit.code,
                signal: exit.signal,
            }),
        }
    }
}

fn error_message(code: ErrorCode, message: impl Into<String>, recoverable: bool) -> Message {
    Message::Error(ErrorMessage {
        code,
        message: message.into(),
        recoverable,
    })
}

fn frame_error_reply(error: &BridgeError) -> Message {
    let code = match error {
        BridgeError::Protocol(ProtocolError::UnsupportedVersion { .. }) => {
            ErrorCode::VersionMismatch
        }
        _ => ErrorCode::InvalidRequest,
    };
    error_message(code, error.to_string(), !error.is_fatal())
}

async fn serve_channel(stream: UnixStream, shared: Arc<Shared>) {
    let codec = shared.options.codec();
    let (read_half, write_half) = stream.into_split();
    let mut writer = FrameWriter::new(write_half, codec.clone());

    let (session, events) =
        SessionManager::channel(shared.options.settings, shared.options.shell.clone());
    let session = Arc::new(session);

    let Some(channel_id) = shared.registry.register(Arc::clone(&session)) else {
        let max = shared.registry.max_channels();
        tracing::warn!(max_channels = max, "Refusing caller: channel limit reached");
        let refusal = error_message(
            ErrorCode::TooManyChannels,
            format!("channel limit of {} reached", max),
            false,
        );
        let _ = writer.send(refusal).await;
        let _ = writer.shutdown().await;
        return;
    };

    tracing::info!(channel_id = %channel_id, "Channel opened");

    let (replies, replies_rx) = mpsc::channel(REPLY_QUEUE);
    let mut outbound = tokio::spawn(write_outbound(writer, events, replies_rx, channel_id));
    let mut reader = FrameReader::new(read_half, codec);

    loop {
        let read = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            read = reader.read_envelope() => read,
        };

        match read {
            Ok(Some(envelope)) => {
                if !handle_message(envelope.payload, &session, &shared, &replies).await {
                    break;
                }
            }
            Ok(None) => {
                tracing::debug!(channel_id = %channel_id, "Caller disconnected");
                break;
            }
            Err(e) => {
                let fatal = e.is_fatal();
                tracing::warn!(channel_id = %channel_id, error = %e, fatal = fatal, "Bad frame from caller");
                if replies.send(frame_error_reply(&e)).await.is_err() || fatal {
                    break;
                }
            }
        }
    }

    session.teardown().await;
    shared.registry.remove(&channel_id);
    drop(session);
    drop(replies);

    if tokio::time::timeout(OUTBOUND_DRAIN_TIMEOUT, &mut outbound)
        .await
        .is_err()
    {
        tracing::debug!(channel_id = %channel_id, "Writer still busy, aborting");
        outbound.abort();
    }

    tracing::info!(channel_id = %channel_id, "Channel closed");
}

/// Applies one caller message. Returns `false` when the channel should close.
async fn handle_message(
    message: Message,
    session: &SessionManager,
    shared: &Shared,
    replies: &mpsc::Sender<Message>,
) -> bool {
    let reply = match message {
        Message::TerminalInit(_) => {
            session.init().await;
            None
        }
        Message::TerminalInput(input) => {
            session.write(&input.data).await;
            None
        }
        Message::TerminalResize(resize) => {
            session.resize(resize.cols, resize.rows).await;
            None
        }
        Message::Ping(ping) => Some(Message::Pong(Pong {
            timestamp: ping.timestamp,
        })),
        Message::StatusRequest(_) => Some(Message::Status(shared.status().await)),
        Message::Shutdown(_) => {
            tracing::info!("Shutdown requested by caller");
            shared.shutdown.cancel();
            Some(Message::Stopping(Stopping {}))
        }
        other => {
            tracing::debug!(message = ?other, "Unexpected message from caller");
            Some(error_message(
                ErrorCode::InvalidRequest,
                "message is only sent by the daemon",
                true,
            ))
        }
    };

    match reply {
        Some(reply) => replies.send(reply).await.is_ok(),
        None => true,
    }
}

/// Serializes session events and control replies onto the socket.
async fn write_outbound(
    mut writer: FrameWriter<tokio::net::unix::OwnedWriteHalf>,
    mut events: mpsc::Receiver<SessionEvent>,
    mut replies: mpsc::Receiver<Message>,
    channel_id: ChannelId,
) {
    let mut events_open = true;
    let mut replies_open = true;

    while events_open || replies_open {
        let message = tokio::select! {
            event = events.recv(), if events_open => match event {
                Some(event) => Message::from(event),
                None => {
                    events_open = false;
                    continue;
                }
            },
            reply = replies.recv(), if replies_open => match reply {
                Some(reply) => reply,
                None => {
                    replies_open = false;
                    continue;
                }
            },
        };

        if let Err(e) = writer.send(message).await {
            tracing::debug!(channel_id = %channel_id, error = %e, "Caller stopped reading");
            break;
        }
    }

    let _ = writer.shutdown().await;
}
