//! Protocol message definitions for ptybridge.
//!
//! One bridge connection carries one terminal channel. The caller drives the
//! shell with `TerminalInit`/`TerminalInput`/`TerminalResize` and receives
//! `TerminalOutput` and `TerminalExit` events. All messages are serialized
//! using MessagePack inside an [`Envelope`].

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::framing::{Frame, FrameCodec};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Envelope wrapper for all protocol messages.
///
/// The envelope provides versioning and a per-direction sequence number. The
/// daemon numbers its outbound envelopes consecutively, so a gap or
/// reordering seen by a caller is a transport bug.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version for compatibility checking.
    pub version: u8,
    /// Sequence number for message ordering.
    pub sequence: u64,
    /// The actual message payload.
    pub payload: Message,
}

impl Envelope {
    /// Create a new envelope with the current protocol version.
    pub fn new(sequence: u64, payload: Message) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            sequence,
            payload,
        }
    }
}

/// Top-level message enum containing all message types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Message {
    // Caller to daemon
    /// (Re)start the channel's shell.
    TerminalInit(TerminalInit),
    /// Raw bytes for the shell's input.
    TerminalInput(TerminalInput),
    /// New terminal dimensions.
    TerminalResize(TerminalResize),

    // Daemon to caller
    /// Raw bytes produced by the shell.
    TerminalOutput(TerminalOutput),
    /// The shell process of one generation has ended.
    TerminalExit(TerminalExit),

    // Control messages
    /// Ping for keepalive.
    Ping(Ping),
    /// Pong response to ping.
    Pong(Pong),
    /// Ask the daemon for its status.
    StatusRequest(StatusRequest),
    /// Daemon status snapshot.
    Status(DaemonStatus),
    /// Ask the daemon to shut down gracefully.
    Shutdown(Shutdown),
    /// Acknowledgment that the daemon is stopping.
    Stopping(Stopping),
    /// Error message.
    Error(ErrorMessage),
}

// ============================================================================
// Terminal Messages
// ============================================================================

/// Request a (re)start of the channel's shell process.
///
/// Carries nothing: the channel identity is the connection itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalInit {}

/// Input for the shell (keystrokes, pasted text).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalInput {
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Terminal resize request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalResize {
    /// New terminal columns.
    pub cols: u16,
    /// New terminal rows.
    pub rows: u16,
}

/// Output produced by the shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalOutput {
    /// Generation of the process that produced these bytes.
    pub generation: u64,
    /// The bytes, exactly as read from the PTY.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Exit notification, sent once per process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalExit {
    /// Generation of the process that exited.
    pub generation: u64,
    /// Exit code if the process exited normally.
    pub code: Option<i32>,
    /// Signal description if the process was killed by a signal.
    pub signal: Option<String>,
}

// ============================================================================
// Control Messages
// ============================================================================

/// Ping message for keepalive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// Timestamp for RTT calculation (Unix millis).
    pub timestamp: u64,
}

/// Pong response to a ping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    /// Timestamp from the original ping.
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRequest {}

/// Daemon status snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonStatus {
    /// Process ID of the daemon.
    pub pid: u32,
    /// Uptime in seconds.
    pub uptime_secs: u64,
    /// Number of open caller channels.
    pub channels: usize,
    /// Number of channels whose shell is currently running.
    pub running_shells: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shutdown {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stopping {}

/// Error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Error code for programmatic handling.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
    /// Whether the connection remains usable.
    pub recoverable: bool,
}

/// Error codes for common error conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Unknown or unspecified error.
    Unknown,
    /// Malformed or unexpected message.
    InvalidRequest,
    /// Server-side error.
    InternalError,
    /// Protocol version mismatch.
    VersionMismatch,
    /// The daemon refuses further channels.
    TooManyChannels,
}

// ============================================================================
// Serialization helpers
// ============================================================================

impl Envelope {
    /// Serialize the envelope to MessagePack bytes.
    pub fn to_msgpack(&self) -> std::result::Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    /// Deserialize an envelope from MessagePack bytes.
    pub fn from_msgpack(bytes: &[u8]) -> std::result::Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }

    /// Encode the envelope as a complete wire frame.
    pub fn encode_frame(&self, codec: &FrameCodec) -> Result<Vec<u8>> {
        let payload = self.to_msgpack()?;
        codec.encode(&Frame::new(payload))
    }

    /// Decode an envelope out of a frame, rejecting unknown versions.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let envelope = Self::from_msgpack(&frame.payload)?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                expected: PROTOCOL_VERSION,
                got: envelope.version,
            });
        }
        Ok(envelope)
    }
}
