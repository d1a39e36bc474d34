//! # ptybridge Protocol Library
//!
//! Wire definitions shared by the ptybridge daemon and its callers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │     Terminal / control messages         │  MessagePack-encoded Envelope
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  Length-prefixed, LZ4
//! ├─────────────────────────────────────────┤
//! │        Transport (Unix socket)          │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Envelope, FrameCodec, Message};
//! use protocol::messages::TerminalInput;
//!
//! let message = Message::TerminalInput(TerminalInput { data: b"ls\n".to_vec() });
//! let envelope = Envelope::new(1, message);
//!
//! let codec = FrameCodec::new();
//! let bytes = envelope.encode_frame(&codec).unwrap();
//!
//! let (frame, _) = codec.decode(&bytes).unwrap();
//! assert_eq!(Envelope::from_frame(&frame).unwrap(), envelope);
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Protocol message definitions
//! - [`framing`]: Frame codec with compression
//! - [`error`]: Error types

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use framing::{
    Frame, FrameCodec, FrameFlags, COMPRESSION_THRESHOLD, FRAME_HEADER_SIZE, FRAME_MAGIC,
    MAX_FRAME_SIZE,
};
pub use messages::{Envelope, ErrorCode, Message, PROTOCOL_VERSION};
