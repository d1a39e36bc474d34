//! Unix socket bridge between callers and PTY sessions.
//!
//! Each accepted connection is one caller channel with its own session. The
//! wire format is the framed MessagePack protocol from the [`protocol`]
//! crate.
//!
//! ## Socket Path
//!
//! - Primary: `$XDG_RUNTIME_DIR/ptybridge/bridge.sock`
//! - Fallback: `/tmp/ptybridge-$UID/bridge.sock`
//!
//! ## Example
//!
//! ```rust,no_run
//! use ptybridge::bridge::{get_socket_path, BridgeClient};
//! use protocol::Message;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = BridgeClient::connect(&get_socket_path()).await?;
//!     client.input("echo hi\n").await?;
//!
//!     while let Some(message) = client.next_message().await? {
//!         if let Message::TerminalOutput(out) = message {
//!             print!("{}", String::from_utf8_lossy(&out.data));
//!         }
//!     }
//!     Ok(())
//! }
//! ```

mod client;
mod connection;
pub mod pidfile;
mod registry;
mod server;

pub use client::{BridgeClient, RECONNECT_DELAY};
pub use connection::{BridgeError, FrameReader, FrameWriter};
pub use pidfile::{get_daemon_pid, get_pid_file_path, is_daemon_running, PidFile};
pub use registry::{ChannelId, ChannelRegistry};
pub use server::{BridgeServer, ServerOptions};

use std::path::PathBuf;

/// Get the default socket path of the bridge.
///
/// 1. If `$XDG_RUNTIME_DIR` is set: `$XDG_RUNTIME_DIR/ptybridge/bridge.sock`
/// 2. Otherwise: `/tmp/ptybridge-$UID/bridge.sock`
pub fn get_socket_path() -> PathBuf {
    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(runtime_dir) if !runtime_dir.is_empty() => {
            PathBuf::from(runtime_dir).join("ptybridge").join("bridge.sock")
        }
        _ => PathBuf::from(format!("/tmp/ptybridge-{}", current_uid())).join("bridge.sock"),
    }
}

#[cfg(unix)]
fn current_uid() -> u32 {
    nix::unistd::getuid().as_raw()
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    0
}
