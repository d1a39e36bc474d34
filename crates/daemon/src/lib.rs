//! # ptybridge Daemon Library
//!
//! Bridges interactive shells running in pseudo-terminals to remote callers.
//!
//! ## Overview
//!
//! - **Sessions**: one shell per caller channel, spawned on demand, restarted
//!   on request, torn down with the channel
//! - **Output relay**: raw PTY bytes pushed to the caller in order, followed by
//!   exactly one exit notification per process
//! - **Bridge**: a Unix socket server speaking the framed MessagePack protocol
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     BridgeServer                         │
//! │   one connection = one channel = one SessionManager      │
//! ├──────────────────────────────────────────────────────────┤
//! │  SessionManager ──spawn/kill──▶ ProcessHandle (PTY)      │
//! │        ▲                              │                  │
//! │        │ events (mpsc)          OutputRelay              │
//! │        └──────────────────────────────┘                  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ptybridge::session::{SessionEvent, SessionManager, ShellCommand, TerminalSettings};
//!
//! #[tokio::main]
//! async fn main() {
//!     let (session, mut events) =
//!         SessionManager::channel(TerminalSettings::default(), ShellCommand::platform_default());
//!
//!     // Input before init starts the shell
//!     session.write(b"echo hi\n").await;
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             SessionEvent::Output { data, .. } => print!("{}", String::from_utf8_lossy(&data)),
//!             SessionEvent::Exit { exit, .. } => {
//!                 println!("exited: {:?}", exit.code);
//!                 break;
//!             }
//!         }
//!     }
//!
//!     session.teardown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: PTY processes, output relay and the session state machine
//! - [`bridge`]: Unix socket server, client and PID file
//! - [`logging`]: Tracing subscriber setup

pub mod bridge;
pub mod config;
pub mod logging;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use bridge::{BridgeClient, BridgeError, BridgeServer, ServerOptions};
pub use config::{Config, ConfigError};
pub use session::{
    Generation, ProcessExit, ProcessHandle, SessionError, SessionEvent, SessionManager,
    SessionState, ShellCommand, TerminalSettings, TerminalSize,
};
