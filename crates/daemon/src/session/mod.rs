//! Session management module.
//!
//! This module provides PTY spawning, output relaying and the per-channel
//! session lifecycle (init, write, resize, exit, teardown).

pub mod manager;
pub mod pty;
pub mod relay;
pub mod shell;

pub use manager::{SessionManager, SessionState, TerminalSettings};
pub use pty::{Generation, ProcessExit, ProcessHandle, SessionError, TerminalSize};
pub use relay::{OutputRelay, SessionEvent};
pub use shell::{ShellCommand, TERMINAL_ENV};
