//! Configuration management for the ptybridge daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/ptybridge/config.toml`.
//!
//! The shell the daemon launches is not configurable; it comes from a fixed
//! per-platform table (see [`ShellCommand::platform_default`]).
//!
//! [`ShellCommand::platform_default`]: crate::session::ShellCommand::platform_default

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::{TerminalSettings, TerminalSize};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("terminal size must be positive, got {cols}x{rows}")]
    InvalidTerminalSize { cols: u16, rows: u16 },

    #[error("read_buffer_size must be between 1 and {max}, got {got}", max = MAX_READ_BUFFER_SIZE)]
    InvalidReadBufferSize { got: usize },

    #[error("output_buffer must be between 1 and {max}, got {got}", max = MAX_OUTPUT_BUFFER)]
    InvalidOutputBuffer { got: usize },

    #[error("restart_grace_ms must be at most {max}, got {got}", max = MAX_RESTART_GRACE_MS)]
    InvalidRestartGrace { got: u64 },

    #[error("max_channels must be between 1 and 1024, got {0}")]
    InvalidMaxChannels(usize),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;
const MAX_OUTPUT_BUFFER: usize = 65536;
const MAX_RESTART_GRACE_MS: u64 = 10_000;

/// Environment variable overriding `daemon.log_level`.
pub const ENV_LOG_LEVEL: &str = "PTYBRIDGE_LOG_LEVEL";
/// Environment variable overriding `daemon.socket_path`.
pub const ENV_SOCKET: &str = "PTYBRIDGE_SOCKET";

/// Main configuration structure for the ptybridge daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Settings for spawned terminals.
    pub terminal: TerminalConfig,

    /// Bridge (socket transport) settings.
    pub bridge: BridgeConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for daily-rotated log files. Logs go to stderr when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,

    /// Bridge socket location. Defaults to the XDG runtime directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
}

/// Terminal configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TerminalConfig {
    /// Columns of a freshly spawned terminal.
    pub cols: u16,

    /// Rows of a freshly spawned terminal.
    pub rows: u16,

    /// Maximum bytes per PTY read.
    pub read_buffer_size: usize,

    /// Output events buffered per channel before the relay waits.
    pub output_buffer: usize,

    /// How long a forced restart waits for the old shell to drain.
    pub restart_grace_ms: u64,
}

/// Bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Maximum number of simultaneously connected callers.
    pub max_channels: usize,

    /// Compress large frames with LZ4.
    pub compression: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            socket_path: None,
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            cols: 80,
            rows: 30,
            read_buffer_size: 4096,
            output_buffer: 256,
            restart_grace_ms: 500,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_channels: 16,
            compression: true,
        }
    }
}

impl TerminalConfig {
    /// Converts to the settings the session manager works with.
    pub fn settings(&self) -> TerminalSettings {
        TerminalSettings {
            initial_size: TerminalSize::new(self.cols, self.rows).unwrap_or_default(),
            read_buffer_size: self.read_buffer_size,
            output_buffer: self.output_buffer,
            restart_grace: Duration::from_millis(self.restart_grace_ms),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ptybridge")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PTYBRIDGE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - PTYBRIDGE_SOCKET: Override the bridge socket path
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var(ENV_LOG_LEVEL) {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(socket) = std::env::var(ENV_SOCKET) {
            if !socket.is_empty() {
                tracing::info!("Overriding socket_path from environment: {}", socket);
                self.daemon.socket_path = Some(PathBuf::from(socket));
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let terminal = &self.terminal;
        if terminal.cols == 0 || terminal.rows == 0 {
            return Err(ConfigError::InvalidTerminalSize {
                cols: terminal.cols,
                rows: terminal.rows,
            });
        }

        if terminal.read_buffer_size == 0 || terminal.read_buffer_size > MAX_READ_BUFFER_SIZE {
            return Err(ConfigError::InvalidReadBufferSize {
                got: terminal.read_buffer_size,
            });
        }

        if terminal.output_buffer == 0 || terminal.output_buffer > MAX_OUTPUT_BUFFER {
            return Err(ConfigError::InvalidOutputBuffer {
                got: terminal.output_buffer,
            });
        }

        if terminal.restart_grace_ms > MAX_RESTART_GRACE_MS {
            return Err(ConfigError::InvalidRestartGrace {
                got: terminal.restart_grace_ms,
            });
        }

        if self.bridge.max_channels < 1 || self.bridge.max_channels > 1024 {
            return Err(ConfigError::InvalidMaxChannels(self.bridge.max_channels));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// The socket the daemon listens on: the configured path, or the
    /// per-user default.
    pub fn socket_path(&self) -> PathBuf {
        self.daemon
            .socket_path
            .clone()
            .unwrap_or_else(crate::bridge::get_socket_path)
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
