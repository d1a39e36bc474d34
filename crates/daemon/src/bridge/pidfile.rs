//! PID file handling for the daemon.
//!
//! The PID file lets a second `ptybridged serve` refuse to start and lets
//! `ptybridged stop --force` find the process to signal.
//!
//! ## PID File Location
//!
//! - `$XDG_DATA_HOME/ptybridge/ptybridged.pid` if XDG_DATA_HOME is set
//! - `~/.local/share/ptybridge/ptybridged.pid` otherwise

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Get the path to the daemon PID file.
pub fn get_pid_file_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .ok()
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local/share")
        });
    data_dir.join("ptybridge").join("ptybridged.pid")
}

/// Check if a daemon process is currently running.
pub fn is_daemon_running() -> bool {
    get_daemon_pid().is_some()
}

/// Get the PID of the running daemon, if any.
///
/// Stale or unreadable PID files are removed.
pub fn get_daemon_pid() -> Option<u32> {
    read_daemon_pid(&get_pid_file_path())
}

/// Like [`get_daemon_pid`], for an explicit PID file.
pub fn read_daemon_pid(path: &Path) -> Option<u32> {
    let contents = fs::read_to_string(path).ok()?;

    let pid = match contents.trim().parse::<u32>() {
        Ok(pid) => pid,
        Err(_) => {
            cleanup_stale_pid_file(path);
            return None;
        }
    };

    if is_process_running(pid) {
        Some(pid)
    } else {
        cleanup_stale_pid_file(path);
        None
    }
}

/// Check if a process with the given PID is running.
fn is_process_running(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new(&format!("/proc/{}/stat", pid)).exists()
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    {
        // Signal 0 only probes for existence
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

fn cleanup_stale_pid_file(path: &Path) {
    if fs::remove_file(path).is_ok() {
        tracing::debug!(path = %path.display(), "Removed stale PID file");
    }
}

/// The daemon's own PID file; removed again on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Writes the current process ID to `path`, creating parent directories.
    pub fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, format!("{}\n", std::process::id()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        // Only remove the file if it still names us
        if read_daemon_pid(&self.path) == Some(std::process::id()) {
            let _ = fs::remove_file(&self.path);
        }
    }
}
