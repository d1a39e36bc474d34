use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use ptybridge::bridge::{
    get_daemon_pid, get_pid_file_path, BridgeClient, BridgeServer, PidFile, ServerOptions,
};
use ptybridge::config::{default_config_path, Config};
use ptybridge::logging;

#[derive(Parser)]
#[command(name = "ptybridged")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge daemon in the foreground
    Serve {
        /// Listen on this socket instead of the configured one
        #[arg(long, value_name = "PATH")]
        socket: Option<PathBuf>,
    },
    /// Show daemon status
    Status {
        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },
    /// Stop the running daemon
    Stop {
        /// Kill the daemon with SIGKILL instead of asking it to stop
        #[arg(long, short)]
        force: bool,

        /// Seconds to wait for a graceful stop
        #[arg(long, default_value = "10")]
        timeout: u64,
    },
    /// Print the effective configuration
    Config {
        /// Write it to the configuration file as well
        #[arg(long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();
    config.validate().context("Invalid configuration")?;

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.to_lowercase()
    };

    // Only `serve` writes to the log directory; the short-lived commands log to stderr
    let log_dir = match cli.command {
        Commands::Serve { .. } => config.daemon.log_dir.clone(),
        _ => None,
    };
    let _log_guard = logging::init(&level, log_dir.as_deref())?;

    match cli.command {
        Commands::Serve { socket } => serve(&config, socket).await,
        Commands::Status { json } => show_status(&config, json).await,
        Commands::Stop { force, timeout } => {
            if force {
                force_stop_daemon(&config.socket_path())
            } else {
                graceful_stop_daemon(&config.socket_path(), timeout).await
            }
        }
        Commands::Config { write } => {
            print!("{}", config.to_toml()?);
            if write {
                config.save(&config_path)?;
                eprintln!("Configuration written to {}", config_path.display());
            }
            Ok(())
        }
    }
}

/// Run the bridge until a signal or a `Shutdown` message stops it.
async fn serve(config: &Config, socket_override: Option<PathBuf>) -> anyhow::Result<()> {
    if let Some(pid) = get_daemon_pid() {
        eprintln!("Daemon already running (PID: {})", pid);
        eprintln!("Use 'ptybridged stop' to stop it first.");
        std::process::exit(1);
    }

    let socket_path = socket_override.unwrap_or_else(|| config.socket_path());
    let pid_path = get_pid_file_path();
    let _pid_file = PidFile::create(&pid_path)
        .with_context(|| format!("Failed to write PID file: {}", pid_path.display()))?;

    let server = BridgeServer::bind(&socket_path, ServerOptions::from_config(config))
        .await
        .with_context(|| format!("Failed to bind socket: {}", socket_path.display()))?;

    spawn_signal_handler(server.shutdown_token())?;

    info!(
        socket = %socket_path.display(),
        pid = std::process::id(),
        "ptybridged started"
    );

    server.run().await.context("Bridge server failed")?;

    info!("ptybridged stopped");
    Ok(())
}

/// Cancels `shutdown` on SIGTERM or SIGINT.
#[cfg(unix)]
fn spawn_signal_handler(shutdown: tokio_util::sync::CancellationToken) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
            _ = shutdown.cancelled() => return,
        }
        shutdown.cancel();
    });

    Ok(())
}

#[cfg(not(unix))]
fn spawn_signal_handler(shutdown: tokio_util::sync::CancellationToken) -> anyhow::Result<()> {
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                    return;
                }
                info!("Received Ctrl+C");
            }
            _ = shutdown.cancelled() => return,
        }
        shutdown.cancel();
    });
    Ok(())
}

async fn show_status(config: &Config, json: bool) -> anyhow::Result<()> {
    let socket_path = config.socket_path();

    let mut client = match BridgeClient::connect(&socket_path).await {
        Ok(client) => client,
        Err(_) => {
            if json {
                println!("{}", serde_json::json!({ "running": false }));
            } else {
                println!("Daemon is not running");
            }
            std::process::exit(1);
        }
    };

    let status = client
        .status()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to query daemon status: {}", e))?;

    if json {
        let value = serde_json::json!({
            "running": true,
            "pid": status.pid,
            "uptime_secs": status.uptime_secs,
            "channels": status.channels,
            "running_shells": status.running_shells,
            "socket": socket_path,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("Daemon is running");
        println!("  PID:            {}", status.pid);
        println!("  Uptime:         {}", format_duration(status.uptime_secs));
        // The status query itself occupies a channel
        println!("  Channels:       {}", status.channels.saturating_sub(1));
        println!("  Running shells: {}", status.running_shells);
        println!("  Socket:         {}", socket_path.display());
    }

    Ok(())
}

/// Ask the daemon to stop, then wait until its socket goes away.
async fn graceful_stop_daemon(socket_path: &Path, timeout_secs: u64) -> anyhow::Result<()> {
    let mut client = BridgeClient::connect_with_timeout(socket_path, Duration::from_secs(5))
        .await
        .map_err(|_| anyhow::anyhow!("Daemon is not running (cannot connect to socket)"))?;

    println!("Sending shutdown request...");

    client.set_timeout(Duration::from_secs(timeout_secs));
    client
        .shutdown()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to send stop request: {}", e))?;
    drop(client);

    println!("Shutdown acknowledged, waiting for daemon to exit...");

    let start = Instant::now();
    let timeout = Duration::from_secs(timeout_secs);

    while start.elapsed() < timeout {
        if !socket_path.exists() {
            println!("Daemon stopped");
            return Ok(());
        }

        if BridgeClient::connect_with_timeout(socket_path, Duration::from_millis(100))
            .await
            .is_err()
        {
            // get_daemon_pid drops the PID file if the process is gone
            let _ = get_daemon_pid();
            println!("Daemon stopped");
            return Ok(());
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    Err(anyhow::anyhow!(
        "Timeout waiting for daemon to exit ({}s)",
        timeout_secs
    ))
}

/// Force stop the daemon using SIGKILL.
///
/// Reads the daemon PID from the PID file. The daemon gets no chance to clean
/// up, so the PID file and socket are removed here.
#[cfg(unix)]
fn force_stop_daemon(socket_path: &Path) -> anyhow::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = get_daemon_pid() else {
        anyhow::bail!("Daemon is not running (no live PID in PID file)");
    };

    let raw = i32::try_from(pid).context("PID out of range")?;
    kill(Pid::from_raw(raw), Signal::SIGKILL)
        .map_err(|e| anyhow::anyhow!("Failed to kill daemon (PID {}): {}", pid, e))?;

    println!("Sent SIGKILL to daemon (PID: {})", pid);

    let pid_path = get_pid_file_path();
    if let Err(e) = std::fs::remove_file(&pid_path) {
        warn!("Failed to remove PID file {}: {}", pid_path.display(), e);
    }
    if socket_path.exists() {
        let _ = std::fs::remove_file(socket_path);
    }

    Ok(())
}

#[cfg(not(unix))]
fn force_stop_daemon(_socket_path: &Path) -> anyhow::Result<()> {
    anyhow::bail!("--force is only supported on Unix")
}

/// Format a duration in seconds as a human-readable string.
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
