//! Relay Daemon - Real-Time Chat Relay Server
//!
//! Entry point for the relay daemon. Streaming clients connect over a Unix
//! socket; browsers submit messages and read history over WebSocket.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults
//! relay-daemon
//!
//! # Custom socket path, no WebSocket gateway
//! relay-daemon --socket /tmp/relay.sock --no-websocket
//!
//! # With config file
//! relay-daemon --config /etc/relay/relay.toml
//!
//! # Verbose logging
//! RUST_LOG=debug relay-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

mod server;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use relay_core::{load_config_from_path, ConfigOverrides, Shutdown};
use server::RelayServer;

/// Relay Daemon - real-time chat relay
#[derive(Parser, Debug)]
#[command(name = "relay-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "RELAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Unix socket path for streaming clients
    #[arg(short = 's', long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Listen address of the WebSocket request gateway
    #[arg(long, value_name = "ADDR")]
    ws_addr: Option<String>,

    /// Do not start the WebSocket request gateway
    #[arg(long)]
    no_websocket: bool,

    /// Per-recipient send timeout in milliseconds
    #[arg(long, value_name = "MS")]
    send_timeout_ms: Option<u64>,

    /// Deadline for one request in milliseconds
    #[arg(long, value_name = "MS")]
    request_timeout_ms: Option<u64>,

    /// PID file path
    #[arg(long, env = "RELAY_PID_FILE", value_name = "PATH")]
    pid_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(ref path) = self.socket {
            overrides = overrides.with_socket_path(path.clone());
        }
        if let Some(ref addr) = self.ws_addr {
            overrides = overrides.with_ws_addr(addr.clone());
        }
        if self.no_websocket {
            overrides = overrides.without_websocket();
        }
        if let Some(ms) = self.send_timeout_ms {
            overrides = overrides.with_send_timeout_ms(ms);
        }
        if let Some(ms) = self.request_timeout_ms {
            overrides = overrides.with_request_timeout_ms(ms);
        }
        overrides
    }
}

/// PID file next to the socket
fn default_pid_path(socket_path: &Path) -> PathBuf {
    socket_path.with_file_name("relay.pid")
}

/// Write PID file
fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create PID directory: {parent:?}"))?;
    }

    let pid = std::process::id();
    let mut file =
        fs::File::create(path).with_context(|| format!("Failed to create PID file: {path:?}"))?;
    writeln!(file, "{pid}")?;

    info!(pid = pid, path = ?path, "PID file created");
    Ok(())
}

/// Remove PID file
fn remove_pid_file(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!(error = %e, path = ?path, "Failed to remove PID file");
        } else {
            info!(path = ?path, "PID file removed");
        }
    }
}

/// Refuse to start if the PID file names a live process
fn check_existing_daemon(pid_path: &Path) -> Result<()> {
    if !pid_path.exists() {
        return Ok(());
    }

    let pid_str = fs::read_to_string(pid_path)
        .with_context(|| format!("Failed to read PID file: {pid_path:?}"))?;

    let pid: i32 = pid_str
        .trim()
        .parse()
        .with_context(|| "Invalid PID in file")?;

    // SAFETY: signal 0 performs the permission and existence check only
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        anyhow::bail!(
            "Another relay-daemon is already running (PID: {pid}). \
             Stop it first or remove {pid_path:?} if it's stale."
        );
    }

    warn!(pid = pid, "Removing stale PID file");
    fs::remove_file(pid_path)?;
    Ok(())
}

/// Initialize logging with the specified level
///
/// `RUST_LOG` wins over `--log-level` when set.
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("relay_daemon={level},relay_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Trigger `shutdown` on the first SIGTERM or SIGINT
fn spawn_signal_handler(shutdown: Shutdown) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
        }
        shutdown.trigger();
    });
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Relay daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let config_path = args.config.clone().or_else(relay_core::default_config_path);
    let mut config =
        load_config_from_path(config_path).context("Failed to load configuration")?;
    args.overrides().apply(&mut config);
    config.validate().context("Invalid configuration")?;

    info!(
        source = %config.source(),
        socket_path = ?config.socket_path,
        ws_addr = %config.ws_addr,
        websocket = config.websocket_enabled,
        "Configuration loaded"
    );

    let pid_path = args
        .pid_file
        .clone()
        .unwrap_or_else(|| default_pid_path(&config.socket_path));
    check_existing_daemon(&pid_path)?;
    write_pid_file(&pid_path)?;

    let shutdown = Shutdown::new();
    if let Err(e) = spawn_signal_handler(shutdown.clone()) {
        remove_pid_file(&pid_path);
        return Err(e);
    }

    let server = RelayServer::new(config);
    let result = server.run(shutdown).await;

    info!("Shutting down...");
    remove_pid_file(&pid_path);

    match result {
        Ok(()) => {
            info!("Relay daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}
