//! Daemon lifecycle handlers
//!
//! Start spawns a background copy of the current executable with its
//! output redirected to the runtime dir; stop asks nicely over the
//! socket before falling back to SIGTERM via the pid file.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::cli::DaemonCommands;
use crate::daemon::protocol::{
    default_log_path, default_pid_path, default_socket_path, runtime_dir,
};
use crate::daemon::{DaemonClient, GatewayDaemon};

use super::load_provider;
use super::status::{format_uptime, print_server_lines};

/// Dispatch daemon subcommands to their handlers.
pub async fn run_daemon_command(config: Option<PathBuf>, command: DaemonCommands) -> Result<()> {
    match command {
        DaemonCommands::Start { background } => run_start(config, background).await,
        DaemonCommands::Stop => run_stop().await,
        DaemonCommands::Status { verbose } => run_daemon_status(verbose).await,
        DaemonCommands::Logs { lines, server } => run_logs(lines, server).await,
        DaemonCommands::Enable { server } => run_toggle(&server, true).await,
        DaemonCommands::Disable { server } => run_toggle(&server, false).await,
        DaemonCommands::ClearBlacklist { server } => run_clear_blacklist(&server).await,
        DaemonCommands::Reload => run_reload().await,
    }
}

pub async fn run_start(config: Option<PathBuf>, background: bool) -> Result<()> {
    let client = DaemonClient::new(None);
    if client.is_running().await {
        println!("mcpd daemon is already running.");
        println!("Socket: {:?}", client.socket_path());
        return Ok(());
    }

    tokio::fs::create_dir_all(runtime_dir()).await?;

    if background {
        println!("Starting mcpd daemon in background...");
        let pid = spawn_background(config).await?;
        println!("mcpd daemon started.");
        println!("  PID: {pid}");
        println!("  Socket: {:?}", default_socket_path());
        println!("  Log: {:?}", default_log_path());
        return Ok(());
    }

    println!("Starting mcpd daemon (foreground)...");
    println!("  Socket: {:?}", default_socket_path());
    println!("  Press Ctrl+C to stop.\n");

    let pid_path = default_pid_path();
    tokio::fs::write(&pid_path, std::process::id().to_string()).await?;

    let provider = load_provider(config)?;
    let daemon = GatewayDaemon::new(provider, None);
    let result = daemon.run().await;

    let _ = tokio::fs::remove_file(&pid_path).await;
    result
}

pub async fn run_stop() -> Result<()> {
    let client = DaemonClient::new(None);
    let pid_path = default_pid_path();

    if client.is_running().await {
        println!("Sending stop command to daemon...");
        if let Err(e) = client.stop().await {
            println!("Warning: stop command failed: {e}");
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    // The pid file survives a crashed daemon; SIGTERM is a no-op when the
    // process is already gone.
    if pid_path.exists() {
        let pid_str = tokio::fs::read_to_string(&pid_path).await?;
        if let Ok(pid) = pid_str.trim().parse::<i32>() {
            let _ = unsafe { libc::kill(pid, libc::SIGTERM) };
        }
        let _ = tokio::fs::remove_file(&pid_path).await;
    }
    let _ = tokio::fs::remove_file(default_socket_path()).await;

    println!("mcpd daemon stopped.");
    Ok(())
}

pub async fn run_daemon_status(verbose: bool) -> Result<()> {
    let client = DaemonClient::new(None);
    if !client.is_running().await {
        println!("mcpd daemon is not running.");
        println!("Start it with `mcpd daemon start`.");
        return Ok(());
    }

    let status = client.status().await?;
    println!("=== mcpd daemon ===\n");
    println!("Version:  {}", status.version);
    println!("Uptime:   {}", format_uptime(status.uptime_secs));
    println!("Clients:  {}", status.client_count);
    if verbose {
        for c in &status.clients {
            println!(
                "    {} {} (connected {}, idle {})",
                c.kind,
                c.name.as_deref().unwrap_or("unnamed"),
                format_uptime(c.connected_secs),
                format_uptime(c.idle_secs)
            );
        }
    }
    println!(
        "Servers:  {}/{} connected",
        status.connected_servers, status.total_servers
    );
    if let Some(path) = &status.config_path {
        println!("Config:   {}", path.display());
    }
    println!();
    print_server_lines(&status.servers, verbose);
    Ok(())
}

pub async fn run_logs(lines: usize, server: Option<String>) -> Result<()> {
    let client = DaemonClient::new(None);
    if client.is_running().await {
        let limit = if lines == 0 { usize::MAX } else { lines };
        let entries = client.logs(server, limit).await?;
        if entries.is_empty() {
            println!("No server logs captured yet.");
            return Ok(());
        }
        for entry in &entries {
            println!(
                "{} [{}] {} {}",
                entry.entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                entry.server,
                entry.entry.level,
                entry.entry.message
            );
        }
        return Ok(());
    }

    // Daemon down: fall back to the log file it wrote while it was alive.
    let log_path = default_log_path();
    if !log_path.exists() {
        println!("No daemon logs found.");
        println!("Expected location: {:?}", log_path);
        return Ok(());
    }
    println!("=== Daemon log ({:?}) ===\n", log_path);
    let content = tokio::fs::read_to_string(&log_path).await?;
    let all: Vec<&str> = content.lines().collect();
    let display = if lines == 0 {
        &all[..]
    } else {
        &all[all.len().saturating_sub(lines)..]
    };
    for line in display {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_toggle(server: &str, enabled: bool) -> Result<()> {
    let client = require_daemon().await?;
    client.set_server_enabled(server, enabled).await?;
    if enabled {
        println!("Server '{server}' enabled.");
    } else {
        println!("Server '{server}' disabled.");
    }
    Ok(())
}

pub async fn run_clear_blacklist(server: &str) -> Result<()> {
    let client = require_daemon().await?;
    client.clear_blacklist(server).await?;
    println!("Blacklist cleared for '{server}'.");
    Ok(())
}

pub async fn run_reload() -> Result<()> {
    let client = require_daemon().await?;
    client.reload_config().await?;
    println!("Configuration reloaded.");
    Ok(())
}

/// Make sure a daemon is reachable, spawning one in the background if not.
/// Quiet on stdout so the proxy path can use it.
pub(crate) async fn ensure_daemon_running(config: Option<PathBuf>) -> Result<()> {
    let client = DaemonClient::new(None);
    if client.is_running().await {
        return Ok(());
    }
    tracing::info!("no daemon running, starting one in the background");
    tokio::fs::create_dir_all(runtime_dir()).await?;
    spawn_background(config).await?;
    Ok(())
}

/// Re-exec ourselves as `daemon start` with output redirected to the log
/// files, then poll until the socket answers.
async fn spawn_background(config: Option<PathBuf>) -> Result<u32> {
    let log_path = default_log_path();
    let err_path = runtime_dir().join("mcpd.err");
    let current_exe = std::env::current_exe().context("cannot locate own executable")?;

    let mut command = std::process::Command::new(&current_exe);
    command.arg("daemon").arg("start");
    if let Some(path) = &config {
        command.arg("--config").arg(path);
    }
    let child = command
        .stdin(std::process::Stdio::null())
        .stdout(std::fs::File::create(&log_path)?)
        .stderr(std::fs::File::create(&err_path)?)
        .spawn()
        .context("failed to spawn daemon process")?;
    let pid = child.id();
    tokio::fs::write(default_pid_path(), pid.to_string()).await?;

    let client = DaemonClient::new(None);
    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        if client.is_running().await {
            return Ok(pid);
        }
    }
    bail!(
        "daemon did not come up within 3s; check {}",
        log_path.display()
    )
}

async fn require_daemon() -> Result<DaemonClient> {
    let client = DaemonClient::new(None);
    if !client.is_running().await {
        bail!("daemon is not running; start it with `mcpd daemon start`");
    }
    Ok(client)
}
