//! Status command handler
//!
//! Shows the daemon's view when one is running, otherwise connects to
//! each configured server directly.

use std::path::PathBuf;

use anyhow::Result;

use crate::daemon::DaemonClient;
use crate::transport::{build_adapter, ConnectionState, TransportStatus};

use super::{first_line_snippet, load_provider};

pub async fn run_status(config: Option<PathBuf>, verbose: bool) -> Result<()> {
    let client = DaemonClient::new(None);
    if client.is_running().await {
        daemon_status(&client, verbose).await
    } else {
        standalone_status(config, verbose).await
    }
}

async fn daemon_status(client: &DaemonClient, verbose: bool) -> Result<()> {
    let status = client.status().await?;
    println!("=== MCP Server Status (daemon) ===\n");
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
        "Servers:  {}/{} connected\n",
        status.connected_servers, status.total_servers
    );
    print_server_lines(&status.servers, verbose);

    let tools = client.tools().await?;
    if verbose && !tools.is_empty() {
        println!();
        for tool in &tools {
            println!(
                "  - {}/{} : {}",
                tool.server,
                tool.name,
                first_line_snippet(tool.description.as_deref())
            );
        }
    }
    println!(
        "\nTotal: {} tools across {} servers",
        tools.len(),
        status.connected_servers
    );
    Ok(())
}

async fn standalone_status(config: Option<PathBuf>, verbose: bool) -> Result<()> {
    println!("=== MCP Server Status ===\n");

    let provider = load_provider(config)?;
    let servers = provider.enabled_servers().await?;
    if servers.is_empty() {
        match provider.path() {
            Some(path) => println!("No enabled servers in {}.", path.display()),
            None => {
                println!("No MCP servers configured.");
                println!("Create an mcpd.json to configure servers.");
            }
        }
        return Ok(());
    }

    println!("Configured servers: {}\n", servers.len());
    let mut total_tools = 0usize;
    let mut connected = 0usize;
    for server in &servers {
        print!("  {} ", server.name);
        let adapter = match build_adapter(server) {
            Ok(adapter) => adapter,
            Err(e) => {
                println!("✗ Invalid config: {e}");
                continue;
            }
        };
        match adapter.connect().await {
            Ok(()) => match adapter.get_tools().await {
                Ok(tools) => {
                    connected += 1;
                    total_tools += tools.len();
                    println!("✓ {} tools", tools.len());
                    if verbose {
                        for tool in &tools {
                            println!(
                                "      - {} : {}",
                                tool.name,
                                first_line_snippet(tool.description.as_deref())
                            );
                        }
                    }
                }
                Err(e) => println!("✗ Failed to list tools: {e}"),
            },
            Err(e) => println!("✗ Failed: {e}"),
        }
        adapter.disconnect().await;
    }

    println!("\nTotal: {total_tools} tools across {connected} servers");
    Ok(())
}

/// One `✓ name (kind, state)` line per server, with crash detail when
/// verbose.
pub(crate) fn print_server_lines(servers: &[TransportStatus], verbose: bool) {
    for server in servers {
        let mark = if server.state == ConnectionState::Connected {
            "✓"
        } else {
            "✗"
        };
        let mut notes = vec![server.kind.to_string(), server.state.to_string()];
        if !server.enabled {
            notes.push("disabled".to_string());
        }
        if let Some(secs) = server.blacklisted_for_secs {
            notes.push(format!("blacklisted {secs}s"));
        }
        println!("  {mark} {} ({})", server.name, notes.join(", "));
        if verbose {
            if server.crash_count > 0 {
                println!(
                    "      crashes: {} total, {} in the last 5m",
                    server.crash_count, server.recent_crashes
                );
            }
            if let Some(detail) = &server.detail {
                println!("      {detail}");
            }
        }
    }
}

pub(crate) fn format_uptime(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m}m {s}s")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}
