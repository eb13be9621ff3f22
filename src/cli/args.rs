//! Main CLI struct and Commands enum for clap parsing.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use super::daemon_args::DaemonCommands;

#[derive(Parser)]
#[command(name = "mcpd")]
#[command(about = "MCP gateway: many tool servers behind one stdio endpoint")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the gateway config (default: discover the nearest mcpd.json)
    #[arg(long, env = "MCPD_CONFIG", global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Speak MCP on stdio with an in-process server fleet
    Serve,
    /// Speak MCP on stdio through the shared daemon (starts it if needed)
    Proxy,
    /// List tools from all configured servers
    Tools {
        /// Only list tools from a specific server
        #[arg(long)]
        server: Option<String>,
        /// Emit the catalog as JSON
        #[arg(long)]
        json: bool,
    },
    /// Call a tool directly
    Call {
        /// Tool name
        tool: String,
        /// Arguments as JSON
        #[arg(long, short)]
        args: Option<String>,
    },
    /// Show server status and tool counts
    Status {
        /// Show the tool list for each server
        #[arg(long, short)]
        verbose: bool,
    },
    /// Manage the shared daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },
}
