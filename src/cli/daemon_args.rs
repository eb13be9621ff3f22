//! Daemon subcommands
//!
//! Commands for managing the shared gateway daemon.

use clap::Subcommand;

#[derive(Subcommand)]
pub enum DaemonCommands {
    /// Start the daemon
    Start {
        /// Run as a background process
        #[arg(long, short)]
        background: bool,
    },
    /// Stop the daemon
    Stop,
    /// Show daemon status
    Status {
        /// Show crash details for each server
        #[arg(long, short)]
        verbose: bool,
    },
    /// View captured server logs, or the daemon log file when stopped
    Logs {
        /// Number of lines to show (0 = all)
        #[arg(long, short, default_value = "50")]
        lines: usize,
        /// Only show logs from a specific server
        #[arg(long)]
        server: Option<String>,
    },
    /// Enable a configured server and connect it
    Enable {
        /// Server name
        server: String,
    },
    /// Disable a server and tear it down
    Disable {
        /// Server name
        server: String,
    },
    /// Clear the crash blacklist for a server
    ClearBlacklist {
        /// Server name
        server: String,
    },
    /// Reload the configuration file
    Reload,
}
