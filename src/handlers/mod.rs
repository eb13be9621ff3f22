//! Command handlers
//!
//! One module per subcommand, each exposing a `run_*` function.
//! [`run`] dispatches a parsed [`Cli`] to the right handler.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::cli::{Cli, Commands};
use crate::config::ConfigProvider;
use crate::router::ToolRouter;
use crate::transport::build_adapter;

pub mod call;
pub mod daemon;
pub mod proxy;
pub mod serve;
pub mod status;
pub mod tools;

pub use call::run_call;
pub use daemon::run_daemon_command;
pub use proxy::run_proxy;
pub use serve::run_serve;
pub use status::run_status;
pub use tools::run_tools;

/// Dispatch a parsed command line to its handler.
pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Serve => run_serve(cli.config).await,
        Commands::Proxy => run_proxy(cli.config).await,
        Commands::Tools { server, json } => run_tools(cli.config, server, json).await,
        Commands::Call { tool, args } => run_call(cli.config, &tool, args).await,
        Commands::Status { verbose } => run_status(cli.config, verbose).await,
        Commands::Daemon { command } => run_daemon_command(cli.config, command).await,
    }
}

/// Resolve the config provider from an explicit path or by discovery.
pub(crate) fn load_provider(config: Option<PathBuf>) -> Result<ConfigProvider> {
    match config {
        Some(path) => ConfigProvider::from_path(&path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => ConfigProvider::discover(),
    }
}

/// Build a router over every enabled server and connect the fleet.
pub(crate) async fn build_fleet(provider: &ConfigProvider) -> Result<Arc<ToolRouter>> {
    let router = ToolRouter::new();
    for config in &provider.enabled_servers().await? {
        match build_adapter(config) {
            Ok(adapter) => router.add_adapter(adapter).await,
            Err(e) => tracing::error!("skipping '{}': {e:#}", config.name),
        }
    }
    router.connect_all().await;
    Ok(router)
}

/// First line of a tool description, truncated for list output.
pub(crate) fn first_line_snippet(description: Option<&str>) -> String {
    let line = description
        .unwrap_or("No description")
        .lines()
        .next()
        .unwrap_or("");
    if line.chars().count() > 60 {
        let head: String = line.chars().take(60).collect();
        format!("{head}...")
    } else {
        line.to_string()
    }
}
