use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mcpd::cli::Cli;
use mcpd::handlers;

#[tokio::main]
async fn main() -> Result<()> {
    // Logging goes to stderr: stdout carries MCP protocol frames in
    // serve and proxy modes.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .with(EnvFilter::from_default_env().add_directive("mcpd=info".parse()?))
        .init();

    let cli = Cli::parse();
    handlers::run(cli).await
}
