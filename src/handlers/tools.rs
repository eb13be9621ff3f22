//! Tool catalog handler

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;

use crate::daemon::protocol::ToolInfo;
use crate::daemon::DaemonClient;

use super::{build_fleet, first_line_snippet, load_provider};

pub async fn run_tools(config: Option<PathBuf>, server: Option<String>, json: bool) -> Result<()> {
    let mut tools = collect_tools(config).await?;
    if let Some(name) = &server {
        tools.retain(|t| &t.server == name);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&tools)?);
        return Ok(());
    }

    if tools.is_empty() {
        match server {
            Some(name) => println!("No tools available from '{name}'."),
            None => println!("No tools available."),
        }
        return Ok(());
    }

    let mut by_server: BTreeMap<&str, Vec<&ToolInfo>> = BTreeMap::new();
    for tool in &tools {
        by_server.entry(tool.server.as_str()).or_default().push(tool);
    }

    println!("=== Available Tools ===\n");
    for (name, server_tools) in &by_server {
        println!("{name}:");
        for tool in server_tools {
            println!(
                "  - {} : {}",
                tool.name,
                first_line_snippet(tool.description.as_deref())
            );
        }
        println!();
    }
    println!(
        "Total: {} tools across {} servers",
        tools.len(),
        by_server.len()
    );
    Ok(())
}

/// Prefer the running daemon's catalog; otherwise spin up a fleet just
/// for this command.
async fn collect_tools(config: Option<PathBuf>) -> Result<Vec<ToolInfo>> {
    let client = DaemonClient::new(None);
    if client.is_running().await {
        return client.tools().await;
    }

    let provider = load_provider(config)?;
    let router = build_fleet(&provider).await?;
    let tools = router
        .get_all_tools(true)
        .await
        .into_iter()
        .map(|t| ToolInfo {
            server: t.server,
            name: t.tool.name,
            description: t.tool.description,
            input_schema: t.tool.input_schema,
        })
        .collect();
    router.disconnect_all().await;
    Ok(tools)
}
