//! Direct tool invocation handler

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};

use crate::daemon::protocol::ClientKind;
use crate::daemon::{DaemonClient, DaemonConnection, McpFrame};
use crate::protocol::{initialize_params, JsonRpcResponse};

use super::{build_fleet, load_provider};

const CALL_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn run_call(config: Option<PathBuf>, tool: &str, args: Option<String>) -> Result<()> {
    let arguments: Value = match args {
        Some(raw) => serde_json::from_str(&raw).context("arguments are not valid JSON")?,
        None => json!({}),
    };

    let client = DaemonClient::new(None);
    let response = if client.is_running().await {
        call_via_daemon(&client, tool, arguments).await?
    } else {
        let provider = load_provider(config)?;
        let router = build_fleet(&provider).await?;
        router.get_all_tools(true).await;
        let outcome = router.call_tool(tool, arguments).await;
        router.disconnect_all().await;
        outcome?
    };

    if let Some(error) = response.error {
        bail!("tool call failed: {} (code {})", error.message, error.code);
    }
    match response.result {
        Some(result) => println!("{}", serde_json::to_string_pretty(&result)?),
        None => println!("(no result)"),
    }
    Ok(())
}

/// The gateway refuses tools/call before initialize, so run the whole
/// exchange over one persistent connection.
async fn call_via_daemon(
    client: &DaemonClient,
    tool: &str,
    arguments: Value,
) -> Result<JsonRpcResponse> {
    let mut conn = client
        .connect(ClientKind::Cli, Some("mcpd-call".to_string()))
        .await?;

    conn.send(json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": initialize_params(),
    }))
    .await?;
    let init = wait_for_response(&mut conn, 1).await?;
    if let Some(error) = init.error {
        bail!("initialize failed: {}", error.message);
    }

    conn.send(json!({
        "jsonrpc": "2.0",
        "id": 2,
        "method": "tools/call",
        "params": { "name": tool, "arguments": arguments },
    }))
    .await?;
    wait_for_response(&mut conn, 2).await
}

async fn wait_for_response(conn: &mut DaemonConnection, id: i64) -> Result<JsonRpcResponse> {
    tokio::time::timeout(CALL_TIMEOUT, async {
        loop {
            match conn.next_mcp().await? {
                None => bail!("daemon closed the connection"),
                Some(McpFrame::Response(response)) if response.id == json!(id) => {
                    return Ok(response);
                }
                Some(_) => continue,
            }
        }
    })
    .await
    .context("timed out waiting for the daemon")?
}
