//! Stdio proxy through the shared daemon
//!
//! Speaks MCP on stdin/stdout but forwards every frame over the daemon
//! socket, so any number of editors share one backend fleet. The daemon
//! is started in the background if nothing answers on the socket.

use std::path::PathBuf;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::daemon::protocol::ClientKind;
use crate::daemon::{DaemonClient, McpFrame};

use super::daemon::ensure_daemon_running;

pub async fn run_proxy(config: Option<PathBuf>) -> Result<()> {
    ensure_daemon_running(config).await?;

    let client = DaemonClient::new(None);
    let conn = client.connect(ClientKind::Stdio, None).await?;
    tracing::info!("proxy connected as '{}'", conn.client_id());
    let (mut receiver, mut sender) = conn.into_split();

    // Requests flow stdin -> daemon on their own task; responses and
    // notifications flow back on this one.
    let stdin_task = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<serde_json::Value>(&line) {
                Ok(request) => {
                    if sender.send(request).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!("dropping unparseable stdin line: {e}"),
            }
        }
    });

    let mut stdout = tokio::io::stdout();
    while let Some(frame) = receiver.next_mcp().await? {
        let mut line = match frame {
            McpFrame::Response(response) => serde_json::to_vec(&response)?,
            McpFrame::Notification(notification) => serde_json::to_vec(&notification)?,
        };
        line.push(b'\n');
        stdout.write_all(&line).await?;
        stdout.flush().await?;
    }

    stdin_task.abort();
    tracing::info!("daemon hung up, proxy exiting");
    Ok(())
}
