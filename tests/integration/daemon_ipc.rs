//! Daemon multiplexer over a per-test Unix socket

use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tempfile::TempDir;
use tokio::task::JoinHandle;

use mcpd::config::{ConfigProvider, GatewayConfig};
use mcpd::daemon::protocol::{ClientKind, DaemonEvent, DaemonMessage};
use mcpd::daemon::{DaemonClient, DaemonConnection, GatewayDaemon, McpFrame};
use mcpd::protocol::JsonRpcResponse;

use super::common::FAKE_SERVER;

fn fake_fleet_config() -> GatewayConfig {
    serde_json::from_value(json!({
        "mcpServers": {
            "fake": { "command": "sh", "args": ["-c", FAKE_SERVER], "timeout": 5 },
        }
    }))
    .unwrap()
}

/// Boot a daemon on a throwaway socket and wait until it answers pings.
async fn start_daemon(config: GatewayConfig) -> (TempDir, DaemonClient, JoinHandle<Result<()>>) {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("daemon.sock");
    let provider = ConfigProvider::new(config, None);
    let daemon = GatewayDaemon::new(provider, Some(socket.clone()));
    let handle = tokio::spawn(daemon.run());

    let client = DaemonClient::new(Some(socket));
    for _ in 0..100 {
        if client.is_running().await {
            return (dir, client, handle);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("daemon never came up on {}", client.socket_path().display());
}

async fn next_response(conn: &mut DaemonConnection) -> JsonRpcResponse {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match conn.next_mcp().await.unwrap() {
                Some(McpFrame::Response(response)) => return response,
                Some(McpFrame::Notification(_)) => continue,
                None => panic!("daemon closed the connection"),
            }
        }
    })
    .await
    .expect("timed out waiting for an mcp response")
}

#[tokio::test]
async fn test_oneshot_ping_status_stop() {
    let (_dir, client, handle) = start_daemon(GatewayConfig::default()).await;

    client.ping().await.unwrap();
    let status = client.status().await.unwrap();
    assert_eq!(status.total_servers, 0);
    assert_eq!(status.client_count, 0);
    assert_eq!(status.version, env!("CARGO_PKG_VERSION"));

    client.stop().await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("daemon did not shut down")
        .unwrap()
        .unwrap();
    assert!(!client.is_running().await);
}

#[tokio::test]
async fn test_mcp_session_through_daemon() {
    let (_dir, client, _handle) = start_daemon(fake_fleet_config()).await;

    let mut conn = client.connect(ClientKind::Cli, None).await.unwrap();
    conn.send(json!({
        "jsonrpc": "2.0", "id": 1, "method": "initialize",
        "params": { "clientInfo": { "name": "it", "version": "0" } },
    }))
    .await
    .unwrap();
    let resp = next_response(&mut conn).await;
    assert!(resp.error.is_none(), "initialize failed: {:?}", resp.error);

    conn.send(json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list", "params": {} }))
        .await
        .unwrap();
    let resp = next_response(&mut conn).await;
    let tools = resp.result.unwrap()["tools"].as_array().unwrap().clone();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0]["name"], "fake_echo");

    conn.send(json!({
        "jsonrpc": "2.0", "id": 3, "method": "tools/call",
        "params": { "name": "fake_echo", "arguments": { "text": "hi" } },
    }))
    .await
    .unwrap();
    let resp = next_response(&mut conn).await;
    assert_eq!(resp.id, json!(3));
    let text = resp.result.unwrap()["content"][0]["text"]
        .as_str()
        .unwrap()
        .to_string();
    assert_eq!(text, "echoed");

    // the persistent connection shows up in status, one-shots never do
    let status = client.status().await.unwrap();
    assert_eq!(status.client_count, 1);
    assert_eq!(status.clients[0].kind, ClientKind::Cli);

    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_disable_and_enable_server() {
    let (_dir, client, _handle) = start_daemon(fake_fleet_config()).await;

    assert_eq!(client.status().await.unwrap().total_servers, 1);
    assert_eq!(client.tools().await.unwrap().len(), 1);

    client.set_server_enabled("fake", false).await.unwrap();
    assert_eq!(client.status().await.unwrap().total_servers, 0);
    assert!(client.tools().await.unwrap().is_empty());

    client.set_server_enabled("fake", true).await.unwrap();
    let status = client.status().await.unwrap();
    assert_eq!(status.total_servers, 1);
    assert_eq!(status.connected_servers, 1);
    let tools = client.tools().await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "fake_echo");

    // unknown names are rejected rather than ignored
    assert!(client.set_server_enabled("missing", false).await.is_err());

    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_events_reach_persistent_clients() {
    let (_dir, client, _handle) = start_daemon(fake_fleet_config()).await;

    let mut watcher = client
        .connect(ClientKind::Web, Some("watcher".to_string()))
        .await
        .unwrap();

    let mut caller = client.connect(ClientKind::Cli, None).await.unwrap();
    caller
        .send(json!({
            "jsonrpc": "2.0", "id": 1, "method": "initialize",
            "params": { "clientInfo": { "name": "it", "version": "0" } },
        }))
        .await
        .unwrap();
    next_response(&mut caller).await;
    caller
        .send(json!({
            "jsonrpc": "2.0", "id": 2, "method": "tools/call",
            "params": { "name": "fake_echo", "arguments": {} },
        }))
        .await
        .unwrap();
    next_response(&mut caller).await;

    let called = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match watcher.recv().await.unwrap() {
                Some(DaemonMessage::Event {
                    event: DaemonEvent::ToolCalled { tool, ok, .. },
                }) => return (tool, ok),
                Some(_) => continue,
                None => panic!("watcher connection closed"),
            }
        }
    })
    .await
    .expect("tool-call event never arrived");
    assert_eq!(called, ("fake_echo".to_string(), true));

    client.stop().await.unwrap();
}
