//! Stdio transport against a /bin/sh scripted MCP server

use serde_json::json;

use mcpd::transport::{build_adapter, ConnectionState, TransportError, TransportKind};

use super::common::{stdio_server, FAKE_SERVER};

#[tokio::test]
async fn test_handshake_tools_and_call() {
    let config = stdio_server("fake", FAKE_SERVER, 5);
    let adapter = build_adapter(&config).unwrap();

    adapter.connect().await.unwrap();
    assert!(adapter.is_connected());

    let status = adapter.status().await;
    assert_eq!(status.kind, TransportKind::Stdio);
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.crash_count, 0);

    let tools = adapter.get_tools().await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "fake_echo");
    assert_eq!(tools[0].description.as_deref(), Some("Echoes input"));

    let resp = adapter
        .call_tool("fake_echo", json!({"text": "hi"}))
        .await
        .unwrap();
    assert_eq!(resp.result.unwrap()["content"][0]["text"], "echoed");

    adapter.disconnect().await;
    assert!(!adapter.is_connected());
}

#[tokio::test]
async fn test_connect_is_idempotent() {
    let config = stdio_server("fake", FAKE_SERVER, 5);
    let adapter = build_adapter(&config).unwrap();

    adapter.connect().await.unwrap();
    // second connect on a live transport is a no-op, not a respawn
    adapter.connect().await.unwrap();
    assert!(adapter.is_connected());
    adapter.disconnect().await;
}

#[tokio::test]
async fn test_connect_fails_when_child_exits_immediately() {
    let config = stdio_server("dies", "exit 3", 2);
    let adapter = build_adapter(&config).unwrap();

    assert!(adapter.connect().await.is_err());
    assert!(!adapter.is_connected());

    let status = adapter.status().await;
    assert_ne!(status.state, ConnectionState::Connected);
}

#[tokio::test]
async fn test_handshake_timeout_against_silent_server() {
    // cat swallows stdin and never answers, so initialize must time out
    let config = stdio_server("silent", "cat >/dev/null", 1);
    let adapter = build_adapter(&config).unwrap();

    let err = adapter.connect().await.unwrap_err();
    assert!(matches!(err, TransportError::Timeout(_)), "got {err:?}");
    assert!(!adapter.is_connected());
}

#[tokio::test]
async fn test_spawn_failure_is_immediate() {
    let raw: mcpd::config::RawServerConfig = serde_json::from_value(json!({
        "command": "/nonexistent/definitely-not-a-binary",
        "timeout": 2,
    }))
    .unwrap();
    let config = raw.into_typed("ghost").unwrap();
    let adapter = build_adapter(&config).unwrap();

    let err = adapter.connect().await.unwrap_err();
    assert!(matches!(err, TransportError::Spawn { .. }), "got {err:?}");
}
