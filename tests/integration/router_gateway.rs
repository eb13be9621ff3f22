//! Catalog aggregation and gateway flow over a mock fleet

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use mcpd::gateway::{Gateway, Outcome};
use mcpd::protocol::JsonRpcResponse;
use mcpd::router::{ConnectOptions, ToolRouter};
use mcpd::transport::{Transport, TransportEvent};

use super::common::{ConnectGauge, MockTransport};

async fn respond(gw: &Gateway, client: &str, raw: Value) -> JsonRpcResponse {
    match gw.handle_request(client, raw).await {
        Outcome::Respond(resp) => resp,
        Outcome::Suppress => panic!("expected a response"),
    }
}

#[tokio::test]
async fn test_full_session_against_mock_fleet() {
    let router = ToolRouter::new();
    router
        .add_adapter(MockTransport::new("alpha", &["files_read", "files_write"]))
        .await;
    router
        .add_adapter(MockTransport::new("beta", &["web_search"]))
        .await;
    router.connect_all().await;

    let gw = Gateway::new(router.clone());

    let resp = respond(
        &gw,
        "editor",
        json!({
            "jsonrpc": "2.0", "id": 0, "method": "initialize",
            "params": { "clientInfo": { "name": "it", "version": "1" } },
        }),
    )
    .await;
    assert!(resp.error.is_none());

    assert!(matches!(
        gw.handle_request(
            "editor",
            json!({ "jsonrpc": "2.0", "method": "notifications/initialized" })
        )
        .await,
        Outcome::Suppress
    ));

    let resp = respond(
        &gw,
        "editor",
        json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list", "params": {} }),
    )
    .await;
    let result = resp.result.unwrap();
    let names: Vec<&str> = result["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["files_read", "files_write", "web_search"]);

    // the caller's id survives the adapter-local rewrite
    let resp = respond(
        &gw,
        "editor",
        json!({
            "jsonrpc": "2.0", "id": 42, "method": "tools/call",
            "params": { "name": "web_search", "arguments": { "q": "x" } },
        }),
    )
    .await;
    assert_eq!(resp.id, json!(42));
    let text = resp.result.unwrap()["content"][0]["text"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(text.contains("beta"), "routed to the wrong server: {text}");
}

#[tokio::test]
async fn test_connect_all_bounds_concurrency() {
    let router = ToolRouter::new();
    let gauge = Arc::new(ConnectGauge::default());
    for i in 0..8 {
        router
            .add_adapter(MockTransport::with_delay(
                &format!("s{i}"),
                &[],
                Duration::from_millis(50),
                Some(gauge.clone()),
            ))
            .await;
    }
    router.connect_all().await;

    let (connected, total) = router.counts().await;
    assert_eq!((connected, total), (8, 8));
    assert!(
        gauge.peak() <= 4,
        "peak concurrency {} exceeded the cap",
        gauge.peak()
    );
    assert!(gauge.peak() >= 2, "connects never overlapped");
}

#[tokio::test]
async fn test_connect_options_override_cap_and_timeout() {
    let router = ToolRouter::new();
    let gauge = Arc::new(ConnectGauge::default());
    for i in 0..6 {
        router
            .add_adapter(MockTransport::with_delay(
                &format!("s{i}"),
                &[],
                Duration::from_millis(50),
                Some(gauge.clone()),
            ))
            .await;
    }
    router
        .connect_all_with(ConnectOptions {
            timeout: Duration::from_secs(5),
            max_concurrent: 2,
        })
        .await;
    assert_eq!(router.counts().await, (6, 6));
    assert!(
        gauge.peak() <= 2,
        "peak concurrency {} exceeded the custom cap",
        gauge.peak()
    );

    // a connect that cannot finish inside the budget is abandoned
    let router = ToolRouter::new();
    router
        .add_adapter(MockTransport::with_delay(
            "slow",
            &[],
            Duration::from_millis(500),
            None,
        ))
        .await;
    router
        .connect_all_with(ConnectOptions {
            timeout: Duration::from_millis(50),
            max_concurrent: 4,
        })
        .await;
    assert_eq!(router.counts().await, (0, 1));
}

#[tokio::test]
async fn test_tools_ready_stops_once_fleet_is_up() {
    let router = ToolRouter::new();
    router.add_adapter(MockTransport::new("bare", &[])).await;
    router.connect_all().await;
    let gw = Gateway::new(router);

    // every server is connected and none has tools; waiting longer
    // cannot change the answer, so the poll loop must bail out
    let started = std::time::Instant::now();
    assert_eq!(gw.wait_for_tools_ready().await, 0);
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "spent {:?} polling an already-settled fleet",
        started.elapsed()
    );
}

#[tokio::test]
async fn test_remove_adapter_drops_routes() {
    let router = ToolRouter::new();
    router.add_adapter(MockTransport::new("a", &["one"])).await;
    router.add_adapter(MockTransport::new("b", &["two"])).await;
    router.connect_all().await;
    router.get_all_tools(true).await;

    assert!(router.remove_adapter("a").await);
    let tools = router.get_all_tools(false).await;
    let names: Vec<&str> = tools.iter().map(|t| t.tool.name.as_str()).collect();
    assert_eq!(names, vec!["two"]);

    // already gone
    assert!(!router.remove_adapter("a").await);
}

#[tokio::test]
async fn test_tools_changed_event_refreshes_catalog() {
    let router = ToolRouter::new();
    let mock = MockTransport::new("dyn", &["old_tool"]);
    router.add_adapter(mock.clone()).await;
    router.connect_all().await;
    router.get_all_tools(true).await;

    mock.set_tools(&["new_tool"]);
    mock.emit(TransportEvent::ToolsChanged);

    // the event forwarder refetches in the background
    let mut found = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(25)).await;
        let tools = router.get_all_tools(false).await;
        if tools.iter().any(|t| t.tool.name == "new_tool") {
            found = true;
            break;
        }
    }
    assert!(found, "catalog never picked up the new tool");
}

#[tokio::test]
async fn test_disconnect_event_clears_contribution() {
    let router = ToolRouter::new();
    let steady = MockTransport::new("steady", &["stays"]);
    let flaky = MockTransport::new("flaky", &["goes"]);
    router.add_adapter(steady).await;
    router.add_adapter(flaky.clone()).await;
    router.connect_all().await;
    router.get_all_tools(true).await;

    flaky.disconnect().await;

    let mut names: Vec<String> = Vec::new();
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(25)).await;
        names = router
            .get_all_tools(false)
            .await
            .into_iter()
            .map(|t| t.tool.name)
            .collect();
        if names == vec!["stays".to_string()] {
            break;
        }
    }
    assert_eq!(names, vec!["stays".to_string()]);
}
