//! Shared fixtures: an in-memory mock transport and a /bin/sh scripted
//! MCP server that answers over stdio.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use mcpd::config::{RawServerConfig, ServerConfig};
use mcpd::protocol::{JsonRpcResponse, ToolDefinition, METHOD_NOT_FOUND};
use mcpd::transport::{
    ConnectionState, Transport, TransportError, TransportEvent, TransportKind, TransportStatus,
    EVENT_CHANNEL_CAPACITY,
};

/// Answers initialize, tools/list and tools/call by echoing the request id
/// back, and ignores notifications. Stays alive until stdin closes.
pub const FAKE_SERVER: &str = r#"
while read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"initialize"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2025-03-26","capabilities":{"tools":{}},"serverInfo":{"name":"fake","version":"0.1"}}}\n' "$id";;
    *'"tools/list"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"fake_echo","description":"Echoes input","inputSchema":{"type":"object"}}]}}\n' "$id";;
    *'"tools/call"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"echoed"}]}}\n' "$id";;
  esac
done
"#;

/// Stdio server config running `sh -c <script>`.
pub fn stdio_server(name: &str, script: &str, timeout_secs: u64) -> ServerConfig {
    let raw: RawServerConfig = serde_json::from_value(json!({
        "command": "sh",
        "args": ["-c", script],
        "timeout": timeout_secs,
    }))
    .unwrap();
    raw.into_typed(name).unwrap()
}

pub fn tool(name: &str) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: Some(format!("{name} tool")),
        input_schema: Some(json!({"type": "object"})),
    }
}

/// Tracks how many connects are in flight at once.
#[derive(Default)]
pub struct ConnectGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConnectGauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub struct MockTransport {
    name: String,
    tools: Mutex<Vec<ToolDefinition>>,
    connected: AtomicBool,
    connect_delay: Duration,
    gauge: Option<Arc<ConnectGauge>>,
    events: broadcast::Sender<TransportEvent>,
}

impl MockTransport {
    pub fn new(name: &str, tool_names: &[&str]) -> Arc<Self> {
        Self::with_delay(name, tool_names, Duration::ZERO, None)
    }

    pub fn with_delay(
        name: &str,
        tool_names: &[&str],
        connect_delay: Duration,
        gauge: Option<Arc<ConnectGauge>>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            name: name.to_string(),
            tools: Mutex::new(tool_names.iter().map(|n| tool(n)).collect()),
            connected: AtomicBool::new(false),
            connect_delay,
            gauge,
            events,
        })
    }

    pub fn set_tools(&self, tool_names: &[&str]) {
        *self.tools.lock().unwrap() = tool_names.iter().map(|n| tool(n)).collect();
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn connect(&self) -> Result<(), TransportError> {
        if let Some(gauge) = &self.gauge {
            gauge.enter();
        }
        if self.connect_delay > Duration::ZERO {
            tokio::time::sleep(self.connect_delay).await;
        }
        if let Some(gauge) = &self.gauge {
            gauge.exit();
        }
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Disconnected);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_request(
        &self,
        method: &str,
        params: Value,
    ) -> Result<JsonRpcResponse, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        match method {
            "tools/list" => {
                let tools = self.tools.lock().unwrap().clone();
                Ok(JsonRpcResponse::ok(json!(99), json!({ "tools": tools })))
            }
            "tools/call" => {
                let name = params["name"].as_str().unwrap_or("").to_string();
                Ok(JsonRpcResponse::ok(
                    json!(99),
                    json!({
                        "content": [{
                            "type": "text",
                            "text": format!("{} ran {name}", self.name),
                        }]
                    }),
                ))
            }
            other => Ok(JsonRpcResponse::err(
                json!(99),
                METHOD_NOT_FOUND,
                format!("unknown method {other}"),
            )),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn status(&self) -> TransportStatus {
        TransportStatus {
            name: self.name.clone(),
            kind: TransportKind::Stdio,
            state: if self.is_connected() {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            },
            enabled: true,
            crash_count: 0,
            recent_crashes: 0,
            blacklisted_for_secs: None,
            detail: None,
        }
    }

    fn set_enabled(&self, _enabled: bool) {}
}
