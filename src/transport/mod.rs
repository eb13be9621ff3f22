//! Transport adapters for MCP backend servers
//!
//! Three wire variants hide behind one [`Transport`] trait: a child process
//! speaking newline JSON over its pipes, an HTTP+SSE pair with a dynamic
//! POST endpoint, and a single-endpoint streamable HTTP server. Request
//! correlation, crash tracking and session handling live in the submodules
//! shared across variants.

pub mod crash;
pub mod pending;
pub mod session;
pub mod sse;
pub mod stdio;
pub mod streamable;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::{ServerConfig, TransportConfig};
use crate::protocol::{
    parse_tools_result, JsonRpcMessage, JsonRpcResponse, ToolDefinition, METHOD_TOOLS_CALL,
    METHOD_TOOLS_LIST, NOTIFICATION_TOOLS_CHANGED,
};
use pending::PendingRequests;

pub use sse::SseTransport;
pub use stdio::StdioTransport;
pub use streamable::StreamableHttpTransport;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Pause between attempts when an HTTP request fails at the network level.
pub const REQUEST_RETRY_PAUSE: Duration = Duration::from_millis(250);
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Stdio,
    Sse,
    StreamableHttp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::Sse => write!(f, "sse"),
            Self::StreamableHttp => write!(f, "streamable-http"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
    Blacklisted,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Backoff => write!(f, "backoff"),
            Self::Blacklisted => write!(f, "blacklisted"),
        }
    }
}

/// Lock-free connection state holder shared by the adapters.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    pub fn get(&self) -> ConnectionState {
        match self.0.load(Ordering::SeqCst) {
            0 => ConnectionState::Disconnected,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Backoff,
            _ => ConnectionState::Blacklisted,
        }
    }
}

/// Lifecycle and traffic events an adapter fans out to subscribers.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Error(String),
    /// Backend announced its tool list changed.
    ToolsChanged,
    /// A server-initiated notification other than tools/list_changed.
    Notification(Value),
    /// A raw line from the child's stderr (stdio only).
    Log { stream: &'static str, line: String },
}

/// Point-in-time view of one adapter, serialized into status replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportStatus {
    pub name: String,
    pub kind: TransportKind,
    pub state: ConnectionState,
    pub enabled: bool,
    pub crash_count: u64,
    pub recent_crashes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blacklisted_for_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("server is disabled")]
    Disabled,
    #[error("server is blacklisted for {remaining_secs}s after repeated crashes")]
    Blacklisted { remaining_secs: u64 },
    #[error("not connected")]
    NotConnected,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("session expired")]
    SessionExpired,
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("tool '{tool}' is not provided by any server")]
    ToolNotFound { tool: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("invalid transport config: {0}")]
    Config(String),
}

/// One MCP backend connection, whatever the wire underneath.
///
/// `connect` runs the full MCP handshake (initialize plus the initialized
/// notification) before reporting success; calling it while connected is a
/// no-op, while disabled or blacklisted it fails fast with the named error.
/// `disconnect` rejects everything in flight with `ConnectionClosed` and
/// tears the transport down.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> TransportKind;

    async fn connect(&self) -> Result<(), TransportError>;

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Generic request/response round trip. Allocates an adapter-local id,
    /// correlates the reply and enforces the per-server timeout.
    async fn send_request(&self, method: &str, params: Value)
        -> Result<JsonRpcResponse, TransportError>;

    /// Fresh `tools/list` round trip. Callers own any caching.
    async fn get_tools(&self) -> Result<Vec<ToolDefinition>, TransportError> {
        let resp = self.send_request(METHOD_TOOLS_LIST, json!({})).await?;
        if let Some(err) = resp.error {
            return Err(TransportError::Protocol(format!(
                "tools/list failed: {}",
                err.message
            )));
        }
        Ok(parse_tools_result(resp.result.as_ref().unwrap_or(&Value::Null)))
    }

    /// `tools/call` round trip. Error payloads come back verbatim inside the
    /// response; the id is still adapter-local here.
    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<JsonRpcResponse, TransportError> {
        self.send_request(
            METHOD_TOOLS_CALL,
            json!({ "name": name, "arguments": arguments }),
        )
        .await
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    async fn status(&self) -> TransportStatus;

    /// Toggle automatic reconnection. Does not touch blacklist state.
    fn set_enabled(&self, enabled: bool);

    /// Manual override clearing crash counters and any active blacklist.
    async fn clear_blacklist(&self) {}
}

/// Construct the right adapter for a validated server config.
pub fn build_adapter(config: &ServerConfig) -> Result<Arc<dyn Transport>, TransportError> {
    let adapter: Arc<dyn Transport> = match &config.transport {
        TransportConfig::Stdio(stdio) => {
            StdioTransport::new(config.name.as_str(), stdio.clone(), config.timeout)
        }
        TransportConfig::Sse(sse) => {
            SseTransport::new(config.name.as_str(), sse.clone(), config.timeout, config.retries)?
        }
        TransportConfig::StreamableHttp(http) => StreamableHttpTransport::new(
            config.name.as_str(),
            http.clone(),
            config.timeout,
            config.retries,
        )?,
    };
    Ok(adapter)
}

/// Route one parsed frame: responses complete their pending entry,
/// tools/list_changed becomes a [`TransportEvent::ToolsChanged`], other
/// notifications are forwarded raw. Server-initiated requests are ignored.
///
/// Every transport funnels incoming frames through here, so stdout lines,
/// SSE message events and streamed POST bodies all behave identically.
pub(crate) async fn dispatch_frame(
    server: &str,
    value: Value,
    pending: &PendingRequests,
    events: &broadcast::Sender<TransportEvent>,
) {
    match JsonRpcMessage::from_value(value) {
        Ok(JsonRpcMessage::Response(resp)) => {
            let id = resp.id.as_i64().unwrap_or(-1);
            if !pending.complete(id, resp).await {
                tracing::debug!("{server}: response for unknown request id {id}");
            }
        }
        Ok(JsonRpcMessage::Notification(note)) => {
            if note.method == NOTIFICATION_TOOLS_CHANGED {
                let _ = events.send(TransportEvent::ToolsChanged);
            } else {
                tracing::debug!("{server}: notification '{}'", note.method);
                let _ = events.send(TransportEvent::Notification(json!({
                    "method": note.method,
                    "params": note.params,
                })));
            }
        }
        Ok(JsonRpcMessage::Request(req)) => {
            tracing::debug!("{server}: ignoring server-initiated request '{}'", req.method);
        }
        Err(e) => {
            tracing::warn!("{server}: dropping malformed frame: {e}");
        }
    }
}
