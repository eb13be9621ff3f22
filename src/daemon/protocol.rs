//! IPC vocabulary between the daemon and its local clients
//!
//! Everything on the Unix socket is newline-delimited JSON, one message per
//! line, tagged by `type`. Control commands (status, logs, config toggles)
//! and proxied MCP traffic share the same framing.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::logstore::LogEntry;
use crate::protocol::{JsonRpcNotification, JsonRpcResponse};
use crate::transport::TransportStatus;

/// Everything the daemon writes lives under one cache directory.
pub fn runtime_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("mcpd")
}

pub fn default_socket_path() -> PathBuf {
    runtime_dir().join("mcpd.sock")
}

pub fn default_pid_path() -> PathBuf {
    runtime_dir().join("mcpd.pid")
}

pub fn default_log_path() -> PathBuf {
    runtime_dir().join("mcpd.log")
}

fn default_log_lines() -> usize {
    50
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientKind {
    /// An MCP client proxied over stdio.
    Stdio,
    /// A long-lived observer (dashboard or similar).
    Web,
    /// One-shot command line invocation.
    Cli,
}

impl std::fmt::Display for ClientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::Web => write!(f, "web"),
            Self::Cli => write!(f, "cli"),
        }
    }
}

/// Messages a client sends to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Opens a persistent connection. Without it the first message is
    /// treated as a one-shot command and the connection closed after the
    /// reply.
    Handshake {
        kind: ClientKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// A raw MCP frame to run through the gateway.
    McpRequest { request: Value },
    GetStatus,
    GetTools,
    GetLogs {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server: Option<String>,
        #[serde(default = "default_log_lines")]
        lines: usize,
    },
    ReloadConfig,
    SetServerEnabled { server: String, enabled: bool },
    ClearBlacklist { server: String },
    Ping,
    Stop,
}

/// Messages the daemon sends back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DaemonMessage {
    HandshakeAck {
        client_id: String,
        server: String,
        version: String,
    },
    McpResponse { response: JsonRpcResponse },
    McpNotification { notification: JsonRpcNotification },
    Status { status: DaemonStatus },
    Tools { tools: Vec<ToolInfo> },
    Logs { entries: Vec<ServerLogEntry> },
    Ok,
    Pong,
    Error { message: String },
    /// Pushed to persistent clients as the fleet changes.
    Event { event: DaemonEvent },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub version: String,
    pub uptime_secs: u64,
    pub client_count: usize,
    pub connected_servers: usize,
    pub total_servers: usize,
    pub servers: Vec<TransportStatus>,
    #[serde(default)]
    pub clients: Vec<ClientInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<PathBuf>,
}

/// One attached persistent client as reported in [`DaemonStatus`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: String,
    pub kind: ClientKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub connected_secs: u64,
    pub idle_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub server: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerLogEntry {
    pub server: String,
    #[serde(flatten)]
    pub entry: LogEntry,
}

/// Fleet happenings broadcast to persistent clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DaemonEvent {
    ServerConnected { server: String },
    ServerDisconnected { server: String },
    ServerError { server: String, message: String },
    RoutesUpdated { server: String, tool_count: usize },
    ToolCalled {
        server: String,
        tool: String,
        ok: bool,
        duration_ms: u64,
    },
    ConfigChanged,
}
