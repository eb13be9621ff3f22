//! Protocol gateway
//!
//! Implements the client-facing MCP surface on top of the router: answers
//! initialize, serves the aggregated tools/list, forwards tools/call with the
//! caller's id, and keeps a per-client dedup window so a retried request is
//! answered at most once. Clients never see individual backends, only the
//! merged catalog.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};

use crate::protocol::{
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, INTERNAL_ERROR,
    INVALID_PARAMS, INVALID_REQUEST, MCP_PROTOCOL_VERSION, METHOD_INITIALIZE, METHOD_NOT_FOUND,
    METHOD_PING, METHOD_PROMPTS_LIST, METHOD_RESOURCES_LIST, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
    NOTIFICATION_TOOLS_CHANGED, PARSE_ERROR, SERVER_NOT_INITIALIZED,
};
use crate::router::ToolRouter;
use crate::transport::TransportError;

/// Dedup window size per gateway; trims down to half when full.
pub const DEDUP_CAPACITY: usize = 300;
pub const DEDUP_TRIM_TO: usize = 150;

/// Grace periods before answering tools/list while the fleet is still
/// coming up: none when everything is connected, short when at least half
/// is, longer when fewer are.
const WAIT_PARTIAL: Duration = Duration::from_secs(1);
const WAIT_SPARSE: Duration = Duration::from_secs(2);
const WAIT_CAP: Duration = Duration::from_secs(3);

const LOW_COUNT_RETRIES: u32 = 2;
const LOW_COUNT_PAUSE: Duration = Duration::from_millis(500);

const READY_POLLS: u32 = 10;
const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// What to do with a frame a client sent.
#[derive(Debug)]
pub enum Outcome {
    /// Write this response back to the client.
    Respond(JsonRpcResponse),
    /// Write nothing: the frame was a notification, a duplicate, or a
    /// response the client sent us.
    Suppress,
}

/// The client whose initialize arrived first. It is the one that receives
/// tools/list_changed pushes, provided it advertised support for them.
#[derive(Debug, Clone)]
pub struct PrimaryClient {
    pub client_id: String,
    pub name: String,
    pub version: String,
    pub supports_list_changed: bool,
}

/// Bounded insert-once set with FIFO eviction.
struct DedupWindow {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl DedupWindow {
    fn new() -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// True if the key is new. At capacity the oldest half is dropped, so
    /// recent retries keep being recognized.
    fn insert(&mut self, key: String) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() >= DEDUP_CAPACITY {
            while self.order.len() > DEDUP_TRIM_TO {
                if let Some(old) = self.order.pop_front() {
                    self.seen.remove(&old);
                }
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        true
    }
}

pub struct Gateway {
    router: Arc<ToolRouter>,
    dedup: Mutex<DedupWindow>,
    primary: RwLock<Option<PrimaryClient>>,
    initialized: AtomicBool,
}

impl Gateway {
    pub fn new(router: Arc<ToolRouter>) -> Self {
        Self {
            router,
            dedup: Mutex::new(DedupWindow::new()),
            primary: RwLock::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn router(&self) -> &Arc<ToolRouter> {
        &self.router
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub async fn primary_client(&self) -> Option<PrimaryClient> {
        self.primary.read().await.clone()
    }

    /// Drop per-client state when a client goes away. A departing primary
    /// frees the slot for the next initialize.
    pub async fn forget_client(&self, client_id: &str) {
        let mut primary = self.primary.write().await;
        if primary.as_ref().is_some_and(|p| p.client_id == client_id) {
            tracing::info!("primary client {client_id} disconnected");
            *primary = None;
        }
    }

    /// Entry point for raw line-delimited input (stdio clients).
    pub async fn handle_line(&self, client_id: &str, line: &str) -> Outcome {
        match serde_json::from_str::<Value>(line) {
            Ok(value) => self.handle_request(client_id, value).await,
            Err(e) => Outcome::Respond(JsonRpcResponse::err(
                Value::Null,
                PARSE_ERROR,
                format!("parse error: {e}"),
            )),
        }
    }

    /// Entry point for already-parsed frames. Notifications and duplicate
    /// requests produce [`Outcome::Suppress`]; everything else gets exactly
    /// one response.
    pub async fn handle_request(&self, client_id: &str, raw: Value) -> Outcome {
        let message = match JsonRpcMessage::from_value(raw) {
            Ok(message) => message,
            Err(e) => {
                return Outcome::Respond(JsonRpcResponse::err(
                    Value::Null,
                    INVALID_REQUEST,
                    format!("invalid request: {e}"),
                ));
            }
        };
        match message {
            JsonRpcMessage::Notification(note) => {
                tracing::debug!("{client_id}: notification '{}'", note.method);
                Outcome::Suppress
            }
            JsonRpcMessage::Response(_) => Outcome::Suppress,
            JsonRpcMessage::Request(req) => {
                let key = format!("{client_id}:{}:{}", req.method, req.id);
                if !self.dedup.lock().await.insert(key) {
                    tracing::debug!(
                        "{client_id}: suppressing duplicate {} (id {})",
                        req.method,
                        req.id
                    );
                    return Outcome::Suppress;
                }
                Outcome::Respond(self.dispatch(client_id, req).await)
            }
        }
    }

    async fn dispatch(&self, client_id: &str, req: JsonRpcRequest) -> JsonRpcResponse {
        let id = req.id.clone();
        if !self.initialized.load(Ordering::SeqCst)
            && req.method != METHOD_INITIALIZE
            && req.method != METHOD_PING
        {
            return JsonRpcResponse::err(id, SERVER_NOT_INITIALIZED, "server not initialized");
        }
        match req.method.as_str() {
            METHOD_INITIALIZE => self.handle_initialize(client_id, req).await,
            METHOD_TOOLS_LIST => self.handle_tools_list(id).await,
            METHOD_TOOLS_CALL => self.handle_tools_call(id, req.params_ref()).await,
            METHOD_RESOURCES_LIST => JsonRpcResponse::ok(id, json!({ "resources": [] })),
            METHOD_PROMPTS_LIST => JsonRpcResponse::ok(id, json!({ "prompts": [] })),
            METHOD_PING => JsonRpcResponse::ok(id, json!({})),
            other => {
                JsonRpcResponse::err(id, METHOD_NOT_FOUND, format!("method not found: {other}"))
            }
        }
    }

    async fn handle_initialize(&self, client_id: &str, req: JsonRpcRequest) -> JsonRpcResponse {
        let params = req.params_ref();
        let name = params
            .pointer("/clientInfo/name")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let version = params
            .pointer("/clientInfo/version")
            .and_then(Value::as_str)
            .unwrap_or("0.0.0")
            .to_string();
        let supports_list_changed = params
            .pointer("/capabilities/tools/listChanged")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        {
            let mut primary = self.primary.write().await;
            if primary.is_none() {
                tracing::info!("primary client is {name} v{version} ({client_id})");
                *primary = Some(PrimaryClient {
                    client_id: client_id.to_string(),
                    name,
                    version,
                    supports_list_changed,
                });
            }
        }
        self.initialized.store(true, Ordering::SeqCst);
        JsonRpcResponse::ok(
            req.id.clone(),
            json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {
                    "tools": { "listChanged": true },
                    "resources": {},
                    "prompts": {},
                },
                "serverInfo": {
                    "name": "mcpd",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        )
    }

    async fn handle_tools_list(&self, id: Value) -> JsonRpcResponse {
        self.adaptive_wait().await;
        let mut tools = self.router.get_all_tools(true).await;
        let (connected, _) = self.router.counts().await;
        // fewer tools than connected servers usually means someone is still
        // starting up, so give the fleet another moment
        let mut attempts = 0;
        while tools.len() < connected && attempts < LOW_COUNT_RETRIES {
            attempts += 1;
            tracing::debug!(
                "{} tool(s) from {connected} connected server(s), retry {attempts}",
                tools.len()
            );
            tokio::time::sleep(LOW_COUNT_PAUSE).await;
            tools = self.router.get_all_tools(true).await;
        }
        let defs: Vec<_> = tools.iter().map(|t| &t.tool).collect();
        JsonRpcResponse::ok(id, json!({ "tools": defs }))
    }

    async fn handle_tools_call(&self, id: Value, params: &Value) -> JsonRpcResponse {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return JsonRpcResponse::err(id, INVALID_PARAMS, "tools/call requires a tool name");
        };
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
        match self.router.call_tool(name, arguments).await {
            Ok(mut resp) => {
                // the backend answered under its own id
                resp.id = id;
                resp
            }
            Err(TransportError::ToolNotFound { tool }) => {
                JsonRpcResponse::err(id, INVALID_PARAMS, format!("Unknown tool: {tool}"))
            }
            Err(e) => JsonRpcResponse::err(id, INTERNAL_ERROR, format!("tool call failed: {e}")),
        }
    }

    /// Hold tools/list briefly while servers are still connecting, scaled
    /// by how much of the fleet is up.
    async fn adaptive_wait(&self) {
        let (connected, total) = self.router.counts().await;
        if total == 0 {
            return;
        }
        let wait = if connected >= total {
            Duration::ZERO
        } else if connected * 2 >= total {
            WAIT_PARTIAL
        } else {
            WAIT_SPARSE
        };
        let wait = wait.min(WAIT_CAP);
        if !wait.is_zero() {
            tracing::debug!("{connected}/{total} servers connected, waiting {wait:?}");
            tokio::time::sleep(wait).await;
        }
    }

    /// Poll until at least one tool is routable, bounded. Lets startup
    /// finish before the first client asks for the catalog; once every
    /// server is connected an empty catalog is final, so stop early.
    pub async fn wait_for_tools_ready(&self) -> usize {
        for attempt in 0..READY_POLLS {
            let tools = self.router.get_all_tools(false).await;
            if !tools.is_empty() {
                return tools.len();
            }
            let (connected, total) = self.router.counts().await;
            if total == 0 || connected >= total {
                return 0;
            }
            tracing::debug!("catalog still empty (attempt {})", attempt + 1);
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
        0
    }

    /// The list_changed push for the primary client, or `None` when there
    /// is no primary or it never advertised support.
    pub async fn tools_changed_notification(&self) -> Option<(String, JsonRpcNotification)> {
        let primary = self.primary.read().await.clone()?;
        if !primary.supports_list_changed {
            return None;
        }
        Some((
            primary.client_id,
            JsonRpcNotification::new(NOTIFICATION_TOOLS_CHANGED, json!({})),
        ))
    }
}
