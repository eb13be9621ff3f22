//! Tool router
//!
//! Owns the adapter fleet. Keeps a per-server tool cache, folds the caches
//! into one aggregated catalog with a name-to-server route table, and
//! forwards tool calls to whichever backend owns the name. Adapter events
//! are re-broadcast as [`RouterEvent`]s so the daemon can fan them out
//! without touching transports directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures_util::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

use crate::protocol::{JsonRpcResponse, ToolDefinition};
use crate::transport::{Transport, TransportError, TransportEvent, TransportStatus};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_CONCURRENT_CONNECTS: usize = 4;
/// How long a server's cached tool list stays fresh.
pub const TOOL_CACHE_TTL: Duration = Duration::from_secs(30);

const ROUTER_EVENT_CAPACITY: usize = 128;

#[derive(Debug, Clone)]
pub enum RouterEvent {
    ServerConnected { server: String },
    ServerDisconnected { server: String },
    ServerError { server: String, message: String },
    ServerLog { server: String, stream: &'static str, line: String },
    /// A server's contribution to the catalog changed.
    RoutesUpdated { server: String, tool_count: usize },
    ToolCalled { server: String, tool: String, ok: bool, duration_ms: u64 },
}

/// A tool along with the server that owns it.
#[derive(Debug, Clone)]
pub struct RoutedTool {
    pub server: String,
    pub tool: ToolDefinition,
}

/// Knobs for [`ToolRouter::connect_all_with`].
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    /// Per-server cap on one connect attempt.
    pub timeout: Duration,
    /// How many servers are brought up at once.
    pub max_concurrent: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            timeout: CONNECT_TIMEOUT,
            max_concurrent: MAX_CONCURRENT_CONNECTS,
        }
    }
}

struct ServerEntry {
    adapter: Arc<dyn Transport>,
    tools: Vec<ToolDefinition>,
    fetched_at: Option<Instant>,
    /// Registration order, used to resolve name collisions.
    seq: u64,
    forward_task: JoinHandle<()>,
}

pub struct ToolRouter {
    me: Weak<ToolRouter>,
    servers: RwLock<HashMap<String, ServerEntry>>,
    /// tool name -> owning server, rebuilt whenever any cache changes.
    routes: RwLock<HashMap<String, String>>,
    next_seq: AtomicU64,
    events: broadcast::Sender<RouterEvent>,
}

impl ToolRouter {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(ROUTER_EVENT_CAPACITY);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            servers: RwLock::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.events.subscribe()
    }

    /// Register an adapter under its server name. A same-named registration
    /// replaces the old adapter, which is disconnected.
    pub async fn add_adapter(&self, adapter: Arc<dyn Transport>) {
        let name = adapter.name().to_string();
        let forward_task = self.spawn_forwarder(name.clone(), adapter.subscribe());
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let previous = self.servers.write().await.insert(
            name.clone(),
            ServerEntry {
                adapter,
                tools: Vec::new(),
                fetched_at: None,
                seq,
                forward_task,
            },
        );
        if let Some(previous) = previous {
            tracing::info!("replacing adapter for '{name}'");
            previous.forward_task.abort();
            previous.adapter.disconnect().await;
        }
    }

    /// Deregister and disconnect one server, dropping its catalog entries.
    pub async fn remove_adapter(&self, name: &str) -> bool {
        let entry = self.servers.write().await.remove(name);
        match entry {
            Some(entry) => {
                entry.forward_task.abort();
                entry.adapter.disconnect().await;
                self.rebuild_routes().await;
                let _ = self.events.send(RouterEvent::RoutesUpdated {
                    server: name.to_string(),
                    tool_count: 0,
                });
                true
            }
            None => false,
        }
    }

    pub async fn adapter(&self, name: &str) -> Option<Arc<dyn Transport>> {
        self.servers.read().await.get(name).map(|e| e.adapter.clone())
    }

    /// Connect every registered adapter that is not connected yet, a few at
    /// a time. Failures are logged, never fatal; stdio adapters keep their
    /// own recovery going afterwards.
    pub async fn connect_all(&self) {
        self.connect_all_with(ConnectOptions::default()).await;
    }

    /// [`connect_all`](Self::connect_all) with explicit limits.
    pub async fn connect_all_with(&self, options: ConnectOptions) {
        let adapters: Vec<(String, Arc<dyn Transport>)> = {
            let servers = self.servers.read().await;
            servers
                .iter()
                .filter(|(_, e)| !e.adapter.is_connected())
                .map(|(name, e)| (name.clone(), e.adapter.clone()))
                .collect()
        };
        if adapters.is_empty() {
            return;
        }
        tracing::info!("connecting {} mcp server(s)", adapters.len());
        let timeout = options.timeout;
        stream::iter(adapters)
            // a zero limit would mean unbounded to for_each_concurrent
            .for_each_concurrent(options.max_concurrent.max(1), |(name, adapter)| async move {
                match tokio::time::timeout(timeout, adapter.connect()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!("failed to connect '{name}': {e}"),
                    Err(_) => {
                        tracing::warn!("connect of '{name}' timed out after {timeout:?}")
                    }
                }
            })
            .await;
    }

    pub async fn disconnect_all(&self) {
        let adapters: Vec<Arc<dyn Transport>> = {
            let servers = self.servers.read().await;
            servers.values().map(|e| e.adapter.clone()).collect()
        };
        for adapter in adapters {
            adapter.disconnect().await;
        }
    }

    /// Aggregated catalog, sorted by tool name. Refreshes stale per-server
    /// caches first; `force` refreshes everything that is connected.
    pub async fn get_all_tools(&self, force: bool) -> Vec<RoutedTool> {
        let now = Instant::now();
        let to_fetch: Vec<(String, Arc<dyn Transport>)> = {
            let servers = self.servers.read().await;
            servers
                .iter()
                .filter(|(_, e)| e.adapter.is_connected())
                .filter(|(_, e)| {
                    force
                        || e.fetched_at
                            .map_or(true, |t| now.duration_since(t) > TOOL_CACHE_TTL)
                })
                .map(|(name, e)| (name.clone(), e.adapter.clone()))
                .collect()
        };
        let fetches = to_fetch.into_iter().map(|(name, adapter)| async move {
            let outcome = adapter.get_tools().await;
            (name, outcome)
        });
        for (name, outcome) in futures_util::future::join_all(fetches).await {
            match outcome {
                Ok(tools) => self.install_tools(&name, tools).await,
                Err(e) => tracing::warn!("tools/list from '{name}' failed: {e}"),
            }
        }
        self.routed_tools().await
    }

    /// Re-fetch one server's tools, typically after it connected or told us
    /// its list changed.
    pub async fn refresh_server(&self, name: &str) {
        let adapter = self.servers.read().await.get(name).map(|e| e.adapter.clone());
        let Some(adapter) = adapter else { return };
        match adapter.get_tools().await {
            Ok(tools) => self.install_tools(name, tools).await,
            Err(e) => tracing::warn!("failed to refresh tools for '{name}': {e}"),
        }
    }

    /// Route a call to whichever server owns the tool name.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
    ) -> Result<JsonRpcResponse, TransportError> {
        let server = self.routes.read().await.get(tool).cloned();
        let Some(server) = server else {
            return Err(TransportError::ToolNotFound {
                tool: tool.to_string(),
            });
        };
        let adapter = self.servers.read().await.get(&server).map(|e| e.adapter.clone());
        let Some(adapter) = adapter else {
            return Err(TransportError::ToolNotFound {
                tool: tool.to_string(),
            });
        };
        tracing::debug!("routing tool '{tool}' to '{server}'");
        let started = Instant::now();
        let outcome = adapter.call_tool(tool, arguments).await;
        let ok = matches!(&outcome, Ok(resp) if !resp.is_error());
        let _ = self.events.send(RouterEvent::ToolCalled {
            server,
            tool: tool.to_string(),
            ok,
            duration_ms: started.elapsed().as_millis() as u64,
        });
        outcome
    }

    /// (connected, total) server counts.
    pub async fn counts(&self) -> (usize, usize) {
        let servers = self.servers.read().await;
        let connected = servers.values().filter(|e| e.adapter.is_connected()).count();
        (connected, servers.len())
    }

    /// Tool counts per server, sorted by server name.
    pub async fn tool_distribution(&self) -> Vec<(String, usize)> {
        let servers = self.servers.read().await;
        let mut out: Vec<(String, usize)> = servers
            .iter()
            .map(|(name, e)| (name.clone(), e.tools.len()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub async fn statuses(&self) -> Vec<TransportStatus> {
        let adapters: Vec<Arc<dyn Transport>> = {
            let servers = self.servers.read().await;
            servers.values().map(|e| e.adapter.clone()).collect()
        };
        let mut out = Vec::with_capacity(adapters.len());
        for adapter in adapters {
            out.push(adapter.status().await);
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    async fn install_tools(&self, name: &str, tools: Vec<ToolDefinition>) {
        let count = tools.len();
        let changed = {
            let mut servers = self.servers.write().await;
            let Some(entry) = servers.get_mut(name) else { return };
            let changed = entry.tools != tools;
            entry.tools = tools;
            entry.fetched_at = Some(Instant::now());
            changed
        };
        self.rebuild_routes().await;
        if changed {
            tracing::info!("'{name}' now contributes {count} tool(s)");
            let _ = self.events.send(RouterEvent::RoutesUpdated {
                server: name.to_string(),
                tool_count: count,
            });
        }
    }

    async fn clear_server_tools(&self, name: &str) {
        let changed = {
            let mut servers = self.servers.write().await;
            let Some(entry) = servers.get_mut(name) else { return };
            let changed = !entry.tools.is_empty();
            entry.tools.clear();
            entry.fetched_at = None;
            changed
        };
        if changed {
            self.rebuild_routes().await;
            let _ = self.events.send(RouterEvent::RoutesUpdated {
                server: name.to_string(),
                tool_count: 0,
            });
        }
    }

    /// Rebuild the name-to-server table in registration order, so on a name
    /// collision the most recently registered server wins.
    async fn rebuild_routes(&self) {
        let routes = {
            let servers = self.servers.read().await;
            let mut ordered: Vec<(&String, &ServerEntry)> = servers.iter().collect();
            ordered.sort_by_key(|(_, e)| e.seq);
            let mut routes: HashMap<String, String> = HashMap::new();
            for (name, entry) in ordered {
                for tool in &entry.tools {
                    if let Some(previous) = routes.insert(tool.name.clone(), name.clone()) {
                        if &previous != name {
                            tracing::warn!(
                                "tool '{}' from '{previous}' is shadowed by '{name}'",
                                tool.name
                            );
                        }
                    }
                }
            }
            routes
        };
        *self.routes.write().await = routes;
    }

    async fn routed_tools(&self) -> Vec<RoutedTool> {
        let routes: HashMap<String, String> = self.routes.read().await.clone();
        let servers = self.servers.read().await;
        let mut out: Vec<RoutedTool> = routes
            .iter()
            .filter_map(|(tool_name, server)| {
                servers
                    .get(server)
                    .and_then(|e| e.tools.iter().find(|t| &t.name == tool_name))
                    .map(|tool| RoutedTool {
                        server: server.clone(),
                        tool: tool.clone(),
                    })
            })
            .collect();
        out.sort_by(|a, b| a.tool.name.cmp(&b.tool.name));
        out
    }

    fn spawn_forwarder(
        &self,
        server: String,
        mut rx: broadcast::Receiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let me = self.me.clone();
        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("event stream for '{server}' lagged by {n}");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(router) = me.upgrade() else { break };
                match event {
                    TransportEvent::Connected => {
                        let _ = router.events.send(RouterEvent::ServerConnected {
                            server: server.clone(),
                        });
                        router.refresh_server(&server).await;
                    }
                    TransportEvent::Disconnected => {
                        let _ = router.events.send(RouterEvent::ServerDisconnected {
                            server: server.clone(),
                        });
                        router.clear_server_tools(&server).await;
                    }
                    TransportEvent::Error(message) => {
                        let _ = router.events.send(RouterEvent::ServerError {
                            server: server.clone(),
                            message,
                        });
                    }
                    TransportEvent::ToolsChanged => {
                        tracing::info!("'{server}' announced a tool list change");
                        router.refresh_server(&server).await;
                    }
                    TransportEvent::Notification(value) => {
                        tracing::debug!("'{server}' notification: {value}");
                    }
                    TransportEvent::Log { stream, line } => {
                        let _ = router.events.send(RouterEvent::ServerLog {
                            server: server.clone(),
                            stream,
                            line,
                        });
                    }
                }
            }
        })
    }
}
