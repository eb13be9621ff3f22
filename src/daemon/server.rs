//! Gateway daemon
//!
//! Accepts local clients on a Unix socket and runs their frames through one
//! shared gateway, so every client sees the same backend fleet and the
//! servers are spawned exactly once. Clients either handshake into a
//! persistent connection (MCP proxying plus pushed events) or send a single
//! command and get a single reply.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, Mutex, Notify, RwLock};

use crate::config::ConfigProvider;
use crate::gateway::{Gateway, Outcome};
use crate::logstore::{LogLevel, LogStore, DEFAULT_LOG_CAPACITY};
use crate::router::{RouterEvent, ToolRouter};
use crate::transport::build_adapter;

use super::protocol::{
    default_socket_path, ClientInfo, ClientKind, ClientMessage, DaemonEvent, DaemonMessage,
    DaemonStatus, ServerLogEntry, ToolInfo,
};

/// Per-client outgoing queue. A client that cannot drain this many messages
/// is dropped rather than allowed to stall the daemon.
const CLIENT_QUEUE: usize = 256;

/// The only per-connection state the daemon keeps for a persistent client.
struct ClientHandle {
    kind: ClientKind,
    name: Option<String>,
    tx: mpsc::Sender<DaemonMessage>,
    connected_at: Instant,
    last_seen: Mutex<Instant>,
}

pub struct GatewayDaemon {
    provider: Arc<ConfigProvider>,
    router: Arc<ToolRouter>,
    gateway: Arc<Gateway>,
    logs: Arc<LogStore>,
    clients: RwLock<HashMap<String, ClientHandle>>,
    socket_path: PathBuf,
    started_at: Instant,
    shutdown: Notify,
}

impl GatewayDaemon {
    pub fn new(provider: ConfigProvider, socket_path: Option<PathBuf>) -> Arc<Self> {
        let router = ToolRouter::new();
        let gateway = Arc::new(Gateway::new(router.clone()));
        Arc::new(Self {
            provider: Arc::new(provider),
            router,
            gateway,
            logs: Arc::new(LogStore::new(DEFAULT_LOG_CAPACITY)),
            clients: RwLock::new(HashMap::new()),
            socket_path: socket_path.unwrap_or_else(default_socket_path),
            started_at: Instant::now(),
            shutdown: Notify::new(),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Bind the socket, bring the fleet up and serve until stopped by a
    /// client command, SIGINT or SIGTERM.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        if let Some(dir) = self.socket_path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        if self.socket_path.exists() {
            if UnixStream::connect(&self.socket_path).await.is_ok() {
                bail!("daemon already running on {}", self.socket_path.display());
            }
            std::fs::remove_file(&self.socket_path)
                .with_context(|| format!("failed to remove {}", self.socket_path.display()))?;
            tracing::info!("removed stale socket {}", self.socket_path.display());
        }
        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("failed to bind {}", self.socket_path.display()))?;
        tracing::info!("listening on {}", self.socket_path.display());

        self.start_servers().await?;
        let pump = self.spawn_event_pump();

        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("failed to install SIGTERM handler")?;
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    tracing::info!("stop requested");
                    break;
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupted");
                    break;
                }
                _ = sigterm.recv() => {
                    tracing::info!("terminated");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let daemon = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = daemon.handle_client(stream).await {
                                tracing::debug!("client connection ended: {e:#}");
                            }
                        });
                    }
                    Err(e) => tracing::warn!("accept failed: {e}"),
                },
            }
        }

        pump.abort();
        self.router.disconnect_all().await;
        let _ = std::fs::remove_file(&self.socket_path);
        tracing::info!("daemon stopped");
        Ok(())
    }

    async fn start_servers(&self) -> Result<()> {
        let servers = self.provider.enabled_servers().await?;
        if servers.is_empty() {
            tracing::warn!("no enabled mcp servers in configuration");
            return Ok(());
        }
        for config in &servers {
            match build_adapter(config) {
                Ok(adapter) => self.router.add_adapter(adapter).await,
                Err(e) => tracing::error!("skipping '{}': {e:#}", config.name),
            }
        }
        self.router.connect_all().await;
        let tool_count = self.gateway.wait_for_tools_ready().await;
        let (connected, total) = self.router.counts().await;
        tracing::info!("{connected}/{total} servers connected, {tool_count} tool(s) routable");
        for (name, count) in self.router.tool_distribution().await {
            tracing::debug!("'{name}' contributes {count} tool(s)");
        }
        Ok(())
    }

    fn spawn_event_pump(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let daemon = self.clone();
        let mut router_rx = daemon.router.subscribe();
        let mut config_rx = daemon.provider.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = router_rx.recv() => match event {
                        Ok(event) => daemon.handle_router_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("router event stream lagged by {n}");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    event = config_rx.recv() => match event {
                        Ok(_) => {
                            daemon
                                .broadcast(DaemonMessage::Event {
                                    event: DaemonEvent::ConfigChanged,
                                })
                                .await;
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    async fn handle_router_event(&self, event: RouterEvent) {
        match event {
            RouterEvent::ServerConnected { server } => {
                self.logs.update_connection_status(&server, "connected").await;
                self.broadcast(DaemonMessage::Event {
                    event: DaemonEvent::ServerConnected { server },
                })
                .await;
            }
            RouterEvent::ServerDisconnected { server } => {
                self.logs.update_connection_status(&server, "disconnected").await;
                self.broadcast(DaemonMessage::Event {
                    event: DaemonEvent::ServerDisconnected { server },
                })
                .await;
            }
            RouterEvent::ServerError { server, message } => {
                self.logs.add_log(&server, LogLevel::Error, message.clone()).await;
                self.broadcast(DaemonMessage::Event {
                    event: DaemonEvent::ServerError { server, message },
                })
                .await;
            }
            RouterEvent::ServerLog { server, stream, line } => {
                // retained for `daemon logs`, too chatty to push to clients
                self.logs.add_server_output(&server, stream, &line).await;
            }
            RouterEvent::RoutesUpdated { server, tool_count } => {
                self.logs
                    .add_log(
                        &server,
                        LogLevel::Info,
                        format!("{tool_count} tool(s) routable"),
                    )
                    .await;
                self.broadcast(DaemonMessage::Event {
                    event: DaemonEvent::RoutesUpdated { server, tool_count },
                })
                .await;
                self.notify_primary().await;
            }
            RouterEvent::ToolCalled { server, tool, ok, duration_ms } => {
                let level = if ok { LogLevel::Info } else { LogLevel::Warn };
                self.logs
                    .add_log(
                        &server,
                        level,
                        format!(
                            "tool '{tool}' {} in {duration_ms}ms",
                            if ok { "succeeded" } else { "failed" }
                        ),
                    )
                    .await;
                self.broadcast(DaemonMessage::Event {
                    event: DaemonEvent::ToolCalled { server, tool, ok, duration_ms },
                })
                .await;
            }
        }
    }

    /// Push the tools/list_changed notification to the primary client, when
    /// there is one and it asked for these.
    async fn notify_primary(&self) {
        let Some((client_id, note)) = self.gateway.tools_changed_notification().await else {
            return;
        };
        let clients = self.clients.read().await;
        if let Some(handle) = clients.get(&client_id) {
            let _ = handle
                .tx
                .try_send(DaemonMessage::McpNotification { notification: note });
        }
    }

    /// Fan a message out to every persistent client. A full or closed queue
    /// marks the client dead.
    async fn broadcast(&self, message: DaemonMessage) {
        let dead: Vec<String> = {
            let clients = self.clients.read().await;
            clients
                .iter()
                .filter(|(_, handle)| handle.tx.try_send(message.clone()).is_err())
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in dead {
            tracing::warn!("dropping unresponsive client {id}");
            self.drop_client(&id).await;
        }
    }

    async fn drop_client(&self, client_id: &str) {
        if self.clients.write().await.remove(client_id).is_some() {
            tracing::info!("client {client_id} disconnected");
            self.gateway.forget_client(client_id).await;
        }
    }

    async fn touch_client(&self, client_id: &str) {
        let clients = self.clients.read().await;
        if let Some(handle) = clients.get(client_id) {
            *handle.last_seen.lock().await = Instant::now();
        }
    }

    async fn handle_client(self: Arc<Self>, stream: UnixStream) -> Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let first: ClientMessage = match serde_json::from_str(line.trim()) {
            Ok(message) => message,
            Err(e) => {
                write_message(
                    &mut write_half,
                    &DaemonMessage::Error {
                        message: format!("unparseable message: {e}"),
                    },
                )
                .await?;
                return Ok(());
            }
        };

        match first {
            ClientMessage::Handshake { kind, name } => {
                self.run_persistent_client(kind, name, reader, write_half).await
            }
            other => {
                let client_id = format!("oneshot-{}", uuid::Uuid::new_v4());
                if let Some(reply) = self.dispatch(&client_id, other).await {
                    write_message(&mut write_half, &reply).await?;
                }
                Ok(())
            }
        }
    }

    async fn run_persistent_client(
        &self,
        kind: ClientKind,
        name: Option<String>,
        mut reader: BufReader<OwnedReadHalf>,
        mut write_half: OwnedWriteHalf,
    ) -> Result<()> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let (tx, mut rx) = mpsc::channel::<DaemonMessage>(CLIENT_QUEUE);
        tracing::info!(
            "client {client_id} connected ({kind}, {})",
            name.as_deref().unwrap_or("unnamed")
        );
        self.clients.write().await.insert(
            client_id.clone(),
            ClientHandle {
                kind,
                name,
                tx: tx.clone(),
                connected_at: Instant::now(),
                last_seen: Mutex::new(Instant::now()),
            },
        );

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if write_message(&mut write_half, &message).await.is_err() {
                    break;
                }
            }
        });

        let _ = tx
            .send(DaemonMessage::HandshakeAck {
                client_id: client_id.clone(),
                server: "mcpd".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            })
            .await;

        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    self.touch_client(&client_id).await;
                    let message: ClientMessage = match serde_json::from_str(trimmed) {
                        Ok(message) => message,
                        Err(e) => {
                            let _ = tx
                                .send(DaemonMessage::Error {
                                    message: format!("unparseable message: {e}"),
                                })
                                .await;
                            continue;
                        }
                    };
                    if matches!(message, ClientMessage::Handshake { .. }) {
                        continue;
                    }
                    if let Some(reply) = self.dispatch(&client_id, message).await {
                        if tx.send(reply).await.is_err() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!("read from {client_id} failed: {e}");
                    break;
                }
            }
        }

        self.drop_client(&client_id).await;
        drop(tx);
        let _ = writer.await;
        Ok(())
    }

    async fn dispatch(&self, client_id: &str, message: ClientMessage) -> Option<DaemonMessage> {
        match message {
            ClientMessage::Handshake { .. } => None,
            ClientMessage::Ping => Some(DaemonMessage::Pong),
            ClientMessage::Stop => {
                tracing::info!("stop requested by {client_id}");
                self.shutdown.notify_one();
                Some(DaemonMessage::Ok)
            }
            ClientMessage::McpRequest { request } => {
                match self.gateway.handle_request(client_id, request).await {
                    Outcome::Respond(response) => Some(DaemonMessage::McpResponse { response }),
                    Outcome::Suppress => None,
                }
            }
            ClientMessage::GetStatus => Some(DaemonMessage::Status {
                status: self.collect_status().await,
            }),
            ClientMessage::GetTools => {
                let tools = self
                    .router
                    .get_all_tools(false)
                    .await
                    .into_iter()
                    .map(|t| ToolInfo {
                        server: t.server,
                        name: t.tool.name,
                        description: t.tool.description,
                        input_schema: t.tool.input_schema,
                    })
                    .collect();
                Some(DaemonMessage::Tools { tools })
            }
            ClientMessage::GetLogs { server, lines } => Some(DaemonMessage::Logs {
                entries: self.collect_logs(server.as_deref(), lines).await,
            }),
            ClientMessage::ReloadConfig => match self.reload_config().await {
                Ok(()) => Some(DaemonMessage::Ok),
                Err(e) => Some(DaemonMessage::Error {
                    message: format!("{e:#}"),
                }),
            },
            ClientMessage::SetServerEnabled { server, enabled } => {
                match self.toggle_server(&server, enabled).await {
                    Ok(()) => Some(DaemonMessage::Ok),
                    Err(e) => Some(DaemonMessage::Error {
                        message: format!("{e:#}"),
                    }),
                }
            }
            ClientMessage::ClearBlacklist { server } => match self.router.adapter(&server).await {
                Some(adapter) => {
                    adapter.clear_blacklist().await;
                    Some(DaemonMessage::Ok)
                }
                None => Some(DaemonMessage::Error {
                    message: format!("unknown server '{server}'"),
                }),
            },
        }
    }

    async fn collect_status(&self) -> DaemonStatus {
        let (connected, total) = self.router.counts().await;
        let clients = {
            let map = self.clients.read().await;
            let mut out = Vec::with_capacity(map.len());
            for (id, handle) in map.iter() {
                out.push(ClientInfo {
                    id: id.clone(),
                    kind: handle.kind,
                    name: handle.name.clone(),
                    connected_secs: handle.connected_at.elapsed().as_secs(),
                    idle_secs: handle.last_seen.lock().await.elapsed().as_secs(),
                });
            }
            out.sort_by(|a, b| b.connected_secs.cmp(&a.connected_secs));
            out
        };
        DaemonStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            client_count: clients.len(),
            connected_servers: connected,
            total_servers: total,
            servers: self.router.statuses().await,
            clients,
            config_path: self.provider.path().map(Path::to_path_buf),
        }
    }

    async fn collect_logs(&self, server: Option<&str>, lines: usize) -> Vec<ServerLogEntry> {
        match server {
            Some(name) => self
                .logs
                .recent(name, lines)
                .await
                .into_iter()
                .map(|entry| ServerLogEntry {
                    server: name.to_string(),
                    entry,
                })
                .collect(),
            None => {
                let mut out = Vec::new();
                for name in self.logs.servers().await {
                    for entry in self.logs.recent(&name, lines).await {
                        out.push(ServerLogEntry {
                            server: name.clone(),
                            entry,
                        });
                    }
                }
                out.sort_by(|a, b| a.entry.timestamp.cmp(&b.entry.timestamp));
                if out.len() > lines {
                    out.drain(..out.len() - lines);
                }
                out
            }
        }
    }

    /// Enable spawns and connects the one server; disable tears it down.
    /// Both persist the flag through the provider.
    async fn toggle_server(&self, name: &str, enabled: bool) -> Result<()> {
        let config = self.provider.set_server_enabled(name, enabled).await?;
        if enabled {
            let adapter = build_adapter(&config)?;
            self.router.add_adapter(adapter.clone()).await;
            if let Err(e) = adapter.connect().await {
                tracing::warn!("'{name}' enabled but connect failed: {e}");
            }
        } else {
            self.router.remove_adapter(name).await;
        }
        Ok(())
    }

    /// Re-read the config file and rebuild the whole fleet against it.
    async fn reload_config(&self) -> Result<()> {
        self.provider.reload().await?;
        tracing::info!("configuration reloaded, rebuilding fleet");
        let names: Vec<String> = {
            let statuses = self.router.statuses().await;
            statuses.into_iter().map(|s| s.name).collect()
        };
        for name in names {
            self.router.remove_adapter(&name).await;
        }
        self.start_servers().await
    }
}

async fn write_message(write_half: &mut OwnedWriteHalf, message: &DaemonMessage) -> Result<()> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    write_half.write_all(&line).await?;
    write_half.flush().await?;
    Ok(())
}
