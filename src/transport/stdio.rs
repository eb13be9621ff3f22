//! Process-pipe transport
//!
//! Spawns the MCP server as a child process and speaks newline-delimited
//! JSON-RPC over its stdio. stdout is split on newlines by a reader task and
//! each frame dispatched by id; stderr is forwarded as log events; a monitor
//! task owns the child and turns unexpected exits into crash records,
//! blacklist decisions and guarded reconnect attempts.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{broadcast, oneshot, Mutex};

use crate::config::StdioConfig;
use crate::protocol::{
    initialize_params, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, METHOD_INITIALIZE,
    METHOD_INITIALIZED,
};

use super::crash::{CrashTracker, CrashVerdict, RECONNECT_MAX};
use super::pending::PendingRequests;
use super::{
    dispatch_frame, ConnectionState, StateCell, Transport, TransportError, TransportEvent,
    TransportKind, TransportStatus, EVENT_CHANNEL_CAPACITY,
};

/// Pause between a crash-driven teardown and the respawn, so the OS has
/// released the dead child's pipes before we ask for new ones.
const SETTLE_DELAY: Duration = Duration::from_millis(200);

pub struct StdioTransport {
    me: Weak<StdioTransport>,
    name: String,
    config: StdioConfig,
    timeout: Duration,
    pending: PendingRequests,
    stdin: Mutex<Option<ChildStdin>>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    connect_lock: Mutex<()>,
    state: StateCell,
    connected: AtomicBool,
    enabled: AtomicBool,
    recovering: AtomicBool,
    closing: AtomicBool,
    generation: AtomicU64,
    crash: Mutex<CrashTracker>,
    events: broadcast::Sender<TransportEvent>,
}

impl StdioTransport {
    pub fn new(name: impl Into<String>, config: StdioConfig, timeout: Duration) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            name: name.into(),
            config,
            timeout,
            pending: PendingRequests::new(),
            stdin: Mutex::new(None),
            kill: Mutex::new(None),
            connect_lock: Mutex::new(()),
            state: StateCell::new(ConnectionState::Disconnected),
            connected: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
            recovering: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            crash: Mutex::new(CrashTracker::new()),
            events,
        })
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.config.command);
        if !self.config.args.is_empty() {
            cmd.args(&self.config.args);
        }
        for (key, value) in &self.config.env {
            let expanded = shellexpand::env(value).unwrap_or_else(|_| value.clone().into());
            cmd.env(key, expanded.as_ref());
        }
        if let Some(dir) = &self.config.cwd {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn write_frame(&self, value: &Value) -> Result<(), TransportError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(TransportError::NotConnected)?;
        let mut line =
            serde_json::to_vec(value).map_err(|e| TransportError::Protocol(e.to_string()))?;
        line.push(b'\n');
        stdin.write_all(&line).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn send_notification(&self, method: &str, params: Value) -> Result<(), TransportError> {
        let note = JsonRpcNotification::new(method, params);
        let value =
            serde_json::to_value(&note).map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.write_frame(&value).await
    }

    /// Kill the current child, if any. The monitor task finishes the
    /// teardown without treating the exit as a crash.
    async fn kill_child(&self) {
        if let Some(kill) = self.kill.lock().await.take() {
            let _ = kill.send(());
        }
    }

    /// Shared exit path for natural deaths and deliberate kills. Stale
    /// generations are ignored so a superseding connect is left alone.
    async fn handle_exit(&self, generation: u64, code: Option<i32>, killed: bool) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        *self.stdin.lock().await = None;
        self.pending.fail_all(|| TransportError::ConnectionClosed).await;
        self.state.set(ConnectionState::Disconnected);
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Disconnected);
        }
        if killed || self.closing.load(Ordering::SeqCst) {
            return;
        }

        tracing::warn!(
            "mcp server '{}' exited unexpectedly (code {:?})",
            self.name,
            code
        );
        let verdict = self.crash.lock().await.record_crash(Instant::now());
        match verdict {
            CrashVerdict::Blacklisted { duration } => {
                self.state.set(ConnectionState::Blacklisted);
                let message = format!(
                    "'{}' blacklisted for {}s after repeated crashes",
                    self.name,
                    duration.as_secs()
                );
                tracing::error!("{message}");
                let _ = self.events.send(TransportEvent::Error(message));
            }
            CrashVerdict::CrashLoop => {
                self.state.set(ConnectionState::Backoff);
                let message = format!(
                    "'{}' is crashing right after startup; automatic reconnect paused",
                    self.name
                );
                tracing::warn!("{message}");
                let _ = self.events.send(TransportEvent::Error(message));
            }
            CrashVerdict::Reconnect { delay } => {
                self.schedule_recovery(delay);
            }
        }
    }

    /// Spawn the background reconnect loop unless one is already running or
    /// the adapter is disabled. Each failed attempt doubles the delay up to
    /// the cap; blacklist and disable checks run before every attempt.
    fn schedule_recovery(&self, initial_delay: Duration) {
        if !self.enabled.load(Ordering::SeqCst) || self.closing.load(Ordering::SeqCst) {
            return;
        }
        if self.recovering.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.set(ConnectionState::Backoff);
        let Some(this) = self.me.upgrade() else {
            self.recovering.store(false, Ordering::SeqCst);
            return;
        };
        tokio::spawn(async move {
            let mut delay = initial_delay;
            loop {
                tracing::info!("reconnecting '{}' in {:?}", this.name, delay);
                tokio::time::sleep(delay).await;
                if !this.enabled.load(Ordering::SeqCst) || this.closing.load(Ordering::SeqCst) {
                    break;
                }
                if this.crash.lock().await.is_blacklisted(Instant::now()) {
                    this.state.set(ConnectionState::Blacklisted);
                    break;
                }
                tokio::time::sleep(SETTLE_DELAY).await;
                match this.connect().await {
                    Ok(()) => {
                        tracing::info!("'{}' reconnected", this.name);
                        break;
                    }
                    Err(TransportError::Disabled) | Err(TransportError::Blacklisted { .. }) => {
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("reconnect of '{}' failed: {}", this.name, e);
                        delay = delay.saturating_mul(2).min(RECONNECT_MAX);
                    }
                }
            }
            this.recovering.store(false, Ordering::SeqCst);
        });
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn connect(&self) -> Result<(), TransportError> {
        if !self.enabled.load(Ordering::SeqCst) {
            return Err(TransportError::Disabled);
        }
        {
            let crash = self.crash.lock().await;
            if let Some(remaining) = crash.blacklist_remaining(Instant::now()) {
                self.state.set(ConnectionState::Blacklisted);
                return Err(TransportError::Blacklisted {
                    remaining_secs: remaining.as_secs(),
                });
            }
        }

        let _guard = self.connect_lock.lock().await;
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        let this = self.me.upgrade().ok_or(TransportError::NotConnected)?;

        self.closing.store(false, Ordering::SeqCst);
        self.state.set(ConnectionState::Connecting);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let mut child = self.build_command().spawn().map_err(|e| {
            self.state.set(ConnectionState::Disconnected);
            TransportError::Spawn {
                command: self.config.command.clone(),
                source: e,
            }
        })?;
        tracing::debug!("spawned '{}' for mcp server '{}'", self.config.command, self.name);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Protocol("child stdout unavailable".into()))?;
        let stderr = child.stderr.take();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Protocol("child stdin unavailable".into()))?;
        *self.stdin.lock().await = Some(stdin);

        let reader = this.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(trimmed) {
                    Ok(value) => {
                        dispatch_frame(&reader.name, value, &reader.pending, &reader.events).await;
                    }
                    Err(e) => {
                        tracing::warn!("{}: dropping malformed stdout line: {e}", reader.name);
                    }
                }
            }
        });

        if let Some(stderr) = stderr {
            let logger = this.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!("{} stderr: {line}", logger.name);
                    let _ = logger.events.send(TransportEvent::Log {
                        stream: "stderr",
                        line,
                    });
                }
            });
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        *self.kill.lock().await = Some(kill_tx);
        let monitor = this.clone();
        tokio::spawn(async move {
            let (code, killed) = tokio::select! {
                status = child.wait() => (status.ok().and_then(|s| s.code()), false),
                _ = kill_rx => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    (None, true)
                }
            };
            monitor.handle_exit(generation, code, killed).await;
        });

        // MCP handshake: a failed initialize leaves the adapter disconnected
        let init = match self.send_request(METHOD_INITIALIZE, initialize_params()).await {
            Ok(resp) => resp,
            Err(e) => {
                self.kill_child().await;
                self.state.set(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        if let Some(err) = init.error {
            self.kill_child().await;
            self.state.set(ConnectionState::Disconnected);
            return Err(TransportError::Protocol(format!(
                "initialize failed: {}",
                err.message
            )));
        }
        if let Err(e) = self
            .send_notification(METHOD_INITIALIZED, serde_json::json!({}))
            .await
        {
            self.kill_child().await;
            self.state.set(ConnectionState::Disconnected);
            return Err(e);
        }

        self.connected.store(true, Ordering::SeqCst);
        self.state.set(ConnectionState::Connected);
        let _ = self.events.send(TransportEvent::Connected);
        tracing::info!("mcp server '{}' connected", self.name);
        Ok(())
    }

    async fn disconnect(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.kill_child().await;
        *self.stdin.lock().await = None;
        self.pending.fail_all(|| TransportError::ConnectionClosed).await;
        self.state.set(ConnectionState::Disconnected);
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Disconnected);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_request(
        &self,
        method: &str,
        params: Value,
    ) -> Result<JsonRpcResponse, TransportError> {
        let id = self.pending.next_id();
        let rx = self.pending.register(id).await;
        let request = JsonRpcRequest::new(id, method, params);
        let value = serde_json::to_value(&request)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        if let Err(e) = self.write_frame(&value).await {
            self.pending.discard(id).await;
            return Err(e);
        }
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => {
                self.pending.discard(id).await;
                Err(TransportError::Timeout(self.timeout))
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn status(&self) -> TransportStatus {
        let crash = self.crash.lock().await;
        let now = Instant::now();
        let detail = crash
            .in_crash_loop(now)
            .then(|| "crash loop: automatic reconnect paused".to_string());
        TransportStatus {
            name: self.name.clone(),
            kind: TransportKind::Stdio,
            state: self.state.get(),
            enabled: self.enabled.load(Ordering::SeqCst),
            crash_count: crash.total_crashes(),
            recent_crashes: crash.recent_crashes(now),
            blacklisted_for_secs: crash.blacklist_remaining(now).map(|d| d.as_secs()),
            detail,
        }
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        tracing::info!(
            "mcp server '{}' {}",
            self.name,
            if enabled { "enabled" } else { "disabled" }
        );
    }

    async fn clear_blacklist(&self) {
        self.crash.lock().await.clear();
        if self.state.get() == ConnectionState::Blacklisted {
            self.state.set(ConnectionState::Disconnected);
        }
        tracing::info!("cleared crash history for '{}'", self.name);
    }
}
