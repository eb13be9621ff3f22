//! HTTP+SSE transport
//!
//! Holds a long-lived GET stream open for server-to-client frames and POSTs
//! client-to-server messages to an endpoint the server announces over that
//! stream. The endpoint arrives as an `endpoint` SSE event (possibly a
//! relative path), may embed a session id, and is forgotten whenever the
//! stream drops so a stale target is never reused.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use url::Url;

use crate::config::SseConfig;
use crate::protocol::{
    initialize_params, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, METHOD_INITIALIZE,
    METHOD_INITIALIZED,
};

use super::pending::PendingRequests;
use super::session::{extract_session_id, SessionMode, SessionState, MCP_SESSION_HEADER};
use super::{
    dispatch_frame, ConnectionState, StateCell, Transport, TransportError, TransportEvent,
    TransportKind, TransportStatus, EVENT_CHANNEL_CAPACITY, REQUEST_RETRY_PAUSE,
};

/// Cap for the stream retry delay as it doubles.
const STREAM_RETRY_MAX: Duration = Duration::from_secs(60);

/// One decoded SSE frame: the optional `event:` name and the joined `data:`
/// payload.
#[derive(Debug, PartialEq)]
pub(crate) struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE wire decoder. Chunks can split lines and frames at any
/// byte; complete frames come out as they close on a blank line.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buf: String,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.buf.push_str(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let raw: String = self.buf.drain(..=pos).collect();
            let line = raw.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                if !self.data.is_empty() {
                    frames.push(SseFrame {
                        event: self.event.take(),
                        data: self.data.join("\n"),
                    });
                    self.data.clear();
                } else {
                    self.event = None;
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            if let Some(value) = line.strip_prefix("event:") {
                self.event = Some(value.trim_start().to_string());
            } else if let Some(value) = line.strip_prefix("data:") {
                let value = value.strip_prefix(' ').unwrap_or(value);
                self.data.push(value.to_string());
            }
        }
        frames
    }
}

pub struct SseTransport {
    me: Weak<SseTransport>,
    name: String,
    config: SseConfig,
    base_url: Url,
    timeout: Duration,
    retries: u32,
    // no client-level timeout: the event stream stays open indefinitely
    client: reqwest::Client,
    pending: PendingRequests,
    /// POST target learned from the stream, `None` until announced.
    endpoint: watch::Sender<Option<Url>>,
    session: Mutex<SessionState>,
    stream_task: Mutex<Option<JoinHandle<()>>>,
    connect_lock: Mutex<()>,
    state: StateCell,
    connected: AtomicBool,
    enabled: AtomicBool,
    recovering: AtomicBool,
    closing: AtomicBool,
    generation: AtomicU64,
    events: broadcast::Sender<TransportEvent>,
}

impl SseTransport {
    pub fn new(
        name: impl Into<String>,
        config: SseConfig,
        timeout: Duration,
        retries: u32,
    ) -> Result<Arc<Self>, TransportError> {
        let base_url = Url::parse(&config.url)
            .map_err(|e| TransportError::Config(format!("invalid sse url '{}': {e}", config.url)))?;
        let session_mode = config.session_mode;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (endpoint, _) = watch::channel(None);
        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            name: name.into(),
            config,
            base_url,
            timeout,
            retries,
            client: reqwest::Client::new(),
            pending: PendingRequests::new(),
            endpoint,
            session: Mutex::new(SessionState::new(session_mode)),
            stream_task: Mutex::new(None),
            connect_lock: Mutex::new(()),
            state: StateCell::new(ConnectionState::Disconnected),
            connected: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
            recovering: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            events,
        }))
    }

    fn apply_headers(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (key, value) in &self.config.headers {
            req = req.header(key, value);
        }
        if let Some(key) = &self.config.api_key {
            req = req.header(reqwest::header::AUTHORIZATION, format!("Bearer {key}"));
        }
        req
    }

    async fn open_stream(&self) -> Result<reqwest::Response, TransportError> {
        let req = self
            .client
            .get(self.base_url.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream");
        let resp = self.apply_headers(req).send().await?.error_for_status()?;
        Ok(resp)
    }

    /// Drain one stream lifetime. Ends when the server closes the stream,
    /// the connection errors, or a newer generation supersedes this one.
    async fn run_stream(self: Arc<Self>, generation: u64, resp: reqwest::Response) {
        let mut decoder = SseDecoder::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            if self.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            match chunk {
                Ok(bytes) => {
                    let text = String::from_utf8_lossy(&bytes);
                    for frame in decoder.push(&text) {
                        self.handle_frame(frame).await;
                    }
                }
                Err(e) => {
                    tracing::warn!("{}: sse stream error: {e}", self.name);
                    break;
                }
            }
        }
        self.handle_stream_end(generation).await;
    }

    async fn handle_frame(&self, frame: SseFrame) {
        match frame.event.as_deref() {
            Some("endpoint") => self.learn_endpoint(frame.data.trim()).await,
            Some("message") | None => {
                let data = frame.data.trim();
                if data.starts_with('{') {
                    match serde_json::from_str::<Value>(data) {
                        Ok(value) => {
                            dispatch_frame(&self.name, value, &self.pending, &self.events).await;
                        }
                        Err(e) => {
                            tracing::warn!("{}: dropping malformed sse frame: {e}", self.name);
                        }
                    }
                } else if data.contains("/messages") {
                    // some servers send the endpoint without naming the event
                    self.learn_endpoint(data).await;
                } else if !data.is_empty() {
                    tracing::debug!("{}: ignoring sse data: {data}", self.name);
                }
            }
            Some(other) => {
                tracing::debug!("{}: ignoring sse event '{other}'", self.name);
            }
        }
    }

    /// Resolve the announced endpoint against the base URL and pull out any
    /// session id it carries.
    async fn learn_endpoint(&self, raw: &str) {
        let url = if raw.starts_with("http://") || raw.starts_with("https://") {
            Url::parse(raw)
        } else {
            self.base_url.join(raw)
        };
        match url {
            Ok(url) => {
                {
                    let mut session = self.session.lock().await;
                    match extract_session_id(url.as_str()) {
                        Some(id) => session.set(id),
                        None if session.mode() == SessionMode::Required => {
                            tracing::warn!(
                                "{}: endpoint carries no session id but sessionMode is required",
                                self.name
                            );
                        }
                        None => {}
                    }
                }
                tracing::debug!("{}: post endpoint is {url}", self.name);
                self.endpoint.send_replace(Some(url));
            }
            Err(e) => {
                tracing::warn!("{}: unusable endpoint '{raw}': {e}", self.name);
            }
        }
    }

    async fn handle_stream_end(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        self.endpoint.send_replace(None);
        self.pending.fail_all(|| TransportError::ConnectionClosed).await;
        self.state.set(ConnectionState::Disconnected);
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Disconnected);
        }
        if self.closing.load(Ordering::SeqCst) || !self.enabled.load(Ordering::SeqCst) {
            return;
        }
        tracing::warn!("{}: sse stream lost", self.name);
        self.schedule_recovery(self.config.reconnect);
    }

    fn schedule_recovery(&self, initial_delay: Duration) {
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
                match this.connect().await {
                    Ok(()) => {
                        tracing::info!("'{}' reconnected", this.name);
                        break;
                    }
                    Err(TransportError::Disabled) => break,
                    Err(e) => {
                        tracing::warn!("reconnect of '{}' failed: {}", this.name, e);
                        delay = delay.saturating_mul(2).min(STREAM_RETRY_MAX);
                    }
                }
            }
            this.recovering.store(false, Ordering::SeqCst);
        });
    }

    /// Tear the current stream down and rebuild shortly. Used when a POST
    /// comes back 404, which means the server no longer knows our session.
    async fn force_reconnect(&self) {
        if let Some(task) = self.stream_task.lock().await.take() {
            task.abort();
        }
        self.endpoint.send_replace(None);
        self.pending.fail_all(|| TransportError::ConnectionClosed).await;
        self.state.set(ConnectionState::Disconnected);
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Disconnected);
        }
        if !self.closing.load(Ordering::SeqCst) && self.enabled.load(Ordering::SeqCst) {
            self.schedule_recovery(Duration::from_millis(200));
        }
    }

    async fn post_json(&self, value: &Value) -> Result<reqwest::Response, TransportError> {
        let endpoint = self
            .endpoint
            .borrow()
            .clone()
            .ok_or(TransportError::NotConnected)?;
        let mut req = self
            .client
            .post(endpoint)
            .timeout(self.timeout)
            .json(value);
        req = self.apply_headers(req);
        let session_id = self.session.lock().await.id().map(str::to_string);
        if let Some(id) = session_id {
            req = req.header(MCP_SESSION_HEADER, id);
        }
        let resp = req.send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::warn!("{}: post endpoint returned 404, session expired", self.name);
            self.session.lock().await.clear();
            self.force_reconnect().await;
            return Err(TransportError::SessionExpired);
        }
        Ok(resp)
    }

    /// One request/response round trip, no recovery.
    async fn try_send(
        &self,
        method: &str,
        params: Value,
    ) -> Result<JsonRpcResponse, TransportError> {
        let id = self.pending.next_id();
        let rx = self.pending.register(id).await;
        let request = JsonRpcRequest::new(id, method, params);
        let value = serde_json::to_value(&request)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        let resp = match self.post_json(&value).await {
            Ok(resp) => resp,
            Err(e) => {
                self.pending.discard(id).await;
                return Err(e);
            }
        };

        let status = resp.status();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if content_type.starts_with("application/json") {
            // response rides back on the POST body instead of the stream
            let body: Value = match resp.json().await {
                Ok(body) => body,
                Err(e) => {
                    self.pending.discard(id).await;
                    return Err(e.into());
                }
            };
            dispatch_frame(&self.name, body, &self.pending, &self.events).await;
        } else if !status.is_success() {
            self.pending.discard(id).await;
            return Err(TransportError::Protocol(format!(
                "post failed with status {status}"
            )));
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

    async fn send_notification(&self, method: &str, params: Value) -> Result<(), TransportError> {
        let note = JsonRpcNotification::new(method, params);
        let value =
            serde_json::to_value(&note).map_err(|e| TransportError::Protocol(e.to_string()))?;
        let resp = self.post_json(&value).await?;
        if !resp.status().is_success() {
            return Err(TransportError::Protocol(format!(
                "notification rejected with status {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn teardown(&self) {
        if let Some(task) = self.stream_task.lock().await.take() {
            task.abort();
        }
        self.endpoint.send_replace(None);
        self.pending.fail_all(|| TransportError::ConnectionClosed).await;
        self.state.set(ConnectionState::Disconnected);
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Disconnected);
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    async fn connect(&self) -> Result<(), TransportError> {
        if !self.enabled.load(Ordering::SeqCst) {
            return Err(TransportError::Disabled);
        }
        let _guard = self.connect_lock.lock().await;
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        let this = self.me.upgrade().ok_or(TransportError::NotConnected)?;

        self.closing.store(false, Ordering::SeqCst);
        self.state.set(ConnectionState::Connecting);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.endpoint.send_replace(None);

        let resp = match self.open_stream().await {
            Ok(resp) => resp,
            Err(e) => {
                self.state.set(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        let handle = tokio::spawn(this.clone().run_stream(generation, resp));
        if let Some(old) = self.stream_task.lock().await.replace(handle) {
            old.abort();
        }

        // the server must announce the POST endpoint before we can talk;
        // the wait resolves to () because the watch guard is not Send
        let mut endpoint_rx = self.endpoint.subscribe();
        let announced = tokio::time::timeout(self.timeout, async {
            endpoint_rx.wait_for(|e| e.is_some()).await.map(|_| ())
        })
        .await;
        match announced {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                self.teardown().await;
                return Err(TransportError::ConnectionClosed);
            }
            Err(_) => {
                tracing::warn!("{}: no endpoint event within {:?}", self.name, self.timeout);
                self.teardown().await;
                return Err(TransportError::Timeout(self.timeout));
            }
        }

        let init = match self.send_request(METHOD_INITIALIZE, initialize_params()).await {
            Ok(resp) => resp,
            Err(e) => {
                self.teardown().await;
                return Err(e);
            }
        };
        if let Some(err) = init.error {
            self.teardown().await;
            return Err(TransportError::Protocol(format!(
                "initialize failed: {}",
                err.message
            )));
        }
        if let Err(e) = self
            .send_notification(METHOD_INITIALIZED, serde_json::json!({}))
            .await
        {
            self.teardown().await;
            return Err(e);
        }

        self.connected.store(true, Ordering::SeqCst);
        self.state.set(ConnectionState::Connected);
        let _ = self.events.send(TransportEvent::Connected);
        tracing::info!("mcp server '{}' connected over sse", self.name);
        Ok(())
    }

    async fn disconnect(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.teardown().await;
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Network-level send failures get the configured retry budget; protocol
    /// errors and expired sessions pass straight through.
    async fn send_request(
        &self,
        method: &str,
        params: Value,
    ) -> Result<JsonRpcResponse, TransportError> {
        let mut attempt = 0u32;
        loop {
            match self.try_send(method, params.clone()).await {
                Err(TransportError::Http(e)) if attempt < self.retries => {
                    attempt += 1;
                    tracing::warn!(
                        "{}: request failed ({e}), retry {attempt} of {}",
                        self.name,
                        self.retries
                    );
                    tokio::time::sleep(REQUEST_RETRY_PAUSE).await;
                }
                outcome => return outcome,
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn status(&self) -> TransportStatus {
        let detail = self
            .session
            .lock()
            .await
            .id()
            .map(|id| format!("session {id}"));
        TransportStatus {
            name: self.name.clone(),
            kind: TransportKind::Sse,
            state: self.state.get(),
            enabled: self.enabled.load(Ordering::SeqCst),
            crash_count: 0,
            recent_crashes: 0,
            blacklisted_for_secs: None,
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
}
