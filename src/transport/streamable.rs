//! Streamable HTTP transport
//!
//! Everything goes through one POST endpoint. The server answers either with
//! a plain JSON body or with a short SSE-framed body carrying the response,
//! and hands out a session id via the `mcp-session-id` header or inside the
//! initialize result. Unlike the SSE transport there is no long-lived stream
//! to babysit, so there is no reconnect loop either; the session id is kept
//! across disconnects, and when the server 404s it the adapter drops the id,
//! redoes the handshake in place and retries, staying connected throughout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use url::Url;

use crate::config::HttpConfig;
use crate::protocol::{
    initialize_params, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, METHOD_INITIALIZE,
    METHOD_INITIALIZED,
};

use super::pending::PendingRequests;
use super::session::{SessionState, MCP_SESSION_HEADER};
use super::sse::SseDecoder;
use super::{
    dispatch_frame, ConnectionState, StateCell, Transport, TransportError, TransportEvent,
    TransportKind, TransportStatus, EVENT_CHANNEL_CAPACITY, REQUEST_RETRY_PAUSE,
};

pub struct StreamableHttpTransport {
    me: Weak<StreamableHttpTransport>,
    name: String,
    config: HttpConfig,
    endpoint: Url,
    timeout: Duration,
    retries: u32,
    client: reqwest::Client,
    pending: PendingRequests,
    session: Mutex<SessionState>,
    connect_lock: Mutex<()>,
    state: StateCell,
    connected: AtomicBool,
    enabled: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
}

impl StreamableHttpTransport {
    pub fn new(
        name: impl Into<String>,
        config: HttpConfig,
        timeout: Duration,
        retries: u32,
    ) -> Result<Arc<Self>, TransportError> {
        let endpoint = Url::parse(&config.url).map_err(|e| {
            TransportError::Config(format!("invalid http url '{}': {e}", config.url))
        })?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let session_mode = config.session_mode;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            name: name.into(),
            config,
            endpoint,
            timeout,
            retries,
            client,
            pending: PendingRequests::new(),
            session: Mutex::new(SessionState::new(session_mode)),
            connect_lock: Mutex::new(()),
            state: StateCell::new(ConnectionState::Disconnected),
            connected: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
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

    /// POST one frame. Captures any session id the response carries; a 404
    /// while we hold a session means the server dropped it, so the id is
    /// cleared before the caller retries or gives up.
    async fn post_json(&self, value: &Value) -> Result<reqwest::Response, TransportError> {
        let mut req = self
            .client
            .post(self.endpoint.clone())
            .header(
                reqwest::header::ACCEPT,
                "application/json, text/event-stream",
            )
            .json(value);
        req = self.apply_headers(req);
        let session_id = self.session.lock().await.id().map(str::to_string);
        let had_session = session_id.is_some();
        if let Some(id) = session_id {
            req = req.header(MCP_SESSION_HEADER, id);
        }
        let resp = req.send().await?;

        if let Some(sid) = resp
            .headers()
            .get(MCP_SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.session.lock().await.set(sid);
        }
        if resp.status() == reqwest::StatusCode::NOT_FOUND && had_session {
            tracing::warn!("{}: server no longer knows our session", self.name);
            self.session.lock().await.clear();
            return Err(TransportError::SessionExpired);
        }
        Ok(resp)
    }

    /// Run the MCP handshake over the bare endpoint, adopting whatever
    /// session id the server hands out. A stale id kept from an earlier
    /// run is cleared by the failing POST, so one retry suffices.
    async fn handshake(&self) -> Result<(), TransportError> {
        let init = match self.try_send(METHOD_INITIALIZE, initialize_params()).await {
            Err(TransportError::SessionExpired) => {
                self.try_send(METHOD_INITIALIZE, initialize_params()).await?
            }
            outcome => outcome?,
        };
        if let Some(err) = init.error {
            return Err(TransportError::Protocol(format!(
                "initialize failed: {}",
                err.message
            )));
        }
        // header wins; _meta.sessionId only fills a gap
        let meta_session = init
            .result
            .as_ref()
            .and_then(|r| r.pointer("/_meta/sessionId"))
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(sid) = meta_session {
            let mut session = self.session.lock().await;
            if !session.is_active() {
                session.set(sid);
            }
        }
        self.send_notification(METHOD_INITIALIZED, serde_json::json!({}))
            .await
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
        if !status.is_success() {
            self.pending.discard(id).await;
            return Err(TransportError::Protocol(format!(
                "post failed with status {status}"
            )));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if content_type.starts_with("text/event-stream") {
            match self.me.upgrade() {
                Some(this) => {
                    tokio::spawn(this.drain_sse_body(resp));
                }
                None => {
                    self.pending.discard(id).await;
                    return Err(TransportError::ConnectionClosed);
                }
            }
        } else {
            let body: Value = match resp.json().await {
                Ok(body) => body,
                Err(e) => {
                    self.pending.discard(id).await;
                    return Err(e.into());
                }
            };
            dispatch_frame(&self.name, body, &self.pending, &self.events).await;
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

    /// Pull JSON-RPC frames out of an SSE-framed response body.
    async fn drain_sse_body(self: Arc<Self>, resp: reqwest::Response) {
        let mut decoder = SseDecoder::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    let text = String::from_utf8_lossy(&bytes);
                    for frame in decoder.push(&text) {
                        let data = frame.data.trim();
                        if !data.starts_with('{') {
                            continue;
                        }
                        match serde_json::from_str::<Value>(data) {
                            Ok(value) => {
                                dispatch_frame(&self.name, value, &self.pending, &self.events)
                                    .await;
                            }
                            Err(e) => {
                                tracing::warn!(
                                    "{}: dropping malformed frame in response body: {e}",
                                    self.name
                                );
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!("{}: response body ended: {e}", self.name);
                    break;
                }
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

    async fn mark_disconnected(&self) {
        self.pending.fail_all(|| TransportError::ConnectionClosed).await;
        self.state.set(ConnectionState::Disconnected);
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Disconnected);
        }
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::StreamableHttp
    }

    async fn connect(&self) -> Result<(), TransportError> {
        if !self.enabled.load(Ordering::SeqCst) {
            return Err(TransportError::Disabled);
        }
        let _guard = self.connect_lock.lock().await;
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.state.set(ConnectionState::Connecting);

        if let Err(e) = self.handshake().await {
            self.state.set(ConnectionState::Disconnected);
            return Err(e);
        }

        self.connected.store(true, Ordering::SeqCst);
        self.state.set(ConnectionState::Connected);
        let _ = self.events.send(TransportEvent::Connected);
        tracing::info!("mcp server '{}' connected over streamable http", self.name);
        Ok(())
    }

    async fn disconnect(&self) {
        // the session id is deliberately kept for the next connect
        self.mark_disconnected().await;
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// An expired session never unseats the adapter: the id is already
    /// cleared, so redo the handshake in place and retry the call once.
    /// Network-level send failures get the configured retry budget.
    async fn send_request(
        &self,
        method: &str,
        params: Value,
    ) -> Result<JsonRpcResponse, TransportError> {
        let mut attempt = 0u32;
        loop {
            match self.try_send(method, params.clone()).await {
                Err(TransportError::SessionExpired) => {
                    tracing::info!("{}: renegotiating the expired session", self.name);
                    self.handshake().await?;
                    return self.try_send(method, params).await;
                }
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
            kind: TransportKind::StreamableHttp,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::session::SessionMode;
    use std::collections::HashMap;

    fn http_config(url: &str) -> HttpConfig {
        HttpConfig {
            url: url.to_string(),
            headers: HashMap::new(),
            api_key: None,
            session_mode: SessionMode::Auto,
        }
    }

    #[test]
    fn test_new_rejects_invalid_url() {
        let outcome = StreamableHttpTransport::new(
            "bad",
            http_config("://nope"),
            Duration::from_secs(1),
            0,
        );
        assert!(matches!(outcome, Err(TransportError::Config(_))));
    }

    #[tokio::test]
    async fn test_session_survives_disconnect() {
        let t = StreamableHttpTransport::new(
            "test",
            http_config("http://localhost:9/mcp"),
            Duration::from_secs(1),
            0,
        )
        .unwrap();
        t.session.lock().await.set("s-1");
        t.disconnect().await;
        assert_eq!(t.session.lock().await.id(), Some("s-1"));
        assert!(!t.is_connected());
    }

    #[tokio::test]
    async fn test_disabled_session_mode_never_exposes_id() {
        let mut config = http_config("http://localhost:9/mcp");
        config.session_mode = SessionMode::Disabled;
        let t =
            StreamableHttpTransport::new("test", config, Duration::from_secs(1), 0).unwrap();
        t.session.lock().await.set("ignored");
        assert_eq!(t.session.lock().await.id(), None);
        let status = t.status().await;
        assert_eq!(status.detail, None);
        assert_eq!(status.crash_count, 0);
    }
}
