//! Client side of the daemon socket
//!
//! [`DaemonClient`] covers one-shot commands (each opens a fresh connection,
//! sends one line, reads one line). [`DaemonConnection`] is the persistent
//! variant the stdio proxy uses, with the handshake already done.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use crate::protocol::{JsonRpcNotification, JsonRpcResponse};

use super::protocol::{
    default_socket_path, ClientKind, ClientMessage, DaemonMessage, DaemonStatus, ServerLogEntry,
    ToolInfo,
};

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct DaemonClient {
    socket_path: PathBuf,
}

impl DaemonClient {
    pub fn new(socket_path: Option<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.unwrap_or_else(default_socket_path),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub async fn is_running(&self) -> bool {
        self.ping().await.is_ok()
    }

    pub async fn ping(&self) -> Result<()> {
        match self.request(&ClientMessage::Ping).await? {
            DaemonMessage::Pong => Ok(()),
            other => bail!("unexpected reply to ping: {other:?}"),
        }
    }

    pub async fn status(&self) -> Result<DaemonStatus> {
        match self.request(&ClientMessage::GetStatus).await? {
            DaemonMessage::Status { status } => Ok(status),
            other => bail!("unexpected reply to status: {other:?}"),
        }
    }

    pub async fn tools(&self) -> Result<Vec<ToolInfo>> {
        match self.request(&ClientMessage::GetTools).await? {
            DaemonMessage::Tools { tools } => Ok(tools),
            other => bail!("unexpected reply to tools: {other:?}"),
        }
    }

    pub async fn logs(
        &self,
        server: Option<String>,
        lines: usize,
    ) -> Result<Vec<ServerLogEntry>> {
        match self.request(&ClientMessage::GetLogs { server, lines }).await? {
            DaemonMessage::Logs { entries } => Ok(entries),
            other => bail!("unexpected reply to logs: {other:?}"),
        }
    }

    pub async fn reload_config(&self) -> Result<()> {
        self.expect_ok(&ClientMessage::ReloadConfig).await
    }

    pub async fn set_server_enabled(&self, server: &str, enabled: bool) -> Result<()> {
        self.expect_ok(&ClientMessage::SetServerEnabled {
            server: server.to_string(),
            enabled,
        })
        .await
    }

    pub async fn clear_blacklist(&self, server: &str) -> Result<()> {
        self.expect_ok(&ClientMessage::ClearBlacklist {
            server: server.to_string(),
        })
        .await
    }

    pub async fn stop(&self) -> Result<()> {
        self.expect_ok(&ClientMessage::Stop).await
    }

    /// Run one MCP frame through the daemon's gateway.
    pub async fn mcp_request(&self, request: Value) -> Result<JsonRpcResponse> {
        match self.request(&ClientMessage::McpRequest { request }).await? {
            DaemonMessage::McpResponse { response } => Ok(response),
            other => bail!("unexpected reply to mcp request: {other:?}"),
        }
    }

    /// Open a persistent connection and complete the handshake.
    pub async fn connect(
        &self,
        kind: ClientKind,
        name: Option<String>,
    ) -> Result<DaemonConnection> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| {
                format!("daemon not reachable on {}", self.socket_path.display())
            })?;
        let (read_half, write_half) = stream.into_split();
        let mut conn = DaemonConnection {
            rx: DaemonReceiver {
                reader: BufReader::new(read_half),
            },
            tx: DaemonSender { writer: write_half },
            client_id: String::new(),
        };
        conn.tx
            .send_client_message(&ClientMessage::Handshake { kind, name })
            .await?;
        loop {
            match conn.recv().await? {
                Some(DaemonMessage::HandshakeAck { client_id, .. }) => {
                    conn.client_id = client_id;
                    return Ok(conn);
                }
                Some(DaemonMessage::Event { .. }) => continue,
                Some(other) => bail!("unexpected message before ack: {other:?}"),
                None => bail!("daemon closed the connection during handshake"),
            }
        }
    }

    async fn expect_ok(&self, message: &ClientMessage) -> Result<()> {
        match self.request(message).await? {
            DaemonMessage::Ok => Ok(()),
            other => bail!("unexpected reply: {other:?}"),
        }
    }

    async fn request(&self, message: &ClientMessage) -> Result<DaemonMessage> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| {
                format!("daemon not reachable on {}", self.socket_path.display())
            })?;
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        stream.write_all(&line).await?;
        stream.flush().await?;

        let mut reader = BufReader::new(stream);
        let mut reply = String::new();
        let n = tokio::time::timeout(REPLY_TIMEOUT, reader.read_line(&mut reply))
            .await
            .context("daemon did not answer in time")??;
        if n == 0 {
            bail!("daemon closed the connection without replying");
        }
        let message: DaemonMessage =
            serde_json::from_str(reply.trim()).context("unparseable reply from daemon")?;
        if let DaemonMessage::Error { message } = message {
            bail!("daemon error: {message}");
        }
        Ok(message)
    }
}

/// An MCP frame arriving over a persistent connection.
#[derive(Debug)]
pub enum McpFrame {
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

/// Read half of a split [`DaemonConnection`].
pub struct DaemonReceiver {
    reader: BufReader<OwnedReadHalf>,
}

impl DaemonReceiver {
    /// Next message from the daemon; `None` when it hangs up.
    pub async fn recv(&mut self) -> Result<Option<DaemonMessage>> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        let message =
            serde_json::from_str(line.trim()).context("unparseable message from daemon")?;
        Ok(Some(message))
    }

    /// Next MCP frame, skipping daemon events a proxy does not care about.
    pub async fn next_mcp(&mut self) -> Result<Option<McpFrame>> {
        loop {
            match self.recv().await? {
                None => return Ok(None),
                Some(DaemonMessage::McpResponse { response }) => {
                    return Ok(Some(McpFrame::Response(response)));
                }
                Some(DaemonMessage::McpNotification { notification }) => {
                    return Ok(Some(McpFrame::Notification(notification)));
                }
                Some(DaemonMessage::Error { message }) => {
                    tracing::warn!("daemon error: {message}");
                }
                Some(_) => {}
            }
        }
    }
}

/// Write half of a split [`DaemonConnection`].
pub struct DaemonSender {
    writer: OwnedWriteHalf,
}

impl DaemonSender {
    pub async fn send(&mut self, request: Value) -> Result<()> {
        self.send_client_message(&ClientMessage::McpRequest { request })
            .await
    }

    async fn send_client_message(&mut self, message: &ClientMessage) -> Result<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

pub struct DaemonConnection {
    rx: DaemonReceiver,
    tx: DaemonSender,
    client_id: String,
}

impl DaemonConnection {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub async fn send(&mut self, request: Value) -> Result<()> {
        self.tx.send(request).await
    }

    pub async fn recv(&mut self) -> Result<Option<DaemonMessage>> {
        self.rx.recv().await
    }

    pub async fn next_mcp(&mut self) -> Result<Option<McpFrame>> {
        self.rx.next_mcp().await
    }

    /// Split into independent halves so reads and writes can live on
    /// different tasks, mirroring [`UnixStream::into_split`].
    pub fn into_split(self) -> (DaemonReceiver, DaemonSender) {
        (self.rx, self.tx)
    }
}
