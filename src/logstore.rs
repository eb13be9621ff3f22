//! Bounded in-memory log retention per backend server
//!
//! One explicitly-constructed [`LogStore`] is shared by the daemon and its
//! status surfaces. Each server gets a ring buffer capped at a few hundred
//! entries; stderr output, connection transitions and adapter errors all
//! land here so `mcpd daemon logs` works without touching the filesystem.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

pub const DEFAULT_LOG_CAPACITY: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

pub struct LogStore {
    capacity: usize,
    entries: RwLock<HashMap<String, VecDeque<LogEntry>>>,
}

impl LogStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_log(&self, server: &str, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        };
        let mut entries = self.entries.write().await;
        let buffer = entries.entry(server.to_string()).or_default();
        if buffer.len() == self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(entry);
    }

    /// Record raw child output. stderr lines come in at info since that is
    /// where MCP servers write their own logs; anything else is debug noise.
    pub async fn add_server_output(&self, server: &str, stream: &str, chunk: &str) {
        let level = if stream == "stderr" {
            LogLevel::Info
        } else {
            LogLevel::Debug
        };
        for line in chunk.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            self.add_log(server, level, line).await;
        }
    }

    pub async fn update_connection_status(&self, server: &str, status: &str) {
        self.add_log(server, LogLevel::Info, format!("connection: {status}"))
            .await;
    }

    /// Newest `limit` entries for one server, oldest first.
    pub async fn recent(&self, server: &str, limit: usize) -> Vec<LogEntry> {
        let entries = self.entries.read().await;
        match entries.get(server) {
            Some(buffer) => {
                let skip = buffer.len().saturating_sub(limit);
                buffer.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    pub async fn servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for LogStore {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}
