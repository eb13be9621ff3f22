//! Gateway configuration
//!
//! The config file is `mcpd.json` with a top-level `mcpServers` map, found by
//! walking up from the current directory and falling back to the user config
//! dir. Entries are parsed leniently into [`RawServerConfig`] and validated
//! exactly once into the typed [`ServerConfig`] / [`TransportConfig`] pair;
//! a missing command or an unparseable URL is a hard error, never retried.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use crate::transport::session::SessionMode;

pub const CONFIG_FILE_NAME: &str = "mcpd.json";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_RETRIES: u32 = 2;
pub const DEFAULT_SSE_RECONNECT_SECS: u64 = 5;

fn default_true() -> bool {
    true
}

/// One server entry exactly as it appears in the file. Lenient on purpose:
/// the transport tag is optional and inferred when absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawServerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,

    // stdio fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    // http fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(rename = "apiKey", default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(rename = "sessionMode", default, skip_serializing_if = "Option::is_none")]
    pub session_mode: Option<SessionMode>,
    /// SSE stream reconnect interval in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<u64>,

    /// Per-request timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StdioConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SseConfig {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub api_key: Option<String>,
    pub session_mode: SessionMode,
    pub reconnect: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpConfig {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub api_key: Option<String>,
    pub session_mode: SessionMode,
}

/// Fully-typed transport parameters, one variant per wire.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportConfig {
    Stdio(StdioConfig),
    Sse(SseConfig),
    StreamableHttp(HttpConfig),
}

impl TransportConfig {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Stdio(_) => "stdio",
            Self::Sse(_) => "sse",
            Self::StreamableHttp(_) => "streamable-http",
        }
    }
}

/// Validated per-server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub transport: TransportConfig,
    pub enabled: bool,
    pub timeout: Duration,
    pub retries: u32,
}

impl RawServerConfig {
    /// Validate into the typed form. The explicit `transport` tag wins;
    /// otherwise a `command` means stdio and a URL containing `/sse` means
    /// SSE, anything else with a URL is streamable HTTP.
    pub fn into_typed(self, name: &str) -> Result<ServerConfig> {
        let kind = match self.transport.as_deref() {
            Some("stdio") => "stdio",
            Some("sse") => "sse",
            Some("http") | Some("streamable-http") => "http",
            Some(other) => bail!("server '{name}': unknown transport '{other}'"),
            None => {
                if self.command.is_some() {
                    "stdio"
                } else if let Some(url) = &self.url {
                    if url.trim_end_matches('/').ends_with("/sse") {
                        "sse"
                    } else {
                        "http"
                    }
                } else {
                    bail!("server '{name}': needs either a command or a url");
                }
            }
        };

        let transport = match kind {
            "stdio" => {
                let command = self
                    .command
                    .with_context(|| format!("server '{name}': stdio transport needs a command"))?;
                TransportConfig::Stdio(StdioConfig {
                    command,
                    args: self.args,
                    env: self.env,
                    cwd: self.cwd,
                })
            }
            "sse" => {
                let url = self
                    .url
                    .with_context(|| format!("server '{name}': sse transport needs a url"))?;
                TransportConfig::Sse(SseConfig {
                    url,
                    headers: self.headers,
                    api_key: self.api_key,
                    session_mode: self.session_mode.unwrap_or_default(),
                    reconnect: Duration::from_secs(
                        self.reconnect.unwrap_or(DEFAULT_SSE_RECONNECT_SECS).max(1),
                    ),
                })
            }
            _ => {
                let url = self
                    .url
                    .with_context(|| format!("server '{name}': http transport needs a url"))?;
                TransportConfig::StreamableHttp(HttpConfig {
                    url,
                    headers: self.headers,
                    api_key: self.api_key,
                    session_mode: self.session_mode.unwrap_or_default(),
                })
            }
        };

        Ok(ServerConfig {
            name: name.to_string(),
            transport,
            enabled: self.enabled,
            timeout: Duration::from_secs(self.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS).max(1)),
            retries: self.retries.unwrap_or(DEFAULT_RETRIES),
        })
    }
}

/// The whole config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: HashMap<String, RawServerConfig>,
}

impl GatewayConfig {
    /// Find and load the nearest config file. `Ok(None)` when none exists.
    pub fn load() -> Result<Option<(Self, PathBuf)>> {
        match Self::find_config_file() {
            Some(path) => {
                let config = Self::load_from_path(&path)?;
                Ok(Some((config, path)))
            }
            None => Ok(None),
        }
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Walk up from the current directory looking for `mcpd.json`, then fall
    /// back to the user config dir.
    pub fn find_config_file() -> Option<PathBuf> {
        if let Ok(mut dir) = std::env::current_dir() {
            loop {
                let candidate = dir.join(CONFIG_FILE_NAME);
                if candidate.is_file() {
                    return Some(candidate);
                }
                if !dir.pop() {
                    break;
                }
            }
        }
        let global = dirs::config_dir()?.join("mcpd").join(CONFIG_FILE_NAME);
        global.is_file().then_some(global)
    }

    /// Typed view of one server.
    pub fn server(&self, name: &str) -> Result<ServerConfig> {
        let raw = self
            .mcp_servers
            .get(name)
            .with_context(|| format!("server '{name}' not found in config"))?;
        raw.clone().into_typed(name)
    }

    /// Typed view of every server, sorted by name. Invalid entries are
    /// errors, not silently dropped.
    pub fn servers(&self) -> Result<Vec<ServerConfig>> {
        let mut names: Vec<&String> = self.mcp_servers.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| self.server(name))
            .collect()
    }

    pub fn enabled_servers(&self) -> Result<Vec<ServerConfig>> {
        Ok(self
            .servers()?
            .into_iter()
            .filter(|server| server.enabled)
            .collect())
    }
}

/// Change events published by the provider.
#[derive(Debug, Clone)]
pub enum ConfigEvent {
    ServerToggled { server: String, enabled: bool },
    Reloaded,
}

/// Shared, reloadable view of the configuration. Toggles persist back to the
/// file when one is backing the provider.
pub struct ConfigProvider {
    path: Option<PathBuf>,
    config: RwLock<GatewayConfig>,
    events: broadcast::Sender<ConfigEvent>,
}

impl ConfigProvider {
    pub fn new(config: GatewayConfig, path: Option<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            path,
            config: RwLock::new(config),
            events,
        }
    }

    /// Provider over the nearest config file, or an empty config when none
    /// is found.
    pub fn discover() -> Result<Self> {
        match GatewayConfig::load()? {
            Some((config, path)) => Ok(Self::new(config, Some(path))),
            None => Ok(Self::new(GatewayConfig::default(), None)),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let config = GatewayConfig::load_from_path(path)?;
        Ok(Self::new(config, Some(path.to_path_buf())))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> GatewayConfig {
        self.config.read().await.clone()
    }

    pub async fn server_config(&self, name: &str) -> Result<ServerConfig> {
        self.config.read().await.server(name)
    }

    pub async fn enabled_servers(&self) -> Result<Vec<ServerConfig>> {
        self.config.read().await.enabled_servers()
    }

    /// Re-read the backing file. A no-op for file-less providers.
    pub async fn reload(&self) -> Result<()> {
        if let Some(path) = &self.path {
            let fresh = GatewayConfig::load_from_path(path)?;
            *self.config.write().await = fresh;
        }
        let _ = self.events.send(ConfigEvent::Reloaded);
        Ok(())
    }

    /// Flip one server's enabled flag, persist, and announce the change.
    /// Returns the server's typed config so callers can act on it.
    pub async fn set_server_enabled(&self, name: &str, enabled: bool) -> Result<ServerConfig> {
        let server = {
            let mut config = self.config.write().await;
            let raw = config
                .mcp_servers
                .get_mut(name)
                .with_context(|| format!("server '{name}' not found in config"))?;
            raw.enabled = enabled;
            let server = config.server(name)?;
            if let Some(path) = &self.path {
                config.save_to_path(path)?;
            }
            server
        };
        let _ = self.events.send(ConfigEvent::ServerToggled {
            server: name.to_string(),
            enabled,
        });
        Ok(server)
    }
}
