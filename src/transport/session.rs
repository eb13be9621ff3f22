//! HTTP session handling shared by the SSE and streamable transports

use serde::{Deserialize, Serialize};
use url::Url;

/// Header both HTTP transports use to carry the session id.
pub const MCP_SESSION_HEADER: &str = "mcp-session-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Track a session whenever the server hands one out.
    #[default]
    Auto,
    /// The server is expected to issue a session; a missing id is logged.
    Required,
    /// Never attach or track a session id.
    Disabled,
}

/// Current session id plus the configured mode. The id survives reconnects
/// for streamable servers and is cleared whenever a 404 signals expiry.
#[derive(Debug)]
pub struct SessionState {
    mode: SessionMode,
    id: Option<String>,
}

impl SessionState {
    pub fn new(mode: SessionMode) -> Self {
        Self { mode, id: None }
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    /// Session id to attach to outgoing requests; always `None` in disabled
    /// mode, whatever has been observed.
    pub fn id(&self) -> Option<&str> {
        if self.mode == SessionMode::Disabled {
            None
        } else {
            self.id.as_deref()
        }
    }

    pub fn set(&mut self, id: impl Into<String>) {
        if self.mode == SessionMode::Disabled {
            return;
        }
        self.id = Some(id.into());
    }

    pub fn clear(&mut self) {
        self.id = None;
    }

    pub fn is_active(&self) -> bool {
        self.id().is_some()
    }
}

/// Pull a session id out of an endpoint URL. The query parameter wins over
/// a path segment: `/mcp/messages/abc123?sessionId=xyz` yields `xyz`, while
/// `/messages/abc123` alone yields `abc123`.
pub fn extract_session_id(endpoint: &str) -> Option<String> {
    let url = match Url::parse(endpoint) {
        Ok(url) => url,
        // relative endpoint paths are the common case on SSE streams
        Err(_) => Url::parse("http://session.invalid").ok()?.join(endpoint).ok()?,
    };

    for (key, value) in url.query_pairs() {
        if (key == "sessionId" || key == "session_id") && !value.is_empty() {
            return Some(value.into_owned());
        }
    }

    let mut segments = url.path_segments()?;
    while let Some(segment) = segments.next() {
        if segment == "messages" {
            if let Some(next) = segments.next() {
                if !next.is_empty() {
                    return Some(next.to_string());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_param_beats_path_segment() {
        let id = extract_session_id("http://localhost:3000/mcp/messages/abc123?sessionId=xyz");
        assert_eq!(id.as_deref(), Some("xyz"));
    }

    #[test]
    fn test_snake_case_query_param() {
        let id = extract_session_id("/messages?session_id=deadbeef");
        assert_eq!(id.as_deref(), Some("deadbeef"));
    }

    #[test]
    fn test_path_segment_fallback() {
        let id = extract_session_id("/messages/abc123");
        assert_eq!(id.as_deref(), Some("abc123"));
        let id = extract_session_id("http://host/mcp/messages/abc123");
        assert_eq!(id.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_no_session_id_present() {
        assert_eq!(extract_session_id("/mcp/sse"), None);
        assert_eq!(extract_session_id("http://host/messages"), None);
        assert_eq!(extract_session_id("http://host/messages/"), None);
    }

    #[test]
    fn test_disabled_mode_hides_id() {
        let mut session = SessionState::new(SessionMode::Disabled);
        session.set("abc");
        assert_eq!(session.id(), None);
        assert!(!session.is_active());
    }

    #[test]
    fn test_auto_mode_tracks_and_clears() {
        let mut session = SessionState::new(SessionMode::Auto);
        assert!(!session.is_active());
        session.set("abc");
        assert_eq!(session.id(), Some("abc"));
        session.clear();
        assert!(!session.is_active());
    }
}
