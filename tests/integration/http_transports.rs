//! HTTP transports against raw TCP stub servers
//!
//! The stubs speak just enough HTTP/1.1 for reqwest: every response
//! carries `Connection: close` so each POST arrives on a fresh socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use mcpd::config::{RawServerConfig, ServerConfig};
use mcpd::transport::{build_adapter, TransportError, TransportKind};

fn http_server(name: &str, url: &str) -> ServerConfig {
    let raw: RawServerConfig = serde_json::from_value(json!({
        "url": url,
        "timeout": 5,
    }))
    .unwrap();
    raw.into_typed(name).unwrap()
}

/// Read one HTTP request: header block plus a Content-Length body.
async fn read_http_request(sock: &mut TcpStream) -> (String, String) {
    let mut data = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = sock.read(&mut buf).await.unwrap_or(0);
        if n == 0 {
            return (String::from_utf8_lossy(&data).to_string(), String::new());
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&data[..pos]).to_string();
            let content_length = head
                .lines()
                .find_map(|l| {
                    let (k, v) = l.split_once(':')?;
                    if k.eq_ignore_ascii_case("content-length") {
                        v.trim().parse::<usize>().ok()
                    } else {
                        None
                    }
                })
                .unwrap_or(0);
            let mut body = data[pos + 4..].to_vec();
            while body.len() < content_length {
                let n = sock.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                body.extend_from_slice(&buf[..n]);
            }
            return (head, String::from_utf8_lossy(&body).to_string());
        }
    }
}

fn header_value(head: &str, name: &str) -> Option<String> {
    head.lines().find_map(|l| {
        let (k, v) = l.split_once(':')?;
        if k.eq_ignore_ascii_case(name) {
            Some(v.trim().to_string())
        } else {
            None
        }
    })
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": "2025-03-26",
        "capabilities": { "tools": {} },
        "serverInfo": { "name": "stub", "version": "0.1" },
    })
}

async fn write_accepted(sock: &mut TcpStream) {
    let _ = sock
        .write_all(b"HTTP/1.1 202 Accepted\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
        .await;
}

async fn write_not_found(sock: &mut TcpStream) {
    let _ = sock
        .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
        .await;
}

async fn write_json(sock: &mut TcpStream, frame: &Value, session: Option<&str>) {
    let body = frame.to_string();
    let mut head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
        body.len()
    );
    if let Some(session) = session {
        head.push_str(&format!("mcp-session-id: {session}\r\n"));
    }
    head.push_str("\r\n");
    let _ = sock.write_all(head.as_bytes()).await;
    let _ = sock.write_all(body.as_bytes()).await;
}

/// SSE stub: the GET stream announces the POST endpoint, every POSTed
/// request is answered with 202 and its response pushed over the stream.
fn spawn_sse_stub(listener: TcpListener) {
    tokio::spawn(async move {
        let mut sse: Option<TcpStream> = None;
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            let (head, body) = read_http_request(&mut sock).await;
            if head.starts_with("GET") {
                let _ = sock
                    .write_all(
                        b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\n\r\n",
                    )
                    .await;
                let _ = sock
                    .write_all(b"event: endpoint\ndata: /messages?sessionId=abc123\n\n")
                    .await;
                sse = Some(sock);
                continue;
            }

            write_accepted(&mut sock).await;
            let Ok(request) = serde_json::from_str::<Value>(&body) else {
                continue;
            };
            let Some(id) = request.get("id").cloned() else {
                continue; // notification, nothing to push
            };
            let result = match request["method"].as_str() {
                Some("initialize") => initialize_result(),
                Some("tools/list") => json!({
                    "tools": [{
                        "name": "sse_tool",
                        "description": "served over sse",
                        "inputSchema": {"type": "object"},
                    }]
                }),
                _ => json!({}),
            };
            if let Some(stream) = sse.as_mut() {
                let frame = json!({"jsonrpc": "2.0", "id": id, "result": result});
                let event = format!("event: message\ndata: {frame}\n\n");
                let _ = stream.write_all(event.as_bytes()).await;
            }
        }
    });
}

#[tokio::test]
async fn test_sse_learns_endpoint_and_round_trips() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    spawn_sse_stub(listener);

    let config = http_server("stub", &format!("http://127.0.0.1:{port}/sse"));
    let adapter = build_adapter(&config).unwrap();
    assert_eq!(adapter.kind(), TransportKind::Sse);

    adapter.connect().await.unwrap();
    assert!(adapter.is_connected());

    let tools = adapter.get_tools().await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "sse_tool");

    // session id was lifted from the endpoint query parameter
    let status = adapter.status().await;
    assert!(
        status.detail.as_deref().unwrap_or("").contains("abc123"),
        "status detail {:?} missing session",
        status.detail
    );

    adapter.disconnect().await;
    assert!(!adapter.is_connected());
}

/// SSE stub whose POST endpoint starts 404ing once `expired` flips; the
/// next GET stream mints a fresh session and honors POSTs again.
fn spawn_sse_expiry_stub(listener: TcpListener, expired: Arc<AtomicBool>) {
    tokio::spawn(async move {
        let mut sse: Option<TcpStream> = None;
        let mut streams = 0u32;
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            let (head, body) = read_http_request(&mut sock).await;
            if head.starts_with("GET") {
                streams += 1;
                expired.store(false, Ordering::SeqCst);
                let _ = sock
                    .write_all(
                        b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\n\r\n",
                    )
                    .await;
                let event =
                    format!("event: endpoint\ndata: /messages?sessionId=gen-{streams}\n\n");
                let _ = sock.write_all(event.as_bytes()).await;
                sse = Some(sock);
                continue;
            }
            if expired.load(Ordering::SeqCst) {
                write_not_found(&mut sock).await;
                continue;
            }
            write_accepted(&mut sock).await;
            let Ok(request) = serde_json::from_str::<Value>(&body) else {
                continue;
            };
            let Some(id) = request.get("id").cloned() else {
                continue;
            };
            let result = match request["method"].as_str() {
                Some("initialize") => initialize_result(),
                _ => json!({}),
            };
            if let Some(stream) = sse.as_mut() {
                let frame = json!({"jsonrpc": "2.0", "id": id, "result": result});
                let event = format!("event: message\ndata: {frame}\n\n");
                let _ = stream.write_all(event.as_bytes()).await;
            }
        }
    });
}

#[tokio::test]
async fn test_sse_404_clears_session_and_reconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let expired = Arc::new(AtomicBool::new(false));
    spawn_sse_expiry_stub(listener, expired.clone());

    let config = http_server("stub", &format!("http://127.0.0.1:{port}/sse"));
    let adapter = build_adapter(&config).unwrap();
    adapter.connect().await.unwrap();
    let detail = adapter.status().await.detail.unwrap_or_default();
    assert!(detail.contains("gen-1"), "unexpected session: {detail}");

    // the server forgot the session: the call in flight fails once, the
    // stale id goes with it, and a fresh stream is negotiated shortly
    expired.store(true, Ordering::SeqCst);
    let outcome = adapter.send_request("tools/list", json!({})).await;
    assert!(matches!(outcome, Err(TransportError::SessionExpired)));
    assert_eq!(adapter.status().await.detail, None);

    let mut reconnected = false;
    for _ in 0..50 {
        if adapter.is_connected() {
            reconnected = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(reconnected, "stream never came back");

    let detail = adapter.status().await.detail.unwrap_or_default();
    assert!(detail.contains("gen-2"), "expected a fresh session: {detail}");
    assert!(adapter.send_request("tools/list", json!({})).await.is_ok());

    adapter.disconnect().await;
}

/// Streamable stub: plain request/response JSON bodies, with the session
/// id handed out on initialize and expected back on later requests.
fn spawn_streamable_stub(listener: TcpListener, seen_sessions: Arc<Mutex<Vec<String>>>) {
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            let seen = seen_sessions.clone();
            tokio::spawn(async move {
                let (head, body) = read_http_request(&mut sock).await;
                if let Some(session) = header_value(&head, "mcp-session-id") {
                    seen.lock().unwrap().push(session);
                }
                let Ok(request) = serde_json::from_str::<Value>(&body) else {
                    write_accepted(&mut sock).await;
                    return;
                };
                let Some(id) = request.get("id").cloned() else {
                    write_accepted(&mut sock).await;
                    return;
                };
                match request["method"].as_str() {
                    Some("initialize") => {
                        let frame =
                            json!({"jsonrpc": "2.0", "id": id, "result": initialize_result()});
                        write_json(&mut sock, &frame, Some("sess-42")).await;
                    }
                    Some("tools/list") => {
                        let frame = json!({"jsonrpc": "2.0", "id": id, "result": {
                            "tools": [{
                                "name": "http_tool",
                                "description": "served over streamable http",
                                "inputSchema": {"type": "object"},
                            }]
                        }});
                        write_json(&mut sock, &frame, None).await;
                    }
                    _ => {
                        let frame = json!({"jsonrpc": "2.0", "id": id, "result": {}});
                        write_json(&mut sock, &frame, None).await;
                    }
                }
            });
        }
    });
}

#[tokio::test]
async fn test_streamable_json_mode_and_session_header() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let seen_sessions = Arc::new(Mutex::new(Vec::new()));
    spawn_streamable_stub(listener, seen_sessions.clone());

    let config = http_server("stub", &format!("http://127.0.0.1:{port}/mcp"));
    let adapter = build_adapter(&config).unwrap();
    assert_eq!(adapter.kind(), TransportKind::StreamableHttp);

    adapter.connect().await.unwrap();
    assert!(adapter.is_connected());

    let tools = adapter.get_tools().await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "http_tool");

    // requests after initialize must carry the server-issued session id
    let seen = seen_sessions.lock().unwrap().clone();
    assert!(
        seen.iter().any(|s| s == "sess-42"),
        "no request carried the session id, saw {seen:?}"
    );

    adapter.disconnect().await;
}

#[derive(Default)]
struct SessionDesk {
    issued: u32,
    valid: Option<String>,
}

/// Streamable stub honoring one session at a time: initialize mints a
/// fresh id, any other request carrying a different one gets a 404, the
/// way a restarted server treats sessions it never issued.
fn spawn_session_desk_stub(listener: TcpListener, desk: Arc<Mutex<SessionDesk>>) {
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            let desk = desk.clone();
            tokio::spawn(async move {
                let (head, body) = read_http_request(&mut sock).await;
                let carried = header_value(&head, "mcp-session-id");
                let Ok(request) = serde_json::from_str::<Value>(&body) else {
                    write_accepted(&mut sock).await;
                    return;
                };
                if request["method"].as_str() == Some("initialize") {
                    let sid = {
                        let mut desk = desk.lock().unwrap();
                        desk.issued += 1;
                        let sid = format!("sess-{}", desk.issued);
                        desk.valid = Some(sid.clone());
                        sid
                    };
                    let frame = json!({
                        "jsonrpc": "2.0",
                        "id": request["id"],
                        "result": initialize_result(),
                    });
                    write_json(&mut sock, &frame, Some(&sid)).await;
                    return;
                }
                if desk.lock().unwrap().valid != carried {
                    write_not_found(&mut sock).await;
                    return;
                }
                let Some(id) = request.get("id").cloned() else {
                    write_accepted(&mut sock).await;
                    return;
                };
                let result = match request["method"].as_str() {
                    Some("tools/list") => json!({
                        "tools": [{
                            "name": "http_tool",
                            "description": "served over streamable http",
                            "inputSchema": {"type": "object"},
                        }]
                    }),
                    _ => json!({}),
                };
                let frame = json!({"jsonrpc": "2.0", "id": id, "result": result});
                write_json(&mut sock, &frame, None).await;
            });
        }
    });
}

#[tokio::test]
async fn test_streamable_renegotiates_dropped_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let desk = Arc::new(Mutex::new(SessionDesk::default()));
    spawn_session_desk_stub(listener, desk.clone());

    let config = http_server("stub", &format!("http://127.0.0.1:{port}/mcp"));
    let adapter = build_adapter(&config).unwrap();
    adapter.connect().await.unwrap();
    assert_eq!(adapter.get_tools().await.unwrap().len(), 1);

    // the server drops the session; the next call must renegotiate one
    // behind the caller's back rather than fail or unseat the adapter
    desk.lock().unwrap().valid = None;
    let tools = adapter.get_tools().await.unwrap();
    assert_eq!(tools[0].name, "http_tool");
    assert!(adapter.is_connected(), "recovery dropped the adapter");

    assert_eq!(desk.lock().unwrap().issued, 2);
    let detail = adapter.status().await.detail.unwrap_or_default();
    assert!(detail.contains("sess-2"), "stale id survived: {detail}");

    adapter.disconnect().await;
}

/// Streamable stub that swallows one POST: the request is read fully and
/// the socket dropped without a response, then service resumes.
fn spawn_drop_once_stub(listener: TcpListener, drop_next: Arc<AtomicBool>) {
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            let (_head, body) = read_http_request(&mut sock).await;
            if drop_next.swap(false, Ordering::SeqCst) {
                continue; // hang up without answering
            }
            let Ok(request) = serde_json::from_str::<Value>(&body) else {
                write_accepted(&mut sock).await;
                continue;
            };
            let Some(id) = request.get("id").cloned() else {
                write_accepted(&mut sock).await;
                continue;
            };
            let result = match request["method"].as_str() {
                Some("initialize") => initialize_result(),
                Some("tools/list") => json!({
                    "tools": [{
                        "name": "http_tool",
                        "description": "served over streamable http",
                        "inputSchema": {"type": "object"},
                    }]
                }),
                _ => json!({}),
            };
            let frame = json!({"jsonrpc": "2.0", "id": id, "result": result});
            write_json(&mut sock, &frame, None).await;
        }
    });
}

#[tokio::test]
async fn test_streamable_retries_dropped_post() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let drop_next = Arc::new(AtomicBool::new(false));
    spawn_drop_once_stub(listener, drop_next.clone());

    let raw: RawServerConfig = serde_json::from_value(json!({
        "url": format!("http://127.0.0.1:{port}/mcp"),
        "timeout": 5,
        "retries": 1,
    }))
    .unwrap();
    let config = raw.into_typed("stub").unwrap();
    let adapter = build_adapter(&config).unwrap();
    adapter.connect().await.unwrap();

    // the server hangs up mid-exchange once; the retry budget absorbs it
    // and the caller only ever sees the served answer
    drop_next.store(true, Ordering::SeqCst);
    let tools = adapter.get_tools().await.unwrap();
    assert_eq!(tools[0].name, "http_tool");

    adapter.disconnect().await;
}

#[tokio::test]
async fn test_invalid_streamable_url_fails_at_construction() {
    let config = http_server("bad", "not a url at all");
    assert!(build_adapter(&config).is_err());
}
