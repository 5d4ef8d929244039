// MCP over real transports: streamable HTTP against a local responder,
// and a built-in connector served over an in-process pipe.

use paw_tool_runtime::engine::auth::AuthStrategy;
use paw_tool_runtime::engine::connectors::{service_api, Connector};
use paw_tool_runtime::engine::mcp::server::ConnectorServer;
use paw_tool_runtime::engine::mcp::{ConnectionState, McpConnection, McpServerConfig, McpTransport};
use paw_tool_runtime::{ErrorKind, RuntimeConfig, ToolOrigin, ToolRuntime};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

// ── Streamable HTTP responder ─────────────────────────────────────────

struct HttpMcp {
    url: String,
    /// (method, session header) per POST.
    seen: Arc<Mutex<Vec<(String, Option<String>)>>>,
}

async fn start_http_mcp() -> HttpMcp {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/mcp", listener.local_addr().unwrap());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let log = Arc::clone(&log);
            tokio::spawn(async move { answer(stream, &log).await });
        }
    });
    HttpMcp { url, seen }
}

async fn answer(mut stream: TcpStream, log: &Mutex<Vec<(String, Option<String>)>>) -> Option<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let header = |name: &str| {
        head.lines()
            .filter_map(|l| l.split_once(':'))
            .find(|(k, _)| k.trim().eq_ignore_ascii_case(name))
            .map(|(_, v)| v.trim().to_string())
    };
    let length: usize = header("content-length").and_then(|v| v.parse().ok()).unwrap_or(0);
    while buf.len() < header_end + length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let msg: Value = serde_json::from_slice(&buf[header_end..header_end + length]).ok()?;
    let method = msg["method"].as_str().unwrap_or_default().to_string();
    log.lock().push((method.clone(), header("mcp-session-id")));

    let id = msg.get("id").cloned();
    let (content_type, extra, body) = match (method.as_str(), id) {
        (_, None) => ("application/json", "", String::new()),
        ("initialize", Some(id)) => (
            "application/json",
            "Mcp-Session-Id: sess-42\r\n",
            json!({"jsonrpc": "2.0", "id": id, "result": {
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "echo-http", "version": "0.3.1"}
            }})
            .to_string(),
        ),
        ("tools/list", Some(id)) => (
            "application/json",
            "",
            json!({"jsonrpc": "2.0", "id": id, "result": {"tools": [{
                "name": "echo",
                "description": "Echo text back",
                "inputSchema": {"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]}
            }]}})
            .to_string(),
        ),
        ("tools/call", Some(id)) => {
            let text = msg["params"]["arguments"]["text"].as_str().unwrap_or_default().to_string();
            let result = json!({"jsonrpc": "2.0", "id": id, "result": {
                "content": [{"type": "text", "text": format!("echo: {}", text)}]
            }});
            ("text/event-stream", "", format!("event: message\ndata: {}\n\n", result))
        }
        (_, Some(id)) => (
            "application/json",
            "",
            json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32601, "message": "Method not found"}}).to_string(),
        ),
    };
    let status = if body.is_empty() { "202 Accepted" } else { "200 OK" };
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        extra,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await.ok()?;
    stream.shutdown().await.ok()
}

fn http_server(name: &str, url: &str) -> McpServerConfig {
    McpServerConfig {
        name: name.into(),
        transport: McpTransport::Http,
        command: String::new(),
        args: vec![],
        env: HashMap::new(),
        url: url.into(),
        enabled: true,
    }
}

#[tokio::test]
async fn test_http_server_tools_route_through_registry() {
    let mcp = start_http_mcp().await;
    let rt = ToolRuntime::new(RuntimeConfig::default()).unwrap();
    assert_eq!(rt.connect_server(&http_server("remote", &mcp.url)).await.unwrap(), 1);

    let status = rt.server_status();
    assert_eq!(status[0].state, ConnectionState::Ready);
    assert_eq!(status[0].server_info.as_ref().unwrap().name, "echo-http");

    let descriptor = rt.registry().get("remote_echo").unwrap();
    assert_eq!(descriptor.origin, ToolOrigin::Remote("remote".into()));
    assert!(descriptor.parameter_schema[0].required);

    let r = rt.dispatch("remote_echo", &json!({"text": "hi"}), None).await;
    assert!(r.success, "{:?}", r.message);
    assert_eq!(r.value, Some(json!("echo: hi")));

    let r = rt.dispatch("remote_echo", &json!({}), None).await;
    assert_eq!(r.error_kind, Some(ErrorKind::ValidationError));

    // Handshake first, and the session id echoed on everything after it.
    let seen = mcp.seen.lock().clone();
    let methods: Vec<&str> = seen.iter().map(|(m, _)| m.as_str()).collect();
    assert_eq!(methods[0], "initialize");
    assert!(methods.contains(&"notifications/initialized"));
    assert!(methods.contains(&"tools/list"));
    assert_eq!(seen[0].1, None);
    assert!(seen[1..].iter().all(|(_, sid)| sid.as_deref() == Some("sess-42")));

    rt.shutdown().await;
    assert!(!rt.registry().contains("remote_echo"));
}

#[tokio::test]
async fn test_http_server_unreachable() {
    let rt = ToolRuntime::new(RuntimeConfig::default()).unwrap();
    let err = rt
        .connect_server(&http_server("gone", "http://127.0.0.1:9/mcp"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransportError);
    assert!(rt.server_status().is_empty());
}

// ── In-process connector ──────────────────────────────────────────────

#[tokio::test]
async fn test_connector_over_pipe() {
    let connector = Connector::new(service_api("gmail").unwrap(), AuthStrategy::personal_token("ya29.test"))
        .unwrap()
        .with_base_url("http://127.0.0.1:9");
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (sr, sw) = tokio::io::split(server_io);
    let served = tokio::spawn(ConnectorServer::new(Arc::new(connector)).serve(sr, sw));

    let (cr, cw) = tokio::io::split(client_io);
    let conn = McpConnection::connect_stream("gmail", cr, cw, Duration::from_secs(5)).await.unwrap();
    assert!(conn.is_ready());
    assert_eq!(conn.descriptors().len(), 10);
    assert!(conn.descriptors().iter().all(|d| d.name.starts_with("gmail_")));

    // No resources or prompts advertised: empty, not an error.
    assert!(conn.list_resources().await.unwrap().is_empty());
    assert!(conn.list_prompts().await.unwrap().is_empty());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let err = conn.call_tool("no_such_tool", &json!({}), deadline).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownTool);

    conn.close().await;
    assert_eq!(conn.state(), ConnectionState::Closed);
    let finished = tokio::time::timeout(Duration::from_secs(2), served).await;
    assert!(finished.is_ok());
}
