// Paw Agent Engine — MCP Server for built-in connectors
//
// Serves one `Connector` over MCP so the registry reaches it the same way
// it reaches any external server. Runs over any reader/writer pair; the
// registry hands it one end of an in-process duplex pipe.
//
// tools/call requests run concurrently and can be aborted with
// `notifications/cancelled`. Tool failures come back as `isError` results
// with the error kind in `_meta` so the caller can report it faithfully.

use super::transport::{read_message, write_frame};
use super::types::*;
use crate::atoms::constants::{
    JSONRPC_INVALID_PARAMS, JSONRPC_METHOD_NOT_FOUND, JSONRPC_PARSE_ERROR,
    JSONRPC_SERVER_NOT_INITIALIZED, MCP_ERROR_KIND_META, MCP_PROTOCOL_VERSION, MCP_WRITE_QUEUE,
};
use crate::atoms::error::EngineResult;
use crate::engine::connectors::Connector;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

pub struct ConnectorServer {
    connector: Arc<Connector>,
}

impl ConnectorServer {
    pub fn new(connector: Arc<Connector>) -> Self {
        ConnectorServer { connector }
    }

    /// Serve until the peer closes its end.
    pub async fn serve<R, W>(self, reader: R, writer: W) -> EngineResult<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let service = self.connector.service_name();
        info!("[mcp:{}] Serving {} tools", service, self.connector.tool_count());

        let (out_tx, mut out_rx) = mpsc::channel::<JsonRpcResponse>(MCP_WRITE_QUEUE);
        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &msg).await {
                    warn!("[mcp:{}] write failed: {}", service, e);
                    break;
                }
            }
        });

        let in_flight: Arc<Mutex<HashMap<String, AbortHandle>>> = Arc::new(Mutex::new(HashMap::new()));
        let mut initialized = false;
        let mut reader = BufReader::new(reader);

        loop {
            let frame = match read_message(&mut reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    warn!("[mcp:{}] read failed: {}", service, e);
                    break;
                }
            };
            let messages = match JsonRpcMessage::parse_frame(&frame) {
                Ok(m) => m,
                Err(e) => {
                    let _ = out_tx
                        .send(JsonRpcResponse::failure(Value::Null, JSONRPC_PARSE_ERROR, e))
                        .await;
                    continue;
                }
            };

            for message in messages {
                match message {
                    JsonRpcMessage::Request { id, method, params } => {
                        if !initialized && method != "initialize" && method != "ping" {
                            let _ = out_tx
                                .send(JsonRpcResponse::failure(
                                    id,
                                    JSONRPC_SERVER_NOT_INITIALIZED,
                                    "Server not initialized",
                                ))
                                .await;
                            continue;
                        }
                        match method.as_str() {
                            "initialize" => {
                                initialized = true;
                                let _ = out_tx.send(JsonRpcResponse::success(id, self.initialize_result())).await;
                            }
                            "ping" => {
                                let _ = out_tx.send(JsonRpcResponse::success(id, json!({}))).await;
                            }
                            "tools/list" => {
                                let result = json!({ "tools": self.connector.tool_defs() });
                                let _ = out_tx.send(JsonRpcResponse::success(id, result)).await;
                            }
                            "tools/call" => {
                                self.spawn_call(id, params, out_tx.clone(), Arc::clone(&in_flight)).await;
                            }
                            other => {
                                debug!("[mcp:{}] unknown method {}", service, other);
                                let _ = out_tx
                                    .send(JsonRpcResponse::failure(
                                        id,
                                        JSONRPC_METHOD_NOT_FOUND,
                                        format!("Method not found: {}", other),
                                    ))
                                    .await;
                            }
                        }
                    }
                    JsonRpcMessage::Notification { method, params } => match method.as_str() {
                        "notifications/initialized" => initialized = true,
                        "notifications/cancelled" => {
                            let key = params
                                .as_ref()
                                .map(|p| p["requestId"].to_string())
                                .unwrap_or_default();
                            if let Some(handle) = in_flight.lock().remove(&key) {
                                info!("[mcp:{}] Cancelled request {}", service, key);
                                handle.abort();
                            }
                        }
                        _ => {}
                    },
                    JsonRpcMessage::Response(_) => {}
                }
            }
        }

        for (_, handle) in in_flight.lock().drain() {
            handle.abort();
        }
        drop(out_tx);
        let _ = writer_task.await;
        info!("[mcp:{}] Client disconnected", service);
        Ok(())
    }

    fn initialize_result(&self) -> Value {
        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": { "tools": { "listChanged": false } },
            "serverInfo": {
                "name": format!("paw-{}", self.connector.service_name()),
                "version": env!("CARGO_PKG_VERSION"),
            },
        })
    }

    async fn spawn_call(
        &self,
        id: Value,
        params: Option<Value>,
        out_tx: mpsc::Sender<JsonRpcResponse>,
        in_flight: Arc<Mutex<HashMap<String, AbortHandle>>>,
    ) {
        let call: ToolCallParams = match params.map(serde_json::from_value).transpose() {
            Ok(Some(call)) => call,
            Ok(None) => {
                let _ = out_tx
                    .send(JsonRpcResponse::failure(id, JSONRPC_INVALID_PARAMS, "missing params"))
                    .await;
                return;
            }
            Err(e) => {
                let _ = out_tx
                    .send(JsonRpcResponse::failure(id, JSONRPC_INVALID_PARAMS, e.to_string()))
                    .await;
                return;
            }
        };

        let key = id.to_string();
        let connector = Arc::clone(&self.connector);
        let registry = Arc::clone(&in_flight);
        // Held across spawn so the task cannot remove its entry before it exists.
        let mut guard = in_flight.lock();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let outcome = connector.call_tool(&call.name, &call.arguments).await;
            registry.lock().remove(&task_key);
            let _ = out_tx.send(JsonRpcResponse::success(id, call_result(outcome))).await;
        });
        guard.insert(key, handle.abort_handle());
    }
}

/// Encode a connector outcome as a `tools/call` result.
fn call_result(outcome: EngineResult<Value>) -> Value {
    let result = match outcome {
        Ok(value) => ToolCallResult {
            content: vec![McpContent::Text { text: value.to_string() }],
            structured_content: value.is_object().then(|| value.clone()),
            is_error: false,
            meta: None,
        },
        Err(e) => ToolCallResult {
            content: vec![McpContent::Text { text: e.detail() }],
            structured_content: None,
            is_error: true,
            meta: Some(json!({ MCP_ERROR_KIND_META: e.kind().as_str() })),
        },
    };
    serde_json::to_value(result).unwrap_or_else(|e| json!({
        "content": [{ "type": "text", "text": e.to_string() }],
        "isError": true,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::ErrorKind;
    use crate::engine::auth::AuthStrategy;
    use crate::engine::connectors::shodan::Shodan;
    use crate::engine::mcp::client::McpConnection;
    use crate::engine::test_support::MockHttp;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::time::Instant;

    async fn served(responses: Vec<(u16, String)>) -> (Arc<McpConnection>, MockHttp) {
        let mock = MockHttp::start(responses).await;
        let connector = Connector::new(Box::new(Shodan), AuthStrategy::api_key("K1"))
            .unwrap()
            .with_base_url(&mock.base_url);
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (sr, sw) = tokio::io::split(server_io);
        tokio::spawn(ConnectorServer::new(Arc::new(connector)).serve(sr, sw));
        let (cr, cw) = tokio::io::split(client_io);
        let conn = McpConnection::connect_stream("shodan", cr, cw, Duration::from_secs(5))
            .await
            .unwrap();
        (conn, mock)
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn test_tools_are_listed_with_prefix() {
        let (conn, _mock) = served(vec![(200, "{}".into())]).await;
        let names: Vec<String> = conn.descriptors().into_iter().map(|d| d.name).collect();
        assert_eq!(names.len(), 14);
        assert!(names.contains(&"shodan_tools_myip".to_string()));
        assert_eq!(conn.server_info().unwrap().name, "paw-shodan");
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let (conn, mock) = served(vec![(200, "\"198.51.100.4\"".into())]).await;
        let v = conn.call_tool("tools_myip", &json!({}), deadline()).await.unwrap();
        assert_eq!(v, json!({"ip": "198.51.100.4"}));
        assert_eq!(mock.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_error_kinds_cross_the_wire() {
        let (conn, mock) = served(vec![(401, r#"{"error":"Invalid API key"}"#.into())]).await;
        let err = conn.call_tool("api_info", &json!({}), deadline()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
        assert!(err.to_string().contains("shodan_api_info"));

        // Rejected before any upstream request.
        let err = conn.call_tool("host_info", &json!({}), deadline()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        assert_eq!(mock.requests().len(), 1);

        let err = conn.call_tool("nope", &json!({}), deadline()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownTool);
    }

    #[tokio::test]
    async fn test_raw_protocol_rules() {
        let mock = MockHttp::start(vec![(200, "{}".into())]).await;
        let connector = Connector::new(Box::new(Shodan), AuthStrategy::api_key("K1"))
            .unwrap()
            .with_base_url(&mock.base_url);
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (sr, sw) = tokio::io::split(server_io);
        let server = tokio::spawn(ConnectorServer::new(Arc::new(connector)).serve(sr, sw));

        let (cr, mut cw) = tokio::io::split(client_io);
        let mut cr = BufReader::new(cr);

        cw.write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"tools/list\"}\n").await.unwrap();
        let v = next_message(&mut cr).await;
        assert_eq!(v["error"]["code"], JSONRPC_SERVER_NOT_INITIALIZED);

        cw.write_all(b"{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"initialize\",\"params\":{}}\n").await.unwrap();
        let v = next_message(&mut cr).await;
        assert_eq!(v["result"]["protocolVersion"], MCP_PROTOCOL_VERSION);

        cw.write_all(b"{\"jsonrpc\":\"2.0\",\"id\":3,\"method\":\"resources/list\"}\n").await.unwrap();
        let v = next_message(&mut cr).await;
        assert_eq!(v["id"], 3);
        assert_eq!(v["error"]["code"], JSONRPC_METHOD_NOT_FOUND);

        cw.write_all(b"{\"jsonrpc\":\"2.0\",\"id\":4,\"method\":\"tools/call\"}\n").await.unwrap();
        let v = next_message(&mut cr).await;
        assert_eq!(v["error"]["code"], JSONRPC_INVALID_PARAMS);

        cw.write_all(b"server banner\n{\"jsonrpc\":\"2.0\",\"id\":5,\"method\":\"ping\"}\n").await.unwrap();
        let v = next_message(&mut cr).await;
        assert_eq!(v["id"], 5);
        assert_eq!(v["result"], json!({}));

        drop(cw);
        drop(cr);
        server.await.unwrap().unwrap();
    }

    async fn next_message<R: tokio::io::AsyncBufRead + Unpin>(reader: &mut R) -> Value {
        let frame = read_message(reader).await.unwrap().unwrap();
        serde_json::from_slice(&frame).unwrap()
    }

    #[test]
    fn test_call_result_encoding() {
        let ok = call_result(Ok(json!([1, 2])));
        assert_eq!(ok["content"][0]["text"], "[1,2]");
        assert!(ok.get("structuredContent").is_none());

        let err = call_result(Err(crate::atoms::error::EngineError::timeout("x", 5)));
        assert_eq!(err["isError"], true);
        assert_eq!(err["_meta"][MCP_ERROR_KIND_META], "Timeout");
    }
}
