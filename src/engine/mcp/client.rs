// Paw Agent Engine — MCP Connection
//
// One live session with one MCP server. Many callers may have requests in
// flight at once; a single demux task reads the transport and routes each
// response to its caller by request id, in whatever order they arrive.
//
// Lifecycle: Connecting → Initializing → Ready → Closed.
// Only `initialize` may be sent before Ready. When the transport drops,
// every pending request fails with ConnectionLost and the state is Closed
// for good; reconnecting creates a new connection.

use super::remote_tool_name;
use super::transport::{
    HttpTransport, InboundEvent, InboundReceiver, StreamTransport, Transport,
};
use super::types::*;
use crate::atoms::constants::{
    JSONRPC_INVALID_PARAMS, JSONRPC_METHOD_NOT_FOUND, MCP_ERROR_KIND_META, MCP_MAX_LIST_PAGES,
    MCP_PROTOCOL_VERSION,
};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{ErrorKind, ToolDescriptor};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// How a pending request ended.
#[derive(Debug)]
enum Outcome {
    Result(Value),
    RpcError(JsonRpcError),
    Failed(EngineError),
}

struct PendingRequest {
    method: String,
    sent_at: Instant,
    sink: oneshot::Sender<Outcome>,
}

/// Removes a request's pending entry however its caller exits,
/// including when the caller's future is dropped.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<u64, PendingRequest>>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

type NotificationHandler = Arc<dyn Fn(&str, &Value) + Send + Sync>;

pub struct McpConnection {
    name: String,
    transport: Arc<dyn Transport>,
    state: RwLock<ConnectionState>,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    next_id: AtomicU64,
    request_timeout: Duration,
    capabilities: RwLock<McpServerCapabilities>,
    server_info: RwLock<Option<McpServerInfo>>,
    tools: RwLock<Vec<McpToolDef>>,
    tools_stale: AtomicBool,
    handlers: RwLock<Vec<NotificationHandler>>,
    demux: Mutex<Option<JoinHandle<()>>>,
}

impl McpConnection {
    /// Wrap an already-running transport. The connection starts in
    /// `Connecting`; call `initialize` (or use one of the `connect*`
    /// helpers) before sending requests.
    pub fn attach(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        inbound: InboundReceiver,
        request_timeout: Duration,
    ) -> Arc<Self> {
        let conn = Arc::new(McpConnection {
            name: name.into(),
            transport,
            state: RwLock::new(ConnectionState::Connecting),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            request_timeout,
            capabilities: RwLock::new(McpServerCapabilities::default()),
            server_info: RwLock::new(None),
            tools: RwLock::new(Vec::new()),
            tools_stale: AtomicBool::new(false),
            handlers: RwLock::new(Vec::new()),
            demux: Mutex::new(None),
        });
        let task = tokio::spawn(demux_loop(Arc::downgrade(&conn), inbound));
        *conn.demux.lock() = Some(task);
        conn
    }

    /// Spawn or dial the server described by `config`, complete the
    /// handshake and fetch the tool list.
    pub async fn connect(config: &McpServerConfig, request_timeout: Duration) -> EngineResult<Arc<Self>> {
        info!("[mcp] Connecting to server '{}' via {:?}", config.name, config.transport);
        let (tx, rx) = mpsc::unbounded_channel();
        let transport: Arc<dyn Transport> = match config.transport {
            McpTransport::Stdio => {
                if config.command.trim().is_empty() {
                    return Err(EngineError::Config(format!(
                        "MCP server '{}' has no command",
                        config.name
                    )));
                }
                Arc::new(StreamTransport::spawn_stdio(&config.command, &config.args, &config.env, tx)?)
            }
            McpTransport::Http => Arc::new(HttpTransport::new(&config.url, &config.env, tx)?),
            McpTransport::InProcess => {
                return Err(EngineError::Config(format!(
                    "MCP server '{}' is in-process and is attached by the registry",
                    config.name
                )))
            }
        };
        let conn = Self::attach(&config.name, transport, rx, request_timeout);
        conn.open().await?;
        Ok(conn)
    }

    /// Connect over an arbitrary reader/writer pair (in-process pipes).
    pub async fn connect_stream<R, W>(
        name: &str,
        reader: R,
        writer: W,
        request_timeout: Duration,
    ) -> EngineResult<Arc<Self>>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(StreamTransport::from_stream(reader, writer, tx, "in-process"));
        let conn = Self::attach(name, transport, rx, request_timeout);
        conn.open().await?;
        Ok(conn)
    }

    async fn open(&self) -> EngineResult<()> {
        self.initialize().await?;
        if let Err(e) = self.refresh_tools().await {
            self.close().await;
            return Err(e);
        }
        Ok(())
    }

    // ── Accessors ──────────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn server_info(&self) -> Option<McpServerInfo> {
        self.server_info.read().clone()
    }

    pub fn capabilities(&self) -> McpServerCapabilities {
        self.capabilities.read().clone()
    }

    pub fn status(&self) -> McpServerStatus {
        McpServerStatus {
            name: self.name.clone(),
            state: self.state(),
            tool_count: self.tools.read().len(),
            pending_requests: self.pending.lock().len(),
            server_info: self.server_info(),
        }
    }

    /// Register a callback for server notifications (after built-in
    /// handling such as cache invalidation).
    pub fn on_notification(&self, handler: impl Fn(&str, &Value) + Send + Sync + 'static) {
        self.handlers.write().push(Arc::new(handler));
    }

    /// `Closed` is terminal; later transitions are ignored.
    fn set_state(&self, next: ConnectionState) -> bool {
        let mut state = self.state.write();
        if *state == ConnectionState::Closed {
            return false;
        }
        debug!("[mcp] '{}' {} → {}", self.name, *state, next);
        *state = next;
        true
    }

    // ── Handshake ──────────────────────────────────────────────────────

    pub async fn initialize(&self) -> EngineResult<()> {
        if !self.set_state(ConnectionState::Initializing) {
            return Err(EngineError::not_ready(&self.name, ConnectionState::Closed));
        }
        match self.handshake().await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("[mcp] '{}' initialize failed: {}", self.name, e);
                self.close().await;
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> EngineResult<()> {
        let params = InitializeParams {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: McpClientCapabilities::default(),
            client_info: McpClientInfo {
                name: "paw-tools".into(),
                version: env!("CARGO_PKG_VERSION").into(),
            },
        };
        let deadline = Instant::now() + self.request_timeout;
        let result = self
            .request("initialize", Some(serde_json::to_value(&params)?), deadline)
            .await?;
        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| EngineError::Transport(format!("malformed initialize result: {}", e)))?;

        if init.protocol_version != MCP_PROTOCOL_VERSION {
            info!(
                "[mcp] '{}' negotiated protocol {} (we sent {})",
                self.name, init.protocol_version, MCP_PROTOCOL_VERSION
            );
        }
        if let Some(ref si) = init.server_info {
            info!(
                "[mcp] '{}' is {} v{}",
                self.name,
                si.name,
                si.version.as_deref().unwrap_or("?")
            );
        }
        *self.capabilities.write() = init.capabilities;
        *self.server_info.write() = init.server_info;

        self.notify("notifications/initialized", None).await?;
        self.set_state(ConnectionState::Ready);
        info!("[mcp] '{}' ready", self.name);
        Ok(())
    }

    // ── Requests ───────────────────────────────────────────────────────

    /// Send a request and wait for its response, an error, or `deadline`.
    /// JSON-RPC errors come back as the inner `Err` so callers can tell
    /// them apart from transport failures.
    async fn request_raw(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Instant,
    ) -> EngineResult<Result<Value, JsonRpcError>> {
        let state = self.state();
        let allowed = state == ConnectionState::Ready
            || (method == "initialize" && state == ConnectionState::Initializing);
        if !allowed {
            return Err(EngineError::not_ready(&self.name, state));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let bytes = serde_json::to_vec(&JsonRpcRequest::new(id, method, params))?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            id,
            PendingRequest { method: method.to_string(), sent_at: Instant::now(), sink: tx },
        );
        // The transport may have closed between the state check and insert.
        if self.state() == ConnectionState::Closed {
            self.pending.lock().remove(&id);
            return Err(EngineError::ConnectionLost(format!("{}: connection closed", self.name)));
        }

        let _guard = PendingGuard { pending: &self.pending, id };

        debug!("[mcp] '{}' → {} (id={})", self.name, method, id);
        let started = Instant::now();
        let exchange = async {
            self.transport.send(bytes).await?;
            rx.await
                .map_err(|_| EngineError::ConnectionLost(format!("{}: response channel dropped", self.name)))
        };

        match tokio::time::timeout_at(deadline, exchange).await {
            Ok(Ok(Outcome::Result(v))) => Ok(Ok(v)),
            Ok(Ok(Outcome::RpcError(e))) => Ok(Err(e)),
            Ok(Ok(Outcome::Failed(e))) => Err(e),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                let elapsed = started.elapsed().as_millis() as u64;
                warn!("[mcp] '{}' {} (id={}) timed out after {}ms", self.name, method, id, elapsed);
                self.pending.lock().remove(&id);
                self.cancel_in_background(id, "timeout");
                Err(EngineError::timeout(format!("{}: {}", self.name, method), elapsed))
            }
        }
    }

    /// Like `request_raw`, with JSON-RPC errors folded into `EngineError`.
    async fn request(&self, method: &str, params: Option<Value>, deadline: Instant) -> EngineResult<Value> {
        self.request_raw(method, params, deadline)
            .await?
            .map_err(|e| self.rpc_error(method, e))
    }

    fn rpc_error(&self, method: &str, e: JsonRpcError) -> EngineError {
        let subject = format!("{}:{}", self.name, method);
        if e.code == JSONRPC_INVALID_PARAMS {
            EngineError::validation(subject, e.message)
        } else {
            EngineError::execution(subject, format!("{} (code {})", e.message, e.code))
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> EngineResult<()> {
        if self.state() == ConnectionState::Closed {
            return Err(EngineError::ConnectionLost(format!("{}: connection closed", self.name)));
        }
        let bytes = serde_json::to_vec(&JsonRpcNotification::new(method, params))?;
        self.transport.send(bytes).await
    }

    /// Best-effort `notifications/cancelled` for an abandoned request.
    fn cancel_in_background(&self, id: u64, reason: &str) {
        if self.state() != ConnectionState::Ready {
            return;
        }
        let note = JsonRpcNotification::new(
            "notifications/cancelled",
            Some(json!({ "requestId": id, "reason": reason })),
        );
        let Ok(bytes) = serde_json::to_vec(&note) else { return };
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            let _ = transport.send(bytes).await;
        });
    }

    /// Follow `nextCursor` until the listing is complete.
    async fn list_all<T: DeserializeOwned>(&self, method: &str, field: &str) -> EngineResult<Vec<T>> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MCP_MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let deadline = Instant::now() + self.request_timeout;
            let page = match self.request_raw(method, params, deadline).await? {
                Ok(v) => v,
                Err(e) if e.code == JSONRPC_METHOD_NOT_FOUND => return Ok(items),
                Err(e) => return Err(self.rpc_error(method, e)),
            };
            for raw in page[field].as_array().cloned().unwrap_or_default() {
                match serde_json::from_value::<T>(raw) {
                    Ok(item) => items.push(item),
                    Err(e) => warn!("[mcp] '{}' skipping malformed {} entry: {}", self.name, field, e),
                }
            }
            match page["nextCursor"].as_str() {
                Some(next) if !next.is_empty() && cursor.as_deref() != Some(next) => {
                    cursor = Some(next.to_string())
                }
                _ => return Ok(items),
            }
        }
        warn!("[mcp] '{}' {} stopped after {} pages", self.name, method, MCP_MAX_LIST_PAGES);
        Ok(items)
    }

    // ── Tools ──────────────────────────────────────────────────────────

    /// Re-fetch `tools/list` and replace the cache.
    pub async fn refresh_tools(&self) -> EngineResult<Vec<McpToolDef>> {
        let tools: Vec<McpToolDef> = if self.capabilities.read().supports_tools() {
            self.list_all("tools/list", "tools").await?
        } else {
            Vec::new()
        };
        info!("[mcp] '{}' has {} tools", self.name, tools.len());
        *self.tools.write() = tools.clone();
        self.tools_stale.store(false, Ordering::SeqCst);
        Ok(tools)
    }

    /// Cached tool list, refreshed first if the server said it changed.
    pub async fn list_tools(&self) -> EngineResult<Vec<McpToolDef>> {
        if self.tools_stale.load(Ordering::SeqCst) {
            return self.refresh_tools().await;
        }
        Ok(self.tools.read().clone())
    }

    pub fn tools_stale(&self) -> bool {
        self.tools_stale.load(Ordering::SeqCst)
    }

    /// Cached tools as registry descriptors named `<server>_<tool>`.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .read()
            .iter()
            .map(|t| {
                ToolDescriptor::remote(
                    remote_tool_name(&self.name, &t.name),
                    t.description.clone().unwrap_or_default(),
                    &self.name,
                    &t.input_schema,
                )
            })
            .collect()
    }

    /// Call a tool by its server-side (unprefixed) name.
    pub async fn call_tool(&self, tool: &str, arguments: &Value, deadline: Instant) -> EngineResult<Value> {
        let qualified = remote_tool_name(&self.name, tool);
        let arguments = if arguments.is_null() { json!({}) } else { arguments.clone() };
        let params = serde_json::to_value(ToolCallParams { name: tool.to_string(), arguments })?;

        let raw = match self.request_raw("tools/call", Some(params), deadline).await? {
            Ok(v) => v,
            Err(e) if e.code == JSONRPC_INVALID_PARAMS => {
                return Err(EngineError::validation(qualified, e.message))
            }
            Err(e) => {
                return Err(EngineError::execution(qualified, format!("{} (code {})", e.message, e.code)))
            }
        };
        let result: ToolCallResult = serde_json::from_value(raw)
            .map_err(|e| EngineError::Transport(format!("malformed tools/call result: {}", e)))?;

        if result.is_error {
            let kind = result
                .meta
                .as_ref()
                .and_then(|m| m[MCP_ERROR_KIND_META].as_str())
                .and_then(ErrorKind::parse)
                .unwrap_or(ErrorKind::ExecutionError);
            let text = extract_text_content(&result.content);
            let message = if text.is_empty() { "tool reported an error".to_string() } else { text };
            return Err(EngineError::from_kind(kind, &qualified, message));
        }

        if let Some(structured) = result.structured_content {
            return Ok(structured);
        }
        let text = extract_text_content(&result.content);
        if text.is_empty() && !result.content.is_empty() {
            return Ok(serde_json::to_value(&result.content)?);
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }

    // ── Resources & prompts ────────────────────────────────────────────

    pub async fn list_resources(&self) -> EngineResult<Vec<McpResource>> {
        if !self.capabilities.read().supports_resources() {
            return Ok(Vec::new());
        }
        self.list_all("resources/list", "resources").await
    }

    pub async fn read_resource(&self, uri: &str) -> EngineResult<ResourceReadResult> {
        let deadline = Instant::now() + self.request_timeout;
        let v = self.request("resources/read", Some(json!({ "uri": uri })), deadline).await?;
        serde_json::from_value(v)
            .map_err(|e| EngineError::Transport(format!("malformed resources/read result: {}", e)))
    }

    pub async fn list_prompts(&self) -> EngineResult<Vec<McpPrompt>> {
        if !self.capabilities.read().supports_prompts() {
            return Ok(Vec::new());
        }
        self.list_all("prompts/list", "prompts").await
    }

    pub async fn get_prompt(&self, name: &str, arguments: &HashMap<String, String>) -> EngineResult<PromptGetResult> {
        let deadline = Instant::now() + self.request_timeout;
        let v = self
            .request("prompts/get", Some(json!({ "name": name, "arguments": arguments })), deadline)
            .await?;
        serde_json::from_value(v)
            .map_err(|e| EngineError::Transport(format!("malformed prompts/get result: {}", e)))
    }

    // ── Shutdown ───────────────────────────────────────────────────────

    pub async fn close(&self) {
        if self.state() != ConnectionState::Closed {
            info!("[mcp] Closing '{}'", self.name);
        }
        self.on_closed("closed by client");
        self.transport.close().await;
        if let Some(task) = self.demux.lock().take() {
            task.abort();
        }
    }

    // ── Inbound handling ───────────────────────────────────────────────

    /// Mark the connection closed and fail everything still waiting.
    fn on_closed(&self, reason: &str) {
        *self.state.write() = ConnectionState::Closed;
        let drained: Vec<(u64, PendingRequest)> = self.pending.lock().drain().collect();
        if !drained.is_empty() {
            warn!("[mcp] '{}' lost with {} request(s) in flight: {}", self.name, drained.len(), reason);
        }
        for (_, p) in drained {
            let _ = p.sink.send(Outcome::Failed(EngineError::ConnectionLost(format!(
                "{}: {} ({})",
                self.name, reason, p.method
            ))));
        }
    }

    fn fail_one(&self, id: u64, reason: String) {
        if let Some(p) = self.pending.lock().remove(&id) {
            let _ = p.sink.send(Outcome::Failed(EngineError::Transport(format!(
                "{}: {} ({})",
                self.name, reason, p.method
            ))));
        }
    }

    async fn handle_frame(&self, bytes: &[u8]) {
        let messages = match JsonRpcMessage::parse_frame(bytes) {
            Ok(m) => m,
            Err(e) => {
                warn!("[mcp] '{}' dropping malformed message: {}", self.name, e);
                return;
            }
        };
        for message in messages {
            match message {
                JsonRpcMessage::Response(resp) => self.resolve(resp),
                JsonRpcMessage::Request { id, method, .. } => self.answer_server_request(id, &method).await,
                JsonRpcMessage::Notification { method, params } => {
                    self.handle_notification(&method, params.unwrap_or(Value::Null))
                }
            }
        }
    }

    fn resolve(&self, resp: JsonRpcResponse) {
        let entry = resp.id.as_u64().and_then(|id| self.pending.lock().remove(&id));
        let Some(p) = entry else {
            // Late reply to a timed-out request, or a stray id.
            debug!("[mcp] '{}' response for unknown id {}", self.name, resp.id);
            return;
        };
        debug!(
            "[mcp] '{}' ← {} in {}ms",
            self.name,
            p.method,
            p.sent_at.elapsed().as_millis()
        );
        let outcome = match (resp.error, resp.result) {
            (Some(err), _) => Outcome::RpcError(err),
            (None, result) => Outcome::Result(result.unwrap_or(Value::Null)),
        };
        let _ = p.sink.send(outcome);
    }

    async fn answer_server_request(&self, id: Value, method: &str) {
        let reply = if method == "ping" {
            JsonRpcResponse::success(id, json!({}))
        } else {
            debug!("[mcp] '{}' unsupported server request: {}", self.name, method);
            JsonRpcResponse::failure(id, JSONRPC_METHOD_NOT_FOUND, format!("Method not found: {}", method))
        };
        if let Ok(bytes) = serde_json::to_vec(&reply) {
            if let Err(e) = self.transport.send(bytes).await {
                warn!("[mcp] '{}' could not answer {}: {}", self.name, method, e);
            }
        }
    }

    fn handle_notification(&self, method: &str, params: Value) {
        match method {
            "notifications/tools/list_changed" => {
                info!("[mcp] '{}' tool list changed", self.name);
                self.tools_stale.store(true, Ordering::SeqCst);
            }
            "notifications/message" => {
                debug!("[mcp:{}] {}", self.name, params["data"]);
            }
            _ => debug!("[mcp] '{}' notification {}", self.name, method),
        }
        let handlers = self.handlers.read().clone();
        for handler in handlers {
            handler(method, &params);
        }
    }
}

async fn demux_loop(conn: Weak<McpConnection>, mut inbound: InboundReceiver) {
    while let Some(event) = inbound.recv().await {
        let Some(conn) = conn.upgrade() else { return };
        match event {
            InboundEvent::Frame(bytes) => conn.handle_frame(&bytes).await,
            InboundEvent::Undeliverable { id, reason } => conn.fail_one(id, reason),
            InboundEvent::Closed(reason) => {
                conn.on_closed(&reason);
                return;
            }
        }
    }
    if let Some(conn) = conn.upgrade() {
        conn.on_closed("transport ended");
    }
}

/// Join all text content blocks into one string.
fn extract_text_content(content: &[McpContent]) -> String {
    content
        .iter()
        .filter_map(|c| match c {
            McpContent::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mcp::transport::{read_message, write_frame};
    use tokio::io::{BufReader, DuplexStream};

    type Seen = Arc<Mutex<Vec<Value>>>;

    /// Scripted peer. The script sees each inbound message and returns the
    /// messages to write back; `None` hangs up.
    fn spawn_server(
        mut script: impl FnMut(&Value) -> Option<Vec<Value>> + Send + 'static,
    ) -> (DuplexStream, Seen) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        tokio::spawn(async move {
            let (r, mut w) = tokio::io::split(server);
            let mut r = BufReader::new(r);
            while let Ok(Some(frame)) = read_message(&mut r).await {
                let msg: Value = serde_json::from_slice(&frame).unwrap();
                log.lock().push(msg.clone());
                match script(&msg) {
                    Some(out) => {
                        for m in out {
                            write_frame(&mut w, &m).await.unwrap();
                        }
                    }
                    None => break,
                }
            }
        });
        (client, seen)
    }

    fn reply(msg: &Value, result: Value) -> Vec<Value> {
        vec![json!({"jsonrpc": "2.0", "id": msg["id"], "result": result})]
    }

    /// Handshake plus a two-page tool list; other methods go to `rest`.
    fn basic(msg: &Value, rest: &mut dyn FnMut(&Value) -> Option<Vec<Value>>) -> Option<Vec<Value>> {
        match msg["method"].as_str().unwrap_or_default() {
            "initialize" => Some(reply(msg, json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "fake", "version": "0.1"}
            }))),
            "tools/list" if msg["params"]["cursor"].is_null() => Some(reply(msg, json!({
                "tools": [{"name": "echo", "description": "Echo", "inputSchema": {"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]}}],
                "nextCursor": "p2"
            }))),
            "tools/list" => Some(reply(msg, json!({"tools": [{"name": "slow"}]}))),
            m if m.starts_with("notifications/") => Some(vec![]),
            _ => rest(msg),
        }
    }

    async fn connect(client: DuplexStream) -> Arc<McpConnection> {
        let (r, w) = tokio::io::split(client);
        McpConnection::connect_stream("fake", r, w, Duration::from_secs(5)).await.unwrap()
    }

    fn in_secs(s: u64) -> Instant {
        Instant::now() + Duration::from_secs(s)
    }

    #[tokio::test]
    async fn test_handshake_and_paginated_tools() {
        let (client, seen) = spawn_server(|m| basic(m, &mut |_: &Value| Some(vec![])));
        let conn = connect(client).await;
        assert!(conn.is_ready());
        assert_eq!(conn.server_info().unwrap().name, "fake");

        let names: Vec<String> = conn.descriptors().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["fake_echo", "fake_slow"]);

        let methods: Vec<String> = seen
            .lock()
            .iter()
            .map(|m| m["method"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(methods, vec!["initialize", "notifications/initialized", "tools/list", "tools/list"]);
        assert_eq!(seen.lock()[3]["params"]["cursor"], "p2");
    }

    #[tokio::test]
    async fn test_call_tool_results() {
        let (client, _) = spawn_server(|m| {
            basic(m, &mut |m: &Value| {
                let text = m["params"]["arguments"]["text"].as_str().unwrap_or_default().to_string();
                let result = match text.as_str() {
                    "structured" => json!({"content": [{"type": "text", "text": "ignored"}], "structuredContent": {"n": 1}}),
                    "json" => json!({"content": [{"type": "text", "text": "{\"n\": 2}"}]}),
                    "auth" => json!({
                        "content": [{"type": "text", "text": "token expired"}],
                        "isError": true,
                        "_meta": {"paw/errorKind": "AuthenticationFailed"}
                    }),
                    "fail" => json!({"content": [{"type": "text", "text": "boom"}], "isError": true}),
                    other => json!({"content": [{"type": "text", "text": other}]}),
                };
                Some(reply(m, result))
            })
        });
        let conn = connect(client).await;

        let v = conn.call_tool("echo", &json!({"text": "structured"}), in_secs(5)).await.unwrap();
        assert_eq!(v, json!({"n": 1}));
        let v = conn.call_tool("echo", &json!({"text": "json"}), in_secs(5)).await.unwrap();
        assert_eq!(v, json!({"n": 2}));
        let v = conn.call_tool("echo", &json!({"text": "plain words"}), in_secs(5)).await.unwrap();
        assert_eq!(v, json!("plain words"));

        let err = conn.call_tool("echo", &json!({"text": "auth"}), in_secs(5)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
        let err = conn.call_tool("echo", &json!({"text": "fail"}), in_secs(5)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExecutionError);
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_out_of_order_responses() {
        let mut held: Option<Value> = None;
        let (client, _) = spawn_server(move |m| {
            basic(m, &mut |m: &Value| {
                if m["method"] != "tools/call" {
                    return Some(vec![]);
                }
                let tag = m["params"]["arguments"]["text"].clone();
                let this = json!({"jsonrpc": "2.0", "id": m["id"], "result": {"content": [], "structuredContent": {"tag": tag}}});
                // Hold the first call, answer both in reverse order.
                match held.take() {
                    None => {
                        held = Some(this);
                        Some(vec![])
                    }
                    Some(first) => Some(vec![this, first]),
                }
            })
        });
        let conn = connect(client).await;

        let args_a = json!({"text": "a"});
        let a = conn.call_tool("echo", &args_a, in_secs(5));
        let b = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            conn.call_tool("echo", &json!({"text": "b"}), in_secs(5)).await
        };
        let (a, b) = tokio::join!(a, b);
        assert_eq!(a.unwrap()["tag"], "a");
        assert_eq!(b.unwrap()["tag"], "b");
    }

    #[tokio::test]
    async fn test_timeout_cancels_and_clears_pending() {
        let (client, seen) = spawn_server(|m| basic(m, &mut |_: &Value| Some(vec![])));
        let conn = connect(client).await;

        let deadline = Instant::now() + Duration::from_millis(100);
        let err = conn.call_tool("slow", &json!({}), deadline).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(conn.status().pending_requests, 0);

        let mut cancelled = false;
        for _ in 0..50 {
            if seen.lock().iter().any(|m| m["method"] == "notifications/cancelled") {
                cancelled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(cancelled);
        assert!(conn.is_ready());
    }

    #[tokio::test]
    async fn test_connection_lost_fails_pending() {
        let (client, _) = spawn_server(|m| {
            basic(m, &mut |m: &Value| if m["method"] == "tools/call" { None } else { Some(vec![]) })
        });
        let conn = connect(client).await;

        let err = conn.call_tool("echo", &json!({"text": "x"}), in_secs(5)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionLost);
        assert_eq!(conn.state(), ConnectionState::Closed);

        let err = conn.call_tool("echo", &json!({"text": "x"}), in_secs(5)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotReady);
    }

    #[tokio::test]
    async fn test_request_before_ready_is_not_sent() {
        let (client, seen) = spawn_server(|_| Some(vec![]));
        let (r, w) = tokio::io::split(client);
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(StreamTransport::from_stream(r, w, tx, "in-process"));
        let conn = McpConnection::attach("early", transport, rx, Duration::from_secs(1));

        let err = conn.call_tool("echo", &json!({}), in_secs(1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotReady);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_list_changed_and_ping() {
        let mut pushed = false;
        let (client, seen) = spawn_server(move |m| {
            basic(m, &mut |m: &Value| {
                if m["method"] == "tools/call" && !pushed {
                    pushed = true;
                    let mut out = vec![
                        json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"}),
                        json!({"jsonrpc": "2.0", "id": "srv-1", "method": "ping"}),
                    ];
                    out.extend(reply(m, json!({"content": [{"type": "text", "text": "ok"}]})));
                    return Some(out);
                }
                Some(vec![])
            })
        });
        let conn = connect(client).await;
        conn.call_tool("echo", &json!({"text": "x"}), in_secs(5)).await.unwrap();

        // The notification precedes the response on the wire.
        assert!(conn.tools_stale());
        let tools = conn.list_tools().await.unwrap();
        assert_eq!(tools.len(), 2);
        assert!(!conn.tools_stale());

        let mut pong = false;
        for _ in 0..50 {
            if seen.lock().iter().any(|m| m["id"] == "srv-1" && m["result"] == json!({})) {
                pong = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(pong);
    }

    #[tokio::test]
    async fn test_missing_capabilities_skip_wire() {
        let (client, seen) = spawn_server(|m| basic(m, &mut |_: &Value| Some(vec![])));
        let conn = connect(client).await;
        let before = seen.lock().len();
        assert!(conn.list_resources().await.unwrap().is_empty());
        assert!(conn.list_prompts().await.unwrap().is_empty());
        assert_eq!(seen.lock().len(), before);
    }

    #[test]
    fn test_extract_text_content_single() {
        let content = vec![McpContent::Text {
            text: "Hello".into(),
        }];
        assert_eq!(extract_text_content(&content), "Hello");
    }

    #[test]
    fn test_extract_text_content_multi() {
        let content = vec![
            McpContent::Text {
                text: "Line 1".into(),
            },
            McpContent::Image {
                data: "base64...".into(),
                mime_type: "image/png".into(),
            },
            McpContent::Text {
                text: "Line 2".into(),
            },
        ];
        assert_eq!(extract_text_content(&content), "Line 1\nLine 2");
    }
}
