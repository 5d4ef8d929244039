// Paw Agent Engine — MCP Transports
//
// A transport only moves framed JSON-RPC messages. Correlation of
// responses with requests happens in the connection (client.rs), which
// consumes the `InboundEvent` channel every transport feeds.
//
//   StreamTransport — any AsyncRead/AsyncWrite pair: a child process's
//                     stdio, or one half of an in-process duplex pipe.
//   HttpTransport   — streamable HTTP: each message is POSTed; replies come
//                     back as a JSON body or an SSE stream.
//
// Outgoing frames are newline-delimited JSON. The reader also accepts
// `Content-Length` framed messages (LSP style) from older servers.

use crate::atoms::constants::{MCP_BANNER_LOG_CHARS, MCP_MAX_MESSAGE_BYTES, MCP_WRITE_QUEUE};
use crate::atoms::error::{EngineError, EngineResult};
use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What a transport delivers to its connection.
#[derive(Debug)]
pub enum InboundEvent {
    /// One raw frame (a message or a batch).
    Frame(Vec<u8>),
    /// A request with this id could not be delivered.
    Undeliverable { id: u64, reason: String },
    /// The peer went away; no further events follow.
    Closed(String),
}

pub type InboundSender = mpsc::UnboundedSender<InboundEvent>;
pub type InboundReceiver = mpsc::UnboundedReceiver<InboundEvent>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue one serialized message for delivery.
    async fn send(&self, message: Vec<u8>) -> EngineResult<()>;

    /// Stop the transport and release its resources.
    async fn close(&self);

    fn is_alive(&self) -> bool;

    /// Short label for logs and status.
    fn kind(&self) -> &'static str;
}

// ── Stream transport ───────────────────────────────────────────────────

pub struct StreamTransport {
    label: &'static str,
    writer_tx: mpsc::Sender<Vec<u8>>,
    alive: Arc<AtomicBool>,
    child: Option<Arc<tokio::sync::Mutex<Option<Child>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamTransport {
    /// Wrap a reader/writer pair (in-process pipes, sockets, tests).
    pub fn from_stream<R, W>(reader: R, writer: W, inbound: InboundSender, label: &'static str) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let alive = Arc::new(AtomicBool::new(true));
        let (writer_tx, writer_rx) = mpsc::channel::<Vec<u8>>(MCP_WRITE_QUEUE);

        let writer_task = tokio::spawn(write_loop(writer, writer_rx, Arc::clone(&alive)));
        let reader_task = {
            let alive = Arc::clone(&alive);
            tokio::spawn(async move {
                let mut reader = BufReader::new(reader);
                let reason = loop {
                    match read_message(&mut reader).await {
                        Ok(Some(frame)) => {
                            if inbound.send(InboundEvent::Frame(frame)).is_err() {
                                break "connection dropped".to_string();
                            }
                        }
                        Ok(None) => break "stream closed by peer".to_string(),
                        Err(e) => {
                            error!("[mcp] Read error: {}", e);
                            break format!("read error: {}", e);
                        }
                    }
                };
                alive.store(false, Ordering::SeqCst);
                let _ = inbound.send(InboundEvent::Closed(reason));
            })
        };

        StreamTransport {
            label,
            writer_tx,
            alive,
            child: None,
            tasks: Mutex::new(vec![writer_task, reader_task]),
        }
    }

    /// Spawn a child process and speak JSON-RPC over its stdio.
    pub fn spawn_stdio(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        inbound: InboundSender,
    ) -> EngineResult<Self> {
        info!("[mcp] Spawning: {} {}", command, args.join(" "));

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|e| {
            EngineError::Transport(format!("failed to spawn MCP server `{}`: {}", command, e))
        })?;

        let stdin = child.stdin.take().ok_or("failed to open child stdin")?;
        let stdout = child.stdout.take().ok_or("failed to open child stdout")?;
        let stderr = child.stderr.take().ok_or("failed to open child stderr")?;

        let mut transport = Self::from_stream(stdout, stdin, inbound, "stdio");

        // Server diagnostics go to stderr; surface them at debug level.
        let stderr_task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let trimmed = line.trim();
                        if !trimmed.is_empty() {
                            debug!("[mcp:stderr] {}", trimmed);
                        }
                    }
                    Err(e) => {
                        warn!("[mcp] stderr read error: {}", e);
                        break;
                    }
                }
            }
        });
        transport.tasks.get_mut().push(stderr_task);
        transport.child = Some(Arc::new(tokio::sync::Mutex::new(Some(child))));
        Ok(transport)
    }
}

#[async_trait]
impl Transport for StreamTransport {
    async fn send(&self, message: Vec<u8>) -> EngineResult<()> {
        if !self.is_alive() {
            return Err(EngineError::ConnectionLost("transport is closed".into()));
        }
        self.writer_tx
            .send(message)
            .await
            .map_err(|_| EngineError::ConnectionLost("transport writer closed".into()))
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(child) = &self.child {
            let mut guard = child.lock().await;
            if let Some(ref mut c) = *guard {
                info!("[mcp] Killing child process");
                let _ = c.kill().await;
            }
            *guard = None;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn kind(&self) -> &'static str {
        self.label
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::Receiver<Vec<u8>>,
    alive: Arc<AtomicBool>,
) {
    while let Some(mut msg) = rx.recv().await {
        msg.push(b'\n');
        if let Err(e) = writer.write_all(&msg).await {
            error!("[mcp] write error: {}", e);
            break;
        }
        if let Err(e) = writer.flush().await {
            error!("[mcp] flush error: {}", e);
            break;
        }
    }
    alive.store(false, Ordering::SeqCst);
    debug!("[mcp] Writer task exiting");
}

/// Serialize and write one newline-terminated frame. Used by the server
/// side, which owns its writer directly.
pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &impl serde::Serialize,
) -> std::io::Result<()> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await
}

// ── Framing ────────────────────────────────────────────────────────────

/// Read one message: either a single line of JSON, or a
/// `Content-Length` header block followed by the body.
/// Returns `Ok(None)` on EOF.
pub(crate) async fn read_message<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, String> {
    read_message_limited(reader, MCP_MAX_MESSAGE_BYTES).await
}

async fn read_message_limited<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    max_bytes: usize,
) -> Result<Option<Vec<u8>>, String> {
    let mut line = String::new();
    loop {
        if read_line_limited(reader, &mut line, max_bytes).await? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            return Ok(Some(trimmed.as_bytes().to_vec()));
        }
        if let Some(len) = header_value(trimmed, "content-length") {
            let len = len
                .parse::<usize>()
                .map_err(|_| format!("bad Content-Length: {}", len))?;
            if len > max_bytes {
                return Err(format!("message too large: {} bytes (limit {})", len, max_bytes));
            }
            // Skip remaining headers up to the blank separator line.
            loop {
                if read_line_limited(reader, &mut line, max_bytes).await? == 0 {
                    return Ok(None);
                }
                if line.trim().is_empty() {
                    break;
                }
            }
            let mut body = vec![0u8; len];
            reader
                .read_exact(&mut body)
                .await
                .map_err(|e| format!("body read error: {}", e))?;
            return Ok(Some(body));
        }
        // Some servers print banners on stdout; they are not protocol traffic.
        let preview: String = trimmed.chars().take(MCP_BANNER_LOG_CHARS).collect();
        debug!("[mcp] Skipping non-JSON line: {}", preview);
    }
}

/// `read_line` that gives up once a line runs past `max_bytes`.
async fn read_line_limited<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    line: &mut String,
    max_bytes: usize,
) -> Result<usize, String> {
    line.clear();
    let limit = max_bytes as u64 + 1;
    let n = (&mut *reader)
        .take(limit)
        .read_line(line)
        .await
        .map_err(|e| format!("read error: {}", e))?;
    if n > max_bytes {
        return Err(format!("message too large: line exceeds {} bytes", max_bytes));
    }
    Ok(n)
}

fn header_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let (key, value) = line.split_once(':')?;
    key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
}

// ── Streamable HTTP transport ──────────────────────────────────────────

const SESSION_HEADER: &str = "Mcp-Session-Id";

pub struct HttpTransport {
    url: String,
    http: reqwest::Client,
    headers: HashMap<String, String>,
    session_id: Arc<Mutex<Option<String>>>,
    inbound: InboundSender,
    alive: Arc<AtomicBool>,
}

impl HttpTransport {
    pub fn new(url: &str, headers: &HashMap<String, String>, inbound: InboundSender) -> EngineResult<Self> {
        if url.trim().is_empty() {
            return Err(EngineError::Config("HTTP transport requires a url".into()));
        }
        let http = reqwest::Client::builder().build()?;
        info!("[mcp] HTTP transport → {}", url);
        Ok(HttpTransport {
            url: url.to_string(),
            http,
            headers: headers.clone(),
            session_id: Arc::new(Mutex::new(None)),
            inbound,
            alive: Arc::new(AtomicBool::new(true)),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, message: Vec<u8>) -> EngineResult<()> {
        if !self.is_alive() {
            return Err(EngineError::ConnectionLost("transport is closed".into()));
        }
        let request_id = serde_json::from_slice::<serde_json::Value>(&message)
            .ok()
            .and_then(|v| v.get("id").and_then(|id| id.as_u64()));

        let mut req = self
            .http
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream");
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(sid) = self.session_id.lock().clone() {
            req = req.header(SESSION_HEADER, sid);
        }
        let req = req.body(message);

        // The round trip runs detached so the caller's deadline covers it.
        let session_id = Arc::clone(&self.session_id);
        let inbound = self.inbound.clone();
        tokio::spawn(async move {
            if let Err(reason) = post_and_collect(req, &session_id, &inbound).await {
                warn!("[mcp] HTTP delivery failed: {}", reason);
                if let Some(id) = request_id {
                    let _ = inbound.send(InboundEvent::Undeliverable { id, reason });
                }
            }
        });
        Ok(())
    }

    async fn close(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            let _ = self.inbound.send(InboundEvent::Closed("closed by client".into()));
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn kind(&self) -> &'static str {
        "http"
    }
}

async fn post_and_collect(
    req: reqwest::RequestBuilder,
    session_id: &Mutex<Option<String>>,
    inbound: &InboundSender,
) -> Result<(), String> {
    let resp = req.send().await.map_err(|e| e.without_url().to_string())?;
    let status = resp.status();

    if let Some(sid) = resp.headers().get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
        *session_id.lock() = Some(sid.to_string());
    }
    if !status.is_success() {
        return Err(format!("server returned {}", status.as_u16()));
    }

    let is_sse = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("text/event-stream"))
        .unwrap_or(false);

    if is_sse {
        let mut stream = resp.bytes_stream();
        let mut parser = SseParser::default();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| e.without_url().to_string())?;
            for data in parser.push(&chunk) {
                let _ = inbound.send(InboundEvent::Frame(data.into_bytes()));
            }
        }
        if let Some(data) = parser.finish() {
            let _ = inbound.send(InboundEvent::Frame(data.into_bytes()));
        }
    } else {
        let body = resp.bytes().await.map_err(|e| e.without_url().to_string())?;
        // 202 Accepted (notifications) carries no body.
        if !body.iter().all(|b| b.is_ascii_whitespace()) {
            let _ = inbound.send(InboundEvent::Frame(body.to_vec()));
        }
    }
    Ok(())
}

/// Incremental `text/event-stream` parser yielding each event's data.
#[derive(Default)]
struct SseParser {
    buffer: String,
    data: Vec<String>,
}

impl SseParser {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                if let Some(event) = self.take_event() {
                    events.push(event);
                }
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.data.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
            }
            // `event:`, `id:`, `retry:` and comments are not needed here.
        }
        events
    }

    fn finish(&mut self) -> Option<String> {
        self.take_event()
    }

    fn take_event(&mut self) -> Option<String> {
        if self.data.is_empty() {
            return None;
        }
        let joined = self.data.join("\n");
        self.data.clear();
        Some(joined)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
