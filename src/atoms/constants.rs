// ── Paw Atoms: Constants ───────────────────────────────────────────────────
// All named constants for the runtime live here.

// ── Sandbox ───────────────────────────────────────────────────────────────
/// Wall-clock budget for a local tool when neither the caller nor the
/// function's `@timeout` tag says otherwise.
pub const DEFAULT_TOOL_TIMEOUT_MS: u64 = 5_000;
/// Per-call cap on captured `console.*` lines.
pub(crate) const SANDBOX_MAX_LOG_LINES: usize = 200;
/// Cap on a single captured log line.
pub(crate) const SANDBOX_MAX_LOG_LINE_CHARS: usize = 2_000;
/// V8 heap ceiling per isolate, in MiB.
pub(crate) const SANDBOX_MAX_HEAP_MB: usize = 64;

// ── MCP ───────────────────────────────────────────────────────────────────
/// Protocol version advertised in `initialize`.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
/// Budget for `initialize` and `*/list` requests.
pub const MCP_REQUEST_TIMEOUT_MS: u64 = 30_000;
/// Default budget for remote tool calls.
pub const REMOTE_TOOL_TIMEOUT_MS: u64 = 120_000;
/// Upper bound on pages followed for `*/list` pagination.
pub(crate) const MCP_MAX_LIST_PAGES: usize = 50;
/// Bounded queue between callers and the transport's writer task.
pub(crate) const MCP_WRITE_QUEUE: usize = 64;
/// Largest single frame accepted from a peer, line or `Content-Length` body.
pub(crate) const MCP_MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;
/// Banner lines are logged up to this many characters.
pub(crate) const MCP_BANNER_LOG_CHARS: usize = 120;
/// JSON-RPC "method not found".
pub const JSONRPC_METHOD_NOT_FOUND: i32 = -32601;
/// JSON-RPC "invalid params".
pub const JSONRPC_INVALID_PARAMS: i32 = -32602;
/// MCP "server not initialized".
pub const JSONRPC_SERVER_NOT_INITIALIZED: i32 = -32002;
/// JSON-RPC "parse error".
pub const JSONRPC_PARSE_ERROR: i32 = -32700;
/// Key inside a tool result's `_meta` carrying the runtime error kind.
pub const MCP_ERROR_KIND_META: &str = "paw/errorKind";

// ── Dispatch ──────────────────────────────────────────────────────────────
/// Dispatch deadline when the caller gives none.
pub const DEFAULT_DISPATCH_DEADLINE_MS: u64 = 30_000;

// ── Connectors ────────────────────────────────────────────────────────────
/// Per-request HTTP timeout for connector calls.
pub(crate) const CONNECTOR_HTTP_TIMEOUT_SECS: u64 = 30;
/// Upstream text bodies longer than this are truncated before being
/// returned to the model.
pub(crate) const CONNECTOR_MAX_BODY_BYTES: usize = 30_000;
pub(crate) const CONNECTOR_USER_AGENT: &str = "Paw-Agent/1.0";
