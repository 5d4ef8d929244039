// ── Paw Atoms: Error Types ─────────────────────────────────────────────────
// Single canonical error enum for the runtime, built with `thiserror`.
//
// Design rules:
//   • One variant per failure the dispatcher can report, plus a few coarse
//     ambient variants (I/O, serialization, network, config).
//   • `EngineError::kind()` collapses every variant onto the closed
//     `ErrorKind` carried by `ToolInvocationResult`.
//   • No variant carries secret material (API keys, tokens) in its message.

use crate::atoms::types::ErrorKind;
use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// No tool with this name is registered.
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// Arguments or script documentation failed validation.
    #[error("Validation error: {subject}: {message}")]
    Validation { subject: String, message: String },

    /// A tool with the same name is already registered.
    #[error("Name conflict: tool '{0}' is already registered")]
    NameConflict(String),

    /// The tool body ran and failed (thrown error, upstream rejection,
    /// non-serializable result).
    #[error("Execution error: {tool}: {message}")]
    Execution { tool: String, message: String },

    /// The deadline elapsed before a result arrived.
    #[error("Timed out after {elapsed_ms}ms: {operation}")]
    Timeout { operation: String, elapsed_ms: u64 },

    /// An MCP request was attempted before the handshake completed.
    #[error("Server '{server}' is not ready (state: {state})")]
    NotReady { server: String, state: String },

    /// The transport closed while a request was outstanding.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Credentials were rejected or could not be refreshed.
    #[error("Authentication failed: {service}: {message}")]
    Auth { service: String, message: String },

    /// Wire-level failure (framing, write error, malformed peer message).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Runtime configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Catch-all for errors that do not have a dedicated variant.
    #[error("{0}")]
    Other(String),
}

// ── Convenience constructors ───────────────────────────────────────────────

impl EngineError {
    pub fn validation(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation { subject: subject.into(), message: message.into() }
    }

    pub fn execution(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution { tool: tool.into(), message: message.into() }
    }

    pub fn timeout(operation: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::Timeout { operation: operation.into(), elapsed_ms }
    }

    pub fn auth(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Auth { service: service.into(), message: message.into() }
    }

    pub fn not_ready(server: impl Into<String>, state: impl std::fmt::Display) -> Self {
        Self::NotReady { server: server.into(), state: state.to_string() }
    }

    /// The taxonomy bucket this error is reported under.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownTool(_) => ErrorKind::UnknownTool,
            Self::Validation { .. } | Self::Config(_) => ErrorKind::ValidationError,
            Self::NameConflict(_) => ErrorKind::NameConflict,
            Self::Execution { .. } | Self::Serialization(_) | Self::Other(_) => {
                ErrorKind::ExecutionError
            }
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::NotReady { .. } => ErrorKind::NotReady,
            Self::ConnectionLost(_) => ErrorKind::ConnectionLost,
            Self::Auth { .. } => ErrorKind::AuthenticationFailed,
            Self::Transport(_) | Self::Io(_) => ErrorKind::TransportError,
            Self::Network(e) if e.is_timeout() => ErrorKind::Timeout,
            Self::Network(_) => ErrorKind::TransportError,
        }
    }

    /// The message without the variant prefix, for re-wrapping on the far
    /// side of a wire.
    pub fn detail(&self) -> String {
        match self {
            Self::Validation { message, .. }
            | Self::Execution { message, .. }
            | Self::Auth { message, .. } => message.clone(),
            Self::ConnectionLost(m) | Self::Transport(m) | Self::Other(m) => m.clone(),
            _ => self.to_string(),
        }
    }

    /// Rebuild an error from a kind + message pair, e.g. one that crossed
    /// the MCP wire inside a tool result.
    pub fn from_kind(kind: ErrorKind, subject: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::UnknownTool => Self::UnknownTool(subject.to_string()),
            ErrorKind::ValidationError => Self::validation(subject, message),
            ErrorKind::NameConflict => Self::NameConflict(subject.to_string()),
            ErrorKind::ExecutionError => Self::execution(subject, message),
            ErrorKind::Timeout => Self::timeout(format!("{}: {}", subject, message), 0),
            ErrorKind::NotReady => Self::not_ready(subject, message),
            ErrorKind::ConnectionLost => Self::ConnectionLost(message),
            ErrorKind::AuthenticationFailed => Self::auth(subject, message),
            ErrorKind::TransportError => Self::Transport(message),
        }
    }
}

// ── String bridges ─────────────────────────────────────────────────────────
// Allows `.ok_or("...")?` in functions returning `EngineResult<T>`.

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        EngineError::Other(s)
    }
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        EngineError::Other(s.to_string())
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All runtime operations return this type.
pub type EngineResult<T> = Result<T, EngineError>;

impl From<EngineError> for String {
    fn from(e: EngineError) -> Self {
        e.to_string()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
