// Paw tool runtime
//
//   atoms/   — pure types, constants, the error enum (no I/O)
//   engine/  — sandbox, MCP client/server, connectors, registry, runtime

pub mod atoms;
pub mod engine;

pub use atoms::error::{EngineError, EngineResult};
pub use atoms::types::{
    ErrorKind, ToolCallOutcome, ToolCallRequest, ToolDescriptor, ToolInvocationResult, ToolOrigin,
};
pub use engine::config::RuntimeConfig;
pub use engine::state::ToolRuntime;
