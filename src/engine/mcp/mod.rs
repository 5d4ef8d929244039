// Paw Agent Engine — MCP (Model Context Protocol)
//
// Tools from external MCP servers, and the built-in connectors, reach the
// registry through the same client.
//
// Architecture:
//   types.rs     — protocol types + config structs
//   transport.rs — stdio / in-process streams, streamable HTTP, framing
//   client.rs    — one connection: handshake, request correlation, caches
//   server.rs    — serves a built-in connector over MCP
//   registry.rs  — multi-server lifecycle

pub mod client;
pub mod registry;
pub mod server;
pub mod transport;
pub mod types;

// Re-export the main public types
pub use client::McpConnection;
pub use registry::McpRegistry;
pub use types::{ConnectionState, McpServerConfig, McpServerStatus, McpTransport};

/// Registry name of a remote tool: `<server>_<tool>`.
pub fn remote_tool_name(server: &str, tool: &str) -> String {
    format!("{}_{}", server, tool)
}
