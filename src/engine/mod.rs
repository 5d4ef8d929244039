// Paw Agent Engine — Tool invocation runtime
// Local script functions, MCP servers and built-in service connectors
// behind one registry and one dispatch contract.

pub mod auth;
pub mod config;
pub mod connectors;
pub mod functions;
pub mod mcp;
pub mod sandbox;
pub mod state;
pub mod tools;

#[cfg(test)]
pub(crate) mod test_support;
