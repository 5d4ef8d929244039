// Paw Agent Engine — MCP Server Registry
//
// Owns every live MCP connection: external servers (stdio / http) and the
// built-in connectors served in-process. Connections are kept in the order
// they were made, which is also the order their tools are listed in.

use super::client::McpConnection;
use super::server::ConnectorServer;
use super::types::*;
use crate::atoms::constants::MCP_REQUEST_TIMEOUT_MS;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::ToolDescriptor;
use crate::engine::connectors::Connector;
use log::{info, warn};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

/// Pipe capacity for in-process connector sessions.
const IN_PROCESS_PIPE_BYTES: usize = 256 * 1024;

pub struct McpRegistry {
    connections: RwLock<Vec<(String, Arc<McpConnection>)>>,
    request_timeout: Duration,
}

impl Default for McpRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl McpRegistry {
    pub fn new() -> Self {
        Self::with_request_timeout(Duration::from_millis(MCP_REQUEST_TIMEOUT_MS))
    }

    /// Budget for handshakes and `*/list` requests on every connection
    /// made through this registry.
    pub fn with_request_timeout(request_timeout: Duration) -> Self {
        McpRegistry { connections: RwLock::new(Vec::new()), request_timeout }
    }

    /// Connect to an MCP server. Replaces any existing connection with the
    /// same name.
    pub async fn connect(&self, config: &McpServerConfig) -> EngineResult<Arc<McpConnection>> {
        if config.name.trim().is_empty() {
            return Err(EngineError::Config("MCP server name must not be empty".into()));
        }
        let conn = McpConnection::connect(config, self.request_timeout).await?;
        self.insert(Arc::clone(&conn)).await;
        Ok(conn)
    }

    /// Serve a built-in connector over an in-process pipe and connect to it.
    pub async fn connect_in_process(&self, connector: Arc<Connector>) -> EngineResult<Arc<McpConnection>> {
        let name = connector.service_name();
        let (client_io, server_io) = tokio::io::duplex(IN_PROCESS_PIPE_BYTES);
        let (sr, sw) = tokio::io::split(server_io);
        tokio::spawn(async move {
            if let Err(e) = ConnectorServer::new(connector).serve(sr, sw).await {
                warn!("[mcp:{}] in-process server stopped: {}", name, e);
            }
        });

        let (cr, cw) = tokio::io::split(client_io);
        let conn = McpConnection::connect_stream(name, cr, cw, self.request_timeout).await?;
        self.insert(Arc::clone(&conn)).await;
        Ok(conn)
    }

    async fn insert(&self, conn: Arc<McpConnection>) {
        let name = conn.name().to_string();
        let old = {
            let mut list = self.connections.write();
            match list.iter().position(|(n, _)| *n == name) {
                Some(i) => Some(std::mem::replace(&mut list[i].1, conn)),
                None => {
                    list.push((name.clone(), conn));
                    None
                }
            }
        };
        if let Some(old) = old {
            info!("[mcp] Replacing connection '{}'", name);
            old.close().await;
        }
    }

    /// Close and forget one server. Returns false if it was not connected.
    pub async fn disconnect(&self, name: &str) -> bool {
        let removed = {
            let mut list = self.connections.write();
            list.iter()
                .position(|(n, _)| n == name)
                .map(|i| list.remove(i).1)
        };
        match removed {
            Some(conn) => {
                conn.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn disconnect_all(&self) {
        let all: Vec<Arc<McpConnection>> = self.connections.write().drain(..).map(|(_, c)| c).collect();
        for conn in all {
            conn.close().await;
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<McpConnection>> {
        self.connections
            .read()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| Arc::clone(c))
    }

    /// Connected server names, in connection order.
    pub fn connected_names(&self) -> Vec<String> {
        self.connections.read().iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.get(name).map(|c| c.is_ready()).unwrap_or(false)
    }

    /// Status of all registered servers.
    pub fn status_list(&self) -> Vec<McpServerStatus> {
        self.connections.read().iter().map(|(_, c)| c.status()).collect()
    }

    /// Every remote tool, grouped by server in connection order.
    pub fn all_descriptors(&self) -> Vec<ToolDescriptor> {
        self.connections
            .read()
            .iter()
            .flat_map(|(_, c)| c.descriptors())
            .collect()
    }

    /// Re-fetch one server's tool list.
    pub async fn refresh_tools(&self, name: &str) -> EngineResult<Vec<McpToolDef>> {
        let conn = self
            .get(name)
            .ok_or_else(|| EngineError::not_ready(name, ConnectionState::Disconnected))?;
        conn.refresh_tools().await
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
