// engine/state.rs — ToolRuntime, the one object a host process builds.
// Owns the tool registry, the MCP connections and the configuration, and
// is passed by reference to whatever drives tool calls. Nothing here is
// global.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{ToolCallOutcome, ToolCallRequest, ToolDescriptor, ToolInvocationResult};
use crate::engine::config::{ConnectorConfig, RuntimeConfig};
use crate::engine::connectors::{service_api, Connector};
use crate::engine::functions::builtins::{native_functions, BUILTIN_SCRIPTS};
use crate::engine::mcp::{McpConnection, McpRegistry, McpServerConfig, McpServerStatus};
use crate::engine::sandbox::ScriptSandbox;
use crate::engine::tools::{ToolHandle, ToolRegistry};
use log::{info, warn};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub struct ToolRuntime {
    config: RuntimeConfig,
    sandbox: ScriptSandbox,
    tools: ToolRegistry,
    mcp: McpRegistry,
}

impl ToolRuntime {
    /// Validate the config and register the built-in scripts and native
    /// functions. Nothing is connected yet; see `connect_configured`.
    pub fn new(config: RuntimeConfig) -> EngineResult<Self> {
        config.validate()?;
        let sandbox = ScriptSandbox::new(config.sandbox.clone());
        let tools = ToolRegistry::new();
        let mcp = McpRegistry::with_request_timeout(Duration::from_millis(config.mcp.request_timeout_ms));

        for (group, source) in BUILTIN_SCRIPTS {
            tools.register_script(source, group, &sandbox, false)?;
        }
        for (descriptor, function) in native_functions(config.sandbox.default_timeout_ms) {
            tools.register(descriptor, ToolHandle::Local(Arc::new(function)), false)?;
        }
        info!("[tools] Runtime ready with {} built-in tool(s)", tools.len());

        Ok(ToolRuntime { config, sandbox, tools, mcp })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn mcp(&self) -> &McpRegistry {
        &self.mcp
    }

    // ── Startup ────────────────────────────────────────────────────────

    /// Connect every enabled connector and external server. One broken
    /// server does not stop the others; failures are returned by name.
    pub async fn connect_configured(&self) -> Vec<(String, EngineError)> {
        let mut failures = Vec::new();

        let connectors: Vec<String> = self.config.enabled_connectors().map(|(n, _)| n.clone()).collect();
        for name in connectors {
            if let Err(e) = self.connect_connector(&name).await {
                warn!("[mcp] Connector '{}' not started: {}", name, e);
                failures.push((name, e));
            }
        }

        let servers: Vec<McpServerConfig> = self.config.enabled_servers().cloned().collect();
        for server in servers {
            if let Err(e) = self.connect_server(&server).await {
                warn!("[mcp] Server '{}' not connected: {}", server.name, e);
                failures.push((server.name, e));
            }
        }
        failures
    }

    // ── Local scripts ──────────────────────────────────────────────────

    /// Load (or reload) one script file's callables as group `group_id`.
    pub fn load_script(&self, source: &str, group_id: &str) -> EngineResult<Vec<String>> {
        self.tools.register_script(source, group_id, &self.sandbox, false)
    }

    pub fn unload_script(&self, group_id: &str) -> usize {
        self.tools.remove_group(group_id)
    }

    // ── Remote servers ─────────────────────────────────────────────────

    /// Build a connector from its configured credentials.
    pub fn build_connector(&self, name: &str) -> EngineResult<Connector> {
        let api = service_api(name).ok_or_else(|| EngineError::Config(format!("unknown connector '{}'", name)))?;
        let fallback = ConnectorConfig::default();
        let settings = self.config.connectors.get(name).unwrap_or(&fallback);
        let connector = Connector::new(api, settings.auth_strategy(name)?)?;
        Ok(match &settings.base_url {
            Some(url) => connector.with_base_url(url.as_str()),
            None => connector,
        })
    }

    /// Serve a built-in connector in-process and register its tools.
    pub async fn connect_connector(&self, name: &str) -> EngineResult<usize> {
        let connector = Arc::new(self.build_connector(name)?);
        let connection = self.mcp.connect_in_process(connector).await?;
        self.register_connection(&connection).await
    }

    /// Connect an external MCP server and register its tools.
    pub async fn connect_server(&self, config: &McpServerConfig) -> EngineResult<usize> {
        let connection = self.mcp.connect(config).await?;
        self.register_connection(&connection).await
    }

    async fn register_connection(&self, connection: &Arc<McpConnection>) -> EngineResult<usize> {
        match self.tools.register_server(connection, false) {
            Ok(count) => Ok(count),
            Err(e) => {
                self.mcp.disconnect(connection.name()).await;
                Err(e)
            }
        }
    }

    /// Drop a server's tools and close its connection.
    pub async fn disconnect(&self, name: &str) -> bool {
        let removed = self.tools.remove_server(name);
        self.mcp.disconnect(name).await || removed > 0
    }

    /// Re-fetch a server's tool list and re-register it.
    pub async fn refresh_server(&self, name: &str) -> EngineResult<usize> {
        self.mcp.refresh_tools(name).await?;
        let connection = self
            .mcp
            .get(name)
            .ok_or_else(|| EngineError::Other(format!("server '{}' disappeared during refresh", name)))?;
        self.tools.register_server(&connection, false)
    }

    /// Re-register servers that announced a changed tool list.
    pub async fn sync_stale_servers(&self) {
        for name in self.mcp.connected_names() {
            let stale = self.mcp.get(&name).map(|c| c.tools_stale()).unwrap_or(false);
            if stale {
                if let Err(e) = self.refresh_server(&name).await {
                    warn!("[mcp:{}] tool refresh failed: {}", name, e);
                }
            }
        }
    }

    pub fn server_status(&self) -> Vec<McpServerStatus> {
        self.mcp.status_list()
    }

    // ── Calls ──────────────────────────────────────────────────────────

    /// Every registered tool after picking up announced list changes.
    pub async fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.sync_stale_servers().await;
        self.tools.list()
    }

    /// Deadline `dispatch.default_deadline_ms` from now.
    pub fn default_deadline(&self) -> Instant {
        Instant::now() + Duration::from_millis(self.config.dispatch.default_deadline_ms)
    }

    pub async fn dispatch(&self, name: &str, args: &Value, deadline: Option<Instant>) -> ToolInvocationResult {
        let deadline = deadline.unwrap_or_else(|| self.default_deadline());
        self.tools.dispatch(name, args, deadline).await
    }

    pub async fn dispatch_batch(&self, calls: Vec<ToolCallRequest>, deadline: Option<Instant>) -> Vec<ToolCallOutcome> {
        let deadline = deadline.unwrap_or_else(|| self.default_deadline());
        self.tools.dispatch_batch(calls, deadline).await
    }

    /// Close every connection and forget its tools. Local tools stay.
    pub async fn shutdown(&self) {
        for name in self.mcp.connected_names() {
            self.tools.remove_server(&name);
        }
        self.mcp.disconnect_all().await;
        info!("[mcp] All servers disconnected");
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{ErrorKind, ToolOrigin};
    use crate::engine::test_support::MockHttp;
    use serde_json::json;

    fn runtime(toml: &str) -> ToolRuntime {
        ToolRuntime::new(RuntimeConfig::from_toml_str(toml).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_builtins_registered() {
        let rt = runtime("");
        let names: Vec<String> = rt.list_tools().await.into_iter().map(|d| d.name).collect();
        for expected in ["factorial", "is_prime", "slugify", "pick_fields", "current_time", "generate_uuid"] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
        let r = rt.dispatch("factorial", &json!({"n": 5}), None).await;
        assert!(r.success, "{:?}", r.message);
        assert_eq!(r.origin, Some(ToolOrigin::Local));
    }

    #[tokio::test]
    async fn test_load_and_unload_script() {
        let rt = runtime("");
        let src = r#"
/**
 * @callable
 * @param {number} x - value
 */
function double_it(x) { return x * 2; }
"#;
        assert_eq!(rt.load_script(src, "user:double.js").unwrap(), vec!["double_it"]);
        let r = rt.dispatch("double_it", &json!({"x": 21}), None).await;
        assert_eq!(r.value, Some(json!(42)));

        // Built-in names are taken.
        let clash = "/**\n * @callable\n */\nfunction factorial() { return 1; }";
        let err = rt.load_script(clash, "user:clash.js").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NameConflict);

        assert_eq!(rt.unload_script("user:double.js"), 1);
        let r = rt.dispatch("double_it", &json!({"x": 1}), None).await;
        assert_eq!(r.error_kind, Some(ErrorKind::UnknownTool));
    }

    #[tokio::test]
    async fn test_connector_from_config() {
        let mock = MockHttp::start(vec![(200, "\"198.51.100.4\"".into())]).await;
        let rt = runtime(&format!(
            "[connectors.shodan]\napi_key = \"k\"\nbase_url = \"{}\"\n",
            mock.base_url
        ));
        let failures = rt.connect_configured().await;
        assert!(failures.is_empty());
        assert_eq!(rt.server_status().len(), 1);

        let r = rt.dispatch("shodan_tools_myip", &json!({}), None).await;
        assert!(r.success, "{:?}", r.message);
        assert_eq!(r.value, Some(json!({"ip": "198.51.100.4"})));
        assert_eq!(r.origin, Some(ToolOrigin::Remote("shodan".into())));

        assert!(rt.disconnect("shodan").await);
        assert!(!rt.registry().contains("shodan_tools_myip"));
        assert!(!rt.disconnect("shodan").await);
    }

    #[tokio::test]
    async fn test_missing_credentials_reported() {
        let rt = runtime("");
        let err = rt.connect_connector("github").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
        let err = rt.connect_connector("jira").await.unwrap_err();
        assert!(err.to_string().contains("unknown connector"));
        assert!(rt.server_status().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_keeps_local_tools() {
        let rt = runtime("[connectors.github]\ntoken = \"t\"\nbase_url = \"http://127.0.0.1:9\"\n");
        assert!(rt.connect_configured().await.is_empty());
        let before = rt.registry().len();
        rt.shutdown().await;
        assert_eq!(rt.registry().len(), before - 13);
        assert!(rt.registry().contains("factorial"));
        assert!(rt.server_status().is_empty());
    }
}
