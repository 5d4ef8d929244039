// Paw Agent Engine — Runtime Configuration
//
// One TOML document describes everything the runtime needs at startup:
//
//   [sandbox]            — local tool budgets
//   [dispatch]           — caller deadline used when none is given
//   [mcp]                — handshake budget + external servers
//   [connectors.<name>]  — credentials / base URL per built-in connector
//   scripts = [...]      — user script files to load
//
// The core only parses strings. Locating and reading the file is the
// hosting process's job.

use crate::atoms::constants::{DEFAULT_DISPATCH_DEADLINE_MS, MCP_REQUEST_TIMEOUT_MS};
use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::auth::{AuthStrategy, OAuthCredentials, GOOGLE_TOKEN_ENDPOINT};
use crate::engine::connectors::service_api;
use crate::engine::mcp::{McpServerConfig, McpTransport};
use crate::engine::sandbox::SandboxConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use zeroize::Zeroizing;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Script files loaded at startup, one group per file.
    pub scripts: Vec<String>,
    pub sandbox: SandboxConfig,
    pub dispatch: DispatchConfig,
    pub mcp: McpConfig,
    /// Built-in connectors keyed by service name.
    pub connectors: BTreeMap<String, ConnectorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub default_deadline_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { default_deadline_ms: DEFAULT_DISPATCH_DEADLINE_MS }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    /// Budget for `initialize` and `*/list` requests.
    pub request_timeout_ms: u64,
    pub servers: Vec<McpServerConfig>,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self { request_timeout_ms: MCP_REQUEST_TIMEOUT_MS, servers: Vec::new() }
    }
}

/// Credentials and overrides for one built-in connector.
///
/// Exactly one credential family may be set: `api_key`, `token`, or the
/// OAuth fields (`access_token` and/or `refresh_token`).
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    pub enabled: bool,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub token: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub token_endpoint: Option<String>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: None,
            api_key: None,
            token: None,
            access_token: None,
            refresh_token: None,
            expires_at: None,
            client_id: None,
            client_secret: None,
            token_endpoint: None,
        }
    }
}

impl std::fmt::Debug for ConnectorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorConfig")
            .field("enabled", &self.enabled)
            .field("base_url", &self.base_url)
            .field("credentials", &self.credential_family())
            .field("client_id", &self.client_id)
            .finish()
    }
}

impl ConnectorConfig {
    fn credential_family(&self) -> Vec<&'static str> {
        let mut families = Vec::new();
        if self.api_key.is_some() {
            families.push("api_key");
        }
        if self.token.is_some() {
            families.push("token");
        }
        if self.access_token.is_some() || self.refresh_token.is_some() {
            families.push("oauth");
        }
        families
    }

    /// Resolve the configured credentials into an `AuthStrategy`.
    pub fn auth_strategy(&self, service: &str) -> EngineResult<AuthStrategy> {
        let families = self.credential_family();
        if families.len() > 1 {
            return Err(EngineError::Config(format!(
                "connector '{}' sets more than one credential type ({})",
                service,
                families.join(", ")
            )));
        }
        if let Some(key) = &self.api_key {
            return Ok(AuthStrategy::api_key(key.clone()));
        }
        if let Some(token) = &self.token {
            return Ok(AuthStrategy::personal_token(token.clone()));
        }
        if families.is_empty() {
            return Err(EngineError::auth(service, "no credentials configured"));
        }
        Ok(AuthStrategy::oauth(OAuthCredentials {
            access_token: Zeroizing::new(self.access_token.clone().unwrap_or_default()),
            refresh_token: self.refresh_token.clone().map(Zeroizing::new),
            expires_at: self.expires_at,
            client_id: self.client_id.clone().unwrap_or_default(),
            client_secret: self.client_secret.clone().map(Zeroizing::new),
            token_endpoint: self
                .token_endpoint
                .clone()
                .unwrap_or_else(|| GOOGLE_TOKEN_ENDPOINT.to_string()),
        }))
    }
}

impl RuntimeConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> EngineResult<Self> {
        let config: RuntimeConfig = toml::from_str(content)
            .map_err(|e| EngineError::Config(format!("TOML parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that do not need the network.
    pub fn validate(&self) -> EngineResult<()> {
        if self.sandbox.default_timeout_ms == 0 {
            return Err(EngineError::Config("sandbox.default_timeout_ms must be > 0".into()));
        }
        if self.sandbox.max_heap_mb < 8 {
            return Err(EngineError::Config("sandbox.max_heap_mb must be at least 8".into()));
        }
        if self.dispatch.default_deadline_ms == 0 {
            return Err(EngineError::Config("dispatch.default_deadline_ms must be > 0".into()));
        }

        for name in self.connectors.keys() {
            if service_api(name).is_none() {
                return Err(EngineError::Config(format!("unknown connector '{}'", name)));
            }
        }

        let mut seen: HashSet<&str> = self.connectors.keys().map(String::as_str).collect();
        for server in &self.mcp.servers {
            let name = server.name.trim();
            if name.is_empty() {
                return Err(EngineError::Config("MCP server name must not be empty".into()));
            }
            if !seen.insert(name) {
                return Err(EngineError::Config(format!(
                    "MCP server name '{}' is used more than once",
                    name
                )));
            }
            match server.transport {
                McpTransport::Stdio if server.command.trim().is_empty() => {
                    return Err(EngineError::Config(format!("MCP server '{}' has no command", name)));
                }
                McpTransport::Http if server.url.trim().is_empty() => {
                    return Err(EngineError::Config(format!("MCP server '{}' has no url", name)));
                }
                McpTransport::InProcess => {
                    return Err(EngineError::Config(format!(
                        "MCP server '{}': in-process servers are configured under [connectors]",
                        name
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Enabled external servers, in file order.
    pub fn enabled_servers(&self) -> impl Iterator<Item = &McpServerConfig> {
        self.mcp.servers.iter().filter(|s| s.enabled)
    }

    /// Enabled connectors, in name order.
    pub fn enabled_connectors(&self) -> impl Iterator<Item = (&String, &ConnectorConfig)> {
        self.connectors.iter().filter(|(_, c)| c.enabled)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::ErrorKind;

    const SAMPLE: &str = r#"
scripts = ["~/tools/math_extra.js"]

[sandbox]
default_timeout_ms = 2500

[mcp]
request_timeout_ms = 10000

[[mcp.servers]]
name = "files"
command = "npx"
args = ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]

[[mcp.servers]]
name = "remote"
transport = "http"
url = "https://mcp.example.com/mcp"
enabled = false

[connectors.shodan]
api_key = "sk-test"

[connectors.gmail]
refresh_token = "rt"
client_id = "cid.apps.googleusercontent.com"
"#;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::from_toml_str("").unwrap();
        assert_eq!(config.sandbox.default_timeout_ms, 5_000);
        assert_eq!(config.dispatch.default_deadline_ms, 30_000);
        assert_eq!(config.mcp.request_timeout_ms, 30_000);
        assert!(config.mcp.servers.is_empty());
        assert!(config.connectors.is_empty());
    }

    #[test]
    fn test_parse_sample() {
        let config = RuntimeConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.scripts, vec!["~/tools/math_extra.js"]);
        assert_eq!(config.sandbox.default_timeout_ms, 2_500);
        assert_eq!(config.sandbox.max_log_lines, 200);
        assert_eq!(config.mcp.request_timeout_ms, 10_000);

        assert_eq!(config.mcp.servers.len(), 2);
        assert_eq!(config.mcp.servers[0].transport, McpTransport::Stdio);
        assert_eq!(config.mcp.servers[1].transport, McpTransport::Http);
        let enabled: Vec<&str> = config.enabled_servers().map(|s| s.name.as_str()).collect();
        assert_eq!(enabled, vec!["files"]);

        let names: Vec<&String> = config.enabled_connectors().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["gmail", "shodan"]);
    }

    #[test]
    fn test_auth_strategy_resolution() {
        let config = RuntimeConfig::from_toml_str(SAMPLE).unwrap();
        let shodan = config.connectors["shodan"].auth_strategy("shodan").unwrap();
        assert_eq!(shodan.kind_name(), "api_key");

        let gmail = config.connectors["gmail"].auth_strategy("gmail").unwrap();
        assert_eq!(gmail.kind_name(), "oauth");
        assert!(gmail.can_refresh());
        assert!(gmail.needs_refresh());

        let empty = ConnectorConfig::default().auth_strategy("github").unwrap_err();
        assert_eq!(empty.kind(), ErrorKind::AuthenticationFailed);

        let both = ConnectorConfig {
            api_key: Some("a".into()),
            token: Some("b".into()),
            ..Default::default()
        };
        assert!(both.auth_strategy("github").unwrap_err().to_string().contains("more than one"));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = RuntimeConfig::from_toml_str(SAMPLE).unwrap();
        let dump = format!("{:?}", config);
        assert!(!dump.contains("sk-test"));
        assert!(!dump.contains("\"rt\""));
    }

    #[test]
    fn test_rejects_bad_documents() {
        let cases = [
            ("[sandbox]\ndefault_timeout_ms = \"soon\"", "TOML parse error"),
            ("[connectors.jira]\ntoken = \"t\"", "unknown connector 'jira'"),
            ("[[mcp.servers]]\nname = \"a\"\ncommand = \"x\"\n[[mcp.servers]]\nname = \"a\"\ncommand = \"y\"", "more than once"),
            ("[connectors.github]\ntoken = \"t\"\n[[mcp.servers]]\nname = \"github\"\ncommand = \"x\"", "more than once"),
            ("[[mcp.servers]]\nname = \"a\"", "has no command"),
            ("[[mcp.servers]]\nname = \"a\"\ntransport = \"http\"", "has no url"),
            ("[[mcp.servers]]\nname = \"a\"\ntransport = \"in-process\"", "[connectors]"),
            ("[dispatch]\ndefault_deadline_ms = 0", "must be > 0"),
            ("[sandbox]\nmax_heap_mb = 1", "at least 8"),
        ];
        for (doc, needle) in cases {
            let err = RuntimeConfig::from_toml_str(doc).unwrap_err();
            assert!(err.to_string().contains(needle), "{doc:?} -> {err}");
        }
    }
}
