// Paw Agent Engine — Service Connectors
//
// A connector maps a fixed, declarative tool set onto one third-party HTTP
// API. Each service module supplies a `ServiceApi` (routes, base URL, where
// the credential goes); `Connector` owns the credential and the HTTP client
// and does the rest: argument validation, request building, auth refresh,
// upstream error mapping and response shaping.
//
// Connectors are served to the registry over MCP (see mcp/server.rs), so
// their tools show up as `Remote` tools named `<service>_<tool>`.

pub mod github;
pub mod gmail;
pub mod shodan;

use crate::atoms::constants::{
    CONNECTOR_HTTP_TIMEOUT_SECS, CONNECTOR_MAX_BODY_BYTES, CONNECTOR_USER_AGENT,
};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{
    parameters_to_json_schema, ParamType, ParameterSpec, ToolDescriptor,
};
use crate::engine::auth::{AuthPlacement, AuthStrategy};
use crate::engine::mcp::remote_tool_name;
use crate::engine::mcp::types::McpToolDef;
use crate::engine::tools::validate::validate_arguments;
use log::{debug, info, warn};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::sync::RwLock;

// ── Route declarations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Post,
    Patch,
    Put,
    Delete,
}

impl Verb {
    fn as_method(self) -> reqwest::Method {
        match self {
            Verb::Get => reqwest::Method::GET,
            Verb::Post => reqwest::Method::POST,
            Verb::Patch => reqwest::Method::PATCH,
            Verb::Put => reqwest::Method::PUT,
            Verb::Delete => reqwest::Method::DELETE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamLocation {
    /// Substituted into `{name}` in the path template.
    Path,
    Query,
    /// Field of the JSON request body.
    Body,
}

#[derive(Debug, Clone, Copy)]
pub struct RouteParam {
    pub name: &'static str,
    pub param_type: ParamType,
    pub required: bool,
    pub location: ParamLocation,
    pub description: &'static str,
}

/// How the request body is produced.
#[derive(Clone, Copy)]
pub enum BodyMode {
    /// `Body`-located params as a JSON object (omitted if none are set).
    Params,
    /// Service-specific encoder over the full argument object.
    Custom(fn(&Value) -> EngineResult<Value>),
}

/// One tool: a single outbound HTTP operation.
#[derive(Clone, Copy)]
pub struct ToolRoute {
    pub name: &'static str,
    pub description: &'static str,
    pub verb: Verb,
    pub path: &'static str,
    pub params: &'static [RouteParam],
    pub body: BodyMode,
    /// Post-processing of the decoded upstream JSON.
    pub shape: Option<fn(Value) -> Value>,
}

impl ToolRoute {
    pub fn parameter_specs(&self) -> Vec<ParameterSpec> {
        self.params
            .iter()
            .map(|p| ParameterSpec {
                name: p.name.to_string(),
                param_type: p.param_type,
                description: p.description.to_string(),
                required: p.required,
            })
            .collect()
    }
}

// Terse constructors for the static route tables.

pub(crate) const fn path(name: &'static str, description: &'static str) -> RouteParam {
    RouteParam { name, param_type: ParamType::String, required: true, location: ParamLocation::Path, description }
}

pub(crate) const fn path_num(name: &'static str, description: &'static str) -> RouteParam {
    RouteParam { name, param_type: ParamType::Integer, required: true, location: ParamLocation::Path, description }
}

pub(crate) const fn query(
    name: &'static str,
    param_type: ParamType,
    required: bool,
    description: &'static str,
) -> RouteParam {
    RouteParam { name, param_type, required, location: ParamLocation::Query, description }
}

pub(crate) const fn body(
    name: &'static str,
    param_type: ParamType,
    required: bool,
    description: &'static str,
) -> RouteParam {
    RouteParam { name, param_type, required, location: ParamLocation::Body, description }
}

/// Static description of one third-party API.
pub trait ServiceApi: Send + Sync {
    /// Service name; also the MCP server name and tool-name prefix.
    fn service(&self) -> &'static str;
    fn default_base_url(&self) -> &'static str;
    fn auth_placement(&self) -> AuthPlacement;
    fn routes(&self) -> &'static [ToolRoute];

    /// Service-specific headers (API version pins, accept types).
    fn decorate(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
    }
}

/// Names of the connectors shipped with the runtime.
pub const BUILTIN_CONNECTORS: &[&str] = &["shodan", "github", "gmail"];

/// Service definition for a built-in connector name.
pub fn service_api(name: &str) -> Option<Box<dyn ServiceApi>> {
    match name {
        "shodan" => Some(Box::new(shodan::Shodan)),
        "github" => Some(Box::new(github::GitHub)),
        "gmail" => Some(Box::new(gmail::Gmail)),
        _ => None,
    }
}

/// MCP tool definitions of a service. Needs no credentials.
pub fn tool_defs(api: &dyn ServiceApi) -> Vec<McpToolDef> {
    api.routes()
        .iter()
        .map(|r| McpToolDef {
            name: r.name.to_string(),
            description: Some(r.description.to_string()),
            input_schema: parameters_to_json_schema(&r.parameter_specs()),
        })
        .collect()
}

/// Registry descriptors of a service, prefixed with the service name.
pub fn descriptors(api: &dyn ServiceApi) -> Vec<ToolDescriptor> {
    let service = api.service();
    tool_defs(api)
        .into_iter()
        .map(|def| {
            ToolDescriptor::remote(
                remote_tool_name(service, &def.name),
                def.description.unwrap_or_default(),
                service,
                &def.input_schema,
            )
        })
        .collect()
}

// ── Connector ──────────────────────────────────────────────────────────

pub struct Connector {
    api: Box<dyn ServiceApi>,
    auth: RwLock<AuthStrategy>,
    http: reqwest::Client,
    base_url: String,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("service", &self.api.service())
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl Connector {
    pub fn new(api: Box<dyn ServiceApi>, auth: AuthStrategy) -> EngineResult<Self> {
        auth.validate(api.service())?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(CONNECTOR_HTTP_TIMEOUT_SECS))
            .user_agent(CONNECTOR_USER_AGENT)
            .build()?;
        let base_url = api.default_base_url().to_string();
        Ok(Connector { api, auth: RwLock::new(auth), http, base_url })
    }

    /// Point the connector at a different upstream (proxies, tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn service_name(&self) -> &'static str {
        self.api.service()
    }

    pub fn tool_count(&self) -> usize {
        self.api.routes().len()
    }

    /// Tool list as served over MCP (unprefixed names).
    pub fn tool_defs(&self) -> Vec<McpToolDef> {
        tool_defs(self.api.as_ref())
    }

    /// Descriptors as they appear in the registry once connected.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        descriptors(self.api.as_ref())
    }

    /// Execute one tool against the upstream API.
    pub async fn call_tool(&self, tool: &str, args: &Value) -> EngineResult<Value> {
        let service = self.api.service();
        let route = self
            .api
            .routes()
            .iter()
            .find(|r| r.name == tool)
            .ok_or_else(|| EngineError::UnknownTool(remote_tool_name(service, tool)))?;

        validate_arguments(tool, &route.parameter_specs(), args)?;

        // At most one refresh per call, proactive or after a 401.
        let mut refreshed = false;
        if self.auth.read().await.needs_refresh() {
            self.refresh_auth(false).await?;
            refreshed = true;
        }

        info!("[connector:{}] {} {:?} {}", service, tool, route.verb, route.path);
        let mut resp = self.send(route, args).await?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED
            && !refreshed
            && self.auth.read().await.can_refresh()
        {
            warn!("[connector:{}] 401 from upstream, refreshing token once", service);
            self.refresh_auth(true).await?;
            resp = self.send(route, args).await?;
        }

        let value = read_response(service, tool, resp).await?;
        Ok(match route.shape {
            Some(shape) => shape(value),
            None => value,
        })
    }

    /// Refresh under the write lock. Unless `force`d, a caller that queued
    /// behind another refresh reuses the token it produced.
    async fn refresh_auth(&self, force: bool) -> EngineResult<()> {
        let mut auth = self.auth.write().await;
        if !force && !auth.needs_refresh() {
            debug!("[connector:{}] token already refreshed", self.api.service());
            return Ok(());
        }
        auth.refresh(&self.http, self.api.service()).await
    }

    async fn send(&self, route: &ToolRoute, args: &Value) -> EngineResult<reqwest::Response> {
        let (url, query, body) = build_parts(&self.base_url, route, args)?;
        let mut request = self.http.request(route.verb.as_method(), &url);
        if !query.is_empty() {
            request = request.query(&query);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }
        request = self.api.decorate(request);
        request = self.auth.read().await.apply(request, self.api.auth_placement());

        // Drop the URL from reqwest errors: it can carry a query-string key.
        request.send().await.map_err(|e| EngineError::Network(e.without_url()))
    }
}

/// Resolve path template, query pairs and JSON body for one call.
fn build_parts(
    base_url: &str,
    route: &ToolRoute,
    args: &Value,
) -> EngineResult<(String, Vec<(String, String)>, Option<Value>)> {
    let mut path = route.path.to_string();
    let mut query = Vec::new();
    let mut body = Map::new();

    for p in route.params {
        let Some(v) = args.get(p.name).filter(|v| !v.is_null()) else {
            continue;
        };
        match p.location {
            ParamLocation::Path => {
                let encoded = scalar(v)
                    .split('/')
                    .map(|seg| urlencoding::encode(seg).into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                path = path.replace(&format!("{{{}}}", p.name), &encoded);
            }
            ParamLocation::Query => query.push((p.name.to_string(), scalar(v))),
            ParamLocation::Body => {
                body.insert(p.name.to_string(), v.clone());
            }
        }
    }

    if path.contains('{') {
        return Err(EngineError::validation(
            route.name,
            format!("unresolved path parameter in {}", route.path),
        ));
    }

    let body = match route.body {
        BodyMode::Custom(encode) => Some(encode(args)?),
        BodyMode::Params if body.is_empty() => None,
        BodyMode::Params => Some(Value::Object(body)),
    };

    Ok((format!("{}{}", base_url, path), query, body))
}

/// Render a JSON value as a path/query string. Arrays become comma lists.
fn scalar(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(scalar).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}

/// Map upstream status and body onto a value or a typed error.
async fn read_response(service: &str, tool: &str, resp: reqwest::Response) -> EngineResult<Value> {
    let status = resp.status();
    let text = resp.text().await.map_err(|e| EngineError::Network(e.without_url()))?;

    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        warn!("[connector:{}] {} rejected credentials ({})", service, tool, status);
        return Err(EngineError::auth(
            service,
            format!("upstream returned {}: {}", status.as_u16(), upstream_message(&text)),
        ));
    }
    if !status.is_success() {
        warn!("[connector:{}] {} failed ({})", service, tool, status);
        return Err(EngineError::execution(
            remote_tool_name(service, tool),
            format!("upstream returned {}: {}", status.as_u16(), upstream_message(&text)),
        ));
    }

    if text.trim().is_empty() {
        return Ok(json!({ "status": status.as_u16() }));
    }
    let value = serde_json::from_str::<Value>(&text).unwrap_or_else(|_| Value::String(text.clone()));
    Ok(truncate_value(value, text.len()))
}

/// Replace oversized payloads with a bounded preview.
fn truncate_value(value: Value, raw_len: usize) -> Value {
    if raw_len <= CONNECTOR_MAX_BODY_BYTES {
        return value;
    }
    let rendered = match &value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let mut cut = CONNECTOR_MAX_BODY_BYTES.min(rendered.len());
    while !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    json!({
        "truncated": true,
        "totalBytes": raw_len,
        "preview": &rendered[..cut],
    })
}

/// Best-effort human message from an upstream error body.
fn upstream_message(text: &str) -> String {
    if let Ok(v) = serde_json::from_str::<Value>(text) {
        let candidates = [
            v["error"]["message"].as_str(),
            v["error"].as_str(),
            v["message"].as_str(),
            v["error_description"].as_str(),
        ];
        if let Some(msg) = candidates.into_iter().flatten().next() {
            return msg.to_string();
        }
    }
    let trimmed = text.trim();
    if trimmed.is_empty() {
        "(empty body)".to_string()
    } else {
        trimmed.chars().take(300).collect()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
