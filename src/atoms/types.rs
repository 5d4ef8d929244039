// ── Paw Atoms: Pure Data Types ────────────────────────────────────────────────
// Plain struct/enum definitions shared by every engine layer.
// Atoms layer rule: no I/O, no side effects, no imports from engine/.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::atoms::constants::REMOTE_TOOL_TIMEOUT_MS;

// ── Error taxonomy ─────────────────────────────────────────────────────────

/// Closed set of failure kinds reported inside a `ToolInvocationResult`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    UnknownTool,
    ValidationError,
    NameConflict,
    ExecutionError,
    Timeout,
    NotReady,
    ConnectionLost,
    AuthenticationFailed,
    TransportError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnknownTool => "UnknownTool",
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::NameConflict => "NameConflict",
            ErrorKind::ExecutionError => "ExecutionError",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::NotReady => "NotReady",
            ErrorKind::ConnectionLost => "ConnectionLost",
            ErrorKind::AuthenticationFailed => "AuthenticationFailed",
            ErrorKind::TransportError => "TransportError",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "UnknownTool" => ErrorKind::UnknownTool,
            "ValidationError" => ErrorKind::ValidationError,
            "NameConflict" => ErrorKind::NameConflict,
            "ExecutionError" => ErrorKind::ExecutionError,
            "Timeout" => ErrorKind::Timeout,
            "NotReady" => ErrorKind::NotReady,
            "ConnectionLost" => ErrorKind::ConnectionLost,
            "AuthenticationFailed" => ErrorKind::AuthenticationFailed,
            "TransportError" => ErrorKind::TransportError,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Parameter schema ───────────────────────────────────────────────────────

/// Basic JSON type of a parameter. `Any` disables the type check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    #[default]
    Any,
}

impl ParamType {
    /// Map a JSON Schema `type` keyword. Unknown names fall back to `Any`.
    pub fn from_json_schema(name: &str) -> Self {
        match name {
            "string" => ParamType::String,
            "number" => ParamType::Number,
            "integer" => ParamType::Integer,
            "boolean" => ParamType::Boolean,
            "object" => ParamType::Object,
            "array" => ParamType::Array,
            _ => ParamType::Any,
        }
    }

    /// JSON Schema `type` keyword, `None` for `Any`.
    pub fn json_schema_name(&self) -> Option<&'static str> {
        match self {
            ParamType::String => Some("string"),
            ParamType::Number => Some("number"),
            ParamType::Integer => Some("integer"),
            ParamType::Boolean => Some("boolean"),
            ParamType::Object => Some("object"),
            ParamType::Array => Some("array"),
            ParamType::Any => None,
        }
    }

    /// Basic type check of a JSON value. No coercion happens here.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Number => value.is_number(),
            ParamType::Integer => {
                value.is_i64()
                    || value.is_u64()
                    || value.as_f64().map(|f| f.fract() == 0.0).unwrap_or(false)
            }
            ParamType::Boolean => value.is_boolean(),
            ParamType::Object => value.is_object(),
            ParamType::Array => value.is_array(),
            ParamType::Any => true,
        }
    }
}

/// One entry of a tool's ordered parameter list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub description: String,
    pub required: bool,
}

impl ParameterSpec {
    pub fn required(name: &str, param_type: ParamType, description: &str) -> Self {
        ParameterSpec {
            name: name.into(),
            param_type,
            description: description.into(),
            required: true,
        }
    }

    pub fn optional(name: &str, param_type: ParamType, description: &str) -> Self {
        ParameterSpec {
            name: name.into(),
            param_type,
            description: description.into(),
            required: false,
        }
    }
}

/// Declared return value of a local function (`@returns`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReturnSpec {
    #[serde(rename = "type")]
    pub return_type: ParamType,
    #[serde(default)]
    pub description: String,
}

/// How caller arguments are handed to a script function.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum CallStyle {
    /// `function f(a, b)`: arguments spread in schema order.
    #[default]
    Positional,
    /// `function f({ a, b })`: the whole argument object is passed.
    ObjectArg,
}

/// Canonical schema extracted from a documentation block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSchema {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParameterSpec>,
    #[serde(default)]
    pub returns: Option<ReturnSpec>,
    /// Per-function override from `@timeout`.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// From `@scope` tags.
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub call_style: CallStyle,
    /// 1-based line of the declaration, for diagnostics.
    pub line: usize,
}

// ── Tool descriptor ────────────────────────────────────────────────────────

/// Where a tool executes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", content = "server")]
pub enum ToolOrigin {
    Local,
    Remote(String),
}

impl ToolOrigin {
    pub fn server(&self) -> Option<&str> {
        match self {
            ToolOrigin::Local => None,
            ToolOrigin::Remote(server) => Some(server.as_str()),
        }
    }
}

impl std::fmt::Display for ToolOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolOrigin::Local => f.write_str("local"),
            ToolOrigin::Remote(server) => write!(f, "remote:{}", server),
        }
    }
}

/// Canonical metadata for one callable capability.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameter_schema: Vec<ParameterSpec>,
    pub origin: ToolOrigin,
    #[serde(default)]
    pub required_scopes: Vec<String>,
    pub timeout_ms: u64,
    /// Original JSON Schema from a remote server, kept so nested detail
    /// (enums, item types) reaches the model unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_input_schema: Option<Value>,
}

impl ToolDescriptor {
    pub fn local(schema: &FunctionSchema, default_timeout_ms: u64) -> Self {
        ToolDescriptor {
            name: schema.name.clone(),
            description: schema.description.clone(),
            parameter_schema: schema.parameters.clone(),
            origin: ToolOrigin::Local,
            required_scopes: schema.scopes.clone(),
            timeout_ms: schema.timeout_ms.unwrap_or(default_timeout_ms),
            raw_input_schema: None,
        }
    }

    /// Build a descriptor from a remote JSON Schema (`inputSchema`).
    pub fn remote(
        name: impl Into<String>,
        description: impl Into<String>,
        server: impl Into<String>,
        input_schema: &Value,
    ) -> Self {
        ToolDescriptor {
            name: name.into(),
            description: description.into(),
            parameter_schema: parameters_from_json_schema(input_schema),
            origin: ToolOrigin::Remote(server.into()),
            required_scopes: Vec::new(),
            timeout_ms: REMOTE_TOOL_TIMEOUT_MS,
            raw_input_schema: Some(input_schema.clone()),
        }
    }

    /// JSON Schema presented to the model.
    pub fn input_schema(&self) -> Value {
        if let Some(raw) = &self.raw_input_schema {
            return raw.clone();
        }
        parameters_to_json_schema(&self.parameter_schema)
    }

    pub fn is_local(&self) -> bool {
        self.origin == ToolOrigin::Local
    }
}

/// Render an ordered parameter list as a JSON Schema object.
pub fn parameters_to_json_schema(params: &[ParameterSpec]) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for p in params {
        let mut prop = Map::new();
        if let Some(t) = p.param_type.json_schema_name() {
            prop.insert("type".into(), Value::String(t.into()));
        }
        if !p.description.is_empty() {
            prop.insert("description".into(), Value::String(p.description.clone()));
        }
        properties.insert(p.name.clone(), Value::Object(prop));
        if p.required {
            required.push(Value::String(p.name.clone()));
        }
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Flatten a JSON Schema object into the canonical parameter list.
pub fn parameters_from_json_schema(schema: &Value) -> Vec<ParameterSpec> {
    let required: Vec<&str> = schema["required"]
        .as_array()
        .map(|r| r.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();

    let Some(props) = schema["properties"].as_object() else {
        return Vec::new();
    };

    props
        .iter()
        .map(|(name, prop)| {
            let param_type = match &prop["type"] {
                Value::String(t) => ParamType::from_json_schema(t),
                // ["string", "null"] style unions
                Value::Array(types) => {
                    let concrete: Vec<&str> = types
                        .iter()
                        .filter_map(|t| t.as_str())
                        .filter(|t| *t != "null")
                        .collect();
                    if concrete.len() == 1 {
                        ParamType::from_json_schema(concrete[0])
                    } else {
                        ParamType::Any
                    }
                }
                _ => ParamType::Any,
            };
            ParameterSpec {
                name: name.clone(),
                param_type,
                description: prop["description"].as_str().unwrap_or_default().to_string(),
                required: required.contains(&name.as_str()),
            }
        })
        .collect()
}

// ── Local functions ────────────────────────────────────────────────────────

/// A script function loaded from a built-in bundle or a user file.
/// `source_text` is the whole file so helper functions stay in scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDefinition {
    pub name: String,
    pub source_text: String,
    pub parsed_schema: FunctionSchema,
    pub group_id: String,
}

// ── Invocation ─────────────────────────────────────────────────────────────

/// One call requested by a model turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequest {
    pub call_id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCallRequest {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        ToolCallRequest {
            call_id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            arguments,
        }
    }
}

/// The only value the dispatcher returns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocationResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// `None` only when the tool name did not resolve.
    pub origin: Option<ToolOrigin>,
    pub duration_ms: u64,
}

impl ToolInvocationResult {
    pub fn ok(value: Value, origin: ToolOrigin, duration_ms: u64) -> Self {
        ToolInvocationResult {
            success: true,
            value: Some(value),
            error_kind: None,
            message: None,
            origin: Some(origin),
            duration_ms,
        }
    }

    pub fn failure(
        kind: ErrorKind,
        message: impl Into<String>,
        origin: Option<ToolOrigin>,
        duration_ms: u64,
    ) -> Self {
        ToolInvocationResult {
            success: false,
            value: None,
            error_kind: Some(kind),
            message: Some(message.into()),
            origin,
            duration_ms,
        }
    }
}

/// Batch result entry, keyed by the caller's own call id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallOutcome {
    pub call_id: String,
    pub name: String,
    pub result: ToolInvocationResult,
}

// ── Tests ──────────────────────────────────────────────────────────────────
