// Paw Agent Engine — Argument validation
//
// Checks caller arguments against a tool's declared parameter list before
// anything runs. Presence and basic JSON type only; values are never
// coerced, and fields the schema does not name are passed through.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::ParameterSpec;
use serde_json::Value;

pub fn validate_arguments(tool: &str, params: &[ParameterSpec], args: &Value) -> EngineResult<()> {
    let empty = serde_json::Map::new();
    let obj = match args {
        Value::Object(map) => map,
        Value::Null => &empty,
        other => {
            return Err(EngineError::validation(
                tool,
                format!("arguments must be a JSON object, got {}", type_name(other)),
            ))
        }
    };

    let missing: Vec<&str> = params
        .iter()
        .filter(|p| p.required && obj.get(&p.name).map(Value::is_null).unwrap_or(true))
        .map(|p| p.name.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(EngineError::validation(
            tool,
            format!("missing required argument(s): {}", missing.join(", ")),
        ));
    }

    for p in params {
        let Some(value) = obj.get(&p.name) else { continue };
        // An explicit null on an optional parameter means "not given".
        if value.is_null() && !p.required {
            continue;
        }
        if !p.param_type.accepts(value) {
            return Err(EngineError::validation(
                tool,
                format!(
                    "argument '{}' must be {}, got {}",
                    p.name,
                    p.param_type.json_schema_name().unwrap_or("any"),
                    type_name(value)
                ),
            ));
        }
    }
    Ok(())
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
