// Paw Agent Engine — Built-in Functions
// Script bundles shipped with the runtime plus a couple of native tools
// that need host facilities (clock, randomness) the sandbox does not expose.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{
    CallStyle, FunctionSchema, ParamType, ParameterSpec, ReturnSpec, ToolDescriptor,
};
use crate::engine::sandbox::NativeFunction;
use serde_json::{json, Value};

/// (group id, source) pairs, loaded in this order.
pub const BUILTIN_SCRIPTS: &[(&str, &str)] = &[
    ("builtin:math", MATH_JS),
    ("builtin:text", TEXT_JS),
    ("builtin:json", JSON_JS),
];

const MATH_JS: &str = r#"
function assertInteger(n, label) {
  if (!Number.isInteger(n) || n < 0) {
    throw new RangeError(label + " must be a non-negative integer");
  }
}

/**
 * Compute n! exactly for n <= 170.
 * @callable
 * @param {integer} n - Non-negative input
 * @returns {number} n factorial
 */
function factorial(n) {
  assertInteger(n, "n");
  if (n > 170) throw new RangeError("n is too large");
  let acc = 1;
  for (let i = 2; i <= n; i++) acc *= i;
  return acc;
}

/**
 * Return the first `count` Fibonacci numbers.
 * @callable
 * @param {integer} count - How many numbers to return (max 1000)
 * @returns {number[]} The sequence starting at 0
 */
function fibonacci(count) {
  assertInteger(count, "count");
  if (count > 1000) throw new RangeError("count is too large");
  const out = [];
  let a = 0, b = 1;
  for (let i = 0; i < count; i++) {
    out.push(a);
    [a, b] = [b, a + b];
  }
  return out;
}

/**
 * Primality test by trial division.
 * @callable
 * @param {integer} n - Number to test
 * @returns {boolean}
 */
function is_prime(n) {
  assertInteger(n, "n");
  if (n < 2) return false;
  if (n % 2 === 0) return n === 2;
  for (let d = 3; d * d <= n; d += 2) {
    if (n % d === 0) return false;
  }
  return true;
}

/**
 * Greatest common divisor.
 * @callable
 * @param {integer} a
 * @param {integer} b
 * @returns {integer}
 */
function gcd(a, b) {
  a = Math.abs(a);
  b = Math.abs(b);
  while (b) [a, b] = [b, a % b];
  return a;
}
"#;

const TEXT_JS: &str = r#"
/**
 * Count words, characters and lines in a text.
 * @callable
 * @param {string} text - Input text
 * @returns {object} { words, characters, lines }
 */
function word_count(text) {
  const trimmed = text.trim();
  return {
    words: trimmed === "" ? 0 : trimmed.split(/\s+/).length,
    characters: text.length,
    lines: text === "" ? 0 : text.split("\n").length,
  };
}

/**
 * Lowercase URL slug.
 * @callable
 * @param {string} text - Input text
 * @param {string} [separator=-] - Word separator
 * @returns {string}
 */
function slugify(text, separator = "-") {
  return text
    .normalize("NFKD")
    .replace(/[\u0300-\u036f]/g, "")
    .toLowerCase()
    .replace(/[^a-z0-9]+/g, separator)
    .split(separator)
    .filter(Boolean)
    .join(separator);
}

/**
 * Reverse a string by code point.
 * @callable
 * @param {string} text
 * @returns {string}
 */
function reverse_text(text) {
  return Array.from(text).reverse().join("");
}
"#;

const JSON_JS: &str = r#"
/**
 * Keep only the listed top-level fields of an object.
 * @callable
 * @param {object} value - Source object
 * @param {string[]} fields - Field names to keep
 * @returns {object}
 */
function pick_fields(value, fields) {
  const out = {};
  for (const f of fields) {
    if (Object.prototype.hasOwnProperty.call(value, f)) out[f] = value[f];
  }
  return out;
}
"#;

// ── Native tools ───────────────────────────────────────────────────────

/// Native built-ins with their descriptors.
pub fn native_functions(default_timeout_ms: u64) -> Vec<(ToolDescriptor, NativeFunction)> {
    vec![
        (
            ToolDescriptor::local(
                &native_schema(
                    "current_time",
                    "Current date and time in UTC and local time.",
                    vec![],
                    ParamType::Object,
                ),
                default_timeout_ms,
            ),
            NativeFunction::new("current_time", current_time),
        ),
        (
            ToolDescriptor::local(
                &native_schema(
                    "generate_uuid",
                    "Generate one or more random v4 UUIDs.",
                    vec![ParameterSpec::optional(
                        "count",
                        ParamType::Integer,
                        "How many to generate (1-100, default 1)",
                    )],
                    ParamType::Array,
                ),
                default_timeout_ms,
            ),
            NativeFunction::new("generate_uuid", generate_uuid),
        ),
    ]
}

fn native_schema(
    name: &str,
    description: &str,
    parameters: Vec<ParameterSpec>,
    returns: ParamType,
) -> FunctionSchema {
    FunctionSchema {
        name: name.into(),
        description: description.into(),
        parameters,
        returns: Some(ReturnSpec {
            return_type: returns,
            description: String::new(),
        }),
        timeout_ms: None,
        scopes: vec![],
        call_style: CallStyle::ObjectArg,
        line: 0,
    }
}

fn current_time(_args: &Value) -> EngineResult<Value> {
    let utc = chrono::Utc::now();
    let local = chrono::Local::now();
    Ok(json!({
        "utc": utc.to_rfc3339(),
        "local": local.to_rfc3339(),
        "unix": utc.timestamp(),
        "timezone_offset": local.offset().to_string(),
    }))
}

fn generate_uuid(args: &Value) -> EngineResult<Value> {
    let count = match args.get("count") {
        None | Some(Value::Null) => 1,
        Some(v) => v
            .as_u64()
            .filter(|n| (1..=100).contains(n))
            .ok_or_else(|| EngineError::validation("generate_uuid", "count must be 1-100"))?,
    };
    let ids: Vec<Value> = (0..count)
        .map(|_| Value::String(uuid::Uuid::new_v4().to_string()))
        .collect();
    Ok(Value::Array(ids))
}
