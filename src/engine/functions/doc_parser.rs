// Script Doc Blocks — Parsing into canonical schemas
//
// Pure functions: no filesystem I/O, no state. Takes script text in,
// returns `FunctionSchema`s out.
//
// Recognised block shape:
//
//   /**
//    * Compute n!.
//    * @callable
//    * @param {integer} n - Non-negative input
//    * @param {string} [label] - Optional label
//    * @returns {number} The factorial
//    * @timeout 2000
//    */
//   function factorial(n, label) { ... }
//
// Only blocks carrying `@callable` produce a schema. Malformed type
// annotations degrade to `any`; structural problems in a callable block
// fail the whole file.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{CallStyle, FunctionSchema, ParamType, ParameterSpec, ReturnSpec};
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

// Patterns are constant; `None` would only mean a typo here and makes every
// callable block report "not followed by a function declaration".
static FUNCTION_DECL: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^(?:export\s+)?(?:async\s+)?function\s*\*?\s*([A-Za-z_$][\w$]*)\s*\(").ok()
});

static BINDING_DECL: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"^(?:export\s+)?(?:const|let|var)\s+([A-Za-z_$][\w$]*)\s*=\s*(?:async\s+)?(?:function\b\s*\*?\s*(?:[A-Za-z_$][\w$]*)?\s*\(|\(|([A-Za-z_$][\w$]*)\s*=>)",
    )
    .ok()
});

// ── Raw block model ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct DocBlock {
    description: Vec<String>,
    tags: Vec<(String, String)>,
}

/// A declaration found right after a doc block.
#[derive(Debug)]
struct Declaration {
    name: String,
    /// Signature parameter names; `None` when the function destructures.
    params: Option<Vec<String>>,
    line: usize,
}

// ── Public API ─────────────────────────────────────────────────────────────

/// Extract the schemas of every `@callable` function in `source`.
///
/// Fails with `ValidationError` naming the offending function when a
/// callable block cannot be parsed; in that case nothing from the file
/// should be registered.
pub fn extract_schemas(source: &str) -> EngineResult<Vec<FunctionSchema>> {
    let mut schemas = Vec::new();
    let mut seen = HashSet::new();
    let mut cursor = 0usize;

    while let Some(rel_start) = source[cursor..].find("/**") {
        let start = cursor + rel_start;
        let body_start = start + 3;
        let Some(rel_end) = source[body_start..].find("*/") else {
            return Err(EngineError::validation(
                "<script>",
                format!("unterminated documentation block at line {}", line_of(source, start)),
            ));
        };
        let body_end = body_start + rel_end;
        cursor = body_end + 2;

        let block = split_block(&source[body_start..body_end]);
        let callable = block.tags.iter().any(|(tag, _)| tag == "callable");
        if !callable {
            continue;
        }

        let decl = find_declaration(source, cursor).ok_or_else(|| {
            EngineError::validation(
                "<script>",
                format!(
                    "@callable block at line {} is not followed by a function declaration",
                    line_of(source, start)
                ),
            )
        })?;

        let schema = build_schema(block, decl)?;
        if !seen.insert(schema.name.clone()) {
            return Err(EngineError::validation(
                schema.name.as_str(),
                "function is declared @callable more than once",
            ));
        }
        schemas.push(schema);
    }

    Ok(schemas)
}

/// Parse a JSDoc-style type expression. Returns the type and whether the
/// `=` optional suffix was present. Anything unrecognised is `Any`.
pub fn parse_type(expr: &str) -> (ParamType, bool) {
    let mut t = expr.trim();
    let mut optional = false;
    if let Some(stripped) = t.strip_suffix('=') {
        t = stripped.trim();
        optional = true;
    }
    t = t.trim_start_matches(['?', '!']).trim();
    t = strip_wrapping_parens(t);

    // Only a top-level `|` makes a union; `Array<string|number>` is an array.
    let alternatives = split_top_level(t, '|');
    if alternatives.len() > 1 {
        let mut variants = alternatives
            .into_iter()
            .map(str::trim)
            .filter(|v| !matches!(*v, "null" | "undefined"))
            .map(|v| parse_type(v).0);
        let first = variants.next().unwrap_or(ParamType::Any);
        let same = variants.all(|v| v == first);
        return (if same { first } else { ParamType::Any }, optional);
    }

    if t.ends_with("[]") || t.starts_with("Array<") || t.starts_with("Array.<") {
        return (ParamType::Array, optional);
    }
    if t.starts_with("Object<") || t.starts_with("Object.<") || (t.starts_with('{') && t.ends_with('}')) {
        return (ParamType::Object, optional);
    }

    let ty = match t.to_ascii_lowercase().as_str() {
        "string" => ParamType::String,
        "number" | "float" | "double" => ParamType::Number,
        "int" | "integer" => ParamType::Integer,
        "boolean" | "bool" => ParamType::Boolean,
        "object" | "record" => ParamType::Object,
        "array" => ParamType::Array,
        _ => ParamType::Any,
    };
    (ty, optional)
}

fn split_top_level(t: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in t.char_indices() {
        match c {
            '<' | '(' | '{' | '[' => depth += 1,
            '>' | ')' | '}' | ']' => depth -= 1,
            c if c == sep && depth == 0 => {
                parts.push(&t[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&t[start..]);
    parts
}

/// `(a|b)` -> `a|b`, but `(a|b)[]` is left alone.
fn strip_wrapping_parens(mut t: &str) -> &str {
    while t.starts_with('(') && t.ends_with(')') {
        let mut depth = 0i32;
        let closes_at_end = t.char_indices().all(|(i, c)| {
            match c {
                '(' => depth += 1,
                ')' => depth -= 1,
                _ => {}
            }
            depth > 0 || i == t.len() - 1
        });
        if !closes_at_end {
            break;
        }
        t = t[1..t.len() - 1].trim();
    }
    t
}

// ── Block splitting ────────────────────────────────────────────────────────

fn split_block(body: &str) -> DocBlock {
    let mut block = DocBlock::default();
    for raw in body.lines() {
        let line = raw.trim();
        let line = line.strip_prefix('*').unwrap_or(line);
        let line = line.strip_prefix(' ').unwrap_or(line).trim_end();

        if let Some(tagged) = line.trim_start().strip_prefix('@') {
            let (tag, rest) = match tagged.find(char::is_whitespace) {
                Some(i) => (&tagged[..i], tagged[i..].trim()),
                None => (tagged, ""),
            };
            block.tags.push((tag.to_string(), rest.to_string()));
        } else if let Some((_, text)) = block.tags.last_mut() {
            // Continuation of the previous tag's text.
            let extra = line.trim();
            if !extra.is_empty() {
                if !text.is_empty() {
                    text.push(' ');
                }
                text.push_str(extra);
            }
        } else if !line.trim().is_empty() {
            block.description.push(line.trim().to_string());
        }
    }
    block
}

// ── Declarations ───────────────────────────────────────────────────────────

fn find_declaration(source: &str, after_block: usize) -> Option<Declaration> {
    let rest = &source[after_block..];
    let offset = rest.len() - rest.trim_start().len();
    let decl_start = after_block + offset;
    let text = &source[decl_start..];

    let function_caps = FUNCTION_DECL.as_ref().and_then(|re| re.captures(text));
    let binding_caps = BINDING_DECL.as_ref().and_then(|re| re.captures(text));

    let (name, open_paren) = if let Some(caps) = function_caps {
        let whole = caps.get(0)?;
        (caps[1].to_string(), Some(whole.end() - 1))
    } else if let Some(caps) = binding_caps {
        let whole = caps.get(0)?;
        match caps.get(2) {
            // `const f = x => ...`
            Some(single) => {
                return Some(Declaration {
                    name: caps[1].to_string(),
                    params: Some(vec![single.as_str().to_string()]),
                    line: line_of(source, decl_start),
                })
            }
            None => (caps[1].to_string(), Some(whole.end() - 1)),
        }
    } else {
        return None;
    };

    let params = open_paren.and_then(|p| signature_params(&text[p..]));
    Some(Declaration {
        name,
        params: params.unwrap_or(None),
        line: line_of(source, decl_start),
    })
}

/// Split the parenthesised parameter list starting at `text[0] == '('`.
/// Returns `Some(None)` for destructured signatures, `None` when the
/// parentheses never close.
fn signature_params(text: &str) -> Option<Option<Vec<String>>> {
    let mut depth = 0i32;
    let mut end = None;
    for (i, c) in text.char_indices() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(i);
                    break;
                }
            }
            _ => {}
        }
    }
    let inner = &text[1..end?];

    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for c in inner.chars() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    parts.push(current);

    let mut names = Vec::new();
    for part in parts {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if part.starts_with('{') || part.starts_with('[') {
            return Some(None);
        }
        let name = part
            .trim_start_matches("...")
            .split('=')
            .next()
            .unwrap_or_default()
            .trim();
        names.push(name.to_string());
    }
    Some(Some(names))
}

// ── Schema assembly ────────────────────────────────────────────────────────

fn build_schema(block: DocBlock, decl: Declaration) -> EngineResult<FunctionSchema> {
    let fn_name = decl.name.clone();
    let mut description = block.description.join(" ");
    let mut params: Vec<ParameterSpec> = Vec::new();
    let mut returns = None;
    let mut timeout_ms = None;
    let mut scopes = Vec::new();

    for (tag, text) in block.tags {
        match tag.as_str() {
            "param" | "arg" | "argument" => {
                if let Some(spec) = parse_param(&fn_name, &text)? {
                    if params.iter().any(|p| p.name == spec.name) {
                        return Err(EngineError::validation(
                            fn_name.as_str(),
                            format!("parameter '{}' is documented twice", spec.name),
                        ));
                    }
                    params.push(spec);
                }
            }
            "returns" | "return" => {
                let (ty, rest) = split_type(&text);
                returns = Some(ReturnSpec {
                    return_type: ty.map(|t| parse_type(t).0).unwrap_or_default(),
                    description: strip_dash(rest).to_string(),
                });
            }
            "description" | "desc" => {
                if !text.is_empty() {
                    description = text;
                }
            }
            "timeout" => {
                let ms = text.trim().parse::<u64>().map_err(|_| {
                    EngineError::validation(
                        fn_name.as_str(),
                        format!("@timeout expects milliseconds, got '{}'", text.trim()),
                    )
                })?;
                timeout_ms = Some(ms);
            }
            "scope" => {
                scopes.extend(text.split_whitespace().map(str::to_string));
            }
            _ => {}
        }
    }

    let call_style = match &decl.params {
        Some(signature) => {
            params = align_with_signature(&fn_name, params, signature)?;
            CallStyle::Positional
        }
        None => CallStyle::ObjectArg,
    };

    Ok(FunctionSchema {
        name: fn_name,
        description,
        parameters: params,
        returns,
        timeout_ms,
        scopes,
        call_style,
        line: decl.line,
    })
}

/// Parse the text after `@param`. Returns `Ok(None)` for dotted names
/// (`opts.limit`), which document nested fields rather than parameters.
fn parse_param(fn_name: &str, text: &str) -> EngineResult<Option<ParameterSpec>> {
    let (ty, rest) = split_type(text);
    let (mut param_type, mut optional) = ty.map(parse_type).unwrap_or((ParamType::Any, false));

    let rest = rest.trim_start();
    let (token, description) = if rest.starts_with('[') {
        match rest.find(']') {
            Some(close) => (&rest[..=close], &rest[close + 1..]),
            None => {
                return Err(EngineError::validation(
                    fn_name,
                    format!("unclosed optional parameter '{}'", rest),
                ))
            }
        }
    } else {
        match rest.find(char::is_whitespace) {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, ""),
        }
    };

    if token.is_empty() {
        return Err(EngineError::validation(fn_name, "@param is missing a parameter name"));
    }

    let name = if let Some(inner) = token.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
        optional = true;
        inner.split('=').next().unwrap_or_default().trim()
    } else {
        token
    };

    if name.contains('.') {
        return Ok(None);
    }
    if !is_identifier(name) {
        return Err(EngineError::validation(
            fn_name,
            format!("'{}' is not a valid parameter name", name),
        ));
    }

    // `{...}` that never closed: keep the parameter, drop the type.
    if ty.is_none() && text.trim_start().starts_with('{') {
        param_type = ParamType::Any;
    }

    Ok(Some(ParameterSpec {
        name: name.to_string(),
        param_type,
        description: strip_dash(description).to_string(),
        required: !optional,
    }))
}

/// Split a leading `{type}` off tag text. An unclosed brace yields no
/// type and skips the broken token.
fn split_type(text: &str) -> (Option<&str>, &str) {
    let text = text.trim_start();
    if !text.starts_with('{') {
        return (None, text);
    }
    let mut depth = 0i32;
    for (i, c) in text.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return (Some(&text[1..i]), &text[i + 1..]);
                }
            }
            _ => {}
        }
    }
    // Unclosed: skip the first whitespace-delimited token.
    match text.find(char::is_whitespace) {
        Some(i) => (None, &text[i..]),
        None => (None, ""),
    }
}

fn strip_dash(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix('-').map(str::trim).unwrap_or(s)
}

/// Order documented parameters by their position in the signature and
/// add undocumented signature parameters as optional `any`, so that
/// positional invocation lines up with the declaration.
fn align_with_signature(
    fn_name: &str,
    documented: Vec<ParameterSpec>,
    signature: &[String],
) -> EngineResult<Vec<ParameterSpec>> {
    if let Some(stray) = documented.iter().find(|p| !signature.contains(&p.name)) {
        return Err(EngineError::validation(
            fn_name,
            format!("@param '{}' does not match any parameter of {}()", stray.name, fn_name),
        ));
    }
    let mut aligned = Vec::with_capacity(signature.len());
    for name in signature {
        match documented.iter().find(|p| &p.name == name) {
            Some(p) => aligned.push(p.clone()),
            None => aligned.push(ParameterSpec::optional(name, ParamType::Any, "")),
        }
    }
    Ok(aligned)
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

fn line_of(source: &str, byte_idx: usize) -> usize {
    source[..byte_idx].bytes().filter(|b| *b == b'\n').count() + 1
}

// ── Tests ──────────────────────────────────────────────────────────────────
