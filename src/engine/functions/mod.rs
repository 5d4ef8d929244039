// Paw Agent Engine — Local Functions
// Script loading: source text → FunctionDefinitions via the doc-comment
// schema extractor. Registration and execution live elsewhere.

pub mod builtins;
pub mod doc_parser;

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::FunctionDefinition;
use log::info;

pub use doc_parser::{extract_schemas, parse_type};

/// Parse every `@callable` function in `source` and tag it with `group_id`.
///
/// Fails as a whole when any block is unparseable, so a file is either
/// fully loaded or not loaded at all. A file with no callables is an
/// empty, successful load.
pub fn load_script(source: &str, group_id: &str) -> EngineResult<Vec<FunctionDefinition>> {
    if group_id.trim().is_empty() {
        return Err(EngineError::validation("script", "group id must not be empty"));
    }

    let schemas = extract_schemas(source)?;
    let defs: Vec<FunctionDefinition> = schemas
        .into_iter()
        .map(|schema| FunctionDefinition {
            name: schema.name.clone(),
            source_text: source.to_string(),
            parsed_schema: schema,
            group_id: group_id.to_string(),
        })
        .collect();

    info!(
        "[functions] Loaded {} callable(s) from group '{}'",
        defs.len(),
        group_id
    );
    Ok(defs)
}
