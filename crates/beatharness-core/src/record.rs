//! Helpers for asserting on structured (JSON) log lines.
//!
//! The harness itself treats output as opaque text; these are for tests
//! that expect one JSON object per line, such as ECS-formatted logs.

use serde_json::{Map, Value};

/// Parse a captured line as a JSON object.
pub fn parse_record(line: &str) -> Result<Map<String, Value>, serde_json::Error> {
    serde_json::from_str(line.trim())
}

/// Top-level `keys` absent from the record in `line`.
///
/// Keys are matched literally, so dotted ECS names like `log.level` refer to
/// a flat key, not a nested path.
pub fn missing_keys<'k>(line: &str, keys: &[&'k str]) -> Result<Vec<&'k str>, serde_json::Error> {
    let record = parse_record(line)?;
    Ok(keys
        .iter()
        .copied()
        .filter(|key| !record.contains_key(*key))
        .collect())
}
