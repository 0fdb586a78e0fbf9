//! Metadata sanitization boundary.
//!
//! Everything written to either backend passes through [`sanitize_metadata`]:
//! primitives are kept, arrays and objects are JSON-stringified and a
//! `<key>_type` marker records the original shape so [`restore_metadata`] can
//! rebuild it.

use serde_json::{Map, Value};

use crate::error::{MemoryError, Result};
use crate::memory::types::{Metadata, MetadataValue};

/// Keys the vector backend uses for its own placement metadata.
pub const RESERVED_KEYS: [&str; 2] = ["memory_tier", "memory_context"];

const TYPE_SUFFIX: &str = "_type";
const ARRAY_MARKER: &str = "array";
const OBJECT_MARKER: &str = "object";

/// Reduce arbitrary JSON metadata to primitive values.
///
/// Fails on empty keys, reserved keys, and on a `<key>_type` entry that would
/// collide with a generated marker.
pub fn sanitize_metadata(input: &Map<String, Value>) -> Result<Metadata> {
    let mut out = Metadata::new();

    for (key, value) in input {
        if key.trim().is_empty() {
            return Err(MemoryError::validation("metadata keys must not be empty"));
        }
        if RESERVED_KEYS.contains(&key.as_str()) {
            return Err(MemoryError::validation(format!(
                "metadata key `{key}` is reserved"
            )));
        }

        let (sanitized, marker) = match value {
            Value::Null => (MetadataValue::Null, None),
            Value::Bool(b) => (MetadataValue::Bool(*b), None),
            Value::Number(n) => match n.as_f64() {
                Some(f) if f.is_finite() => (MetadataValue::Number(f), None),
                _ => {
                    return Err(MemoryError::validation(format!(
                        "metadata key `{key}` holds a number outside f64 range"
                    )))
                }
            },
            Value::String(s) => (MetadataValue::String(s.clone()), None),
            Value::Array(_) => (stringify(key, value)?, Some(ARRAY_MARKER)),
            Value::Object(_) => (stringify(key, value)?, Some(OBJECT_MARKER)),
        };

        if out.contains_key(key) {
            return Err(marker_collision(key));
        }
        out.insert(key.clone(), sanitized);

        if let Some(marker) = marker {
            let marker_key = format!("{key}{TYPE_SUFFIX}");
            if input.contains_key(&marker_key) || out.contains_key(&marker_key) {
                return Err(marker_collision(&marker_key));
            }
            out.insert(marker_key, MetadataValue::String(marker.to_string()));
        }
    }

    Ok(out)
}

/// Rebuild the JSON shape of sanitized metadata, consuming the type markers.
pub fn restore_metadata(metadata: &Metadata) -> Map<String, Value> {
    let mut out = Map::new();

    for (key, value) in metadata {
        if let Some(base) = key.strip_suffix(TYPE_SUFFIX) {
            if is_marker(value) && metadata.contains_key(base) {
                continue;
            }
        }

        let marker = metadata.get(&format!("{key}{TYPE_SUFFIX}"));
        let restored = match (value, marker) {
            (MetadataValue::String(raw), Some(m)) if is_marker(m) => {
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
            }
            _ => primitive_to_json(value),
        };
        out.insert(key.clone(), restored);
    }

    out
}

/// Convert sanitized metadata back to a flat JSON object (no reconstruction).
pub fn to_json(metadata: &Metadata) -> Map<String, Value> {
    metadata
        .iter()
        .map(|(k, v)| (k.clone(), primitive_to_json(v)))
        .collect()
}

fn primitive_to_json(value: &MetadataValue) -> Value {
    match value {
        MetadataValue::Null => Value::Null,
        MetadataValue::Bool(b) => Value::Bool(*b),
        MetadataValue::Number(n) => serde_json::Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        MetadataValue::String(s) => Value::String(s.clone()),
    }
}

fn is_marker(value: &MetadataValue) -> bool {
    matches!(value, MetadataValue::String(s) if s == ARRAY_MARKER || s == OBJECT_MARKER)
}

fn stringify(key: &str, value: &Value) -> Result<MetadataValue> {
    serde_json::to_string(value)
        .map(MetadataValue::String)
        .map_err(|e| MemoryError::validation(format!("metadata key `{key}`: {e}")))
}

fn marker_collision(key: &str) -> MemoryError {
    MemoryError::validation(format!(
        "metadata key `{key}` collides with a generated type marker"
    ))
}
