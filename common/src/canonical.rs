//! Canonical-JSON serialization: object keys sorted, no insignificant
//! whitespace, so that two semantically-equal documents hash identically.

use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

/// Serializes `value` to its canonical JSON byte representation: object keys
/// sorted lexicographically at every level, arrays left in order, and no
/// extra whitespace.
///
/// # Errors
///
/// Returns an error if `value` cannot be serialized to JSON at all.
pub fn canonicalize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let json = serde_json::to_value(value)?;
    let sorted = sort_keys(json);
    Ok(serde_json::to_vec(&sorted)?)
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(String, Value)> =
                map.into_iter().map(|(k, v)| (k, sort_keys(v))).collect();
            sorted.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}
