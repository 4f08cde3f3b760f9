//! JSON helpers: recursive merge and canonical encoding

use serde_json::{Map, Value};

use crate::types::StateData;

/// Recursively merge `source` into `target`
///
/// Nested objects are merged key by key; any other collision is won by
/// `source`.
pub fn deep_merge(target: &mut StateData, source: &StateData) {
    for (key, incoming) in source {
        match (target.get_mut(key), incoming) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), incoming.clone());
            }
        }
    }
}

/// Canonical JSON bytes: object keys sorted recursively, no whitespace
///
/// Checksums are computed over this encoding so that two equal states hash
/// identically regardless of map insertion order.
pub fn canonical_json_bytes(value: &Value) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&canon_value(value))
}

fn canon_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canon_value(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canon_value).collect()),
        other => other.clone(),
    }
}
