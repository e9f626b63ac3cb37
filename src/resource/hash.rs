//! Canonical hashing of source and params maps
//!
//! Maps are serialized with keys in byte order at every depth and without
//! whitespace, then digested with SHA-256. A missing map and an empty map
//! produce the same digest.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Resource source configuration as supplied by a pipeline
pub type Source = Map<String, Value>;

/// Fetch parameters for a get step
pub type Params = Map<String, Value>;

/// Resolved resource version
pub type Version = BTreeMap<String, String>;

/// Rebuild `value` with every object's keys in sorted order
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Canonical JSON text for an optional map
pub fn canonical_json(map: Option<&Map<String, Value>>) -> String {
    let value = match map {
        Some(map) => canonicalize(&Value::Object(map.clone())),
        None => Value::Object(Map::new()),
    };
    // Serializing a Value cannot fail: all keys are strings
    serde_json::to_string(&value).unwrap_or_else(|_| "{}".to_string())
}

/// SHA-256 hex digest of the canonical JSON of `map`
pub fn map_hash(map: Option<&Map<String, Value>>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(map).as_bytes());
    hex::encode(hasher.finalize())
}

/// Canonical text stored for a version
pub fn version_json(version: &Version) -> String {
    serde_json::to_string(version).unwrap_or_else(|_| "{}".to_string())
}
