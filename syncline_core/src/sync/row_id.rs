//! Content-derived row identity for sources without a natural id.

use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Serialize `value` with object keys sorted at every depth.
pub fn stable_stringify(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_stable(value, &mut out);
    out
}

fn write_stable(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String(key.clone()).to_string());
                out.push(':');
                write_stable(&map[key], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_stable(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Deterministic id for a record: hex SHA-256 of its stable serialization.
pub fn row_id(value: &serde_json::Value) -> String {
    let digest = Sha256::digest(stable_stringify(value).as_bytes());
    hex::encode(digest)
}

/// Assigns row ids within one run.
///
/// The first occurrence of a content hash gets the bare hash; later
/// occurrences in the same run get `<hash>-1`, `<hash>-2`, ... so identical
/// rows that are genuinely distinct are never collapsed into one. Replaying the
/// same rows in the same order yields the same ids.
#[derive(Debug, Default)]
pub struct RowIdAssigner {
    seen: HashMap<String, u32>,
}

impl RowIdAssigner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&mut self, value: &serde_json::Value) -> String {
        let base = row_id(value);
        let count = self.seen.entry(base.clone()).or_insert(0);
        let id = if *count == 0 {
            base
        } else {
            format!("{base}-{count}")
        };
        *count += 1;
        id
    }
}
