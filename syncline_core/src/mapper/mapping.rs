//! Declarative field mappings from a raw connector payload to a unified record.
//!
//! A `FieldMapping` is a table of `unified_field -> fn(&raw) -> Value`. The
//! helpers below never fail: a missing or mistyped source field becomes
//! `null`, which keeps every mapping total over its raw schema.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::sync::Arc;

pub type FieldFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

#[derive(Clone, Default)]
pub struct FieldMapping {
    fields: Vec<(String, FieldFn)>,
}

impl std::fmt::Debug for FieldMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.fields.iter().map(|(name, _)| name))
            .finish()
    }
}

impl FieldMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `name` with an arbitrary function of the raw payload.
    /// Declaring the same field twice replaces the earlier function.
    pub fn field<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        let name = name.into();
        self.fields.retain(|(existing, _)| existing != &name);
        self.fields.push((name, Arc::new(f)));
        self
    }

    /// Map `name` to the value at a dotted `path` (`properties.email`, `lines.0.amount`).
    pub fn path(self, name: impl Into<String>, path: &'static str) -> Self {
        self.field(name, move |raw| pluck(raw, path))
    }

    pub fn constant(self, name: impl Into<String>, value: Value) -> Self {
        self.field(name, move |_| value.clone())
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|(n, _)| n == name)
    }

    /// Build the unified object. Every declared field is present.
    pub fn apply(&self, raw: &Value) -> Value {
        let mut out = serde_json::Map::with_capacity(self.fields.len());
        for (name, f) in &self.fields {
            out.insert(name.clone(), f(raw));
        }
        Value::Object(out)
    }
}

/// Walk a dotted path through objects and arrays.
pub fn get_path<'a>(raw: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = raw;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        cur = match cur {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

/// Cloned value at `path`, or `null`.
pub fn pluck(raw: &Value, path: &str) -> Value {
    get_path(raw, path).cloned().unwrap_or(Value::Null)
}

/// First non-null, non-empty-string value among `paths`.
pub fn first_of(raw: &Value, paths: &[&str]) -> Value {
    paths
        .iter()
        .filter_map(|p| get_path(raw, p))
        .find(|v| !v.is_null() && v.as_str() != Some(""))
        .cloned()
        .unwrap_or(Value::Null)
}

/// Coerce numbers and numeric strings to a JSON number.
pub fn as_number(value: &Value) -> Value {
    match value {
        Value::Number(_) => value.clone(),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(n) = s.parse::<i64>() {
                Value::from(n)
            } else if let Ok(f) = s.parse::<f64>() {
                serde_json::Number::from_f64(f)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            } else {
                Value::Null
            }
        }
        _ => Value::Null,
    }
}

/// Coerce scalars to a string; objects, arrays and null become `null`.
pub fn as_string(value: &Value) -> Value {
    match value {
        Value::String(_) => value.clone(),
        Value::Number(n) => Value::String(n.to_string()),
        Value::Bool(b) => Value::String(b.to_string()),
        _ => Value::Null,
    }
}

pub fn as_bool(value: &Value) -> Value {
    match value {
        Value::Bool(_) => value.clone(),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Value::Bool(true),
            "false" | "0" | "no" => Value::Bool(false),
            _ => Value::Null,
        },
        Value::Number(n) => n.as_i64().map(|n| Value::Bool(n != 0)).unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

/// Normalize epoch milliseconds or an RFC 3339 string to RFC 3339 (UTC).
pub fn as_timestamp(value: &Value) -> Value {
    let parsed: Option<DateTime<Utc>> = match value {
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(ms) = s.parse::<i64>() {
                Utc.timestamp_millis_opt(ms).single()
            } else {
                DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            }
        }
        _ => None,
    };
    parsed
        .map(|dt| Value::String(dt.to_rfc3339()))
        .unwrap_or(Value::Null)
}
