//! Recursive masking of sensitive fields.
//!
//! Matching is by key name only: a key is sensitive when its lowercase form
//! contains any configured term. Sequences carry no keys, so their elements
//! are recursed into wholesale. Scalars are never touched.

use serde_json::{Map, Value};

/// Replacement written in place of a sensitive value.
pub const REDACTED: &str = "[REDACTED]";

/// The set of sensitive key terms, matched case-insensitively as substrings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedactFields(Vec<String>);

impl RedactFields {
    pub fn new<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(terms.into_iter().map(|t| t.as_ref().to_lowercase()).collect())
    }

    /// Whether `key` names a sensitive field.
    pub fn matches(&self, key: &str) -> bool {
        let key = key.to_lowercase();
        self.0.iter().any(|term| key.contains(term.as_str()))
    }

    pub fn terms(&self) -> &[String] {
        &self.0
    }
}

impl Default for RedactFields {
    fn default() -> Self {
        Self::new(["password", "token", "authorization", "secret", "apikey", "api_key"])
    }
}

/// Returns a copy of `value` with every sensitive field masked, at any depth.
///
/// No cycle detection: a `Value` is a tree, so there is nothing to detect.
pub fn redact(value: &Value, fields: &RedactFields) -> Value {
    match value {
        Value::Object(map) => Value::Object(redact_map(map, fields)),
        Value::Array(items) => Value::Array(items.iter().map(|v| redact(v, fields)).collect()),
        scalar => scalar.clone(),
    }
}

pub fn redact_map(map: &Map<String, Value>, fields: &RedactFields) -> Map<String, Value> {
    map.iter()
        .map(|(key, value)| {
            let value = if fields.matches(key) {
                Value::String(REDACTED.to_owned())
            } else {
                redact(value, fields)
            };
            (key.clone(), value)
        })
        .collect()
}
