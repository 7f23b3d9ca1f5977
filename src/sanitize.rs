//! Property-bag validation.
//!
//! Props cross into the sandbox as JSON and are parsed there, so keys that
//! reach `Object.prototype` through assignment (`__proto__`, `constructor`,
//! `prototype`) are refused, as are pathologically deep values.

use serde_json::{Map, Value};
use thiserror::Error;

/// Maximum nesting depth of objects and arrays.
pub const MAX_DEPTH: usize = 32;

/// Keys that could be used for prototype pollution.
const DANGEROUS_KEYS: &[&str] = &["__proto__", "constructor", "prototype"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SanitizeError {
    #[error("Props must be a JSON object")]
    NotAnObject,

    #[error("Prototype pollution attempt: '{0}' key is forbidden in props")]
    ForbiddenKey(String),

    #[error("Props nesting too deep (max {} levels)", MAX_DEPTH)]
    TooDeep,
}

/// Validate a property bag: a JSON object free of dangerous keys and
/// nested at most [`MAX_DEPTH`] levels. `null` is treated as `{}`.
pub fn sanitize_props(value: Value) -> Result<Value, SanitizeError> {
    match value {
        Value::Null => Ok(Value::Object(Map::new())),
        Value::Object(_) => sanitize_recursive(value, 0),
        _ => Err(SanitizeError::NotAnObject),
    }
}

fn sanitize_recursive(value: Value, depth: usize) -> Result<Value, SanitizeError> {
    if depth > MAX_DEPTH {
        return Err(SanitizeError::TooDeep);
    }

    match value {
        Value::Object(map) => {
            if let Some(key) = map.keys().find(|k| DANGEROUS_KEYS.contains(&k.as_str())) {
                return Err(SanitizeError::ForbiddenKey(key.clone()));
            }
            map.into_iter()
                .map(|(key, val)| Ok((key, sanitize_recursive(val, depth + 1)?)))
                .collect::<Result<Map<_, _>, _>>()
                .map(Value::Object)
        }
        Value::Array(items) => items
            .into_iter()
            .map(|v| sanitize_recursive(v, depth + 1))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other),
    }
}
