//! Wire encoding for shared-tier payloads.
//!
//! Values are stored as JSON text. Reads are lenient: a payload that isn't
//! valid JSON (written by another producer, or truncated) comes back as a
//! plain string instead of failing the lookup.

use serde::Serialize;
use serde_json::Value;

/// Convert a caller value into the cache's value model.
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value, serde_json::Error> {
    serde_json::to_value(value)
}

pub fn encode(value: &Value) -> String {
    // Display for Value is infallible compact JSON.
    value.to_string()
}

pub fn decode(raw: String) -> Value {
    match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!(error = %e, "shared payload is not JSON, returning raw string");
            Value::String(raw)
        }
    }
}
