//! Boundary between opaque job values and their stored text form.

use serde_json::{Map, Value};

use crate::error::Result;

/// Encodes and decodes the opaque `args`, `kwargs` and result payloads.
///
/// The scheduler never looks inside these values; it only round-trips them
/// between the store and the invoked function.
pub trait ArgCodec: Send + Sync {
    fn encode_args(&self, args: &[Value]) -> Result<String>;
    fn decode_args(&self, raw: &str) -> Result<Vec<Value>>;
    fn encode_kwargs(&self, kwargs: &Map<String, Value>) -> Result<String>;
    fn decode_kwargs(&self, raw: &str) -> Result<Map<String, Value>>;
    fn encode_value(&self, value: &Value) -> Result<String>;
    fn decode_value(&self, raw: &str) -> Result<Value>;
}

/// JSON text codec. Empty text and `null` decode to empty args/kwargs.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl ArgCodec for JsonCodec {
    fn encode_args(&self, args: &[Value]) -> Result<String> {
        Ok(serde_json::to_string(args)?)
    }

    fn decode_args(&self, raw: &str) -> Result<Vec<Value>> {
        match serde_json::from_str::<Option<Vec<Value>>>(non_empty(raw))? {
            Some(args) => Ok(args),
            None => Ok(Vec::new()),
        }
    }

    fn encode_kwargs(&self, kwargs: &Map<String, Value>) -> Result<String> {
        Ok(serde_json::to_string(kwargs)?)
    }

    fn decode_kwargs(&self, raw: &str) -> Result<Map<String, Value>> {
        Ok(serde_json::from_str::<Option<Map<String, Value>>>(non_empty(raw))?.unwrap_or_default())
    }

    fn encode_value(&self, value: &Value) -> Result<String> {
        Ok(serde_json::to_string(value)?)
    }

    fn decode_value(&self, raw: &str) -> Result<Value> {
        Ok(serde_json::from_str(raw)?)
    }
}

fn non_empty(raw: &str) -> &str {
    if raw.trim().is_empty() {
        "null"
    } else {
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn blank_and_null_decode_to_empty() {
        let codec = JsonCodec;
        assert!(codec.decode_args("").unwrap().is_empty());
        assert!(codec.decode_args("null").unwrap().is_empty());
        assert!(codec.decode_kwargs("  ").unwrap().is_empty());
        assert!(codec.decode_kwargs("null").unwrap().is_empty());
    }

    #[test]
    fn nested_values_survive() {
        let codec = JsonCodec;
        let args = vec![json!({"to": ["a@example.com"], "retries": 3}), json!(null)];
        let raw = codec.encode_args(&args).unwrap();
        assert_eq!(codec.decode_args(&raw).unwrap(), args);
    }

    #[test]
    fn kwargs_must_be_an_object() {
        assert!(JsonCodec.decode_kwargs("[1,2]").is_err());
    }
}
