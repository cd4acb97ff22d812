use crate::ModelError;
use serde_json::{Map, Value};

/// A decoded secret payload: a JSON object of arbitrary string-keyed values.
pub type Secrets = Map<String, Value>;

/// Decode raw request parameters into a secrets object.
///
/// Anything other than a JSON object (including an empty body or `null`) is
/// rejected before any store write happens.
pub fn decode_secrets(raw: &[u8]) -> Result<Secrets, ModelError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err(ModelError::InvalidParameters(
            "parameters are required and must be a JSON object of secrets".to_owned(),
        ));
    }
    let value: Value = serde_json::from_slice(raw)
        .map_err(|e| ModelError::InvalidParameters(format!("parameters are not valid JSON: {e}")))?;
    match value {
        Value::Object(map) => Ok(map),
        other => Err(ModelError::InvalidParameters(format!(
            "parameters must be a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
