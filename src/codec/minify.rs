//! Stage three of the compact encoding: whitespace-free JSON text.

use serde_json::Value;

use super::CodecError;

/// Serialize with zero insignificant whitespace. Unicode is written as-is,
/// not `\u`-escaped.
pub fn minify(value: &Value) -> String {
    // Serializing a `Value` cannot fail: keys are always strings.
    serde_json::to_string(value).unwrap_or_default()
}

/// Parse text produced by [`minify`] (or any JSON text) back into a value.
pub fn parse_minified(text: &str) -> Result<Value, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::InvalidJson(e.to_string()))
}
