//! Reversible compact encoding for memory records.
//!
//! Three stages, each independently invertible:
//! - `keys`: long field names to short aliases (`user_id` -> `uid`).
//! - `array`: fact records to a fixed 9-position array.
//! - `minify`: whitespace-free JSON text.
//!
//! The canonical compact wire form of a fact is
//! `minify(to_array(compress_keys(record)))`. [`decode_record`] accepts that
//! form, a key-aliased object, or a plain full-key object, so data written
//! with compaction on or off stays readable after the setting flips.

pub mod array;
pub mod keys;
pub mod minify;
pub mod stats;

use serde_json::{Map, Value};

use crate::config::OptimizationConfig;

pub use array::{
    ARRAY_FIELDS, ARRAY_WIDTH, ArrayOptions, from_array, from_array_batch, to_array,
    to_array_batch,
};
pub use keys::{ESCAPE, KEY_ALIASES, KeyMapper, compress_keys, compress_record, expand_keys, expand_record};
pub use minify::{minify, parse_minified};
pub use stats::{SizeReduction, get_size_reduction};

/// Malformed wire input. Decoding fails closed: nothing is partially
/// returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Not valid JSON text.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// Valid JSON, but neither an array nor an object at the top level.
    #[error("expected a JSON array or object at the top level, found {0}")]
    UnexpectedTopLevel(&'static str),

    /// A positional array element has the wrong JSON type.
    #[error("position {position} ({field}) must be a {expected}")]
    MalformedField {
        position: usize,
        field: &'static str,
        expected: &'static str,
    },

    /// A decoded record lacks a required field.
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// A decoded field has an unusable value.
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

const PLAIN_MARKER: &str = "user_id";

/// True iff optimization is enabled and `record` has at least
/// `min_fields_for_compression` non-null fields.
pub fn should_compress(record: &Map<String, Value>, config: &OptimizationConfig) -> bool {
    if !config.enabled {
        return false;
    }
    let populated = record.values().filter(|v| !v.is_null()).count();
    populated >= config.min_fields_for_compression
}

/// Canonical positional wire form of a fact record.
pub fn encode_compact(record: &Map<String, Value>) -> String {
    minify(&Value::Array(to_array(&compress_record(record))))
}

/// Key-aliased object wire form, for records outside the fact tuple.
pub fn encode_compact_object(record: &Map<String, Value>) -> String {
    minify(&Value::Object(compress_record(record)))
}

/// Full-key object wire form.
pub fn encode_plain(record: &Map<String, Value>) -> String {
    minify(&Value::Object(record.clone()))
}

/// Decode any accepted wire form back to a full-key record.
///
/// Every record carries `user_id`, so an object holding that key is in the
/// plain form and is returned as stored; any other object is key-aliased.
pub fn decode_record(wire: &str, options: ArrayOptions) -> Result<Map<String, Value>, CodecError> {
    match parse_minified(wire)? {
        Value::Array(items) => Ok(expand_record(&from_array(&items, options)?)),
        Value::Object(map) if map.contains_key(PLAIN_MARKER) => Ok(map),
        Value::Object(map) => Ok(expand_record(&map)),
        Value::Null => Err(CodecError::UnexpectedTopLevel("null")),
        Value::Bool(_) => Err(CodecError::UnexpectedTopLevel("boolean")),
        Value::Number(_) => Err(CodecError::UnexpectedTopLevel("number")),
        Value::String(_) => Err(CodecError::UnexpectedTopLevel("string")),
    }
}
