//! Size accounting for the compact encoding. Informational only.

use serde::Serialize;
use serde_json::{Map, Value};

use super::{encode_compact, minify};

/// Before/after byte counts for one record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SizeReduction {
    /// Bytes of the full-key JSON object.
    pub original_size: usize,
    /// Bytes of the wire form.
    pub encoded_size: usize,
    /// `original_size - encoded_size`; negative when encoding grew the record.
    pub reduction_bytes: i64,
    /// Reduction as a percentage of `original_size`, `0.0` for empty input.
    pub reduction_percent: f64,
}

/// Compare a record's plain JSON size with `wire`, or with its canonical
/// compact encoding when no wire form is given.
pub fn get_size_reduction(record: &Map<String, Value>, wire: Option<&str>) -> SizeReduction {
    let original_size = minify(&Value::Object(record.clone())).len();
    let encoded_size = match wire {
        Some(w) => w.len(),
        None => encode_compact(record).len(),
    };
    let reduction_bytes = original_size as i64 - encoded_size as i64;
    let reduction_percent = if original_size == 0 {
        0.0
    } else {
        reduction_bytes as f64 * 100.0 / original_size as f64
    };
    SizeReduction {
        original_size,
        encoded_size,
        reduction_bytes,
        reduction_percent,
    }
}
