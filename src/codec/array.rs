//! Stage two of the compact encoding: record to fixed positional array.
//!
//! Position order is part of the wire format and must never change:
//! `user_id, category, key, value, importance, timestamp, source,
//! confidence, tags`.

use serde_json::{Map, Value};

use super::CodecError;
use super::keys::KeyMapper;

/// Semantic fields in wire order.
pub const ARRAY_FIELDS: [&str; ARRAY_WIDTH] = [
    "user_id",
    "category",
    "key",
    "value",
    "importance",
    "timestamp",
    "source",
    "confidence",
    "tags",
];

pub const ARRAY_WIDTH: usize = 9;

const TAGS_POSITION: usize = 8;

/// What a position may legally hold on decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Text,
    Number,
    StringList,
    Any,
}

const SLOTS: [Slot; ARRAY_WIDTH] = [
    Slot::Text,
    Slot::Text,
    Slot::Text,
    Slot::Any,
    Slot::Number,
    Slot::Text,
    Slot::Text,
    Slot::Number,
    Slot::StringList,
];

/// Decode options for [`from_array`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArrayOptions {
    /// Write `null` positions back as explicit nulls instead of omitting them.
    pub preserve_nulls: bool,
}

/// Map a record to its positional array.
///
/// Each position is read from the field's alias first, then its long name,
/// so this accepts records before or after [`super::compress_keys`]. Absent
/// fields become `null`, except `tags` which defaults to an empty list.
pub fn to_array(record: &Map<String, Value>) -> Vec<Value> {
    let mapper = KeyMapper::global();
    ARRAY_FIELDS
        .iter()
        .enumerate()
        .map(|(pos, long)| {
            let found = mapper
                .short_for(long)
                .and_then(|short| record.get(short))
                .or_else(|| record.get(*long))
                .cloned();
            match found {
                Some(v) => v,
                None if pos == TAGS_POSITION => Value::Array(Vec::new()),
                None => Value::Null,
            }
        })
        .collect()
}

/// Inverse of [`to_array`]. Output keys are aliases.
///
/// Extra trailing elements are ignored; missing trailing positions are
/// treated as absent. A position holding the wrong JSON type is a
/// [`CodecError::MalformedField`].
pub fn from_array(values: &[Value], options: ArrayOptions) -> Result<Map<String, Value>, CodecError> {
    let mapper = KeyMapper::global();
    let mut record = Map::new();
    for (pos, long) in ARRAY_FIELDS.iter().enumerate() {
        let alias = mapper.short_for(long).unwrap_or(*long);
        let value = values.get(pos).unwrap_or(&Value::Null);
        if value.is_null() {
            if options.preserve_nulls {
                record.insert(alias.to_owned(), Value::Null);
            }
            continue;
        }
        check_slot(pos, value)?;
        record.insert(alias.to_owned(), value.clone());
    }
    Ok(record)
}

/// Element-wise [`to_array`].
pub fn to_array_batch(records: &[Map<String, Value>]) -> Vec<Vec<Value>> {
    records.iter().map(to_array).collect()
}

/// Element-wise [`from_array`]; fails on the first malformed element.
pub fn from_array_batch(
    arrays: &[Vec<Value>],
    options: ArrayOptions,
) -> Result<Vec<Map<String, Value>>, CodecError> {
    arrays.iter().map(|a| from_array(a, options)).collect()
}

fn check_slot(pos: usize, value: &Value) -> Result<(), CodecError> {
    let ok = match SLOTS[pos] {
        Slot::Text => value.is_string(),
        Slot::Number => value.is_number(),
        Slot::StringList => value
            .as_array()
            .is_some_and(|items| items.iter().all(Value::is_string)),
        Slot::Any => true,
    };
    if ok {
        return Ok(());
    }
    let expected = match SLOTS[pos] {
        Slot::Text => "string",
        Slot::Number => "number",
        Slot::StringList => "list of strings",
        Slot::Any => "any",
    };
    Err(CodecError::MalformedField {
        position: pos,
        field: ARRAY_FIELDS[pos],
        expected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn positions_follow_wire_order() {
        let r = record(json!({
            "tags": ["t"],
            "confidence": 0.9,
            "source": "chat",
            "timestamp": "2026-01-01T00:00:00Z",
            "importance": 3.5,
            "value": "Python",
            "key": "lang",
            "category": "preferences",
            "user_id": "u1"
        }));
        assert_eq!(
            to_array(&r),
            vec![
                json!("u1"),
                json!("preferences"),
                json!("lang"),
                json!("Python"),
                json!(3.5),
                json!("2026-01-01T00:00:00Z"),
                json!("chat"),
                json!(0.9),
                json!(["t"]),
            ]
        );
    }

    #[test]
    fn reads_aliases_as_well_as_long_names() {
        let long = record(json!({"user_id": "u1", "key": "lang"}));
        let short = record(json!({"uid": "u1", "k": "lang"}));
        assert_eq!(to_array(&long), to_array(&short));
    }

    #[test]
    fn absent_fields_become_null_and_tags_default_empty() {
        let arr = to_array(&record(json!({"user_id": "u1"})));
        assert_eq!(arr.len(), ARRAY_WIDTH);
        assert_eq!(arr[1], Value::Null);
        assert_eq!(arr[4], Value::Null);
        assert_eq!(arr[TAGS_POSITION], json!([]));
    }

    #[test]
    fn nulls_are_omitted_unless_preserved() {
        let arr = vec![json!("u1"), Value::Null, json!("k1")];
        let out = from_array(&arr, ArrayOptions::default()).expect("decode");
        assert_eq!(out, record(json!({"uid": "u1", "k": "k1"})));

        let kept = from_array(
            &arr,
            ArrayOptions {
                preserve_nulls: true,
            },
        )
        .expect("decode");
        assert_eq!(kept.len(), ARRAY_WIDTH);
        assert_eq!(kept.get("cat"), Some(&Value::Null));
    }

    #[test]
    fn extra_elements_are_ignored() {
        let mut arr = to_array(&record(json!({"user_id": "u1", "tags": []})));
        arr.push(json!("extra"));
        arr.push(json!(42));
        let out = from_array(&arr, ArrayOptions::default()).expect("decode");
        assert_eq!(out, record(json!({"uid": "u1", "tg": []})));
    }

    #[test]
    fn short_arrays_treat_missing_positions_as_absent() {
        let out = from_array(&[json!("u1")], ArrayOptions::default()).expect("decode");
        assert_eq!(out, record(json!({"uid": "u1"})));
        let empty = from_array(&[], ArrayOptions::default()).expect("decode");
        assert!(empty.is_empty());
    }

    #[test]
    fn wrong_type_in_position_is_rejected() {
        let err = from_array(&[json!(17)], ArrayOptions::default()).expect_err("number as user_id");
        assert!(matches!(
            err,
            CodecError::MalformedField {
                position: 0,
                field: "user_id",
                ..
            }
        ));

        let mut arr = to_array(&record(json!({"user_id": "u"})));
        arr[7] = json!("high");
        assert!(from_array(&arr, ArrayOptions::default()).is_err());

        arr[7] = json!(0.5);
        arr[8] = json!(["ok", 3]);
        assert!(from_array(&arr, ArrayOptions::default()).is_err());
    }

    #[test]
    fn value_position_accepts_any_json() {
        let r = record(json!({"user_id": "u", "value": {"nested": [1, null, true]}, "tags": []}));
        let out = from_array(&to_array(&r), ArrayOptions::default()).expect("decode");
        assert_eq!(out.get("v"), Some(&json!({"nested": [1, null, true]})));
    }

    #[test]
    fn batch_matches_scalar() {
        let records = vec![
            record(json!({"user_id": "a", "key": "x", "tags": ["1"]})),
            record(json!({"user_id": "b", "confidence": 0.1})),
            record(json!({})),
        ];
        let batch = to_array_batch(&records);
        let scalar: Vec<Vec<Value>> = records.iter().map(to_array).collect();
        assert_eq!(batch, scalar);

        let opts = ArrayOptions::default();
        let decoded = from_array_batch(&batch, opts).expect("batch decode");
        let scalar_decoded: Vec<_> = batch
            .iter()
            .map(|a| from_array(a, opts).expect("decode"))
            .collect();
        assert_eq!(decoded, scalar_decoded);
    }
}
