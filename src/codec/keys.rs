//! Stage one of the compact encoding: long field names to short aliases.
//!
//! A single table drives both directions. Unknown keys that would read back
//! as an alias (`v`, `ts`, ...) or that start with [`ESCAPE`] gain one
//! [`ESCAPE`] prefix on the way in and lose it on the way out, so
//! `expand_keys` is the exact inverse of `compress_keys` for every key,
//! including keys inside user-supplied values.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde_json::{Map, Value};

/// `(long, short)` pairs. Shorts never collide and are never longer than
/// the long name they replace.
pub const KEY_ALIASES: &[(&str, &str)] = &[
    // facts
    ("user_id", "uid"),
    ("category", "cat"),
    ("key", "k"),
    ("value", "v"),
    ("importance", "imp"),
    ("timestamp", "ts"),
    ("source", "src"),
    ("confidence", "conf"),
    ("tags", "tg"),
    // episodes
    ("episode_id", "eid"),
    ("episode_type", "et"),
    ("title", "ttl"),
    ("summary", "sum"),
    ("sentiment", "snt"),
    ("metadata", "md"),
    // affinity
    ("personality_name", "pn"),
    ("points", "pts"),
    ("level", "lvl"),
    ("last_interaction", "li"),
    ("interaction_type", "it"),
];

/// Marks an unknown key that must not be read back as an alias.
pub const ESCAPE: char = '~';

/// Bidirectional lookup over [`KEY_ALIASES`].
#[derive(Debug)]
pub struct KeyMapper {
    to_short: HashMap<&'static str, &'static str>,
    to_long: HashMap<&'static str, &'static str>,
}

static MAPPER: OnceLock<KeyMapper> = OnceLock::new();

impl KeyMapper {
    /// Process-wide mapper built once from [`KEY_ALIASES`].
    pub fn global() -> &'static KeyMapper {
        MAPPER.get_or_init(|| Self::from_table(KEY_ALIASES))
    }

    fn from_table(table: &[(&'static str, &'static str)]) -> Self {
        let mut to_short = HashMap::with_capacity(table.len());
        let mut to_long = HashMap::with_capacity(table.len());
        for &(long, short) in table {
            to_short.insert(long, short);
            to_long.insert(short, long);
        }
        Self { to_short, to_long }
    }

    /// Alias for a long key, if it has one.
    pub fn short_for(&self, long: &str) -> Option<&'static str> {
        self.to_short.get(long).copied()
    }

    /// Long key for an alias, if it is one.
    pub fn long_for(&self, short: &str) -> Option<&'static str> {
        self.to_long.get(short).copied()
    }

    /// Number of distinct aliases.
    pub fn len(&self) -> usize {
        self.to_long.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_long.is_empty()
    }

    fn compress_key(&self, key: &str) -> String {
        match self.short_for(key) {
            Some(short) => short.to_owned(),
            None if key.starts_with(ESCAPE) || self.long_for(key).is_some() => {
                format!("{ESCAPE}{key}")
            }
            None => key.to_owned(),
        }
    }

    fn expand_key(&self, key: &str) -> String {
        if let Some(escaped) = key.strip_prefix(ESCAPE) {
            return escaped.to_owned();
        }
        self.long_for(key).map_or_else(|| key.to_owned(), str::to_owned)
    }

    fn rename(&self, value: &Value, rename_key: &dyn Fn(&str) -> String) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (rename_key(k), self.rename(v, rename_key)))
                    .collect(),
            ),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.rename(v, rename_key)).collect())
            }
            other => other.clone(),
        }
    }
}

/// Rename known long keys to their aliases, recursing into nested maps and
/// element-wise into lists. Unknown keys pass through unchanged unless they
/// collide with an alias, in which case they are escaped.
pub fn compress_keys(value: &Value) -> Value {
    let mapper = KeyMapper::global();
    mapper.rename(value, &|k| mapper.compress_key(k))
}

/// Exact inverse of [`compress_keys`].
pub fn expand_keys(value: &Value) -> Value {
    let mapper = KeyMapper::global();
    mapper.rename(value, &|k| mapper.expand_key(k))
}

/// [`compress_keys`] specialised to a top-level record.
pub fn compress_record(record: &Map<String, Value>) -> Map<String, Value> {
    match compress_keys(&Value::Object(record.clone())) {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// [`expand_keys`] specialised to a top-level record.
pub fn expand_record(record: &Map<String, Value>) -> Map<String, Value> {
    match expand_keys(&Value::Object(record.clone())) {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
