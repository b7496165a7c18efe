//! Construction-time schema probe for the SQLite adapter.
//!
//! Each table is inspected once with `PRAGMA table_info` / `index_list` /
//! `index_info`. The result is cached as a typed [`SqliteLayout`] and never
//! re-probed per call.

use std::collections::BTreeSet;

use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{KeySchemaOverride, SqliteConfig};
use crate::error::{MemoryError, Result};

pub(crate) const FACT_COLUMNS: &[&str] = &[
    "user_id",
    "category",
    "key",
    "confidence",
    "importance",
    "updated_at",
    "payload",
];
pub(crate) const FACT_IDENTITY: &[&str] = &["user_id", "category", "key"];

pub(crate) const EPISODE_COLUMNS: &[&str] = &[
    "id",
    "user_id",
    "episode_type",
    "importance",
    "occurred_at",
    "payload",
];
pub(crate) const EPISODE_IDENTITY: &[&str] = &["id"];

pub(crate) const AFFINITY_COLUMNS: &[&str] = &[
    "user_id",
    "personality_name",
    "points",
    "level",
    "last_interaction",
    "interaction_type",
];
pub(crate) const AFFINITY_IDENTITY: &[&str] = &["user_id", "personality_name"];

/// Column every user-scoped read filters on.
const USER_COLUMN: &str = "user_id";

/// Where a key schema came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    Probed,
    Explicit,
}

/// Addressing keys of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeySchema {
    pub partition_key: String,
    pub sort_key: Vec<String>,
    pub source: KeySource,
}

/// How user-scoped reads are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadStrategy {
    /// `WHERE user_id = ?` served by a key or index.
    Indexed,
    /// Full scan with the user filter applied in process.
    ScanAndFilter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableLayout {
    pub table: String,
    pub key: KeySchema,
    pub strategy: ReadStrategy,
}

/// Probed layout of the three memory tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SqliteLayout {
    pub facts: TableLayout,
    pub episodes: TableLayout,
    pub affinity: TableLayout,
}

impl SqliteLayout {
    pub fn probe(conn: &Connection, config: &SqliteConfig) -> Result<Self> {
        Ok(Self {
            facts: probe_table(
                conn,
                &config.facts_table,
                FACT_COLUMNS,
                FACT_IDENTITY,
                config.key_schema.get(&config.facts_table),
            )?,
            episodes: probe_table(
                conn,
                &config.episodes_table,
                EPISODE_COLUMNS,
                EPISODE_IDENTITY,
                config.key_schema.get(&config.episodes_table),
            )?,
            affinity: probe_table(
                conn,
                &config.affinity_table,
                AFFINITY_COLUMNS,
                AFFINITY_IDENTITY,
                config.key_schema.get(&config.affinity_table),
            )?,
        })
    }
}

struct ColumnInfo {
    name: String,
    /// 1-based position in the primary key, 0 if not part of it.
    pk: i64,
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<ColumnInfo>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{table}\")"))?;
    let rows = stmt.query_map([], |row| {
        Ok(ColumnInfo {
            name: row.get(1)?,
            pk: row.get(5)?,
        })
    })?;
    let mut columns = Vec::new();
    for r in rows {
        columns.push(r?);
    }
    Ok(columns)
}

/// `(unique, columns in index order)` for every index on `table`.
fn table_indexes(conn: &Connection, table: &str) -> Result<Vec<(bool, Vec<String>)>> {
    let mut stmt = conn.prepare(&format!("PRAGMA index_list(\"{table}\")"))?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(1)?, row.get::<_, bool>(2)?))
    })?;
    let mut names = Vec::new();
    for r in rows {
        names.push(r?);
    }

    let mut indexes = Vec::with_capacity(names.len());
    for (name, unique) in names {
        let mut stmt = conn.prepare(&format!("PRAGMA index_info(\"{name}\")"))?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(2)?)))?;
        let mut cols = Vec::new();
        for r in rows {
            cols.push(r?);
        }
        cols.sort_by_key(|(seq, _)| *seq);
        indexes.push((unique, cols.into_iter().map(|(_, c)| c).collect()));
    }
    Ok(indexes)
}

pub(crate) fn probe_table(
    conn: &Connection,
    table: &str,
    required: &[&str],
    identity: &[&str],
    explicit: Option<&KeySchemaOverride>,
) -> Result<TableLayout> {
    let columns = table_columns(conn, table)?;
    if columns.is_empty() {
        return Err(MemoryError::Configuration(format!(
            "table `{table}` does not exist; run migrations first"
        )));
    }
    let names: BTreeSet<&str> = columns.iter().map(|c| c.name.as_str()).collect();
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|c| !names.contains(c))
        .collect();
    if !missing.is_empty() {
        return Err(MemoryError::Configuration(format!(
            "table `{table}` is missing columns: {}",
            missing.join(", ")
        )));
    }

    if let Some(schema) = explicit {
        for column in std::iter::once(&schema.partition_key).chain(&schema.sort_key) {
            if !names.contains(column.as_str()) {
                return Err(MemoryError::Configuration(format!(
                    "key schema for `{table}` names unknown column `{column}`"
                )));
            }
        }
        let strategy = if schema.partition_key == USER_COLUMN {
            ReadStrategy::Indexed
        } else {
            ReadStrategy::ScanAndFilter
        };
        return Ok(finish(
            table,
            KeySchema {
                partition_key: schema.partition_key.clone(),
                sort_key: schema.sort_key.clone(),
                source: KeySource::Explicit,
            },
            strategy,
        ));
    }

    let mut pk: Vec<&ColumnInfo> = columns.iter().filter(|c| c.pk > 0).collect();
    pk.sort_by_key(|c| c.pk);
    let pk: Vec<String> = pk.into_iter().map(|c| c.name.clone()).collect();
    let indexes = table_indexes(conn, table)?;

    let wanted: BTreeSet<&str> = identity.iter().copied().collect();
    let same_set = |cols: &[String]| cols.iter().map(String::as_str).collect::<BTreeSet<_>>() == wanted;
    let identity_unique =
        same_set(&pk) || indexes.iter().any(|(unique, cols)| *unique && same_set(cols));
    if !identity_unique {
        return Err(MemoryError::Configuration(format!(
            "table `{table}` has no primary key or unique index on ({})",
            identity.join(", ")
        )));
    }

    let key = match pk.split_first() {
        Some((first, rest)) => KeySchema {
            partition_key: first.clone(),
            sort_key: rest.to_vec(),
            source: KeySource::Probed,
        },
        None => KeySchema {
            partition_key: "rowid".to_owned(),
            sort_key: Vec::new(),
            source: KeySource::Probed,
        },
    };

    let user_leading = pk.first().is_some_and(|c| c == USER_COLUMN)
        || indexes
            .iter()
            .any(|(_, cols)| cols.first().is_some_and(|c| c == USER_COLUMN));
    let strategy = if user_leading {
        ReadStrategy::Indexed
    } else {
        ReadStrategy::ScanAndFilter
    };
    Ok(finish(table, key, strategy))
}

fn finish(table: &str, key: KeySchema, strategy: ReadStrategy) -> TableLayout {
    match strategy {
        ReadStrategy::Indexed => debug!(table, ?key, "schema probed"),
        ReadStrategy::ScanAndFilter => warn!(
            table,
            partition_key = %key.partition_key,
            "no key or index leads with user_id; reads fall back to scan-and-filter (degraded performance)"
        ),
    }
    TableLayout {
        table: table.to_owned(),
        key,
        strategy,
    }
}
