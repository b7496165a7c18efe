//! SQLite (`sqlite_flexible`) backend adapter.
//!
//! One connection per process, shared behind a `Mutex` and only ever used
//! from `spawn_blocking`, so no async task holds the lock across an await.
//! Table names come from configuration and are validated identifiers; the
//! key layout is probed once at construction (see [`super::schema`]).

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::{debug, info};

use crate::codec::CodecError;
use crate::config::{BackendKind, SqliteConfig};
use crate::error::{MemoryError, Result};
use crate::memory::backend::{MemoryBackend, call_deadline};
use crate::memory::schema::{ReadStrategy, SqliteLayout};
use crate::memory::types::{
    Affinity, AffinityLevel, Episode, Fact, FactCategory, format_timestamp, parse_timestamp,
};
use crate::migrations::MigrationManager;

/// Path value that opens a private in-memory database.
pub const IN_MEMORY_PATH: &str = ":memory:";

/// Lock wait used when the caller sets none.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Process-wide SQLite connection handle. Cheap to clone.
#[derive(Clone)]
pub struct SqliteHandle {
    conn: Arc<Mutex<Connection>>,
    busy_timeout: Duration,
}

impl SqliteHandle {
    /// Open (or create) the database at `path`, creating parent
    /// directories as needed.
    pub fn open(path: &Path, busy_timeout_ms: u64) -> Result<Self> {
        let conn = if path.as_os_str() == IN_MEMORY_PATH {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let conn = Connection::open(path).map_err(|e| {
                MemoryError::Configuration(format!("cannot open {}: {e}", path.display()))
            })?;
            let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
            debug!(path = %path.display(), journal_mode = %mode, "sqlite opened");
            conn
        };
        let busy_timeout = Duration::from_millis(busy_timeout_ms);
        conn.busy_timeout(busy_timeout)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            busy_timeout,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Wrap an open connection, setting its lock wait to
    /// [`DEFAULT_BUSY_TIMEOUT`].
    pub fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| MemoryError::Backend(format!("sqlite connection lock poisoned: {e}")))
    }

    /// Run `f` against the connection on the blocking pool.
    ///
    /// Inside a [`MemoryStore`](super::store::MemoryStore) call, `f` never
    /// starts after the call's deadline and waits on database locks no longer
    /// than the time left, so a call reported as timed out cannot commit
    /// afterwards.
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let handle = self.clone();
        let deadline = call_deadline();
        tokio::task::spawn_blocking(move || {
            let mut conn = handle.lock()?;
            let Some(deadline) = deadline else {
                return f(&mut *conn);
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!("sqlite work skipped: caller deadline already passed");
                return Err(MemoryError::Timeout {
                    operation: "sqlite",
                    after: Duration::ZERO,
                });
            }
            conn.busy_timeout(remaining.min(handle.busy_timeout))?;
            let result = f(&mut *conn);
            conn.busy_timeout(handle.busy_timeout)?;
            result
        })
        .await
        .map_err(|e| MemoryError::Backend(format!("sqlite task failed: {e}")))?
    }
}

/// Relational reference adapter.
pub struct SqliteBackend {
    handle: SqliteHandle,
    layout: Arc<SqliteLayout>,
}

impl SqliteBackend {
    /// Optionally migrate, then probe the configured tables.
    ///
    /// Missing or incomplete tables are a [`MemoryError::Configuration`].
    pub async fn new(handle: SqliteHandle, config: &SqliteConfig) -> Result<Self> {
        let config = config.clone();
        let layout = handle
            .run(move |conn| {
                if config.auto_migrate {
                    let plan = MigrationManager::new(conn).migrate(false, None)?;
                    if !plan.is_noop() {
                        info!(
                            from = plan.from_version,
                            to = plan.to_version,
                            "sqlite schema migrated"
                        );
                    }
                }
                SqliteLayout::probe(conn, &config)
            })
            .await?;
        Ok(Self {
            handle,
            layout: Arc::new(layout),
        })
    }

    pub fn layout(&self) -> &SqliteLayout {
        &self.layout
    }

    pub fn handle(&self) -> &SqliteHandle {
        &self.handle
    }
}

type AffinityRow = (String, String, i64, String, String);

fn affinity_from_row(row: AffinityRow) -> Result<Affinity> {
    let (user_id, personality_name, points, last_interaction, interaction_type) = row;
    let last_interaction =
        parse_timestamp(&last_interaction).map_err(|e| CodecError::InvalidValue {
            field: "last_interaction",
            reason: e.to_string(),
        })?;
    Ok(Affinity {
        user_id,
        personality_name,
        points,
        level: AffinityLevel::from_points(points),
        last_interaction,
        interaction_type,
    })
}

fn select_affinity(
    conn: &Connection,
    table: &str,
    user_id: &str,
    personality_name: &str,
) -> Result<Option<Affinity>> {
    let row: Option<AffinityRow> = conn
        .query_row(
            &format!(
                "SELECT user_id, personality_name, points, last_interaction, interaction_type \
                 FROM {table} WHERE user_id = ?1 AND personality_name = ?2"
            ),
            params![user_id, personality_name],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )
        .optional()?;
    row.map(affinity_from_row).transpose()
}

#[async_trait]
impl MemoryBackend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::SqliteFlexible
    }

    async fn put_fact(&self, fact: &Fact, payload: String) -> Result<()> {
        let table = self.layout.facts.table.clone();
        let user_id = fact.user_id.clone();
        let category = fact.category.as_str();
        let key = fact.key.clone();
        let confidence = fact.confidence;
        let importance = fact.importance;
        let updated_at = format_timestamp(&fact.timestamp);
        self.handle
            .run(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT OR REPLACE INTO {table} \
                         (user_id, category, key, confidence, importance, updated_at, payload) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
                    ),
                    params![user_id, category, key, confidence, importance, updated_at, payload],
                )?;
                Ok(())
            })
            .await
    }

    async fn list_facts(
        &self,
        user_id: &str,
        category: Option<FactCategory>,
    ) -> Result<Vec<String>> {
        let layout = self.layout.clone();
        let user_id = user_id.to_owned();
        let category = category.map(FactCategory::as_str);
        self.handle
            .run(move |conn| {
                let table = &layout.facts.table;
                let mut payloads = Vec::new();
                match layout.facts.strategy {
                    ReadStrategy::Indexed => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT payload FROM {table} \
                             WHERE user_id = ?1 AND (?2 IS NULL OR category = ?2) \
                             ORDER BY category, key"
                        ))?;
                        let rows = stmt.query_map(params![user_id, category], |row| row.get(0))?;
                        for r in rows {
                            payloads.push(r?);
                        }
                    }
                    ReadStrategy::ScanAndFilter => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT user_id, category, payload FROM {table}"
                        ))?;
                        let rows = stmt.query_map([], |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, String>(2)?,
                            ))
                        })?;
                        for r in rows {
                            let (uid, cat, payload) = r?;
                            if uid == user_id && category.is_none_or(|c| c == cat) {
                                payloads.push(payload);
                            }
                        }
                    }
                }
                Ok(payloads)
            })
            .await
    }

    async fn remove_fact(&self, user_id: &str, category: FactCategory, key: &str) -> Result<bool> {
        let table = self.layout.facts.table.clone();
        let user_id = user_id.to_owned();
        let key = key.to_owned();
        self.handle
            .run(move |conn| {
                let removed = conn.execute(
                    &format!("DELETE FROM {table} WHERE user_id = ?1 AND category = ?2 AND key = ?3"),
                    params![user_id, category.as_str(), key],
                )?;
                Ok(removed > 0)
            })
            .await
    }

    async fn put_episode(&self, episode: &Episode, payload: String) -> Result<()> {
        let table = self.layout.episodes.table.clone();
        let id = episode.id.clone();
        let user_id = episode.user_id.clone();
        let episode_type = episode.episode_type.as_str();
        let importance = episode.importance;
        let occurred_at = format_timestamp(&episode.timestamp);
        self.handle
            .run(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO {table} \
                         (id, user_id, episode_type, importance, occurred_at, payload) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
                    ),
                    params![id, user_id, episode_type, importance, occurred_at, payload],
                )?;
                Ok(())
            })
            .await
    }

    async fn list_episodes(
        &self,
        user_id: &str,
        min_importance: Option<f64>,
    ) -> Result<Vec<String>> {
        let layout = self.layout.clone();
        let user_id = user_id.to_owned();
        self.handle
            .run(move |conn| {
                let table = &layout.episodes.table;
                let mut payloads = Vec::new();
                match layout.episodes.strategy {
                    ReadStrategy::Indexed => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT payload FROM {table} \
                             WHERE user_id = ?1 AND (?2 IS NULL OR importance >= ?2) \
                             ORDER BY occurred_at, id"
                        ))?;
                        let rows =
                            stmt.query_map(params![user_id, min_importance], |row| row.get(0))?;
                        for r in rows {
                            payloads.push(r?);
                        }
                    }
                    ReadStrategy::ScanAndFilter => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT user_id, importance, payload FROM {table}"
                        ))?;
                        let rows = stmt.query_map([], |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, f64>(1)?,
                                row.get::<_, String>(2)?,
                            ))
                        })?;
                        for r in rows {
                            let (uid, importance, payload) = r?;
                            if uid == user_id && min_importance.is_none_or(|m| importance >= m) {
                                payloads.push(payload);
                            }
                        }
                    }
                }
                Ok(payloads)
            })
            .await
    }

    async fn delete_episodes_before(
        &self,
        user_id: Option<&str>,
        cutoff: DateTime<Utc>,
    ) -> Result<usize> {
        let table = self.layout.episodes.table.clone();
        let user_id = user_id.map(str::to_owned);
        let cutoff = format_timestamp(&cutoff);
        self.handle
            .run(move |conn| {
                let removed = conn.execute(
                    &format!(
                        "DELETE FROM {table} WHERE occurred_at < ?1 AND (?2 IS NULL OR user_id = ?2)"
                    ),
                    params![cutoff, user_id],
                )?;
                Ok(removed)
            })
            .await
    }

    async fn add_affinity_points(
        &self,
        user_id: &str,
        personality_name: &str,
        delta: i64,
        interaction_type: &str,
        at: DateTime<Utc>,
    ) -> Result<Affinity> {
        let table = self.layout.affinity.table.clone();
        let user_id = user_id.to_owned();
        let personality_name = personality_name.to_owned();
        let interaction_type = interaction_type.to_owned();
        self.handle
            .run(move |conn| {
                // IMMEDIATE takes the write lock up front, so concurrent
                // writers in other processes serialize on the busy timeout.
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let previous = select_affinity(&tx, &table, &user_id, &personality_name)?;
                let next = Affinity::accumulate(
                    previous.as_ref(),
                    &user_id,
                    &personality_name,
                    delta,
                    &interaction_type,
                    at,
                );
                tx.execute(
                    &format!(
                        "INSERT OR REPLACE INTO {table} \
                         (user_id, personality_name, points, level, last_interaction, interaction_type) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
                    ),
                    params![
                        next.user_id,
                        next.personality_name,
                        next.points,
                        next.level.as_str(),
                        format_timestamp(&next.last_interaction),
                        next.interaction_type,
                    ],
                )?;
                tx.commit()?;
                Ok(next)
            })
            .await
    }

    async fn get_affinity(
        &self,
        user_id: &str,
        personality_name: &str,
    ) -> Result<Option<Affinity>> {
        let table = self.layout.affinity.table.clone();
        let user_id = user_id.to_owned();
        let personality_name = personality_name.to_owned();
        self.handle
            .run(move |conn| select_affinity(conn, &table, &user_id, &personality_name))
            .await
    }
}
