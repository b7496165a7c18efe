//! Versioned, rollback-capable schema migrations for the SQLite backend.
//!
//! The applied version is tracked in a `schema_migrations` ledger, one row
//! per applied migration. Each migration runs in its own transaction, so a
//! failing script leaves neither partial DDL nor a ledger row behind.

pub mod backup;
pub mod catalog;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{MemoryError, Result};
use crate::memory::types::{format_timestamp, now, parse_timestamp};

pub use backup::{backup_database, rotate_backups};
pub use catalog::{Migration, OwnedObjects, builtin_migrations};

/// Ledger table name.
pub const LEDGER_TABLE: &str = "schema_migrations";

const LEDGER_DDL: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    version     INTEGER PRIMARY KEY,
    name        TEXT NOT NULL,
    applied_at  TEXT NOT NULL
)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
}

/// One migration applied (or, in a dry run, that would be applied).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStep {
    pub version: u32,
    pub name: String,
    pub direction: Direction,
    pub statements: Vec<String>,
}

/// What a `migrate` or `rollback` call did or would do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationPlan {
    pub from_version: u32,
    pub to_version: u32,
    pub dry_run: bool,
    pub steps: Vec<MigrationStep>,
}

impl MigrationPlan {
    pub fn is_noop(&self) -> bool {
        self.steps.is_empty()
    }
}

/// A ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMigration {
    pub version: u32,
    pub name: String,
    pub applied_at: DateTime<Utc>,
}

/// Applies and rolls back migrations against one connection.
pub struct MigrationManager<'a> {
    conn: &'a Connection,
    migrations: Vec<Migration>,
}

impl<'a> MigrationManager<'a> {
    /// Manager over the embedded catalog.
    pub fn new(conn: &'a Connection) -> Self {
        Self {
            conn,
            migrations: builtin_migrations(),
        }
    }

    /// Manager over a custom catalog, e.g. from [`Migration::load_dir`].
    pub fn with_migrations(conn: &'a Connection, mut migrations: Vec<Migration>) -> Result<Self> {
        migrations.sort_by_key(|m| m.version);
        catalog::validate_catalog(&migrations)?;
        Ok(Self { conn, migrations })
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Highest known version, 0 for an empty catalog.
    pub fn latest_version(&self) -> u32 {
        self.migrations.last().map_or(0, |m| m.version)
    }

    /// Max version in the ledger. Creates the ledger on first use.
    pub fn get_current_version(&self) -> Result<u32> {
        self.ensure_ledger()?;
        self.read_version()
    }

    /// Known migrations newer than the current version, ascending.
    pub fn get_pending_migrations(&self) -> Result<Vec<&Migration>> {
        let current = self.get_current_version()?;
        Ok(self.pending_after(current))
    }

    /// Ledger rows, oldest first.
    pub fn get_migration_history(&self) -> Result<Vec<AppliedMigration>> {
        self.ensure_ledger()?;
        let mut stmt = self.conn.prepare(
            "SELECT version, name, applied_at FROM schema_migrations ORDER BY version ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, u32>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut history = Vec::new();
        for r in rows {
            let (version, name, applied_at) = r?;
            let applied_at = parse_timestamp(&applied_at).map_err(|e| {
                MemoryError::Migration(format!(
                    "ledger row {version} has unreadable applied_at `{applied_at}`: {e}"
                ))
            })?;
            history.push(AppliedMigration {
                version,
                name,
                applied_at,
            });
        }
        Ok(history)
    }

    /// Apply pending migrations up to `target` (latest when `None`).
    ///
    /// Already at `target` is a no-op. With `dry_run` nothing is written,
    /// not even the ledger table.
    pub fn migrate(&self, dry_run: bool, target: Option<u32>) -> Result<MigrationPlan> {
        let target = target.unwrap_or_else(|| self.latest_version());
        if target > self.latest_version() {
            return Err(MemoryError::Migration(format!(
                "target version {target} is beyond the latest known migration {}",
                self.latest_version()
            )));
        }

        let current = if dry_run {
            self.read_version_if_ledger_exists()?
        } else {
            self.get_current_version()?
        };
        if target < current {
            return Err(MemoryError::Migration(format!(
                "target version {target} is below current version {current}; use rollback"
            )));
        }

        let steps: Vec<MigrationStep> = self
            .pending_after(current)
            .into_iter()
            .filter(|m| m.version <= target)
            .map(|m| MigrationStep {
                version: m.version,
                name: m.name.clone(),
                direction: Direction::Up,
                statements: m.up_statements(),
            })
            .collect();

        let mut reached = current;
        for (step, migration) in steps.iter().zip(self.pending_after(current)) {
            if dry_run {
                for sql in &step.statements {
                    info!(version = step.version, sql = %sql, "dry run: would apply");
                }
            } else {
                self.apply(migration, Direction::Up)?;
            }
            reached = step.version;
        }

        Ok(MigrationPlan {
            from_version: current,
            to_version: reached,
            dry_run,
            steps,
        })
    }

    /// Roll back applied migrations, newest first, until the ledger's max
    /// version is `target`.
    pub fn rollback(&self, target: u32, dry_run: bool) -> Result<MigrationPlan> {
        let applied: Vec<u32> = if dry_run && !self.ledger_exists()? {
            Vec::new()
        } else {
            self.get_migration_history()?
                .into_iter()
                .map(|a| a.version)
                .collect()
        };
        let current = applied.last().copied().unwrap_or(0);

        let by_version: BTreeMap<u32, &Migration> =
            self.migrations.iter().map(|m| (m.version, m)).collect();
        let mut to_undo = Vec::new();
        for version in applied.iter().rev().copied().filter(|v| *v > target) {
            let migration = by_version.get(&version).copied().ok_or_else(|| {
                MemoryError::Migration(format!(
                    "ledger has version {version} but no such migration is known"
                ))
            })?;
            to_undo.push(migration);
        }

        let mut reached = current;
        let mut steps = Vec::with_capacity(to_undo.len());
        for migration in to_undo {
            let step = MigrationStep {
                version: migration.version,
                name: migration.name.clone(),
                direction: Direction::Down,
                statements: migration.down_statements(),
            };
            if dry_run {
                for sql in &step.statements {
                    info!(version = step.version, sql = %sql, "dry run: would roll back");
                }
            } else {
                self.apply(migration, Direction::Down)?;
            }
            reached = applied
                .iter()
                .copied()
                .filter(|v| *v < migration.version)
                .max()
                .unwrap_or(0);
            steps.push(step);
        }

        Ok(MigrationPlan {
            from_version: current,
            to_version: reached,
            dry_run,
            steps,
        })
    }

    fn pending_after(&self, current: u32) -> Vec<&Migration> {
        self.migrations
            .iter()
            .filter(|m| m.version > current)
            .collect()
    }

    fn ensure_ledger(&self) -> Result<()> {
        self.conn.execute_batch(LEDGER_DDL)?;
        Ok(())
    }

    fn ledger_exists(&self) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![LEDGER_TABLE],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn read_version(&self) -> Result<u32> {
        let version: Option<u32> = self.conn.query_row(
            "SELECT MAX(version) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;
        Ok(version.unwrap_or(0))
    }

    fn read_version_if_ledger_exists(&self) -> Result<u32> {
        if self.ledger_exists()? {
            self.read_version()
        } else {
            Ok(0)
        }
    }

    /// Run one script inside an immediate transaction, with the scope guard
    /// and the ledger update in the same unit.
    fn apply(&self, migration: &Migration, direction: Direction) -> Result<()> {
        let fail = |e: &dyn std::fmt::Display| {
            MemoryError::Migration(format!(
                "migration {} ({direction:?}) failed: {e}",
                migration.id()
            ))
        };

        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)
            .map_err(|e| fail(&e))?;

        // Another process may have moved the ledger since we planned.
        let recorded: Option<u32> = tx
            .query_row(
                "SELECT version FROM schema_migrations WHERE version = ?1",
                params![migration.version],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| fail(&e))?;
        let already = recorded.is_some();
        if (direction == Direction::Up) == already {
            debug!(migration = %migration.id(), ?direction, "already in target state");
            return Ok(());
        }

        let owned = migration.owned_objects();
        let before = foreign_ddl(&tx, &owned).map_err(|e| fail(&e))?;

        let script = match direction {
            Direction::Up => &migration.up,
            Direction::Down => &migration.down,
        };
        tx.execute_batch(script).map_err(|e| fail(&e))?;

        let after = foreign_ddl(&tx, &owned).map_err(|e| fail(&e))?;
        if before != after {
            let changed: Vec<&str> = before
                .keys()
                .chain(after.keys())
                .filter(|k| before.get(*k) != after.get(*k))
                .map(String::as_str)
                .collect();
            return Err(fail(&format!(
                "modified objects outside its scope: {}",
                changed.join(", ")
            )));
        }

        let ledger_update = match direction {
            Direction::Up => tx.execute(
                "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
                params![migration.version, migration.name, format_timestamp(&now())],
            ),
            Direction::Down => tx.execute(
                "DELETE FROM schema_migrations WHERE version = ?1",
                params![migration.version],
            ),
        };
        ledger_update.map_err(|e| fail(&e))?;

        tx.commit().map_err(|e| fail(&e))?;
        info!(migration = %migration.id(), ?direction, "migration applied");
        Ok(())
    }
}

/// DDL text of every schema object the migration does not own, keyed by
/// `type:name`.
fn foreign_ddl(conn: &Connection, owned: &OwnedObjects) -> rusqlite::Result<BTreeMap<String, String>> {
    let mut stmt = conn.prepare(
        "SELECT type, name, tbl_name, COALESCE(sql, '') FROM sqlite_master \
         WHERE name NOT LIKE 'sqlite_%' AND name != ?1",
    )?;
    let rows = stmt.query_map(params![LEDGER_TABLE], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;
    let mut ddl = BTreeMap::new();
    for r in rows {
        let (kind, name, table, sql) = r?;
        if !owned.owns(&name, &table) {
            ddl.insert(format!("{kind}:{name}"), sql);
        }
    }
    Ok(ddl)
}
