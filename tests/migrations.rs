#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;

use flexmem::MemoryError;
use flexmem::migrations::{Migration, MigrationManager, backup_database};
use rusqlite::{Connection, params};

fn table_sql(conn: &Connection, table: &str) -> Option<String> {
    conn.query_row(
        "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |row| row.get(0),
    )
    .ok()
}

fn write_pair(dir: &Path, id: &str, up: &str, down: &str) {
    std::fs::write(dir.join(format!("{id}.up.sql")), up).expect("write up");
    std::fs::write(dir.join(format!("{id}.down.sql")), down).expect("write down");
}

#[test]
fn dry_run_on_fresh_database_leaves_version_zero() {
    let conn = Connection::open_in_memory().expect("open");
    let manager = MigrationManager::new(&conn);

    let plan = manager.migrate(true, None).expect("dry run");
    assert!(plan.dry_run);
    assert_eq!(plan.steps.len(), 3);
    assert!(plan.steps.iter().all(|s| !s.statements.is_empty()));

    assert_eq!(manager.get_current_version().expect("version"), 0);
    assert_eq!(table_sql(&conn, "facts"), None);
}

#[test]
fn migrate_twice_is_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let conn = Connection::open(dir.path().join("memory.db")).expect("open");
    let manager = MigrationManager::new(&conn);

    manager.migrate(false, None).expect("first");
    let version = manager.get_current_version().expect("version");
    assert_eq!(version, manager.latest_version());

    let again = manager.migrate(false, None).expect("second");
    assert!(again.is_noop());
    assert_eq!(manager.get_current_version().expect("version"), version);
    assert_eq!(manager.get_migration_history().expect("history").len(), 3);
    assert!(manager.get_pending_migrations().expect("pending").is_empty());
}

#[test]
fn failing_migration_stops_the_chain_atomically() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_pair(
        dir.path(),
        "001_create_notes",
        "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL);",
        "DROP TABLE notes;",
    );
    write_pair(
        dir.path(),
        "002_create_tags",
        "CREATE TABLE tags (id INTEGER PRIMARY KEY);\nCREATE TABLE tags_broken (id INTEGER PRIMARY KEY,);",
        "DROP TABLE IF EXISTS tags_broken;\nDROP TABLE tags;",
    );
    write_pair(
        dir.path(),
        "003_create_links",
        "CREATE TABLE links (id INTEGER PRIMARY KEY);",
        "DROP TABLE links;",
    );
    std::fs::write(dir.path().join("README.md"), "ignored").expect("write readme");

    let migrations = Migration::load_dir(dir.path()).expect("load");
    assert_eq!(migrations.len(), 3);

    let conn = Connection::open_in_memory().expect("open");
    let manager = MigrationManager::with_migrations(&conn, migrations).expect("manager");
    let err = manager.migrate(false, None).expect_err("002 must fail");
    assert!(matches!(err, MemoryError::Migration(_)), "{err}");

    assert_eq!(manager.get_current_version().expect("version"), 1);
    assert!(table_sql(&conn, "notes").is_some());
    assert_eq!(table_sql(&conn, "tags"), None, "partial DDL must roll back");
    assert_eq!(table_sql(&conn, "links"), None, "chain must stop");
}

#[test]
fn pre_existing_tables_keep_identical_ddl() {
    let conn = Connection::open_in_memory().expect("open");
    conn.execute_batch(
        "CREATE TABLE users (id TEXT PRIMARY KEY, display_name TEXT, created_at TEXT);
         CREATE INDEX idx_users_created ON users(created_at);",
    )
    .expect("seed");
    let before = table_sql(&conn, "users").expect("users ddl");

    let manager = MigrationManager::new(&conn);
    manager.migrate(false, None).expect("migrate");
    manager.rollback(0, false).expect("rollback");
    manager.migrate(false, None).expect("migrate again");

    assert_eq!(table_sql(&conn, "users").expect("users ddl"), before);
}

#[test]
fn relational_constraints_reject_out_of_range_rows() {
    let conn = Connection::open_in_memory().expect("open");
    MigrationManager::new(&conn)
        .migrate(false, None)
        .expect("migrate");

    let fact = conn.execute(
        "INSERT INTO facts (user_id, category, key, confidence, importance, updated_at, payload)
         VALUES ('u1', 'preferences', 'lang', 1.5, NULL, '2026-01-01T00:00:00Z', '{}')",
        [],
    );
    assert!(fact.is_err(), "confidence 1.5 must be rejected");

    let episode = conn.execute(
        "INSERT INTO episodes (id, user_id, episode_type, importance, occurred_at, payload)
         VALUES ('e1', 'u1', 'milestone', -1, '2026-01-01T00:00:00Z', '{}')",
        [],
    );
    assert!(episode.is_err(), "importance -1 must be rejected");

    let affinity = conn.execute(
        "INSERT INTO affinity (user_id, personality_name, points, level, last_interaction)
         VALUES ('u1', 'Nova', 150, 'best_friend', '2026-01-01T00:00:00Z')",
        [],
    );
    assert!(affinity.is_err(), "points 150 must be rejected");

    let category = conn.execute(
        "INSERT INTO facts (user_id, category, key, confidence, importance, updated_at, payload)
         VALUES ('u1', 'astrology', 'sign', 0.5, NULL, '2026-01-01T00:00:00Z', '{}')",
        [],
    );
    assert!(category.is_err(), "unknown category must be rejected");
}

#[test]
fn rollback_restores_pre_migration_shape() {
    let conn = Connection::open_in_memory().expect("open");
    let manager = MigrationManager::new(&conn);
    manager.migrate(false, None).expect("migrate");

    let plan = manager.rollback(1, false).expect("rollback");
    assert_eq!(plan.from_version, 3);
    assert_eq!(plan.to_version, 1);
    assert_eq!(
        plan.steps.iter().map(|s| s.version).collect::<Vec<_>>(),
        vec![3, 2]
    );
    assert!(table_sql(&conn, "facts").is_some());
    assert_eq!(table_sql(&conn, "episodes"), None);
    assert_eq!(table_sql(&conn, "affinity"), None);
    assert_eq!(manager.get_current_version().expect("version"), 1);

    let plan = manager.migrate(false, Some(2)).expect("partial");
    assert_eq!(plan.to_version, 2);
    assert!(table_sql(&conn, "episodes").is_some());
    assert_eq!(table_sql(&conn, "affinity"), None);
}

#[test]
fn malformed_migration_directories_are_rejected() {
    let missing_down = tempfile::tempdir().expect("tempdir");
    std::fs::write(missing_down.path().join("001_a.up.sql"), "SELECT 1;").expect("write");
    assert!(matches!(
        Migration::load_dir(missing_down.path()),
        Err(MemoryError::Migration(_))
    ));

    let duplicate = tempfile::tempdir().expect("tempdir");
    write_pair(duplicate.path(), "001_a", "SELECT 1;", "SELECT 1;");
    write_pair(duplicate.path(), "001_b", "SELECT 1;", "SELECT 1;");
    assert!(matches!(
        Migration::load_dir(duplicate.path()),
        Err(MemoryError::Migration(_))
    ));

    let bad_prefix = tempfile::tempdir().expect("tempdir");
    write_pair(bad_prefix.path(), "one_a", "SELECT 1;", "SELECT 1;");
    assert!(matches!(
        Migration::load_dir(bad_prefix.path()),
        Err(MemoryError::Migration(_))
    ));
}

#[test]
fn backup_snapshot_contains_migrated_schema() {
    let dir = tempfile::tempdir().expect("tempdir");
    let conn = Connection::open(dir.path().join("memory.db")).expect("open");
    MigrationManager::new(&conn)
        .migrate(false, None)
        .expect("migrate");

    let backup = backup_database(&conn, &dir.path().join("backups")).expect("backup");
    let copy = Connection::open(&backup).expect("open backup");
    assert_eq!(
        MigrationManager::new(&copy)
            .get_current_version()
            .expect("version"),
        3
    );
    assert!(table_sql(&copy, "affinity").is_some());
}
