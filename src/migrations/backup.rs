//! Pre-migration SQLite snapshots and rotation.
//!
//! Uses `VACUUM INTO` for atomic, consistent backups and keeps the N most
//! recent backup files.

use std::path::{Path, PathBuf};

use rusqlite::Connection;
use tracing::{info, warn};

use crate::error::{MemoryError, Result};

/// Prefix for backup filenames used by `backup_database` and `rotate_backups`.
const BACKUP_PREFIX: &str = "flexmem-backup-";

const BACKUP_EXT: &str = ".db";

/// Snapshot the database behind `conn` into `backup_dir`.
///
/// The file is named `flexmem-backup-{YYYYMMDD-HHMMSS}.db`, with a numeric
/// suffix when a backup from the same second already exists. The directory
/// is created if needed.
pub fn backup_database(conn: &Connection, backup_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(backup_dir)?;

    let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S").to_string();
    let mut backup_path = backup_dir.join(format!("{BACKUP_PREFIX}{stamp}{BACKUP_EXT}"));
    let mut n = 1;
    while backup_path.exists() {
        backup_path = backup_dir.join(format!("{BACKUP_PREFIX}{stamp}-{n}{BACKUP_EXT}"));
        n += 1;
    }

    // VACUUM INTO takes no bound parameters.
    let escaped = backup_path.display().to_string().replace('\'', "''");
    conn.execute_batch(&format!("VACUUM INTO '{escaped}'"))
        .map_err(|e| MemoryError::Backend(format!("backup to {} failed: {e}", backup_path.display())))?;

    info!(path = %backup_path.display(), "database backed up");
    Ok(backup_path)
}

/// Keep at most `keep_count` backups in `backup_dir`, newest first by name.
///
/// Returns the number of deleted files. Individual deletion failures are
/// logged and skipped.
pub fn rotate_backups(backup_dir: &Path, keep_count: usize) -> Result<usize> {
    if !backup_dir.exists() {
        return Ok(0);
    }

    let mut backups: Vec<PathBuf> = std::fs::read_dir(backup_dir)?
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let name = entry.file_name().to_string_lossy().to_string();
            (name.starts_with(BACKUP_PREFIX) && name.ends_with(BACKUP_EXT)).then(|| entry.path())
        })
        .collect();

    backups.sort_by(|a, b| b.cmp(a));

    let mut deleted = 0;
    for old in backups.iter().skip(keep_count) {
        match std::fs::remove_file(old) {
            Ok(()) => deleted += 1,
            Err(e) => warn!(path = %old.display(), error = %e, "failed to delete old backup"),
        }
    }
    Ok(deleted)
}
