//! # Backup 模块
//!
//! Whole-database snapshot taken before a confirmed destructive migration.
//!
//! ## SQLite Backup API
//!
//! Snapshots use `sqlite3_backup_*` rather than a file copy, so a database in
//! WAL mode is captured consistently. Every snapshot is checked with
//! `PRAGMA quick_check` before the migration is allowed to continue.
//!
//! Snapshots are never pruned. Each file name carries a timestamp and a
//! random suffix, so no earlier snapshot is ever overwritten.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Local;
use rusqlite::backup::Backup;
use rusqlite::{Connection, DatabaseName};
use uuid::Uuid;

use crate::data_governance::migration::MigrationError;

/// Sub-directory of the backup directory holding snapshots.
pub const SNAPSHOT_DIR: &str = "snapshots";

const PAGES_PER_STEP: std::os::raw::c_int = 50;
const STEP_PAUSE: Duration = Duration::from_millis(20);

fn snapshot_err(context: &str, path: &Path, e: impl std::fmt::Display) -> MigrationError {
    MigrationError::Snapshot(format!("{} {}: {}", context, path.display(), e))
}

/// Copy database `schema` of `conn` into `<backup_dir>/snapshots/`.
///
/// Returns the snapshot path once the copy passed `quick_check`.
pub fn snapshot_database(
    conn: &Connection,
    schema: &str,
    backup_dir: &Path,
    stem: &str,
) -> Result<PathBuf, MigrationError> {
    let dir = backup_dir.join(SNAPSHOT_DIR);
    std::fs::create_dir_all(&dir).map_err(|e| snapshot_err("cannot create", &dir, e))?;

    let suffix = Uuid::new_v4().simple().to_string();
    let dst = dir.join(format!(
        "{}_{}_{}.db",
        stem,
        Local::now().format("%Y%m%d_%H%M%S"),
        &suffix[..8]
    ));

    let mut dst_conn =
        Connection::open(&dst).map_err(|e| snapshot_err("cannot create", &dst, e))?;

    let src_name = if schema.eq_ignore_ascii_case("main") {
        DatabaseName::Main
    } else {
        DatabaseName::Attached(schema)
    };

    {
        let backup = Backup::new_with_names(conn, src_name, &mut dst_conn, DatabaseName::Main)
            .map_err(|e| snapshot_err("cannot start backup into", &dst, e))?;
        backup
            .run_to_completion(PAGES_PER_STEP, STEP_PAUSE, None)
            .map_err(|e| snapshot_err("backup failed for", &dst, e))?;
    } // drop backup，释放 dst_conn 的可变借用

    let integrity: String = dst_conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .map_err(|e| snapshot_err("quick_check failed for", &dst, e))?;
    if integrity != "ok" {
        return Err(snapshot_err("integrity check rejected", &dst, integrity));
    }

    tracing::info!("[Backup] snapshot of '{}' written to {}", schema, dst.display());
    Ok(dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::database_seed::{count_rows, insert_patient, seed_clinic_database};
    use tempfile::TempDir;

    #[test]
    fn test_snapshot_contains_current_rows() {
        let dir = TempDir::new().unwrap();
        let conn = Connection::open_in_memory().unwrap();
        seed_clinic_database(&conn).unwrap();
        insert_patient(&conn, 1, "Garcia").unwrap();
        insert_patient(&conn, 2, "Okafor").unwrap();

        let path = snapshot_database(&conn, "main", dir.path(), "purge-orphan-appointments").unwrap();

        assert!(path.starts_with(dir.path().join(SNAPSHOT_DIR)));
        let copy = Connection::open(&path).unwrap();
        assert_eq!(count_rows(&copy, "patients").unwrap(), 2);
    }

    #[test]
    fn test_snapshots_are_never_overwritten() {
        let dir = TempDir::new().unwrap();
        let conn = Connection::open_in_memory().unwrap();
        seed_clinic_database(&conn).unwrap();

        let first = snapshot_database(&conn, "main", dir.path(), "copy-history-notes").unwrap();
        let second = snapshot_database(&conn, "main", dir.path(), "copy-history-notes").unwrap();

        assert_ne!(first, second);
        assert!(first.exists() && second.exists());
    }

    #[test]
    fn test_unknown_schema_is_a_snapshot_error() {
        let dir = TempDir::new().unwrap();
        let conn = Connection::open_in_memory().unwrap();

        let err = snapshot_database(&conn, "nope", dir.path(), "x").unwrap_err();
        assert!(matches!(err, MigrationError::Snapshot(_)));
    }
}
