//! Database session scoped to one migration invocation.
//!
//! The session is the only way the engine reaches SQLite. It is created at
//! the entry point, passed down explicitly and closed (or dropped) on every
//! exit path.

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags};

use crate::data_governance::migration::MigrationError;

/// Wait at most this long for a lock held by another process.
const BUSY_TIMEOUT_MS: i64 = 3000;

pub struct MigrationSession {
    conn: Connection,
    path: Option<PathBuf>,
}

impl MigrationSession {
    /// Open an existing database file read-write. A missing file is a
    /// connection error; migrations never create the clinic database.
    pub fn open(path: &Path) -> Result<Self, MigrationError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags).map_err(|e| {
            MigrationError::Connection(format!("cannot open {}: {}", path.display(), e))
        })?;
        Self::configure(&conn)?;
        tracing::info!("[MigrationSession] opened {}", path.display());
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self, MigrationError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| MigrationError::Connection(e.to_string()))?;
        Ok(Self { conn, path: None })
    }

    fn configure(conn: &Connection) -> Result<(), MigrationError> {
        conn.pragma_update(None, "busy_timeout", BUSY_TIMEOUT_MS)
            .map_err(|e| MigrationError::Connection(format!("busy_timeout: {}", e)))
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// File backing the session, `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Close explicitly so a close error is reported instead of ignored.
    pub fn close(self) -> Result<(), MigrationError> {
        self.conn.close().map_err(|(_, e)| {
            MigrationError::Connection(format!("closing the database failed: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_a_connection_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.db");

        let err = MigrationSession::open(&path).err().unwrap();
        assert_matches!(err, MigrationError::Connection(_));
        assert!(!path.exists(), "opening must not create the database");
    }

    #[test]
    fn test_open_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clinic.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE patients (id INTEGER PRIMARY KEY);")
            .unwrap();

        let session = MigrationSession::open(&path).unwrap();
        assert_eq!(session.path(), Some(path.as_path()));
        let count: i64 = session
            .connection()
            .query_row("SELECT COUNT(*) FROM patients", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
        session.close().unwrap();
    }
}
