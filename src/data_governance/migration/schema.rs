//! # Schema Applier (幂等 Schema 变更)
//!
//! Column existence checks against SQLite schema metadata and the additive
//! DDL built on top of them.
//!
//! An existing column is a success ("already exists"), never an error and
//! never a retry. Failures are collected per column so one run reports the
//! status of every requested change.

use rusqlite::Connection;
use serde::Serialize;

use super::definitions::SchemaChange;
use super::MigrationError;

/// Whether `table.column` exists in the attached database `schema`.
///
/// A missing table reports `false` rather than an error.
pub fn column_exists(
    conn: &Connection,
    schema: &str,
    table: &str,
    column: &str,
) -> Result<bool, MigrationError> {
    let exists: bool = conn
        .query_row(
            "SELECT COUNT(*) > 0 FROM pragma_table_info(?1, ?2) WHERE name = ?3 COLLATE NOCASE",
            rusqlite::params![table, schema, column],
            |row| row.get(0),
        )
        .map_err(|e| {
            MigrationError::Database(format!(
                "column metadata lookup for {}.{}.{} failed: {}",
                schema, table, column, e
            ))
        })?;
    Ok(exists)
}

/// `(name, declared type)` of every column of `schema.table`, in table order.
pub fn table_columns(
    conn: &Connection,
    schema: &str,
    table: &str,
) -> Result<Vec<(String, String)>, MigrationError> {
    let lookup_err = |e: rusqlite::Error| {
        MigrationError::Database(format!(
            "column listing for {}.{} failed: {}",
            schema, table, e
        ))
    };
    let mut stmt = conn
        .prepare("SELECT name, type FROM pragma_table_info(?1, ?2) ORDER BY cid")
        .map_err(lookup_err)?;
    let columns = stmt
        .query_map(rusqlite::params![table, schema], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(lookup_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(lookup_err)?;
    Ok(columns)
}

/// Per-column result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ColumnStatus {
    AlreadyExists,
    Added,
    Failed { reason: String },
}

impl ColumnStatus {
    pub fn is_success(&self) -> bool {
        !matches!(self, ColumnStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ColumnOutcome {
    pub table: String,
    pub column: String,
    #[serde(flatten)]
    pub status: ColumnStatus,
}

/// Outcome of one applier run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchemaApplyReport {
    pub outcomes: Vec<ColumnOutcome>,
}

impl SchemaApplyReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.status.is_success())
    }

    pub fn added_count(&self) -> usize {
        self.count(|s| matches!(s, ColumnStatus::Added))
    }

    pub fn existing_count(&self) -> usize {
        self.count(|s| matches!(s, ColumnStatus::AlreadyExists))
    }

    pub fn failed_count(&self) -> usize {
        self.count(|s| matches!(s, ColumnStatus::Failed { .. }))
    }

    fn count(&self, pred: impl Fn(&ColumnStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.status)).count()
    }
}

/// Idempotent additive DDL.
pub struct SchemaApplier<'a> {
    conn: &'a Connection,
    schema: &'a str,
}

impl<'a> SchemaApplier<'a> {
    pub fn new(conn: &'a Connection, schema: &'a str) -> Self {
        Self { conn, schema }
    }

    /// Apply one change. Errors are folded into [`ColumnStatus::Failed`].
    pub fn apply_one(&self, change: &SchemaChange) -> ColumnStatus {
        match column_exists(self.conn, self.schema, &change.table, &change.column) {
            Ok(true) => {
                tracing::info!(
                    "[SchemaApplier] {}.{} already exists",
                    change.table,
                    change.column
                );
                ColumnStatus::AlreadyExists
            }
            Ok(false) => match self.conn.execute(&change.alter_sql(self.schema), []) {
                Ok(_) => {
                    tracing::info!(
                        "[SchemaApplier] added {}.{} {}",
                        change.table,
                        change.column,
                        change.definition
                    );
                    ColumnStatus::Added
                }
                Err(e) => {
                    tracing::warn!(
                        "[SchemaApplier] adding {}.{} failed: {}",
                        change.table,
                        change.column,
                        e
                    );
                    ColumnStatus::Failed {
                        reason: e.to_string(),
                    }
                }
            },
            Err(e) => {
                tracing::warn!("[SchemaApplier] {}", e);
                ColumnStatus::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Apply every change, continuing past failures.
    pub fn apply_all(&self, changes: &[SchemaChange]) -> SchemaApplyReport {
        let outcomes = changes
            .iter()
            .map(|change| ColumnOutcome {
                table: change.table.clone(),
                column: change.column.clone(),
                status: self.apply_one(change),
            })
            .collect();
        SchemaApplyReport { outcomes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn conn_with_patients() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE patients (id INTEGER PRIMARY KEY, last_name TEXT);")
            .unwrap();
        conn
    }

    #[test]
    fn test_column_exists_reads_metadata() {
        let conn = conn_with_patients();
        assert!(column_exists(&conn, "main", "patients", "last_name").unwrap());
        assert!(column_exists(&conn, "main", "patients", "LAST_NAME").unwrap());
        assert!(!column_exists(&conn, "main", "patients", "blood_type").unwrap());
    }

    #[test]
    fn test_column_exists_on_missing_table_is_false() {
        let conn = conn_with_patients();
        assert!(!column_exists(&conn, "main", "appointments", "status").unwrap());
    }

    #[test]
    fn test_column_exists_respects_schema_name() {
        let conn = conn_with_patients();
        conn.execute_batch(
            "ATTACH DATABASE ':memory:' AS archive;
             CREATE TABLE archive.patients (id INTEGER PRIMARY KEY, archived_at TEXT);",
        )
        .unwrap();
        assert!(column_exists(&conn, "archive", "patients", "archived_at").unwrap());
        assert!(!column_exists(&conn, "main", "patients", "archived_at").unwrap());
    }

    #[test]
    fn test_table_columns_in_declared_order() {
        let conn = conn_with_patients();
        assert_eq!(
            table_columns(&conn, "main", "patients").unwrap(),
            vec![
                ("id".to_string(), "INTEGER".to_string()),
                ("last_name".to_string(), "TEXT".to_string()),
            ]
        );
        assert!(table_columns(&conn, "main", "missing").unwrap().is_empty());
    }

    #[test]
    fn test_second_apply_reports_already_exists() {
        let conn = conn_with_patients();
        let applier = SchemaApplier::new(&conn, "main");
        let change = SchemaChange::new("patients", "blood_type", "TEXT");

        assert_eq!(applier.apply_one(&change), ColumnStatus::Added);
        assert_eq!(applier.apply_one(&change), ColumnStatus::AlreadyExists);
        assert!(column_exists(&conn, "main", "patients", "blood_type").unwrap());
    }

    #[test]
    fn test_failures_accumulate_without_aborting() {
        let conn = conn_with_patients();
        let applier = SchemaApplier::new(&conn, "main");
        let report = applier.apply_all(&[
            SchemaChange::new("appointments", "status", "TEXT"),
            SchemaChange::new("patients", "blood_type", "TEXT"),
            SchemaChange::new("patients", "last_name", "TEXT"),
        ]);

        assert!(!report.is_success());
        assert_eq!(report.failed_count(), 1);
        assert_eq!(report.added_count(), 1);
        assert_eq!(report.existing_count(), 1);
        assert_matches!(&report.outcomes[0].status, ColumnStatus::Failed { reason } if reason.contains("no such table"));
    }
}
