//! # Migration Verifier (迁移验证器)
//!
//! Checks the database after a script migration.
//!
//! ## 验证内容
//!
//! - 表是否存在
//! - 列是否存在
//! - 索引是否存在
//! - 关键查询是否可执行（语义 smoke test）

use rusqlite::Connection;

use super::definitions::quote_ident;
use super::schema::column_exists;
use super::MigrationError;

/// What a migration is expected to leave behind.
#[derive(Debug, Clone, Default)]
pub struct ExpectedSchema {
    pub tables: Vec<String>,
    pub columns: Vec<(String, String)>,
    pub indexes: Vec<String>,
    pub queries: Vec<String>,
}

impl ExpectedSchema {
    pub fn with_tables(mut self, tables: &[&str]) -> Self {
        self.tables.extend(tables.iter().map(|t| t.to_string()));
        self
    }

    pub fn with_columns(mut self, columns: &[(&str, &str)]) -> Self {
        self.columns
            .extend(columns.iter().map(|(t, c)| (t.to_string(), c.to_string())));
        self
    }

    pub fn with_indexes(mut self, indexes: &[&str]) -> Self {
        self.indexes.extend(indexes.iter().map(|i| i.to_string()));
        self
    }

    pub fn with_queries(mut self, queries: &[&str]) -> Self {
        self.queries.extend(queries.iter().map(|q| q.to_string()));
        self
    }
}

/// 迁移验证器
pub struct MigrationVerifier<'a> {
    conn: &'a Connection,
    schema: &'a str,
}

impl<'a> MigrationVerifier<'a> {
    pub fn new(conn: &'a Connection, schema: &'a str) -> Self {
        Self { conn, schema }
    }

    /// Fails on the first missing object.
    pub fn verify(&self, migration: &str, expected: &ExpectedSchema) -> Result<(), MigrationError> {
        let failed = |reason: String| MigrationError::VerificationFailed {
            migration: migration.to_string(),
            reason,
        };

        for table in &expected.tables {
            if !self.object_exists("table", table)? {
                return Err(failed(format!("Table '{}' not found", table)));
            }
        }

        for (table, column) in &expected.columns {
            if !column_exists(self.conn, self.schema, table, column)? {
                return Err(failed(format!("Column '{}.{}' not found", table, column)));
            }
        }

        for index in &expected.indexes {
            if !self.object_exists("index", index)? {
                return Err(failed(format!("Index '{}' not found", index)));
            }
        }

        for query in &expected.queries {
            if let Err(err) = self.query_executes(query) {
                return Err(failed(format!(
                    "Query smoke test failed '{}': {}",
                    shorten_query(query),
                    err
                )));
            }
        }

        tracing::info!("[MigrationVerifier] {} verified", migration);
        Ok(())
    }

    fn object_exists(&self, kind: &str, name: &str) -> Result<bool, MigrationError> {
        let sql = format!(
            "SELECT COUNT(*) FROM {}.sqlite_master WHERE type = ?1 AND name = ?2",
            quote_ident(self.schema)
        );
        let count: i64 = self
            .conn
            .query_row(&sql, [kind, name], |row| row.get(0))
            .map_err(|e| MigrationError::Database(e.to_string()))?;
        Ok(count > 0)
    }

    fn query_executes(&self, query: &str) -> Result<(), MigrationError> {
        let mut stmt = self
            .conn
            .prepare(query)
            .map_err(|e| MigrationError::Database(e.to_string()))?;
        let mut rows = stmt
            .query([])
            .map_err(|e| MigrationError::Database(e.to_string()))?;

        // 只需确保查询可以成功执行并开始迭代
        rows.next()
            .map_err(|e| MigrationError::Database(e.to_string()))?;
        Ok(())
    }
}

fn shorten_query(query: &str) -> String {
    const MAX_CHARS: usize = 96;
    if query.chars().count() <= MAX_CHARS {
        return query.to_string();
    }
    let cut: String = query.chars().take(MAX_CHARS).collect();
    format!("{}...", cut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn vitals_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE vitals (id INTEGER PRIMARY KEY, pulse INTEGER);
             CREATE INDEX idx_vitals_pulse ON vitals(pulse);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_verify_passes_for_present_objects() {
        let conn = vitals_conn();
        let expected = ExpectedSchema::default()
            .with_tables(&["vitals"])
            .with_columns(&[("vitals", "pulse")])
            .with_indexes(&["idx_vitals_pulse"])
            .with_queries(&["SELECT pulse FROM vitals LIMIT 1"]);

        MigrationVerifier::new(&conn, "main")
            .verify("vitals", &expected)
            .unwrap();
    }

    #[test]
    fn test_missing_table_names_the_table() {
        let conn = vitals_conn();
        let expected = ExpectedSchema::default().with_tables(&["vitals", "vitals_history"]);

        let err = MigrationVerifier::new(&conn, "main")
            .verify("vitals", &expected)
            .unwrap_err();
        assert_matches!(
            err,
            MigrationError::VerificationFailed { ref migration, ref reason }
                if migration == "vitals" && reason.contains("vitals_history")
        );
    }

    #[test]
    fn test_broken_query_fails_smoke_test() {
        let conn = vitals_conn();
        let expected = ExpectedSchema::default().with_queries(&["SELECT systolic FROM vitals"]);

        let err = MigrationVerifier::new(&conn, "main")
            .verify("vitals", &expected)
            .unwrap_err();
        assert_matches!(
            err,
            MigrationError::VerificationFailed { ref reason, .. } if reason.contains("Query smoke test failed")
        );
    }

    #[test]
    fn test_tables_are_looked_up_in_the_configured_schema() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "ATTACH DATABASE ':memory:' AS clinic;
             CREATE TABLE clinic.vitals (id INTEGER);",
        )
        .unwrap();
        let expected = ExpectedSchema::default().with_tables(&["vitals"]);

        assert!(MigrationVerifier::new(&conn, "main").verify("v", &expected).is_err());
        MigrationVerifier::new(&conn, "clinic")
            .verify("v", &expected)
            .unwrap();
    }
}
