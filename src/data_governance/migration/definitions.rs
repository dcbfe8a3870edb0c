//! # Migration Definitions (迁移定义)
//!
//! Declarative descriptions of what each clinic migration touches. The
//! components in this module tree only ever see these plans, never ad hoc SQL
//! strings assembled at the call site, so a preview and its mutation are
//! built from the very same predicate text.

use serde::Serialize;

use super::reclassify::SectionLabels;
use super::verifier::ExpectedSchema;

/// Schema metadata name used when the configuration does not override it.
pub const DEFAULT_SCHEMA: &str = "main";

/// Characters treated as blank by the SQL side of the emptiness check.
const SQL_BLANK_CHARS: &str = "' ' || char(9) || char(10) || char(13)";

/// Quote an SQLite identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// SQL fragment that is true when `column` is NULL or blank after trimming.
pub fn blank_sql(column: &str) -> String {
    let col = quote_ident(column);
    format!("({col} IS NULL OR TRIM({col}, {SQL_BLANK_CHARS}) = '')")
}

// ============================================================================
// Schema changes
// ============================================================================

/// An additive column change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaChange {
    pub table: String,
    pub column: String,
    /// Column type and constraints, e.g. `TEXT DEFAULT 'scheduled'`
    pub definition: String,
}

impl SchemaChange {
    pub fn new(
        table: impl Into<String>,
        column: impl Into<String>,
        definition: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            definition: definition.into(),
        }
    }

    pub fn alter_sql(&self, schema: &str) -> String {
        format!(
            "ALTER TABLE {}.{} ADD COLUMN {} {}",
            quote_ident(schema),
            quote_ident(&self.table),
            quote_ident(&self.column),
            self.definition
        )
    }
}

// ============================================================================
// Backup-then-mutate plans
// ============================================================================

/// Row predicate shared by the dry-run count and the mutation.
///
/// Only constructors in this module produce one, and the SQL text is reused
/// verbatim by every statement of a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPredicate {
    sql: String,
}

impl TargetPredicate {
    /// `target` is NULL/blank and `source` carries non-blank text.
    pub fn empty_target_with_source(target: &str, source: &str) -> Self {
        Self {
            sql: format!("{} AND NOT {}", blank_sql(target), blank_sql(source)),
        }
    }

    /// `fk_column` is set but no row in `parent_table` has that key.
    pub fn orphaned(table: &str, fk_column: &str, parent_table: &str, parent_key: &str) -> Self {
        let fk = format!("{}.{}", quote_ident(table), quote_ident(fk_column));
        Self {
            sql: format!(
                "{fk} IS NOT NULL AND NOT EXISTS (SELECT 1 FROM {parent} p WHERE p.{key} = {fk})",
                parent = quote_ident(parent_table),
                key = quote_ident(parent_key),
            ),
        }
    }

    /// Escape hatch for plans built outside the clinic definitions.
    pub fn raw(sql: impl Into<String>) -> Self {
        Self { sql: sql.into() }
    }

    pub fn as_sql(&self) -> &str {
        &self.sql
    }
}

/// What happens to rows matching the predicate once they are backed up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// `SET` clause, e.g. `"interview" = "notes"`
    Update { assignments: String },
    Delete,
}

/// Shadow-table backup followed by a mutation over the same predicate.
#[derive(Debug, Clone)]
pub struct MutationPlan {
    pub source_table: String,
    pub backup_table: String,
    /// Primary identity used to skip rows already present in the backup
    pub key_column: String,
    pub predicate: TargetPredicate,
    pub mutation: Mutation,
}

impl MutationPlan {
    pub fn count_sql(&self) -> String {
        format!(
            "SELECT COUNT(*) FROM {} WHERE {}",
            quote_ident(&self.source_table),
            self.predicate.as_sql()
        )
    }

    /// Create-if-absent with the source's columns and no rows.
    pub fn ensure_backup_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} AS SELECT * FROM {} WHERE 0",
            quote_ident(&self.backup_table),
            quote_ident(&self.source_table)
        )
    }

    /// Index on the backup key; `CREATE TABLE .. AS SELECT` carries no keys.
    pub fn backup_index_sql(&self) -> String {
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            quote_ident(&format!("{}_key_idx", self.backup_table)),
            quote_ident(&self.backup_table),
            quote_ident(&self.key_column)
        )
    }

    /// Insert-only-new copy keyed by `key_column`, over an explicit column
    /// list so a backup table with extra columns still lines up.
    pub fn copy_sql(&self, columns: &[String]) -> String {
        let source = quote_ident(&self.source_table);
        let key = quote_ident(&self.key_column);
        let columns = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {backup} ({columns}) SELECT {columns} FROM {source} WHERE ({predicate}) \
             AND NOT EXISTS (SELECT 1 FROM {backup} b WHERE b.{key} = {source}.{key})",
            backup = quote_ident(&self.backup_table),
            predicate = self.predicate.as_sql(),
        )
    }

    pub fn mutate_sql(&self) -> String {
        let source = quote_ident(&self.source_table);
        match &self.mutation {
            Mutation::Update { assignments } => format!(
                "UPDATE {source} SET {assignments} WHERE {}",
                self.predicate.as_sql()
            ),
            Mutation::Delete => format!("DELETE FROM {source} WHERE {}", self.predicate.as_sql()),
        }
    }
}

// ============================================================================
// Reclassification plans
// ============================================================================

/// Which composite column to split, into which secondary column.
#[derive(Debug, Clone)]
pub struct ReclassificationPlan {
    pub table: String,
    pub key_column: String,
    /// Free-text column holding both sections; receives the primary section
    pub composite_column: String,
    /// Column receiving the secondary section
    pub secondary_column: String,
    pub labels: SectionLabels,
    /// File name prefix of the audit CSV
    pub audit_prefix: String,
}

impl ReclassificationPlan {
    /// Rows with something to parse, in key order.
    pub fn select_sql(&self) -> String {
        format!(
            "SELECT {key}, {composite}, {secondary} FROM {table} WHERE NOT {blank} ORDER BY {key}",
            key = quote_ident(&self.key_column),
            composite = quote_ident(&self.composite_column),
            secondary = quote_ident(&self.secondary_column),
            table = quote_ident(&self.table),
            blank = blank_sql(&self.composite_column),
        )
    }

    pub fn update_sql(&self) -> String {
        format!(
            "UPDATE {} SET {} = ?1, {} = ?2 WHERE {} = ?3",
            quote_ident(&self.table),
            quote_ident(&self.composite_column),
            quote_ident(&self.secondary_column),
            quote_ident(&self.key_column)
        )
    }
}

// ============================================================================
// Clinic migrations
// ============================================================================

pub const PATIENTS_TABLE: &str = "patients";
pub const APPOINTMENTS_TABLE: &str = "appointments";
pub const HISTORY_TABLE: &str = "patient_history_records";

/// Biometrics tables script (stop-on-first-failure: later tables reference earlier ones).
pub const BIOMETRICS_SCRIPT_NAME: &str = "V20261018__biometrics.sql";
pub const BIOMETRICS_SCRIPT: &str =
    include_str!("../../../migrations/clinic/V20261018__biometrics.sql");
pub const BIOMETRICS_TABLES: &[&str] = &[
    "biometric_types",
    "biometric_readings",
    "blood_pressure_readings",
];
pub const BIOMETRICS_QUERIES: &[&str] = &[
    "SELECT code, unit FROM biometric_types LIMIT 1",
    "SELECT patient_id, systolic, diastolic FROM blood_pressure_readings LIMIT 1",
];
pub const BIOMETRICS_INDEXES: &[&str] = &[
    "idx_biometric_readings_patient",
    "idx_blood_pressure_patient",
];

/// What `create-biometrics-tables` must leave behind.
pub fn biometrics_expectations() -> ExpectedSchema {
    ExpectedSchema::default()
        .with_tables(BIOMETRICS_TABLES)
        .with_indexes(BIOMETRICS_INDEXES)
        .with_queries(BIOMETRICS_QUERIES)
}

/// Columns added by `add-history-columns`.
pub fn history_columns() -> Vec<SchemaChange> {
    vec![
        SchemaChange::new(HISTORY_TABLE, "interview", "TEXT"),
        SchemaChange::new(HISTORY_TABLE, "treatment", "TEXT"),
        SchemaChange::new(APPOINTMENTS_TABLE, "status", "TEXT DEFAULT 'scheduled'"),
        SchemaChange::new(PATIENTS_TABLE, "blood_type", "TEXT"),
    ]
}

/// `copy-history-notes`: fill an empty interview from legacy notes.
pub fn copy_history_notes_plan() -> MutationPlan {
    MutationPlan {
        source_table: HISTORY_TABLE.to_string(),
        backup_table: format!("{HISTORY_TABLE}_backup"),
        key_column: "id".to_string(),
        predicate: TargetPredicate::empty_target_with_source("interview", "notes"),
        mutation: Mutation::Update {
            assignments: format!("{} = {}", quote_ident("interview"), quote_ident("notes")),
        },
    }
}

/// `purge-orphan-appointments`: drop appointments of deleted patients.
pub fn purge_orphan_appointments_plan() -> MutationPlan {
    MutationPlan {
        source_table: APPOINTMENTS_TABLE.to_string(),
        backup_table: format!("{APPOINTMENTS_TABLE}_backup"),
        key_column: "id".to_string(),
        predicate: TargetPredicate::orphaned(APPOINTMENTS_TABLE, "patient_id", PATIENTS_TABLE, "id"),
        mutation: Mutation::Delete,
    }
}

/// `reclassify-history`: `Diagnosis:` stays in diagnosis, `Interview:` moves out.
pub fn reclassify_history_plan() -> ReclassificationPlan {
    ReclassificationPlan {
        table: HISTORY_TABLE.to_string(),
        key_column: "id".to_string(),
        composite_column: "diagnosis".to_string(),
        secondary_column: "interview".to_string(),
        labels: SectionLabels::new("Diagnosis:", "Interview:"),
        audit_prefix: "patient_history_reclassify".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_and_mutation_share_predicate_text() {
        let plan = copy_history_notes_plan();
        let predicate = plan.predicate.as_sql().to_string();
        assert!(plan.count_sql().ends_with(&predicate));
        assert!(plan.mutate_sql().ends_with(&predicate));
        assert!(plan.copy_sql(&["id".to_string()]).contains(&predicate));
    }

    #[test]
    fn test_blank_sql_trims_tabs_and_newlines() {
        let sql = blank_sql("notes");
        assert!(sql.contains("\"notes\" IS NULL"));
        assert!(sql.contains("char(9)"));
        assert!(sql.contains("char(10)"));
    }

    #[test]
    fn test_copy_sql_skips_already_backed_up_keys() {
        let columns = ["id".to_string(), "patient_id".to_string()];
        let sql = purge_orphan_appointments_plan().copy_sql(&columns);
        assert!(sql.starts_with(
            "INSERT INTO \"appointments_backup\" (\"id\", \"patient_id\") SELECT \"id\", \"patient_id\" FROM \"appointments\""
        ));
        assert!(sql.contains("NOT EXISTS (SELECT 1 FROM \"appointments_backup\" b WHERE b.\"id\" = \"appointments\".\"id\")"));
    }

    #[test]
    fn test_backup_index_covers_the_key() {
        assert_eq!(
            purge_orphan_appointments_plan().backup_index_sql(),
            "CREATE INDEX IF NOT EXISTS \"appointments_backup_key_idx\" ON \"appointments_backup\" (\"id\")"
        );
    }

    #[test]
    fn test_alter_sql_is_schema_qualified() {
        let change = SchemaChange::new("appointments", "status", "TEXT DEFAULT 'scheduled'");
        assert_eq!(
            change.alter_sql("main"),
            "ALTER TABLE \"main\".\"appointments\" ADD COLUMN \"status\" TEXT DEFAULT 'scheduled'"
        );
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_biometrics_script_is_embedded() {
        for table in BIOMETRICS_TABLES {
            assert!(BIOMETRICS_SCRIPT.contains(table), "script misses {table}");
        }
    }
}
