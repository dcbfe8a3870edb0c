//! # Backup-Then-Mutate Transaction (先备份后变更)
//!
//! One transaction, four steps:
//!
//! 1. create the shadow table if absent (same columns as the source), index
//!    its key, and add any source column it is missing
//! 2. copy rows matching the predicate that are not in the shadow table yet
//! 3. run the mutation over the same predicate
//! 4. commit
//!
//! A shadow table created before the source gained a column is widened in
//! place; older backup rows read NULL there.
//!
//! Any failure drops the transaction, which rolls back the copy and the
//! mutation together. There is no partial recovery; the rollback is the
//! recovery.

use rusqlite::Connection;
use serde::Serialize;

use super::definitions::{MutationPlan, SchemaChange, DEFAULT_SCHEMA};
use super::schema::{column_exists, table_columns, ColumnStatus, SchemaApplier};
use super::{MigrationError, TransactionStep};

/// Counts reported after a committed run.
#[derive(Debug, Clone, Serialize)]
pub struct BackupMutateReport {
    pub source_table: String,
    pub backup_table: String,
    pub rows_backed_up: u64,
    pub rows_mutated: u64,
    /// Whole-database snapshot taken before the transaction, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<String>,
}

fn step_err(step: TransactionStep) -> impl FnOnce(rusqlite::Error) -> MigrationError {
    move |e| {
        tracing::warn!("[BackupMutate] {} failed, rolling back: {}", step, e);
        MigrationError::Transaction {
            step,
            reason: e.to_string(),
        }
    }
}

fn align_err(reason: String) -> MigrationError {
    tracing::warn!(
        "[BackupMutate] {} failed, rolling back: {}",
        TransactionStep::AlignBackupColumns,
        reason
    );
    MigrationError::Transaction {
        step: TransactionStep::AlignBackupColumns,
        reason,
    }
}

/// Add source columns missing from the backup table. Returns the source
/// column names, which is the column list the copy uses.
fn align_backup_columns(
    conn: &Connection,
    plan: &MutationPlan,
) -> Result<Vec<String>, MigrationError> {
    let source_columns = table_columns(conn, DEFAULT_SCHEMA, &plan.source_table)
        .map_err(|e| align_err(e.to_string()))?;

    let mut missing = Vec::new();
    for (name, declared_type) in &source_columns {
        let present = column_exists(conn, DEFAULT_SCHEMA, &plan.backup_table, name)
            .map_err(|e| align_err(e.to_string()))?;
        if !present {
            missing.push(SchemaChange::new(&plan.backup_table, name, declared_type));
        }
    }

    if !missing.is_empty() {
        let report = SchemaApplier::new(conn, DEFAULT_SCHEMA).apply_all(&missing);
        if !report.is_success() {
            let reasons = report
                .outcomes
                .iter()
                .filter_map(|o| match &o.status {
                    ColumnStatus::Failed { reason } => Some(format!("{}: {}", o.column, reason)),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("; ");
            return Err(align_err(reasons));
        }
        tracing::info!(
            "[BackupMutate] widened {} by {} column(s)",
            plan.backup_table,
            missing.len()
        );
    }

    Ok(source_columns.into_iter().map(|(name, _)| name).collect())
}

/// Run `plan` atomically. On error nothing of this run persists.
pub fn backup_then_mutate(
    conn: &mut Connection,
    plan: &MutationPlan,
) -> Result<BackupMutateReport, MigrationError> {
    let tx = conn
        .transaction()
        .map_err(step_err(TransactionStep::Begin))?;

    tx.execute(&plan.ensure_backup_sql(), [])
        .map_err(step_err(TransactionStep::EnsureBackupTable))?;
    tx.execute(&plan.backup_index_sql(), [])
        .map_err(step_err(TransactionStep::EnsureBackupTable))?;

    let columns = align_backup_columns(&tx, plan)?;

    let rows_backed_up = tx
        .execute(&plan.copy_sql(&columns), [])
        .map_err(step_err(TransactionStep::CopyToBackup))?;

    let rows_mutated = tx
        .execute(&plan.mutate_sql(), [])
        .map_err(step_err(TransactionStep::Mutate))?;

    tx.commit().map_err(step_err(TransactionStep::Commit))?;

    tracing::info!(
        "[BackupMutate] {}: {} row(s) backed up into {}, {} row(s) mutated",
        plan.source_table,
        rows_backed_up,
        plan.backup_table,
        rows_mutated
    );

    Ok(BackupMutateReport {
        source_table: plan.source_table.clone(),
        backup_table: plan.backup_table.clone(),
        rows_backed_up: rows_backed_up as u64,
        rows_mutated: rows_mutated as u64,
        snapshot_path: None,
    })
}
