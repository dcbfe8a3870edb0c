//! # Migration 模块
//!
//! One-shot, standalone migrations for the clinic schema. Every migration is
//! idempotent on its own; there is no version ledger and no dependency graph
//! between migrations.
//!
//! ## Core rules
//!
//! 1. **Safe by default**: destructive migrations only report their impact
//!    unless the caller passed the exact confirmation token.
//! 2. **Backup before mutate**: shadow-table copy and mutation share one
//!    transaction; any failure rolls back both.
//! 3. **Idempotent DDL**: columns are added only when schema metadata says
//!    they are missing.
//! 4. **Traceable reclassification**: every row examined lands in a CSV audit
//!    trail before its update is attempted.
//!
//! ## Components
//!
//! - `schema`: column existence checker + idempotent schema applier
//! - `dry_run`: impact preview and confirmation gate
//! - `backup_mutate`: backup-then-mutate transaction
//! - `reclassify`: free-text section splitter and the batch pass that drives it
//! - `script_runner`: multi-statement SQL script runner
//! - `script_checker`: static lint for SQL scripts
//! - `verifier`: post-migration table/column/query checks
//! - `definitions`: the concrete clinic migrations
//! - `coordinator`: dispatches a request to the right component

pub mod backup_mutate;
pub mod coordinator;
pub mod definitions;
pub mod dry_run;
pub mod reclassify;
pub mod schema;
pub mod script_checker;
pub mod script_runner;
pub mod verifier;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ============================================================================
// Re-exports - 核心类型
// ============================================================================

pub use backup_mutate::{backup_then_mutate, BackupMutateReport};
pub use coordinator::{EngineSettings, MigrationCoordinator, MigrationOutcome, MigrationTask};
pub use definitions::{MutationPlan, ReclassificationPlan, SchemaChange, TargetPredicate};
pub use dry_run::{Confirmation, DryRunGate, GateDecision, MigrationImpact};
pub use reclassify::{reclassify, ReclassificationReport, Reclassifier, SectionLabels};
pub use schema::{column_exists, ColumnStatus, SchemaApplier, SchemaApplyReport};
pub use script_runner::{split_statements, ScriptMode, ScriptRunReport, ScriptRunner};
pub use verifier::{ExpectedSchema, MigrationVerifier};

// ============================================================================
// 迁移标识
// ============================================================================

/// Identity of a runnable migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationId {
    /// Additive columns on history/appointments/patients
    AddHistoryColumns,
    /// Copy `notes` into an empty `interview` (backup table first)
    CopyHistoryNotes,
    /// Delete appointments whose patient no longer exists (backup table first)
    PurgeOrphanAppointments,
    /// Split `diagnosis` free text into diagnosis/interview
    ReclassifyHistory,
    /// Create the biometrics tables from the embedded script
    CreateBiometricsTables,
    /// Run an operator supplied SQL script
    RunScript,
}

impl MigrationId {
    pub const ALL: &'static [MigrationId] = &[
        MigrationId::AddHistoryColumns,
        MigrationId::CopyHistoryNotes,
        MigrationId::PurgeOrphanAppointments,
        MigrationId::ReclassifyHistory,
        MigrationId::CreateBiometricsTables,
        MigrationId::RunScript,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            MigrationId::AddHistoryColumns => "add-history-columns",
            MigrationId::CopyHistoryNotes => "copy-history-notes",
            MigrationId::PurgeOrphanAppointments => "purge-orphan-appointments",
            MigrationId::ReclassifyHistory => "reclassify-history",
            MigrationId::CreateBiometricsTables => "create-biometrics-tables",
            MigrationId::RunScript => "run-script",
        }
    }

    /// Migrations that rewrite or remove existing rows go through the dry-run gate.
    pub const fn is_destructive(&self) -> bool {
        matches!(
            self,
            MigrationId::CopyHistoryNotes
                | MigrationId::PurgeOrphanAppointments
                | MigrationId::ReclassifyHistory
        )
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationId {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().replace('_', "-").to_ascii_lowercase();
        MigrationId::ALL
            .iter()
            .copied()
            .find(|id| id.as_str() == wanted)
            .ok_or_else(|| {
                let known: Vec<&str> = MigrationId::ALL.iter().map(|id| id.as_str()).collect();
                MigrationError::InvalidRequest(format!(
                    "unknown migration '{}' (known: {})",
                    s,
                    known.join(", ")
                ))
            })
    }
}

// ============================================================================
// 错误类型
// ============================================================================

/// Step of the backup-then-mutate transaction that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStep {
    Begin,
    EnsureBackupTable,
    AlignBackupColumns,
    CopyToBackup,
    Mutate,
    Commit,
}

impl fmt::Display for TransactionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionStep::Begin => "begin transaction",
            TransactionStep::EnsureBackupTable => "ensure backup table",
            TransactionStep::AlignBackupColumns => "align backup columns",
            TransactionStep::CopyToBackup => "copy rows to backup",
            TransactionStep::Mutate => "mutate rows",
            TransactionStep::Commit => "commit",
        };
        f.write_str(name)
    }
}

/// 迁移错误
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Preview failed: {0}")]
    Preview(String),

    #[error("Transaction rolled back at step '{step}': {reason}")]
    Transaction {
        step: TransactionStep,
        reason: String,
    },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Snapshot failed: {0}")]
    Snapshot(String),

    #[error("Audit trail error: {0}")]
    AuditTrail(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Verification failed for {migration}: {reason}")]
    VerificationFailed { migration: String, reason: String },
}

// ============================================================================
// 测试
// ============================================================================
