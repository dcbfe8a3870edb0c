//! # Migration Coordinator (迁移协调器)
//!
//! Routes one typed request to the engine path of its migration.
//!
//! ## 职责
//!
//! 1. Gate destructive migrations behind the dry-run preview
//! 2. Snapshot the database before a confirmed destructive run
//! 3. Run the schema applier, backup-then-mutate, reclassification pass or
//!    script runner
//! 4. Verify script migrations afterwards
//!
//! The coordinator never reads the environment or the raw request; it only
//! sees [`MigrationTask`] and [`EngineSettings`].

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use super::backup_mutate::{backup_then_mutate, BackupMutateReport};
use super::definitions::{
    biometrics_expectations, copy_history_notes_plan, history_columns,
    purge_orphan_appointments_plan, reclassify_history_plan, MutationPlan, BIOMETRICS_SCRIPT,
    BIOMETRICS_SCRIPT_NAME,
};
use super::dry_run::{Confirmation, DryRunGate, GateDecision, MigrationImpact};
use super::reclassify::{ReclassificationReport, Reclassifier};
use super::schema::{ColumnStatus, SchemaApplier, SchemaApplyReport};
use super::script_runner::{load_script, ScriptMode, ScriptRunReport, ScriptRunner};
use super::verifier::MigrationVerifier;
use super::{MigrationError, MigrationId};
use crate::data_governance::audit::AuditTrailWriter;
use crate::data_governance::backup::snapshot_database;
use crate::database::MigrationSession;

/// Final, typed settings the engine runs with.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Database name used for schema metadata lookups
    pub schema_name: String,
    /// Audit trails and snapshots
    pub backup_dir: PathBuf,
    pub snapshot_before_mutation: bool,
}

/// What to run. Built once at the entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationTask {
    pub migration: MigrationId,
    pub confirmation: Confirmation,
    /// `run-script` only
    pub script_path: Option<PathBuf>,
    /// Overrides the migration's default script mode
    pub script_mode: Option<ScriptMode>,
}

impl MigrationTask {
    pub fn new(migration: MigrationId, confirmation: Confirmation) -> Self {
        Self {
            migration,
            confirmation,
            script_path: None,
            script_mode: None,
        }
    }
}

/// Result of one invocation.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MigrationOutcome {
    Preview {
        migration: MigrationId,
        impact: MigrationImpact,
    },
    Schema {
        migration: MigrationId,
        report: SchemaApplyReport,
    },
    BackupMutate {
        migration: MigrationId,
        report: BackupMutateReport,
    },
    Reclassify {
        migration: MigrationId,
        report: ReclassificationReport,
    },
    Script {
        migration: MigrationId,
        report: ScriptRunReport,
    },
}

impl MigrationOutcome {
    pub fn migration(&self) -> MigrationId {
        match self {
            MigrationOutcome::Preview { migration, .. }
            | MigrationOutcome::Schema { migration, .. }
            | MigrationOutcome::BackupMutate { migration, .. }
            | MigrationOutcome::Reclassify { migration, .. }
            | MigrationOutcome::Script { migration, .. } => *migration,
        }
    }

    /// A preview counts as success: nothing was asked to change.
    pub fn is_success(&self) -> bool {
        match self {
            MigrationOutcome::Preview { .. } | MigrationOutcome::BackupMutate { .. } => true,
            MigrationOutcome::Schema { report, .. } => report.is_success(),
            MigrationOutcome::Reclassify { report, .. } => report.is_success(),
            MigrationOutcome::Script { report, .. } => report.is_success(),
        }
    }
}

impl fmt::Display for MigrationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationOutcome::Preview { migration, impact } => write!(
                f,
                "{}: dry run, {} row(s) would be affected. Re-run with confirm={} to apply.",
                migration,
                impact.affected_row_count,
                Confirmation::TOKEN
            ),
            MigrationOutcome::Schema { migration, report } => {
                writeln!(
                    f,
                    "{}: {} column(s) added, {} already present, {} failed",
                    migration,
                    report.added_count(),
                    report.existing_count(),
                    report.failed_count()
                )?;
                for outcome in &report.outcomes {
                    let status = match &outcome.status {
                        ColumnStatus::AlreadyExists => "already exists".to_string(),
                        ColumnStatus::Added => "added".to_string(),
                        ColumnStatus::Failed { reason } => format!("FAILED: {}", reason),
                    };
                    writeln!(f, "  {}.{}: {}", outcome.table, outcome.column, status)?;
                }
                Ok(())
            }
            MigrationOutcome::BackupMutate { migration, report } => {
                write!(
                    f,
                    "{}: {} row(s) backed up into {}, {} row(s) mutated in {}",
                    migration,
                    report.rows_backed_up,
                    report.backup_table,
                    report.rows_mutated,
                    report.source_table
                )?;
                if let Some(path) = &report.snapshot_path {
                    write!(f, "\n  snapshot: {}", path)?;
                }
                Ok(())
            }
            MigrationOutcome::Reclassify { migration, report } => {
                writeln!(
                    f,
                    "{}: scanned {}, changed {}, unchanged {}, out of order {}, failed {}",
                    migration,
                    report.rows_scanned,
                    report.rows_changed,
                    report.rows_unchanged,
                    report.rows_out_of_order,
                    report.rows_failed()
                )?;
                writeln!(f, "  audit trail: {}", report.audit_path)?;
                if let Some(path) = &report.snapshot_path {
                    writeln!(f, "  snapshot: {}", path)?;
                }
                for failure in &report.failures {
                    writeln!(f, "  row {} FAILED: {}", failure.row_id, failure.reason)?;
                }
                Ok(())
            }
            MigrationOutcome::Script { migration, report } => {
                writeln!(
                    f,
                    "{} [{}] ({} mode): {}/{} statement(s) succeeded, {} failed, {} skipped",
                    migration,
                    report.script_name,
                    report.mode,
                    report.succeeded(),
                    report.statements_total,
                    report.failed(),
                    report.skipped
                )?;
                for failure in report.failures() {
                    writeln!(
                        f,
                        "  statement {} FAILED: {} | {}",
                        failure.index,
                        failure.error.as_deref().unwrap_or_default(),
                        failure.statement
                    )?;
                }
                for finding in report.lint.errors.iter().chain(report.lint.warnings.iter()) {
                    writeln!(f, "  lint {}: {}", finding.rule, finding.message)?;
                }
                Ok(())
            }
        }
    }
}

/// 迁移协调器
pub struct MigrationCoordinator<'a> {
    session: &'a mut MigrationSession,
    settings: &'a EngineSettings,
}

impl<'a> MigrationCoordinator<'a> {
    pub fn new(session: &'a mut MigrationSession, settings: &'a EngineSettings) -> Self {
        Self { session, settings }
    }

    pub fn run(&mut self, task: &MigrationTask) -> Result<MigrationOutcome, MigrationError> {
        tracing::info!(
            "[MigrationCoordinator] {} (confirmed={})",
            task.migration,
            task.confirmation.is_confirmed()
        );

        let mut snapshot_path = None;
        if task.migration.is_destructive() {
            if let GateDecision::Preview(impact) = self.gate(task)? {
                return Ok(MigrationOutcome::Preview {
                    migration: task.migration,
                    impact,
                });
            }
            snapshot_path = self.snapshot(task.migration)?;
        }

        match task.migration {
            MigrationId::AddHistoryColumns => Ok(self.add_columns(task.migration)),
            MigrationId::CopyHistoryNotes => {
                self.backup_mutate(task.migration, &copy_history_notes_plan(), snapshot_path)
            }
            MigrationId::PurgeOrphanAppointments => self.backup_mutate(
                task.migration,
                &purge_orphan_appointments_plan(),
                snapshot_path,
            ),
            MigrationId::ReclassifyHistory => self.reclassify(task.migration, snapshot_path),
            MigrationId::CreateBiometricsTables => self.biometrics(task),
            MigrationId::RunScript => self.run_script(task),
        }
    }

    /// Dry-run decision for a destructive migration, counted with the same
    /// predicate or parser its confirmed run uses.
    fn gate(&self, task: &MigrationTask) -> Result<GateDecision, MigrationError> {
        let conn = self.session.connection();
        match task.migration {
            MigrationId::CopyHistoryNotes => {
                DryRunGate::evaluate(conn, &copy_history_notes_plan(), task.confirmation)
            }
            MigrationId::PurgeOrphanAppointments => {
                DryRunGate::evaluate(conn, &purge_orphan_appointments_plan(), task.confirmation)
            }
            MigrationId::ReclassifyHistory => {
                let plan = reclassify_history_plan();
                let reclassifier = Reclassifier::new(conn, &plan);
                DryRunGate::evaluate_with(task.confirmation, || reclassifier.count_changes())
            }
            other => Err(MigrationError::InvalidRequest(format!(
                "{} has no dry-run preview",
                other
            ))),
        }
    }

    fn add_columns(&self, migration: MigrationId) -> MigrationOutcome {
        let applier = SchemaApplier::new(self.session.connection(), &self.settings.schema_name);
        let report = applier.apply_all(&history_columns());
        MigrationOutcome::Schema { migration, report }
    }

    fn backup_mutate(
        &mut self,
        migration: MigrationId,
        plan: &MutationPlan,
        snapshot_path: Option<String>,
    ) -> Result<MigrationOutcome, MigrationError> {
        let mut report = backup_then_mutate(self.session.connection_mut(), plan)?;
        report.snapshot_path = snapshot_path;
        Ok(MigrationOutcome::BackupMutate { migration, report })
    }

    fn reclassify(
        &self,
        migration: MigrationId,
        snapshot_path: Option<String>,
    ) -> Result<MigrationOutcome, MigrationError> {
        let plan = reclassify_history_plan();
        let mut audit = AuditTrailWriter::create(&self.settings.backup_dir, &plan.audit_prefix)?;
        let mut report = Reclassifier::new(self.session.connection(), &plan).run(&mut audit)?;
        report.snapshot_path = snapshot_path;
        Ok(MigrationOutcome::Reclassify { migration, report })
    }

    fn biometrics(&self, task: &MigrationTask) -> Result<MigrationOutcome, MigrationError> {
        let conn = self.session.connection();
        let mode = task.script_mode.unwrap_or(ScriptMode::StopOnFirstFailure);
        let report = ScriptRunner::new(conn).run(BIOMETRICS_SCRIPT_NAME, BIOMETRICS_SCRIPT, mode);

        if report.is_success() {
            MigrationVerifier::new(conn, &self.settings.schema_name)
                .verify(task.migration.as_str(), &biometrics_expectations())?;
        }
        Ok(MigrationOutcome::Script {
            migration: task.migration,
            report,
        })
    }

    fn run_script(&self, task: &MigrationTask) -> Result<MigrationOutcome, MigrationError> {
        let path = task.script_path.as_deref().ok_or_else(|| {
            MigrationError::InvalidRequest(format!("{} needs script=<path>", task.migration))
        })?;
        let script = load_script(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let mode = task.script_mode.unwrap_or(ScriptMode::ContinueOnError);

        let report = ScriptRunner::new(self.session.connection()).run(&name, &script, mode);
        Ok(MigrationOutcome::Script {
            migration: task.migration,
            report,
        })
    }

    /// Whole-database snapshot before a confirmed destructive run. Failure
    /// aborts before anything is mutated.
    fn snapshot(&self, migration: MigrationId) -> Result<Option<String>, MigrationError> {
        if !self.settings.snapshot_before_mutation {
            return Ok(None);
        }
        let path = snapshot_database(
            self.session.connection(),
            &self.settings.schema_name,
            &self.settings.backup_dir,
            migration.as_str(),
        )?;
        Ok(Some(path.display().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::database_seed::{insert_history, insert_patient, seed_clinic_database};
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    fn settings(dir: &TempDir, snapshot: bool) -> EngineSettings {
        EngineSettings {
            schema_name: "main".to_string(),
            backup_dir: dir.path().to_path_buf(),
            snapshot_before_mutation: snapshot,
        }
    }

    fn seeded_session() -> MigrationSession {
        let session = MigrationSession::open_in_memory().unwrap();
        seed_clinic_database(session.connection()).unwrap();
        insert_patient(session.connection(), 1, "Garcia").unwrap();
        insert_history(session.connection(), 1, 1, Some("flu"), None, Some("fever")).unwrap();
        session
    }

    #[test]
    fn test_unconfirmed_destructive_run_is_a_preview() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir, true);
        let mut session = seeded_session();

        let outcome = MigrationCoordinator::new(&mut session, &settings)
            .run(&MigrationTask::new(
                MigrationId::CopyHistoryNotes,
                Confirmation::NotConfirmed,
            ))
            .unwrap();

        assert_matches!(
            outcome,
            MigrationOutcome::Preview { impact: MigrationImpact { affected_row_count: 1 }, .. }
        );
        assert!(outcome.is_success());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0, "preview writes nothing");
    }

    #[test]
    fn test_confirmed_run_snapshots_first() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir, true);
        let mut session = seeded_session();

        let outcome = MigrationCoordinator::new(&mut session, &settings)
            .run(&MigrationTask::new(
                MigrationId::CopyHistoryNotes,
                Confirmation::Confirmed,
            ))
            .unwrap();

        match outcome {
            MigrationOutcome::BackupMutate { report, .. } => {
                assert_eq!(report.rows_mutated, 1);
                let snapshot = report.snapshot_path.expect("snapshot taken");
                assert!(std::path::Path::new(&snapshot).exists());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_snapshot_can_be_disabled() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir, false);
        let mut session = seeded_session();

        let outcome = MigrationCoordinator::new(&mut session, &settings)
            .run(&MigrationTask::new(
                MigrationId::PurgeOrphanAppointments,
                Confirmation::Confirmed,
            ))
            .unwrap();

        assert_matches!(
            outcome,
            MigrationOutcome::BackupMutate { ref report, .. } if report.snapshot_path.is_none()
        );
    }

    #[test]
    fn test_only_destructive_migrations_wait_for_confirmation() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir, true);

        for id in MigrationId::ALL.iter().filter(|id| id.is_destructive()) {
            let mut session = seeded_session();
            let outcome = MigrationCoordinator::new(&mut session, &settings)
                .run(&MigrationTask::new(*id, Confirmation::NotConfirmed))
                .unwrap();
            assert_matches!(outcome, MigrationOutcome::Preview { migration, .. } if migration == *id);
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        let mut session = seeded_session();
        let outcome = MigrationCoordinator::new(&mut session, &settings)
            .run(&MigrationTask::new(
                MigrationId::AddHistoryColumns,
                Confirmation::NotConfirmed,
            ))
            .unwrap();
        assert_matches!(outcome, MigrationOutcome::Schema { .. });
        assert_eq!(
            std::fs::read_dir(dir.path()).unwrap().count(),
            0,
            "non-destructive runs take no snapshot"
        );
    }

    #[test]
    fn test_run_script_requires_a_path() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir, false);
        let mut session = seeded_session();

        let err = MigrationCoordinator::new(&mut session, &settings)
            .run(&MigrationTask::new(MigrationId::RunScript, Confirmation::Confirmed))
            .unwrap_err();
        assert_matches!(err, MigrationError::InvalidRequest(_));
    }

    #[test]
    fn test_preview_text_mentions_confirmation() {
        let outcome = MigrationOutcome::Preview {
            migration: MigrationId::PurgeOrphanAppointments,
            impact: MigrationImpact {
                affected_row_count: 3,
            },
        };
        let text = outcome.to_string();
        assert!(text.contains("3 row(s) would be affected"));
        assert!(text.contains("confirm=yes"));
    }
}
