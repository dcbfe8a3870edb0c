//! # Dry-Run Gate (预演门控)
//!
//! Destructive migrations only run when the caller supplied the exact token
//! `yes`. Anything else, including no token at all, produces an impact
//! preview computed from the same predicate the mutation would use.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use super::definitions::MutationPlan;
use super::MigrationError;

/// Rows a pending migration would touch. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationImpact {
    pub affected_row_count: u64,
}

/// Caller's confirmation intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confirmation {
    Confirmed,
    #[default]
    NotConfirmed,
}

impl Confirmation {
    /// The only token that authorizes execution. Matched exactly.
    pub const TOKEN: &'static str = "yes";

    pub fn from_token(token: Option<&str>) -> Self {
        match token {
            Some(Self::TOKEN) => Confirmation::Confirmed,
            _ => Confirmation::NotConfirmed,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, Confirmation::Confirmed)
    }
}

/// What the gate decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Not confirmed: report this and stop
    Preview(MigrationImpact),
    /// Confirmed: go ahead with the mutation
    Proceed,
}

pub struct DryRunGate;

impl DryRunGate {
    /// Decide for a backup-then-mutate plan.
    pub fn evaluate(
        conn: &Connection,
        plan: &MutationPlan,
        confirmation: Confirmation,
    ) -> Result<GateDecision, MigrationError> {
        Self::evaluate_with(confirmation, || Self::count_matching(conn, plan))
    }

    /// Decide with a caller supplied counter. The counter only runs on the
    /// preview path.
    pub fn evaluate_with<F>(
        confirmation: Confirmation,
        count: F,
    ) -> Result<GateDecision, MigrationError>
    where
        F: FnOnce() -> Result<u64, MigrationError>,
    {
        if confirmation.is_confirmed() {
            return Ok(GateDecision::Proceed);
        }
        let affected_row_count = count()?;
        tracing::info!(
            "[DryRunGate] not confirmed, {} row(s) would be affected",
            affected_row_count
        );
        Ok(GateDecision::Preview(MigrationImpact { affected_row_count }))
    }

    /// Read-only count over the plan's predicate.
    pub fn count_matching(conn: &Connection, plan: &MutationPlan) -> Result<u64, MigrationError> {
        let count: i64 = conn
            .query_row(&plan.count_sql(), [], |row| row.get(0))
            .map_err(|e| {
                MigrationError::Preview(format!(
                    "counting rows of {} failed: {}",
                    plan.source_table, e
                ))
            })?;
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_governance::migration::definitions::copy_history_notes_plan;
    use crate::test_utils::database_seed::{insert_history, seed_clinic_database};
    use assert_matches::assert_matches;

    #[test]
    fn test_only_exact_yes_confirms() {
        assert_eq!(Confirmation::from_token(Some("yes")), Confirmation::Confirmed);
        for other in [None, Some(""), Some("YES"), Some("y"), Some(" yes"), Some("true")] {
            assert_eq!(Confirmation::from_token(other), Confirmation::NotConfirmed);
        }
    }

    #[test]
    fn test_preview_counts_without_mutating() {
        let conn = Connection::open_in_memory().unwrap();
        seed_clinic_database(&conn).unwrap();
        insert_history(&conn, 1, 1, None, None, Some("felt dizzy")).unwrap();
        insert_history(&conn, 2, 1, None, Some("  \t"), Some("headache")).unwrap();
        insert_history(&conn, 3, 1, None, Some("done"), Some("ignored")).unwrap();
        insert_history(&conn, 4, 1, None, None, Some("   ")).unwrap();

        let plan = copy_history_notes_plan();
        let decision =
            DryRunGate::evaluate(&conn, &plan, Confirmation::NotConfirmed).unwrap();
        assert_eq!(
            decision,
            GateDecision::Preview(MigrationImpact {
                affected_row_count: 2
            })
        );

        let untouched: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM patient_history_records WHERE interview IS NULL",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(untouched, 2);
    }

    #[test]
    fn test_confirmed_skips_counting() {
        let decision = DryRunGate::evaluate_with(Confirmation::Confirmed, || {
            panic!("counter must not run when confirmed")
        })
        .unwrap();
        assert_eq!(decision, GateDecision::Proceed);
    }

    #[test]
    fn test_count_failure_is_a_preview_error() {
        let conn = Connection::open_in_memory().unwrap();
        let err = DryRunGate::evaluate(&conn, &copy_history_notes_plan(), Confirmation::NotConfirmed)
            .unwrap_err();
        assert_matches!(err, MigrationError::Preview(msg) if msg.contains("patient_history_records"));
    }
}
