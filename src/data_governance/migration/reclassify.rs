//! # Free-Text Reclassification (自由文本重分类)
//!
//! Some free-text columns carry two logical sections glued together by
//! textual labels, e.g. `"Diagnosis: flu\nInterview: cough"`. This module
//! splits them into two real columns.
//!
//! ## Decision table
//!
//! | labels found                | primary                | secondary              |
//! |-----------------------------|------------------------|------------------------|
//! | A then B                    | between A and B        | after B                |
//! | B at or before A            | empty                  | empty                  |
//! | A only                      | after A                | empty                  |
//! | B only                      | empty                  | after B                |
//! | neither                     | empty                  | empty                  |
//!
//! An empty extracted secondary never overwrites the existing secondary
//! value. The primary is always the extracted one, so an empty extraction
//! clears the composite column. Rows with reversed labels lose only the
//! composite text; the original stays in the audit trail.
//!
//! ## Batch pass
//!
//! [`Reclassifier::run`] writes every examined row to the audit trail before
//! attempting its update. Updates are per row, outside any batch
//! transaction: a failing row is reported and the pass moves on.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use super::definitions::ReclassificationPlan;
use super::MigrationError;
use crate::data_governance::audit::{AuditTrailEntry, AuditTrailWriter};

// ============================================================================
// Pure parsing
// ============================================================================

/// The two section labels, matched case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionLabels {
    /// Label A
    pub primary: String,
    /// Label B
    pub secondary: String,
}

impl SectionLabels {
    pub fn new(primary: impl Into<String>, secondary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            secondary: secondary.into(),
        }
    }
}

/// Which row of the decision table applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelLayout {
    Ordered,
    OutOfOrder,
    PrimaryOnly,
    SecondaryOnly,
    Unlabelled,
}

/// Raw extraction, before the fallback rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedSections {
    pub layout: LabelLayout,
    pub primary: String,
    pub secondary: String,
}

/// Values to store after the fallback rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reclassified {
    pub layout: LabelLayout,
    pub primary: String,
    pub secondary: String,
}

pub fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Byte span of the first case-insensitive occurrence of `label`.
///
/// `folded` must be the ASCII-lowercased text; ASCII folding keeps byte
/// offsets valid for the original string.
fn find_label(folded: &str, label: &str) -> Option<(usize, usize)> {
    let needle = label.to_ascii_lowercase();
    if needle.is_empty() {
        return None;
    }
    folded
        .find(&needle)
        .map(|start| (start, start + needle.len()))
}

pub fn extract_sections(composite: &str, labels: &SectionLabels) -> ExtractedSections {
    let text = normalize_line_endings(composite);
    let folded = text.to_ascii_lowercase();

    let primary_span = find_label(&folded, &labels.primary);
    let secondary_span = find_label(&folded, &labels.secondary);

    let (layout, primary, secondary) = match (primary_span, secondary_span) {
        (Some((_, a_end)), Some((b_start, b_end))) if b_start >= a_end => (
            LabelLayout::Ordered,
            text[a_end..b_start].trim(),
            text[b_end..].trim(),
        ),
        (Some(_), Some(_)) => (LabelLayout::OutOfOrder, "", ""),
        (Some((_, a_end)), None) => (LabelLayout::PrimaryOnly, text[a_end..].trim(), ""),
        (None, Some((_, b_end))) => (LabelLayout::SecondaryOnly, "", text[b_end..].trim()),
        (None, None) => (LabelLayout::Unlabelled, "", ""),
    };

    ExtractedSections {
        layout,
        primary: primary.to_string(),
        secondary: secondary.to_string(),
    }
}

/// `(composite, existing secondary) -> (primary, secondary)`.
pub fn reclassify(composite: &str, existing_secondary: &str, labels: &SectionLabels) -> Reclassified {
    let extracted = extract_sections(composite, labels);
    let primary = extracted.primary;
    let secondary = if extracted.secondary.is_empty() {
        existing_secondary.to_string()
    } else {
        extracted.secondary
    };
    Reclassified {
        layout: extracted.layout,
        primary,
        secondary,
    }
}

// ============================================================================
// Batch pass
// ============================================================================

/// One row considered by the pass.
#[derive(Debug, Clone)]
pub struct ReclassificationCandidate {
    pub row_id: i64,
    pub original_composite_text: String,
    pub original_secondary_text: Option<String>,
    pub extracted_primary_text: String,
    pub extracted_secondary_text: String,
    pub layout: LabelLayout,
}

impl ReclassificationCandidate {
    fn from_row(
        row_id: i64,
        composite: String,
        secondary: Option<String>,
        labels: &SectionLabels,
    ) -> Self {
        let computed = reclassify(&composite, secondary.as_deref().unwrap_or(""), labels);
        Self {
            row_id,
            original_composite_text: composite,
            original_secondary_text: secondary,
            extracted_primary_text: computed.primary,
            extracted_secondary_text: computed.secondary,
            layout: computed.layout,
        }
    }

    /// NULL and empty secondary compare equal, so no write is issued for them.
    pub fn is_changed(&self) -> bool {
        self.extracted_primary_text != self.original_composite_text
            || self.extracted_secondary_text
                != self.original_secondary_text.as_deref().unwrap_or("")
    }

    pub fn audit_entry(&self) -> AuditTrailEntry {
        AuditTrailEntry {
            id: self.row_id,
            original_primary: self.original_composite_text.clone(),
            original_secondary: self.original_secondary_text.clone().unwrap_or_default(),
            updated_primary: self.extracted_primary_text.clone(),
            updated_secondary: self.extracted_secondary_text.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RowFailure {
    pub row_id: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReclassificationReport {
    pub rows_scanned: u64,
    pub rows_changed: u64,
    pub rows_unchanged: u64,
    /// Rows left unextracted because label B came first
    pub rows_out_of_order: u64,
    pub failures: Vec<RowFailure>,
    pub audit_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<String>,
}

impl ReclassificationReport {
    pub fn rows_failed(&self) -> u64 {
        self.failures.len() as u64
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct Reclassifier<'a> {
    conn: &'a Connection,
    plan: &'a ReclassificationPlan,
}

impl<'a> Reclassifier<'a> {
    pub fn new(conn: &'a Connection, plan: &'a ReclassificationPlan) -> Self {
        Self { conn, plan }
    }

    /// Current rows with a non-blank composite column, parsed.
    pub fn load_candidates(&self) -> Result<Vec<ReclassificationCandidate>, MigrationError> {
        let db_err = |e: rusqlite::Error| {
            MigrationError::Database(format!("reading {} failed: {}", self.plan.table, e))
        };
        let mut stmt = self.conn.prepare(&self.plan.select_sql()).map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })
            .map_err(db_err)?;

        let mut candidates = Vec::new();
        for row in rows {
            let (row_id, composite, secondary) = row.map_err(db_err)?;
            candidates.push(ReclassificationCandidate::from_row(
                row_id,
                composite.unwrap_or_default(),
                secondary,
                &self.plan.labels,
            ));
        }
        Ok(candidates)
    }

    /// Rows the pass would rewrite. Used by the dry-run gate.
    pub fn count_changes(&self) -> Result<u64, MigrationError> {
        let candidates = self
            .load_candidates()
            .map_err(|e| MigrationError::Preview(e.to_string()))?;
        Ok(candidates.iter().filter(|c| c.is_changed()).count() as u64)
    }

    pub fn run(&self, audit: &mut AuditTrailWriter) -> Result<ReclassificationReport, MigrationError> {
        let candidates = self.load_candidates()?;
        let mut update = self
            .conn
            .prepare(&self.plan.update_sql())
            .map_err(|e| MigrationError::Database(format!("preparing update failed: {}", e)))?;

        let mut report = ReclassificationReport {
            audit_path: audit.path().display().to_string(),
            ..Default::default()
        };

        for candidate in &candidates {
            report.rows_scanned += 1;
            // The audit entry records intent, so it is written before the update.
            audit.append(&candidate.audit_entry())?;

            if candidate.layout == LabelLayout::OutOfOrder {
                report.rows_out_of_order += 1;
                tracing::warn!(
                    "[Reclassifier] row {}: '{}' appears before '{}', nothing extracted",
                    candidate.row_id,
                    self.plan.labels.secondary,
                    self.plan.labels.primary
                );
            }

            if !candidate.is_changed() {
                report.rows_unchanged += 1;
                continue;
            }

            match update.execute(params![
                candidate.extracted_primary_text,
                candidate.extracted_secondary_text,
                candidate.row_id
            ]) {
                Ok(_) => report.rows_changed += 1,
                Err(e) => {
                    tracing::warn!(
                        "[Reclassifier] row {} update failed (continuing): {}",
                        candidate.row_id,
                        e
                    );
                    report.failures.push(RowFailure {
                        row_id: candidate.row_id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            "[Reclassifier] {}: scanned {}, changed {}, failed {}",
            self.plan.table,
            report.rows_scanned,
            report.rows_changed,
            report.rows_failed()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_governance::audit::read_entries;
    use crate::data_governance::migration::definitions::reclassify_history_plan;
    use crate::test_utils::database_seed::{history_sections, insert_history, seed_clinic_database};
    use tempfile::TempDir;

    fn labels() -> SectionLabels {
        SectionLabels::new("Diagnosis:", "Interview:")
    }

    #[test]
    fn test_both_labels_in_order() {
        let out = reclassify("Diagnosis: flu\nInterview: cough for 3 days", "", &labels());
        assert_eq!(out.layout, LabelLayout::Ordered);
        assert_eq!(out.primary, "flu");
        assert_eq!(out.secondary, "cough for 3 days");
    }

    #[test]
    fn test_out_of_order_labels_extract_nothing() {
        let extracted = extract_sections("Interview: cough\nDiagnosis: flu", &labels());
        assert_eq!(extracted.layout, LabelLayout::OutOfOrder);
        assert_eq!(extracted.primary, "");
        assert_eq!(extracted.secondary, "");

        let out = reclassify("Interview: cough\nDiagnosis: flu", "earlier notes", &labels());
        assert_eq!(out.primary, "");
        assert_eq!(out.secondary, "earlier notes");
    }

    #[test]
    fn test_primary_only_keeps_existing_secondary() {
        let out = reclassify("Diagnosis: flu", "earlier notes", &labels());
        assert_eq!(out.layout, LabelLayout::PrimaryOnly);
        assert_eq!(out.primary, "flu");
        assert_eq!(out.secondary, "earlier notes");
    }

    #[test]
    fn test_secondary_only_clears_primary() {
        let out = reclassify("Interview: sore throat", "earlier notes", &labels());
        assert_eq!(out.layout, LabelLayout::SecondaryOnly);
        assert_eq!(out.primary, "");
        assert_eq!(out.secondary, "sore throat");
    }

    #[test]
    fn test_unlabelled_text_clears_primary_and_keeps_secondary() {
        let out = reclassify("patient seemed fine", "earlier notes", &labels());
        assert_eq!(out.layout, LabelLayout::Unlabelled);
        assert_eq!(out.primary, "");
        assert_eq!(out.secondary, "earlier notes");
    }

    #[test]
    fn test_labels_match_case_insensitively_across_crlf() {
        let out = reclassify("DIAGNOSIS:  migraine \r\n\r\ninterview:\r\nlight sensitivity\r\n", "", &labels());
        assert_eq!(out.layout, LabelLayout::Ordered);
        assert_eq!(out.primary, "migraine");
        assert_eq!(out.secondary, "light sensitivity");
    }

    #[test]
    fn test_non_ascii_text_keeps_byte_offsets() {
        let out = reclassify("Diagnóstico previo. Diagnosis: gripe leve\nInterview: tos según paciente", "", &labels());
        assert_eq!(out.primary, "gripe leve");
        assert_eq!(out.secondary, "tos según paciente");
    }

    #[test]
    fn test_multiline_primary_section_is_kept_whole() {
        let out = reclassify(
            "Diagnosis: type 2 diabetes\nfollow-up in 3 months\nInterview: thirst, fatigue",
            "",
            &labels(),
        );
        assert_eq!(out.primary, "type 2 diabetes\nfollow-up in 3 months");
        assert_eq!(out.secondary, "thirst, fatigue");
    }

    fn seeded() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        seed_clinic_database(&conn).unwrap();
        insert_history(&conn, 1, 1, Some("Diagnosis: flu\nInterview: cough for 3 days"), None, None).unwrap();
        insert_history(&conn, 2, 1, Some("Interview: cough\nDiagnosis: flu"), Some("older"), None).unwrap();
        insert_history(&conn, 3, 1, Some("Diagnosis: flu"), Some("kept"), None).unwrap();
        insert_history(&conn, 4, 1, Some("flu"), Some(""), None).unwrap();
        insert_history(&conn, 5, 1, Some("   "), Some("blank composite"), None).unwrap();
        conn
    }

    #[test]
    fn test_pass_updates_changed_rows_and_audits_all() {
        let conn = seeded();
        let dir = TempDir::new().unwrap();
        let plan = reclassify_history_plan();
        let mut audit = AuditTrailWriter::create(dir.path(), &plan.audit_prefix).unwrap();

        let report = Reclassifier::new(&conn, &plan).run(&mut audit).unwrap();

        assert_eq!(report.rows_scanned, 4);
        assert_eq!(report.rows_changed, 4);
        assert_eq!(report.rows_unchanged, 0);
        assert_eq!(report.rows_out_of_order, 1);
        assert!(report.is_success());

        assert_eq!(
            history_sections(&conn, 1).unwrap(),
            (Some("flu".into()), Some("cough for 3 days".into()))
        );
        assert_eq!(
            history_sections(&conn, 2).unwrap(),
            (Some("".into()), Some("older".into()))
        );
        assert_eq!(
            history_sections(&conn, 3).unwrap(),
            (Some("flu".into()), Some("kept".into()))
        );
        assert_eq!(history_sections(&conn, 4).unwrap(), (Some("".into()), Some("".into())));

        let entries = read_entries(audit.path()).unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].original_primary, "Diagnosis: flu\nInterview: cough for 3 days");
        assert_eq!(entries[0].updated_secondary, "cough for 3 days");
    }

    #[test]
    fn test_failing_row_does_not_block_the_rest() {
        let conn = seeded();
        conn.execute_batch(
            "CREATE TRIGGER lock_row_1 BEFORE UPDATE ON patient_history_records
             WHEN OLD.id = 1
             BEGIN SELECT RAISE(ABORT, 'row locked'); END;",
        )
        .unwrap();
        let dir = TempDir::new().unwrap();
        let plan = reclassify_history_plan();
        let mut audit = AuditTrailWriter::create(dir.path(), &plan.audit_prefix).unwrap();

        let report = Reclassifier::new(&conn, &plan).run(&mut audit).unwrap();

        assert_eq!(report.rows_failed(), 1);
        assert_eq!(report.failures[0].row_id, 1);
        assert!(report.failures[0].reason.contains("row locked"));
        assert_eq!(report.rows_changed, 3);
        assert!(!report.is_success());
        // Partial completion is expected: row 3 committed on its own.
        assert_eq!(history_sections(&conn, 3).unwrap().0.as_deref(), Some("flu"));
        assert_eq!(read_entries(audit.path()).unwrap().len(), 4);
    }

    #[test]
    fn test_repeated_passes_settle_once_composites_are_blank() {
        let conn = seeded();
        let dir = TempDir::new().unwrap();
        let plan = reclassify_history_plan();
        let reclassifier = Reclassifier::new(&conn, &plan);

        let mut first = AuditTrailWriter::create(dir.path(), &plan.audit_prefix).unwrap();
        reclassifier.run(&mut first).unwrap();

        // Rows 1 and 3 now hold a bare "flu" with no label, which clears.
        let mut second = AuditTrailWriter::create(dir.path(), &plan.audit_prefix).unwrap();
        let report = reclassifier.run(&mut second).unwrap();
        assert_eq!(report.rows_scanned, 2);
        assert_eq!(report.rows_changed, 2);
        assert_eq!(
            history_sections(&conn, 1).unwrap(),
            (Some("".into()), Some("cough for 3 days".into()))
        );

        let mut third = AuditTrailWriter::create(dir.path(), &plan.audit_prefix).unwrap();
        let report = reclassifier.run(&mut third).unwrap();
        assert_eq!(report.rows_scanned, 0);
        assert_eq!(report.rows_changed, 0);
        assert_ne!(first.path(), second.path());
        assert_ne!(second.path(), third.path());
    }

    #[test]
    fn test_count_changes_matches_rows_changed() {
        let conn = seeded();
        let plan = reclassify_history_plan();
        let reclassifier = Reclassifier::new(&conn, &plan);
        let predicted = reclassifier.count_changes().unwrap();

        let dir = TempDir::new().unwrap();
        let mut audit = AuditTrailWriter::create(dir.path(), &plan.audit_prefix).unwrap();
        let report = reclassifier.run(&mut audit).unwrap();
        assert_eq!(predicted, report.rows_changed);
    }
}
