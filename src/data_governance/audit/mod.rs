//! # Audit 模块
//!
//! Append-only CSV audit trail for reclassification passes.
//!
//! ## Design
//!
//! 1. **One file per run**: file names carry a timestamp and a random
//!    suffix and are opened with `create_new`, so earlier trails are never
//!    overwritten.
//! 2. **Flushed per row**: a crash mid-run leaves every entry written so far
//!    on disk.
//! 3. **Independent of the database**: the file alone is enough to review
//!    or restore the original values.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::data_governance::migration::MigrationError;

/// Header row of every audit file.
pub const AUDIT_HEADER: [&str; 5] = [
    "id",
    "original_primary",
    "original_secondary",
    "updated_primary",
    "updated_secondary",
];

/// One examined row, before and after.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditTrailEntry {
    pub id: i64,
    pub original_primary: String,
    pub original_secondary: String,
    pub updated_primary: String,
    pub updated_secondary: String,
}

fn audit_err(path: &Path, e: impl std::fmt::Display) -> MigrationError {
    MigrationError::AuditTrail(format!("{}: {}", path.display(), e))
}

/// Append-only writer over a fresh CSV file.
pub struct AuditTrailWriter {
    path: PathBuf,
    writer: csv::Writer<File>,
    entries_written: u64,
}

impl AuditTrailWriter {
    /// Create `<dir>/<prefix>_<timestamp>_<suffix>.csv` and write the header.
    pub fn create(dir: &Path, prefix: &str) -> Result<Self, MigrationError> {
        std::fs::create_dir_all(dir).map_err(|e| audit_err(dir, e))?;

        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let file_name = format!(
            "{}_{}_{}.csv",
            prefix,
            Local::now().format("%Y%m%d_%H%M%S"),
            &suffix[..8]
        );
        let path = dir.join(file_name);

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| audit_err(&path, e))?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        writer
            .write_record(AUDIT_HEADER)
            .map_err(|e| audit_err(&path, e))?;
        writer.flush().map_err(|e| audit_err(&path, e))?;

        tracing::info!("[AuditTrail] writing {}", path.display());
        Ok(Self {
            path,
            writer,
            entries_written: 0,
        })
    }

    /// Append one entry and flush it to the file.
    pub fn append(&mut self, entry: &AuditTrailEntry) -> Result<(), MigrationError> {
        self.writer
            .serialize(entry)
            .map_err(|e| audit_err(&self.path, e))?;
        self.writer.flush().map_err(|e| audit_err(&self.path, e))?;
        self.entries_written += 1;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries_written(&self) -> u64 {
        self.entries_written
    }
}

/// Read a trail back, e.g. to verify a run or restore original values.
pub fn read_entries(path: &Path) -> Result<Vec<AuditTrailEntry>, MigrationError> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| audit_err(path, e))?;

    let headers = reader.headers().map_err(|e| audit_err(path, e))?.clone();
    if headers.iter().ne(AUDIT_HEADER.iter().copied()) {
        return Err(audit_err(path, format!("unexpected header {:?}", headers)));
    }

    reader
        .deserialize()
        .collect::<Result<Vec<AuditTrailEntry>, _>>()
        .map_err(|e| audit_err(path, e))
}
