//! Configuration for the migration tool.
//!
//! Sources, lowest precedence first:
//!
//! 1. built-in defaults
//! 2. `config/clinic_migrate.{toml,json,...}` (optional)
//! 3. `CLINIC_MIGRATE__<FIELD>` environment variables (after `.env`)
//!
//! Request options (`db=`, `backup_dir=`) override all of them for one
//! invocation.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::data_governance::migration::definitions::DEFAULT_SCHEMA;
use crate::data_governance::migration::{EngineSettings, MigrationError};

pub const CONFIG_FILE_STEM: &str = "config/clinic_migrate";
pub const ENV_PREFIX: &str = "CLINIC_MIGRATE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// SQLite file to migrate
    pub database_path: Option<PathBuf>,
    /// Database name for schema metadata (`main` or an attached name)
    pub schema_name: String,
    /// Audit CSVs and snapshots
    pub backup_dir: PathBuf,
    pub snapshot_before_mutation: bool,
    /// Used when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            schema_name: DEFAULT_SCHEMA.to_string(),
            backup_dir: PathBuf::from("backups"),
            snapshot_before_mutation: true,
            log_filter: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load from `.env`, the default config file and the environment.
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::load_from(Path::new(CONFIG_FILE_STEM))
    }

    /// Load with an explicit config file stem (extension optional).
    pub fn load_from(file_stem: &Path) -> anyhow::Result<Self> {
        let loaded = config::Config::builder()
            .add_source(config::File::from(file_stem).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("loading configuration from {}", file_stem.display()))?;

        loaded
            .try_deserialize::<AppConfig>()
            .context("invalid configuration")
    }

    /// Apply per-invocation overrides.
    pub fn with_overrides(mut self, database: Option<&Path>, backup_dir: Option<&Path>) -> Self {
        if let Some(db) = database {
            self.database_path = Some(db.to_path_buf());
        }
        if let Some(dir) = backup_dir {
            self.backup_dir = dir.to_path_buf();
        }
        self
    }

    pub fn database_path(&self) -> Result<&Path, MigrationError> {
        self.database_path.as_deref().ok_or_else(|| {
            MigrationError::Config(format!(
                "no database configured (pass db=<path> or set {}__DATABASE_PATH)",
                ENV_PREFIX
            ))
        })
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            schema_name: self.schema_name.clone(),
            backup_dir: self.backup_dir.clone(),
            snapshot_before_mutation: self.snapshot_before_mutation,
        }
    }
}
