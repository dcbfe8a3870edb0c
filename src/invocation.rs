//! Invocation surfaces: CLI arguments and HTTP query strings.
//!
//! Both end in the same [`MigrationRequest`]. The engine never sees raw
//! arguments; it gets a typed [`MigrationTask`] built here once.

use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use serde::Serialize;

use crate::data_governance::migration::{
    Confirmation, MigrationError, MigrationId, MigrationTask, ScriptMode,
};

/// clinic-migrate <MIGRATION> [KEY=VALUE]...
#[derive(Debug, Parser)]
#[command(name = "clinic-migrate")]
#[command(version, about = "One-shot clinic database migrations", long_about = None)]
#[command(after_help = "Keys: confirm=yes, db=<path>, backup_dir=<dir>, script=<path>, \
                        mode=stop|continue, output=text|json")]
pub struct Cli {
    /// Migration to run, e.g. copy-history-notes
    pub migration: String,

    /// Parameters as key=value
    #[arg(value_name = "KEY=VALUE")]
    pub params: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for OutputFormat {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(MigrationError::InvalidRequest(format!(
                "unknown output '{}' (expected text or json)",
                other
            ))),
        }
    }
}

/// Options that shape the invocation, not the migration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    pub db: Option<PathBuf>,
    pub backup_dir: Option<PathBuf>,
    pub output: OutputFormat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRequest {
    pub task: MigrationTask,
    pub options: RequestOptions,
}

fn invalid(msg: String) -> MigrationError {
    MigrationError::InvalidRequest(msg)
}

fn non_empty_path(key: &str, value: &str) -> Result<PathBuf, MigrationError> {
    if value.trim().is_empty() {
        return Err(invalid(format!("{} needs a value", key)));
    }
    Ok(PathBuf::from(value))
}

/// Split one `key=value` argument.
pub fn split_pair(raw: &str) -> Result<(String, String), MigrationError> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(invalid(format!(
            "malformed parameter '{}' (expected key=value)",
            raw
        ))),
    }
}

impl MigrationRequest {
    /// Build from a migration name and its parameters.
    pub fn from_pairs<I>(migration: &str, pairs: I) -> Result<Self, MigrationError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let migration: MigrationId = migration.parse()?;
        let mut task = MigrationTask::new(migration, Confirmation::NotConfirmed);
        let mut options = RequestOptions::default();
        let mut confirm: Option<String> = None;
        let mut seen = HashSet::new();

        for (key, value) in pairs {
            if !seen.insert(key.clone()) {
                return Err(invalid(format!("parameter '{}' given twice", key)));
            }
            match key.as_str() {
                "confirm" => confirm = Some(value),
                "db" => options.db = Some(non_empty_path("db", &value)?),
                "backup_dir" => options.backup_dir = Some(non_empty_path("backup_dir", &value)?),
                "script" => {
                    if migration != MigrationId::RunScript {
                        return Err(invalid(format!(
                            "script= only applies to {}",
                            MigrationId::RunScript
                        )));
                    }
                    task.script_path = Some(non_empty_path("script", &value)?);
                }
                "mode" => {
                    if !matches!(
                        migration,
                        MigrationId::RunScript | MigrationId::CreateBiometricsTables
                    ) {
                        return Err(invalid(format!(
                            "mode= does not apply to {}",
                            migration
                        )));
                    }
                    task.script_mode = Some(value.parse::<ScriptMode>()?);
                }
                "output" => options.output = value.parse()?,
                other => {
                    return Err(invalid(format!(
                        "unknown parameter '{}' (known: confirm, db, backup_dir, script, mode, output)",
                        other
                    )))
                }
            }
        }

        // Any confirm value other than the exact token is a dry run, never an error.
        task.confirmation = Confirmation::from_token(confirm.as_deref());
        Ok(Self { task, options })
    }

    pub fn from_cli(cli: &Cli) -> Result<Self, MigrationError> {
        let pairs = cli
            .params
            .iter()
            .map(|raw| split_pair(raw))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_pairs(&cli.migration, pairs)
    }

    /// `migration=<id>&confirm=yes&...`, with or without the leading `?`.
    pub fn from_query(query: &str) -> Result<Self, MigrationError> {
        let query = query.strip_prefix('?').unwrap_or(query);
        let mut migration: Option<String> = None;
        let mut pairs = Vec::new();

        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if key == "migration" {
                if migration.replace(value.into_owned()).is_some() {
                    return Err(invalid("parameter 'migration' given twice".to_string()));
                }
            } else {
                pairs.push((key.into_owned(), value.into_owned()));
            }
        }

        let migration =
            migration.ok_or_else(|| invalid("query has no migration=<id>".to_string()))?;
        Self::from_pairs(&migration, pairs)
    }
}
