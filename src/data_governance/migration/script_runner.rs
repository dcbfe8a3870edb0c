//! # Batch SQL Script Runner (批量脚本执行)
//!
//! Loads a multi-statement script, splits it on the delimiter and executes
//! the statements in order. The calling migration picks the failure mode.
//!
//! The splitter is deliberately naive: it does not understand quoting, so a
//! delimiter inside a literal or a comment cuts the statement in two. The
//! static checker flags those spots before anything runs.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use rusqlite::Connection;
use serde::Serialize;

use super::script_checker::{CheckResult, MigrationScriptChecker};
use super::MigrationError;

pub const DEFAULT_DELIMITER: char = ';';

/// Longest statement prefix kept in reports and logs.
const STATEMENT_PREVIEW_CHARS: usize = 80;

/// 失败处理模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScriptMode {
    /// Abort at the first failing statement; the rest are skipped
    #[serde(rename = "stop")]
    StopOnFirstFailure,
    /// Attempt every statement and collect all errors
    #[serde(rename = "continue")]
    ContinueOnError,
}

impl fmt::Display for ScriptMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptMode::StopOnFirstFailure => f.write_str("stop"),
            ScriptMode::ContinueOnError => f.write_str("continue"),
        }
    }
}

impl FromStr for ScriptMode {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stop" => Ok(ScriptMode::StopOnFirstFailure),
            "continue" => Ok(ScriptMode::ContinueOnError),
            other => Err(MigrationError::InvalidRequest(format!(
                "unknown script mode '{}' (expected stop or continue)",
                other
            ))),
        }
    }
}

/// Read a script file.
pub fn load_script(path: &Path) -> Result<String, MigrationError> {
    std::fs::read_to_string(path)
        .map_err(|e| MigrationError::Script(format!("cannot read {}: {}", path.display(), e)))
}

/// Split on `delimiter`, drop pure `--` comment lines and blank chunks.
pub fn split_statements(script: &str, delimiter: char) -> Vec<String> {
    script
        .split(delimiter)
        .filter_map(|chunk| {
            let kept: Vec<&str> = chunk
                .lines()
                .filter(|line| !line.trim_start().starts_with("--"))
                .collect();
            let statement = kept.join("\n").trim().to_string();
            (!statement.is_empty()).then_some(statement)
        })
        .collect()
}

fn preview(statement: &str) -> String {
    let flat = statement.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= STATEMENT_PREVIEW_CHARS {
        flat
    } else {
        let cut: String = flat.chars().take(STATEMENT_PREVIEW_CHARS).collect();
        format!("{}...", cut)
    }
}

/// Result of one executed statement.
#[derive(Debug, Clone, Serialize)]
pub struct StatementOutcome {
    /// 1-based position after splitting
    pub index: usize,
    pub statement: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatementOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScriptRunReport {
    pub script_name: String,
    pub mode: ScriptMode,
    pub statements_total: usize,
    /// Attempted statements, in order
    pub outcomes: Vec<StatementOutcome>,
    /// Statements never attempted because stop mode aborted
    pub skipped: usize,
    pub lint: CheckResult,
}

impl ScriptRunReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &StatementOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    pub fn failed(&self) -> usize {
        self.failures().count()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0 && self.skipped == 0
    }
}

pub struct ScriptRunner<'a> {
    conn: &'a Connection,
    delimiter: char,
}

impl<'a> ScriptRunner<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self {
            conn,
            delimiter: DEFAULT_DELIMITER,
        }
    }

    pub fn with_delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Lint, split and execute `script`. Statement failures land in the
    /// report, never in `Err`.
    pub fn run(&self, script_name: &str, script: &str, mode: ScriptMode) -> ScriptRunReport {
        let lint = MigrationScriptChecker::new(self.delimiter).check(script_name, script);
        for finding in lint.errors.iter().chain(lint.warnings.iter()) {
            tracing::warn!(
                "[ScriptRunner] lint {}: {} ({})",
                finding.rule,
                finding.message,
                finding.suggestion
            );
        }

        let statements = split_statements(script, self.delimiter);
        let statements_total = statements.len();
        tracing::info!(
            "[ScriptRunner] {}: {} statement(s), mode={}",
            script_name,
            statements_total,
            mode
        );

        let mut outcomes = Vec::with_capacity(statements_total);
        for (idx, statement) in statements.iter().enumerate() {
            let index = idx + 1;
            let error = match self.conn.execute_batch(statement) {
                Ok(()) => None,
                Err(e) => {
                    tracing::warn!(
                        "[ScriptRunner] {} statement {} failed: {} | {}",
                        script_name,
                        index,
                        e,
                        preview(statement)
                    );
                    Some(e.to_string())
                }
            };
            let failed = error.is_some();
            outcomes.push(StatementOutcome {
                index,
                statement: preview(statement),
                error,
            });
            if failed && mode == ScriptMode::StopOnFirstFailure {
                break;
            }
        }

        let skipped = statements_total - outcomes.len();
        if skipped > 0 {
            tracing::warn!(
                "[ScriptRunner] {} aborted, {} statement(s) not attempted",
                script_name,
                skipped
            );
        }

        ScriptRunReport {
            script_name: script_name.to_string(),
            mode,
            statements_total,
            outcomes,
            skipped,
            lint,
        }
    }
}
