//! # 迁移脚本静态检查器
//!
//! Static lint for multi-statement SQL scripts, run before any statement
//! touches the database.
//!
//! ## Principles
//!
//! - **Text only**: the checker never looks at database state
//! - **Advisory**: findings are logged and attached to the run report; the
//!   runner still executes the script. Errors mark statements the splitter
//!   is known to mangle
//! - **Opt-out per rule**: `-- @skip-check: <rule>` (or `all`) disables a rule
//!
//! ## Rules
//!
//! 1. `idempotent_create`: CREATE TABLE without IF NOT EXISTS (warning)
//! 2. `idempotent_drop`: DROP TABLE without IF EXISTS (warning)
//! 3. `idempotent_index`: CREATE INDEX without IF NOT EXISTS (warning)
//! 4. `delimiter_in_literal`: the statement delimiter inside a quoted literal
//!    (error, the naive splitter would cut the statement in two)
//! 5. `delimiter_in_comment`: the delimiter inside a comment (error, same
//!    reason)

use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::LazyLock;

// ============================================================================
// 预编译正则表达式
// ============================================================================

/// CREATE TABLE 语句（所有）
static RE_ALL_CREATES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"CREATE\s+TABLE\s+(\w+)\s*\(").unwrap());

/// CREATE TABLE IF NOT EXISTS
static RE_SAFE_CREATES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"CREATE\s+TABLE\s+IF\s+NOT\s+EXISTS\s+(\w+)").unwrap());

/// DROP TABLE 语句（所有）
static RE_ALL_DROPS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"DROP\s+TABLE\s+(\w+)").unwrap());

/// DROP TABLE IF EXISTS
static RE_SAFE_DROPS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"DROP\s+TABLE\s+IF\s+EXISTS\s+(\w+)").unwrap());

/// CREATE INDEX 语句（所有）
static RE_ALL_INDEXES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"CREATE\s+(?:UNIQUE\s+)?INDEX\s+(\w+)\s+ON").unwrap());

/// CREATE INDEX IF NOT EXISTS
static RE_SAFE_INDEXES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"CREATE\s+(?:UNIQUE\s+)?INDEX\s+IF\s+NOT\s+EXISTS\s+(\w+)").unwrap()
});

const SKIP_MARKER: &str = "-- @skip-check:";

/// 检查结果
#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckResult {
    pub passed: bool,
    pub warnings: Vec<CheckFinding>,
    pub errors: Vec<CheckFinding>,
}

impl CheckResult {
    fn new() -> Self {
        Self {
            passed: true,
            ..Self::default()
        }
    }

    fn add_warning(&mut self, finding: CheckFinding) {
        self.warnings.push(finding);
    }

    fn add_error(&mut self, finding: CheckFinding) {
        self.passed = false;
        self.errors.push(finding);
    }
}

/// One rule hit.
#[derive(Debug, Clone, Serialize)]
pub struct CheckFinding {
    pub rule: &'static str,
    pub message: String,
    pub suggestion: String,
}

/// Where a delimiter sits when it is not a statement boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HiddenDelimiter {
    Literal,
    Comment,
}

/// 迁移脚本检查器
pub struct MigrationScriptChecker {
    delimiter: char,
    /// 跳过的规则（`-- @skip-check: rule_name`）
    skipped_rules: HashSet<String>,
}

impl MigrationScriptChecker {
    pub fn new(delimiter: char) -> Self {
        Self {
            delimiter,
            skipped_rules: HashSet::new(),
        }
    }

    /// Check `sql`; `script_name` only labels the messages.
    pub fn check(&mut self, script_name: &str, sql: &str) -> CheckResult {
        let mut result = CheckResult::new();

        self.parse_skip_markers(sql);
        let normalized = normalize_sql(sql);

        if !self.is_skipped("idempotent_create") {
            check_idempotent_create(script_name, &normalized, &mut result);
        }
        if !self.is_skipped("idempotent_drop") {
            check_idempotent_drop(script_name, &normalized, &mut result);
        }
        if !self.is_skipped("idempotent_index") {
            check_idempotent_index(script_name, &normalized, &mut result);
        }

        let hidden = hidden_delimiters(sql, self.delimiter);
        if !self.is_skipped("delimiter_in_literal") {
            for line in lines_of(&hidden, HiddenDelimiter::Literal) {
                result.add_error(CheckFinding {
                    rule: "delimiter_in_literal",
                    message: format!(
                        "[{}] line {}: '{}' inside a quoted literal would split the statement",
                        script_name, line, self.delimiter
                    ),
                    suggestion: format!(
                        "build the value with char({}) or run the statement separately",
                        self.delimiter as u32
                    ),
                });
            }
        }
        if !self.is_skipped("delimiter_in_comment") {
            for line in lines_of(&hidden, HiddenDelimiter::Comment) {
                result.add_error(CheckFinding {
                    rule: "delimiter_in_comment",
                    message: format!(
                        "[{}] line {}: '{}' inside a comment would split the script",
                        script_name, line, self.delimiter
                    ),
                    suggestion: format!("remove '{}' from the comment", self.delimiter),
                });
            }
        }

        result
    }

    fn parse_skip_markers(&mut self, sql: &str) {
        self.skipped_rules.clear();
        for line in sql.lines() {
            if let Some(rule) = line.trim().strip_prefix(SKIP_MARKER) {
                self.skipped_rules.insert(rule.trim().to_string());
            }
        }
    }

    fn is_skipped(&self, rule: &str) -> bool {
        self.skipped_rules.contains(rule) || self.skipped_rules.contains("all")
    }
}

/// 标准化 SQL（移除注释，转为大写）
fn normalize_sql(sql: &str) -> String {
    let mut result = String::new();
    let mut in_block_comment = false;

    for line in sql.lines() {
        let mut chars = line.chars().peekable();
        let mut line_result = String::new();

        while let Some(c) = chars.next() {
            if in_block_comment {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    in_block_comment = false;
                }
            } else if c == '-' && chars.peek() == Some(&'-') {
                break;
            } else if c == '/' && chars.peek() == Some(&'*') {
                chars.next();
                in_block_comment = true;
            } else {
                line_result.push(c);
            }
        }

        if !line_result.trim().is_empty() {
            result.push_str(&line_result);
            result.push('\n');
        }
    }

    result.to_uppercase()
}

/// 1-based line numbers of delimiters that are not statement boundaries.
fn hidden_delimiters(sql: &str, delimiter: char) -> Vec<(usize, HiddenDelimiter)> {
    let mut found = Vec::new();
    let mut quote: Option<char> = None;
    let mut in_block_comment = false;

    for (idx, line) in sql.lines().enumerate() {
        let line_no = idx + 1;
        let mut chars = line.chars().peekable();
        let mut in_line_comment = false;

        while let Some(c) = chars.next() {
            if in_line_comment {
                if c == delimiter {
                    found.push((line_no, HiddenDelimiter::Comment));
                }
                continue;
            }
            if in_block_comment {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    in_block_comment = false;
                } else if c == delimiter {
                    found.push((line_no, HiddenDelimiter::Comment));
                }
                continue;
            }
            if let Some(q) = quote {
                if c == q {
                    // doubled quote is an escaped quote
                    if chars.peek() == Some(&q) {
                        chars.next();
                    } else {
                        quote = None;
                    }
                } else if c == delimiter {
                    found.push((line_no, HiddenDelimiter::Literal));
                }
                continue;
            }
            match c {
                '\'' | '"' => quote = Some(c),
                '-' if chars.peek() == Some(&'-') => in_line_comment = true,
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    in_block_comment = true;
                }
                _ => {}
            }
        }
    }

    found
}

fn lines_of(hidden: &[(usize, HiddenDelimiter)], kind: HiddenDelimiter) -> Vec<usize> {
    let mut lines: Vec<usize> = hidden
        .iter()
        .filter(|(_, k)| *k == kind)
        .map(|(line, _)| *line)
        .collect();
    lines.dedup();
    lines
}

fn safe_names(re: &Regex, normalized: &str) -> HashSet<String> {
    re.captures_iter(normalized)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

fn check_idempotent_create(script_name: &str, normalized: &str, result: &mut CheckResult) {
    let safe_tables = safe_names(&RE_SAFE_CREATES, normalized);

    for cap in RE_ALL_CREATES.captures_iter(normalized) {
        let table_name = cap.get(1).map(|m| m.as_str()).unwrap_or("");
        if safe_tables.contains(table_name) {
            continue;
        }
        let table_name_lower = table_name.to_lowercase();
        result.add_warning(CheckFinding {
            rule: "idempotent_create",
            message: format!(
                "[{}] CREATE TABLE {} without IF NOT EXISTS fails on a second run",
                script_name, table_name_lower
            ),
            suggestion: format!("CREATE TABLE IF NOT EXISTS {} (...)", table_name_lower),
        });
    }
}

fn check_idempotent_drop(script_name: &str, normalized: &str, result: &mut CheckResult) {
    let safe_tables = safe_names(&RE_SAFE_DROPS, normalized);

    for cap in RE_ALL_DROPS.captures_iter(normalized) {
        let table_name = cap.get(1).map(|m| m.as_str()).unwrap_or("");
        // "DROP TABLE IF EXISTS" also matches with "IF" as the name
        if table_name == "IF" || safe_tables.contains(table_name) {
            continue;
        }
        let table_name_lower = table_name.to_lowercase();
        result.add_warning(CheckFinding {
            rule: "idempotent_drop",
            message: format!(
                "[{}] DROP TABLE {} without IF EXISTS",
                script_name, table_name_lower
            ),
            suggestion: format!("DROP TABLE IF EXISTS {}", table_name_lower),
        });
    }
}

fn check_idempotent_index(script_name: &str, normalized: &str, result: &mut CheckResult) {
    let safe_indexes = safe_names(&RE_SAFE_INDEXES, normalized);

    for cap in RE_ALL_INDEXES.captures_iter(normalized) {
        let index_name = cap.get(1).map(|m| m.as_str()).unwrap_or("");
        if index_name == "IF" || safe_indexes.contains(index_name) {
            continue;
        }
        let index_name_lower = index_name.to_lowercase();
        result.add_warning(CheckFinding {
            rule: "idempotent_index",
            message: format!(
                "[{}] CREATE INDEX {} without IF NOT EXISTS",
                script_name, index_name_lower
            ),
            suggestion: format!("CREATE INDEX IF NOT EXISTS {} ON ...", index_name_lower),
        });
    }
}

// ============================================================================
// 便捷函数
// ============================================================================

/// Check one script against the default `;` delimiter.
pub fn check_migration_script(script_name: &str, sql: &str) -> CheckResult {
    MigrationScriptChecker::new(super::script_runner::DEFAULT_DELIMITER).check(script_name, sql)
}

// ============================================================================
// 测试
// ============================================================================
