//! Durable run/case records with indexed queries and a migration ladder
//!.

mod memory;
mod recorder;
mod sqlite;

pub use memory::InMemoryHistoryStore;
pub use recorder::{HistoryRecorder, ResultFormatter, RunContext};
pub use sqlite::SqliteHistoryStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorCode;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("store is closed")]
    Closed,
}

impl ErrorCode for HistoryError {
    fn code(&self) -> &'static str {
        match self {
            HistoryError::Sqlite(_) => "UNKNOWN",
            HistoryError::Io(_) => "UNKNOWN",
            HistoryError::RunNotFound(_) => "SUITE_NOT_FOUND",
            HistoryError::Closed => "NOT_RUNNING",
        }
    }
}

pub type Result<T> = std::result::Result<T, HistoryError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    #[default]
    Cli,
    Mcp,
    Dashboard,
    Ci,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Cli => "cli",
            Trigger::Mcp => "mcp",
            Trigger::Dashboard => "dashboard",
            Trigger::Ci => "ci",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cli" => Some(Trigger::Cli),
            "mcp" => Some(Trigger::Mcp),
            "dashboard" => Some(Trigger::Dashboard),
            "ci" => Some(Trigger::Ci),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Passed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseStatus {
    Passed,
    Failed,
    Skipped,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::Passed => "passed",
            CaseStatus::Failed => "failed",
            CaseStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "passed" => CaseStatus::Passed,
            "failed" => CaseStatus::Failed,
            _ => CaseStatus::Skipped,
        }
    }
}

/// Immutable-after-insert run record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRunRecord {
    pub id: String,
    pub project: String,
    pub timestamp_ms: i64,
    pub git_commit: Option<String>,
    pub git_branch: Option<String>,
    pub config_hash: String,
    pub trigger: Trigger,
    pub duration_ms: i64,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub flaky: u32,
    pub status: RunStatus,
}

/// Child of a run; FK with cascade delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCaseRunRecord {
    pub id: String,
    pub run_id: String,
    pub suite_id: String,
    pub case_name: String,
    pub status: CaseStatus,
    pub duration_ms: i64,
    pub attempts: u32,
    pub response_ms: Option<i64>,
    pub assertions: Option<i64>,
    pub error: Option<String>,
    pub snapshot: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RunQuery {
    pub status: Option<RunStatus>,
    pub days: Option<u32>,
    pub limit: u32,
    pub offset: u32,
}

pub struct RunPage {
    pub runs: Vec<TestRunRecord>,
    pub total: u64,
}

/// Shared contract for the durable (SQLite+WAL) and in-memory history
/// stores.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Inserts `run` and `cases` atomically; a partial insert must never be
    /// observable.
    async fn save_run(&self, run: TestRunRecord, cases: Vec<TestCaseRunRecord>) -> Result<()>;

    async fn get_run_by_id(&self, run_id: &str) -> Result<Option<(TestRunRecord, Vec<TestCaseRunRecord>)>>;

    /// Filtered, timestamp-descending; `limit` clamped to `[1, 100]`.
    /// `total` reflects the filter before `limit`/`offset` are applied.
    async fn get_runs(&self, project: &str, query: RunQuery) -> Result<RunPage>;

    async fn get_runs_in_date_range(
        &self,
        project: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<TestRunRecord>>;

    async fn get_cases_for_run(&self, run_id: &str) -> Result<Vec<TestCaseRunRecord>>;

    /// Most-recent cases named `case_name`, across most-recent runs, capped
    /// at `limit`.
    async fn get_case_history(
        &self,
        case_name: &str,
        project: &str,
        limit: u32,
        suite_id: Option<&str>,
    ) -> Result<Vec<TestCaseRunRecord>>;

    async fn get_distinct_case_names(
        &self,
        project: &str,
        suite_id: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Vec<String>>;

    /// Deletes runs older than `max_age` (form `/^(\d+)d$/`; anything else is
    /// treated as "no age-based cleanup") *and* any beyond the
    /// `max_runs`-most-recent. Returns the delete count.
    async fn cleanup(&self, project: &str, max_age: &str, max_runs: u32) -> Result<u64>;

    async fn close(&self) -> Result<()>;
}

pub fn clamp_limit(limit: u32) -> u32 {
    limit.clamp(1, 100)
}

/// Parses `max_age` per `/^(\d+)d$/`; other forms return `None` (caller
/// skips the age-based pass).
pub fn parse_max_age_days(max_age: &str) -> Option<i64> {
    let bytes = max_age.as_bytes();
    if bytes.is_empty() || bytes.last() != Some(&b'd') {
        return None;
    }
    let digits = &max_age[..max_age.len() - 1];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<i64>().ok()
}
