//! Folds a runner event stream into a `TestRunRecord`/`TestCaseRunRecord`
//! pair and persists it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::runners::RunnerEvent;

use super::{CaseStatus, HistoryStore, Result, RunStatus, TestCaseRunRecord, TestRunRecord, Trigger};

/// Per-case accumulator state while a suite's events are still streaming.
struct InFlightCase {
    suite_id: String,
    case_name: String,
    attempts: u32,
}

/// Folds case-level runner events into a completed `SuiteRunResult` summary
/// (pass/fail/skip counts, per-case outcomes, total duration). One formatter
/// instance is good for exactly one run.
#[derive(Default)]
pub struct ResultFormatter {
    open: HashMap<(String, String), InFlightCase>,
    cases: Vec<TestCaseRunRecord>,
    passed: u32,
    failed: u32,
    skipped: u32,
}

impl ResultFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one event into the accumulator. Call for every event the run
    /// produces, in order; `finish()` reads back the final tallies.
    pub fn push(&mut self, run_id: &str, event: &RunnerEvent) {
        match event {
            RunnerEvent::CaseStart { suite_id, case_name } => {
                self.open.insert(
                    (suite_id.clone(), case_name.clone()),
                    InFlightCase {
                        suite_id: suite_id.clone(),
                        case_name: case_name.clone(),
                        attempts: 1,
                    },
                );
            }
            RunnerEvent::CasePass { suite_id, case_name, duration } => {
                self.record(run_id, suite_id, case_name, CaseStatus::Passed, *duration, None);
                self.passed += 1;
            }
            RunnerEvent::CaseFail { suite_id, case_name, error, duration } => {
                self.record(run_id, suite_id, case_name, CaseStatus::Failed, *duration, Some(error.clone()));
                self.failed += 1;
            }
            RunnerEvent::CaseSkip { suite_id, case_name, reason } => {
                self.record(run_id, suite_id, case_name, CaseStatus::Skipped, Duration::ZERO, Some(reason.clone()));
                self.skipped += 1;
            }
            RunnerEvent::SuiteStart { .. } | RunnerEvent::SuiteEnd { .. } | RunnerEvent::Log { .. } => {}
        }
    }

    fn record(
        &mut self,
        run_id: &str,
        suite_id: &str,
        case_name: &str,
        status: CaseStatus,
        duration: Duration,
        error: Option<String>,
    ) {
        let attempts = self
            .open
            .remove(&(suite_id.to_string(), case_name.to_string()))
            .map(|c| c.attempts)
            .unwrap_or(1);

        self.cases.push(TestCaseRunRecord {
            id: ulid::Ulid::new().to_string(),
            run_id: run_id.to_string(),
            suite_id: suite_id.to_string(),
            case_name: case_name.to_string(),
            status,
            duration_ms: duration.as_millis() as i64,
            attempts,
            response_ms: None,
            assertions: None,
            error,
            snapshot: None,
        });
    }

    pub fn passed(&self) -> u32 {
        self.passed
    }

    pub fn failed(&self) -> u32 {
        self.failed
    }

    pub fn skipped(&self) -> u32 {
        self.skipped
    }

    pub fn overall_status(&self) -> RunStatus {
        if self.failed > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Passed
        }
    }

    pub fn into_cases(self) -> Vec<TestCaseRunRecord> {
        self.cases
    }
}

/// Provenance fields attached to a persisted run.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub project: String,
    pub trigger: Trigger,
    pub git_commit: Option<String>,
    pub git_branch: Option<String>,
    pub config_hash: String,
}

/// Consumes a finished [`ResultFormatter`] plus provenance context and
/// persists the run through a [`HistoryStore`].
pub struct HistoryRecorder {
    store: Arc<dyn HistoryStore>,
}

impl HistoryRecorder {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }

    pub async fn record(
        &self,
        run_id: String,
        context: RunContext,
        timestamp_ms: i64,
        duration_ms: i64,
        flaky: u32,
        formatter: ResultFormatter,
    ) -> Result<()> {
        let run = TestRunRecord {
            id: run_id,
            project: context.project,
            timestamp_ms,
            git_commit: context.git_commit,
            git_branch: context.git_branch,
            config_hash: context.config_hash,
            trigger: context.trigger,
            duration_ms,
            passed: formatter.passed(),
            failed: formatter.failed(),
            skipped: formatter.skipped(),
            flaky,
            status: formatter.overall_status(),
        };
        let cases = formatter.into_cases();
        self.store.save_run(run, cases).await
    }
}
