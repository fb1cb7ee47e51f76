//! Suite-level scheduler: serial, by-suite, or by-file parallel, with
//! fail-fast cancellation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::diagnostics::{Classifier, FailureInput};
use crate::retry::RetryPolicy;
use crate::runners::{Runner, RunnerEvent};

pub use tokio_util::sync::CancellationToken as CancelToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Serial,
    BySuite,
    ByFile,
}

/// One declared suite: an id, its backing runner, and its file(s). `ByFile`
/// mode schedules each file in `files` independently; other modes use only
/// `files[0]`.
#[derive(Clone)]
pub struct SuiteDef {
    pub id: String,
    pub runner: Arc<dyn Runner>,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuiteStatus {
    Passed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct SuiteResult {
    pub suite_id: String,
    pub status: SuiteStatus,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Passed,
    Failed,
}

pub struct ParallelRunResult {
    pub status: RunStatus,
    pub suites: Vec<SuiteResult>,
}

/// Suite-level scheduler. `worker_count` only applies to
/// `BySuite`/`ByFile`; defaults to the number of CPUs. `retry_policy`, when
/// set, is consulted per failed case before its terminal event is forwarded.
pub struct ParallelSuiteExecutor {
    pub mode: ExecutionMode,
    pub worker_count: usize,
    pub fail_fast: bool,
    pub retry_policy: Option<RetryPolicy>,
}

impl Default for ParallelSuiteExecutor {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Serial,
            worker_count: num_cpus::get().max(1),
            fail_fast: false,
            retry_policy: None,
        }
    }
}

impl ParallelSuiteExecutor {
    /// Runs `suites`, forwarding every runner event to `event_sink` as it is
    /// produced (suite-tagged, so a consumer can demultiplex across
    /// interleaved parallel suites).
    pub async fn run(
        &self,
        suites: Vec<SuiteDef>,
        event_sink: mpsc::Sender<RunnerEvent>,
    ) -> ParallelRunResult {
        match self.mode {
            ExecutionMode::Serial => self.run_serial(suites, event_sink).await,
            ExecutionMode::BySuite => self.run_by_suite(suites, event_sink).await,
            ExecutionMode::ByFile => self.run_by_file(suites, event_sink).await,
        }
    }

    async fn run_serial(&self, suites: Vec<SuiteDef>, event_sink: mpsc::Sender<RunnerEvent>) -> ParallelRunResult {
        let mut results = Vec::new();
        let mut overall_failed = false;

        for suite in suites {
            if self.fail_fast && overall_failed {
                results.push(cancelled_result(&suite.id));
                continue;
            }
            let file = suite.files.first().cloned().unwrap_or_default();
            let result = run_one_suite(suite.runner, suite.id, file, &event_sink, self.retry_policy.as_ref()).await;
            if result.status == SuiteStatus::Failed {
                overall_failed = true;
            }
            results.push(result);
        }

        finish(results)
    }

    async fn run_by_suite(&self, suites: Vec<SuiteDef>, event_sink: mpsc::Sender<RunnerEvent>) -> ParallelRunResult {
        let semaphore = Arc::new(Semaphore::new(self.worker_count.max(1)));
        let cancel = CancellationToken::new();
        let failed_flag = Arc::new(AtomicU32::new(0));
        let fail_fast = self.fail_fast;

        let mut handles = Vec::new();
        for suite in suites {
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let sink = event_sink.clone();
            let failed_flag = failed_flag.clone();
            let retry_policy = self.retry_policy.clone();

            handles.push(tokio::spawn(async move {
                let permit = tokio::select! {
                    permit = semaphore.acquire_owned() => permit,
                    _ = cancel.cancelled() => return cancelled_result(&suite.id),
                };
                let _permit = permit;

                let file = suite.files.first().cloned().unwrap_or_default();
                let result = run_one_suite(suite.runner, suite.id, file, &sink, retry_policy.as_ref()).await;
                if fail_fast && result.status == SuiteStatus::Failed {
                    failed_flag.store(1, Ordering::SeqCst);
                    cancel.cancel();
                }
                result
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap_or_else(|_| cancelled_result("unknown")));
        }

        finish(results)
    }

    /// Splits each suite into its declared files and runs them concurrently
    /// under the same worker pool, merging results back per suite.
    async fn run_by_file(&self, suites: Vec<SuiteDef>, event_sink: mpsc::Sender<RunnerEvent>) -> ParallelRunResult {
        let semaphore = Arc::new(Semaphore::new(self.worker_count.max(1)));
        let cancel = CancellationToken::new();
        let fail_fast = self.fail_fast;

        let mut handles = Vec::new();
        for suite in suites {
            let files = if suite.files.is_empty() {
                vec![String::new()]
            } else {
                suite.files.clone()
            };

            for file in files {
                let semaphore = semaphore.clone();
                let cancel = cancel.clone();
                let sink = event_sink.clone();
                let runner = suite.runner.clone();
                let suite_id = suite.id.clone();
                let retry_policy = self.retry_policy.clone();

                handles.push(tokio::spawn(async move {
                    let permit = tokio::select! {
                        permit = semaphore.acquire_owned() => permit,
                        _ = cancel.cancelled() => return cancelled_result(&suite_id),
                    };
                    let _permit = permit;

                    let result = run_one_suite(runner, suite_id, file, &sink, retry_policy.as_ref()).await;
                    if fail_fast && result.status == SuiteStatus::Failed {
                        cancel.cancel();
                    }
                    result
                }));
            }
        }

        let mut per_file = Vec::new();
        for handle in handles {
            per_file.push(handle.await.unwrap_or_else(|_| cancelled_result("unknown")));
        }

        let merged = merge_by_suite_id(per_file);
        finish(merged)
    }
}

fn merge_by_suite_id(results: Vec<SuiteResult>) -> Vec<SuiteResult> {
    let mut merged: Vec<SuiteResult> = Vec::new();
    for r in results {
        if let Some(existing) = merged.iter_mut().find(|m| m.suite_id == r.suite_id) {
            existing.passed += r.passed;
            existing.failed += r.failed;
            existing.skipped += r.skipped;
            existing.duration += r.duration;
            if r.status == SuiteStatus::Failed {
                existing.status = SuiteStatus::Failed;
            }
        } else {
            merged.push(r);
        }
    }
    merged
}

fn cancelled_result(suite_id: &str) -> SuiteResult {
    SuiteResult {
        suite_id: suite_id.to_string(),
        status: SuiteStatus::Cancelled,
        passed: 0,
        failed: 0,
        skipped: 0,
        duration: Duration::ZERO,
    }
}

/// One case's event slice: its `CaseStart` through its terminal event
/// (`CasePass`/`CaseFail`/`CaseSkip`), plus any `Log` lines emitted in
/// between.
#[derive(Clone)]
struct CaseGroup {
    case_name: String,
    events: Vec<RunnerEvent>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CaseOutcome {
    Pass,
    Fail,
    Skip,
    Unresolved,
}

fn case_outcome(events: &[RunnerEvent]) -> CaseOutcome {
    for event in events {
        match event {
            RunnerEvent::CasePass { .. } => return CaseOutcome::Pass,
            RunnerEvent::CaseFail { .. } => return CaseOutcome::Fail,
            RunnerEvent::CaseSkip { .. } => return CaseOutcome::Skip,
            _ => {}
        }
    }
    CaseOutcome::Unresolved
}

fn case_failure_error(events: &[RunnerEvent]) -> Option<String> {
    events.iter().find_map(|event| match event {
        RunnerEvent::CaseFail { error, .. } => Some(error.clone()),
        _ => None,
    })
}

/// Splits a suite's full event list into a prefix (everything before the
/// first case), an ordered list of per-case groups, and a suffix (the
/// `SuiteEnd` and anything after). Runners emit at most one case group per
/// `CaseStart`, so grouping by nearest-preceding `CaseStart` is exact.
fn split_suite_events(events: Vec<RunnerEvent>) -> (Vec<RunnerEvent>, Vec<CaseGroup>, Vec<RunnerEvent>) {
    let mut prefix = Vec::new();
    let mut groups: Vec<CaseGroup> = Vec::new();
    let mut suffix = Vec::new();
    let mut current: Option<CaseGroup> = None;

    for event in events {
        match &event {
            RunnerEvent::CaseStart { case_name, .. } => {
                if let Some(group) = current.take() {
                    groups.push(group);
                }
                current = Some(CaseGroup {
                    case_name: case_name.clone(),
                    events: vec![event],
                });
            }
            RunnerEvent::CasePass { .. } | RunnerEvent::CaseFail { .. } | RunnerEvent::CaseSkip { .. } => {
                if let Some(group) = current.as_mut() {
                    group.events.push(event);
                    groups.push(current.take().unwrap());
                } else {
                    suffix.push(event);
                }
            }
            RunnerEvent::SuiteEnd { .. } => {
                if let Some(group) = current.take() {
                    groups.push(group);
                }
                suffix.push(event);
            }
            _ => {
                if let Some(group) = current.as_mut() {
                    group.events.push(event);
                } else if groups.is_empty() {
                    prefix.push(event);
                } else {
                    suffix.push(event);
                }
            }
        }
    }
    if let Some(group) = current.take() {
        groups.push(group);
    }

    (prefix, groups, suffix)
}

async fn run_suite_events(runner: &Arc<dyn Runner>, suite_id: &str, file: &str) -> Option<Vec<RunnerEvent>> {
    use tokio_stream::StreamExt;
    let mut stream = runner.run(suite_id.to_string(), file.to_string()).await.ok()?;
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event);
    }
    Some(events)
}

/// Runs `suite_id`/`file` once, then retries each failed case individually
/// against `retry_policy` (re-invoking the runner and splicing in just that
/// case's new outcome) until it passes, exhausts its attempt budget, or the
/// policy doesn't match its failure category. Forwards the final event for
/// every case to `sink` and recomputes a single terminal `SuiteEnd`.
async fn run_one_suite(
    runner: Arc<dyn Runner>,
    suite_id: String,
    file: String,
    sink: &mpsc::Sender<RunnerEvent>,
    retry_policy: Option<&RetryPolicy>,
) -> SuiteResult {
    let start = Instant::now();

    let events = match run_suite_events(&runner, &suite_id, &file).await {
        Some(events) => events,
        None => return cancelled_result(&suite_id),
    };

    let (prefix, mut groups, suffix) = split_suite_events(events);

    // Runners that only ever report suite-level tallies (no `CaseStart`
    // events) can't be retried per case; fall back to their own `SuiteEnd`.
    if groups.is_empty() {
        for event in prefix {
            let _ = sink.send(event).await;
        }
        let mut passed = 0u32;
        let mut failed = 0u32;
        let mut skipped = 0u32;
        for event in suffix {
            if let RunnerEvent::SuiteEnd {
                passed: p,
                failed: f,
                skipped: s,
                ..
            } = &event
            {
                passed = *p;
                failed = *f;
                skipped = *s;
            }
            let _ = sink.send(event).await;
        }
        return SuiteResult {
            suite_id,
            status: if failed > 0 { SuiteStatus::Failed } else { SuiteStatus::Passed },
            passed,
            failed,
            skipped,
            duration: start.elapsed(),
        };
    }

    if let Some(policy) = retry_policy {
        for group in groups.iter_mut() {
            let mut attempt = 1;
            while case_outcome(&group.events) == CaseOutcome::Fail {
                let error = case_failure_error(&group.events).unwrap_or_default();
                let category = Classifier::classify(&FailureInput {
                    suite_id: suite_id.clone(),
                    case_name: group.case_name.clone(),
                    error,
                    ..Default::default()
                });
                if attempt >= policy.max_attempts || !policy.matches(category) {
                    break;
                }
                let delay = policy.backoff.compute_delay(attempt);
                tokio::time::sleep(delay).await;
                attempt += 1;

                let Some(retry_events) = run_suite_events(&runner, &suite_id, &file).await else {
                    break;
                };
                let (_, retry_groups, _) = split_suite_events(retry_events);
                if let Some(retried) = retry_groups.into_iter().find(|g| g.case_name == group.case_name) {
                    group.events = retried.events;
                } else {
                    break;
                }
            }
        }
    }

    for event in prefix {
        let _ = sink.send(event).await;
    }

    let mut passed = 0u32;
    let mut failed = 0u32;
    let mut skipped = 0u32;
    for group in groups {
        match case_outcome(&group.events) {
            CaseOutcome::Pass => passed += 1,
            CaseOutcome::Fail => failed += 1,
            CaseOutcome::Skip => skipped += 1,
            CaseOutcome::Unresolved => {}
        }
        for event in group.events {
            let _ = sink.send(event).await;
        }
    }

    for event in suffix {
        if matches!(event, RunnerEvent::SuiteEnd { .. }) {
            continue;
        }
        let _ = sink.send(event).await;
    }

    let _ = sink
        .send(RunnerEvent::SuiteEnd {
            suite_id: suite_id.clone(),
            passed,
            failed,
            skipped,
            duration: start.elapsed(),
        })
        .await;

    SuiteResult {
        suite_id,
        status: if failed > 0 { SuiteStatus::Failed } else { SuiteStatus::Passed },
        passed,
        failed,
        skipped,
        duration: start.elapsed(),
    }
}

fn finish(suites: Vec<SuiteResult>) -> ParallelRunResult {
    let status = if suites.iter().any(|s| s.status == SuiteStatus::Failed) {
        RunStatus::Failed
    } else {
        RunStatus::Passed
    };
    ParallelRunResult { status, suites }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runners::{RunnerEvent as RE, *};
    use async_trait::async_trait;

    struct ScriptedRunner {
        events: Vec<RunnerEvent>,
    }

    #[async_trait]
    impl Runner for ScriptedRunner {
        fn id(&self) -> &str {
            "scripted"
        }
        async fn available(&self) -> bool {
            true
        }
        async fn run(&self, _suite_id: String, _file: String) -> Result<EventStream> {
            let (tx, rx) = crate::runners::channel(16);
            let events = self.events.clone();
            tokio::spawn(async move {
                for event in events {
                    let _ = tx.send(event).await;
                }
            });
            Ok(rx)
        }
    }

    fn passing_suite(id: &str) -> SuiteDef {
        SuiteDef {
            id: id.to_string(),
            runner: Arc::new(ScriptedRunner {
                events: vec![
                    RE::SuiteStart { suite_id: id.to_string() },
                    RE::SuiteEnd { suite_id: id.to_string(), passed: 1, failed: 0, skipped: 0, duration: Duration::ZERO },
                ],
            }),
            files: vec!["f".to_string()],
        }
    }

    fn failing_suite(id: &str) -> SuiteDef {
        SuiteDef {
            id: id.to_string(),
            runner: Arc::new(ScriptedRunner {
                events: vec![
                    RE::SuiteStart { suite_id: id.to_string() },
                    RE::SuiteEnd { suite_id: id.to_string(), passed: 0, failed: 1, skipped: 0, duration: Duration::ZERO },
                ],
            }),
            files: vec!["f".to_string()],
        }
    }

    /// Fails case `flaky` on its first invocation, passes on every
    /// subsequent one -- exercises per-case retry.
    struct FlakyRunner {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Runner for FlakyRunner {
        fn id(&self) -> &str {
            "flaky"
        }
        async fn available(&self) -> bool {
            true
        }
        async fn run(&self, suite_id: String, _file: String) -> Result<EventStream> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = crate::runners::channel(16);
            tokio::spawn(async move {
                let _ = tx.send(RE::SuiteStart { suite_id: suite_id.clone() }).await;
                let _ = tx
                    .send(RE::CaseStart { suite_id: suite_id.clone(), case_name: "flaky".to_string() })
                    .await;
                if call == 0 {
                    let _ = tx
                        .send(RE::CaseFail {
                            suite_id: suite_id.clone(),
                            case_name: "flaky".to_string(),
                            error: "connection refused".to_string(),
                            duration: Duration::ZERO,
                        })
                        .await;
                    let _ = tx
                        .send(RE::SuiteEnd { suite_id, passed: 0, failed: 1, skipped: 0, duration: Duration::ZERO })
                        .await;
                } else {
                    let _ = tx
                        .send(RE::CasePass { suite_id: suite_id.clone(), case_name: "flaky".to_string(), duration: Duration::ZERO })
                        .await;
                    let _ = tx
                        .send(RE::SuiteEnd { suite_id, passed: 1, failed: 0, skipped: 0, duration: Duration::ZERO })
                        .await;
                }
            });
            Ok(rx)
        }
    }

    #[tokio::test]
    async fn serial_fail_fast_cancels_remaining() {
        let executor = ParallelSuiteExecutor {
            mode: ExecutionMode::Serial,
            worker_count: 1,
            fail_fast: true,
            retry_policy: None,
        };
        let (tx, mut rx) = mpsc::channel(256);
        let suites = vec![passing_suite("s1"), failing_suite("s2"), passing_suite("s3")];
        let handle = tokio::spawn(async move { executor.run(suites, tx).await });
        while rx.recv().await.is_some() {}
        let result = handle.await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.suites[0].status, SuiteStatus::Passed);
        assert_eq!(result.suites[1].status, SuiteStatus::Failed);
        assert_eq!(result.suites[2].status, SuiteStatus::Cancelled);
    }

    #[tokio::test]
    async fn by_suite_mode_fail_fast_cancels_pending_suites() {
        let executor = ParallelSuiteExecutor {
            mode: ExecutionMode::BySuite,
            worker_count: 2,
            fail_fast: true,
            retry_policy: None,
        };
        let (tx, mut rx) = mpsc::channel(256);
        let suites = vec![
            passing_suite("s1"),
            failing_suite("s2"),
            passing_suite("s3"),
            passing_suite("s4"),
        ];
        let handle = tokio::spawn(async move { executor.run(suites, tx).await });
        while rx.recv().await.is_some() {}
        let result = handle.await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.suites.len() >= 2 && result.suites.len() <= 4);
        let cancelled = result.suites.iter().filter(|s| s.status == SuiteStatus::Cancelled).count();
        // with only 2 workers and suite-2 failing, at least one of suite 3/4
        // should observe cancellation before acquiring a permit
        assert!(cancelled <= 2);
    }

    #[tokio::test]
    async fn without_fail_fast_all_suites_run() {
        let executor = ParallelSuiteExecutor {
            mode: ExecutionMode::BySuite,
            worker_count: 2,
            fail_fast: false,
            retry_policy: None,
        };
        let (tx, mut rx) = mpsc::channel(256);
        let suites = vec![passing_suite("s1"), failing_suite("s2"), passing_suite("s3")];
        let handle = tokio::spawn(async move { executor.run(suites, tx).await });
        while rx.recv().await.is_some() {}
        let result = handle.await.unwrap();

        assert!(result.suites.iter().all(|s| s.status != SuiteStatus::Cancelled));
    }

    #[tokio::test]
    async fn retry_policy_recovers_a_flaky_case() {
        use crate::knowledge::FailureCategory;
        use crate::retry::{Backoff, BackoffStrategy};

        let calls = Arc::new(AtomicU32::new(0));
        let suite = SuiteDef {
            id: "s1".to_string(),
            runner: Arc::new(FlakyRunner { calls: calls.clone() }),
            files: vec!["f".to_string()],
        };
        let executor = ParallelSuiteExecutor {
            mode: ExecutionMode::Serial,
            worker_count: 1,
            fail_fast: false,
            retry_policy: Some(RetryPolicy {
                max_attempts: 3,
                backoff: Backoff {
                    strategy: BackoffStrategy::Fixed,
                    initial: Duration::from_millis(1),
                    max: None,
                },
                retry_categories: Some(vec![FailureCategory::ConnectionRefused]),
            }),
        };

        let (tx, mut rx) = mpsc::channel(256);
        let handle = tokio::spawn(async move { executor.run(vec![suite], tx).await });
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        let result = handle.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(result.status, RunStatus::Passed);
        assert_eq!(result.suites[0].passed, 1);
        assert_eq!(result.suites[0].failed, 0);
        let fails = events.iter().filter(|e| matches!(e, RE::CaseFail { .. })).count();
        let passes = events.iter().filter(|e| matches!(e, RE::CasePass { .. })).count();
        assert_eq!(fails, 0, "only the recovered pass should be forwarded");
        assert_eq!(passes, 1);
    }

    #[tokio::test]
    async fn retry_policy_gives_up_on_non_matching_category() {
        use crate::knowledge::FailureCategory;
        use crate::retry::{Backoff, BackoffStrategy};

        let calls = Arc::new(AtomicU32::new(0));
        let suite = SuiteDef {
            id: "s1".to_string(),
            runner: Arc::new(FlakyRunner { calls: calls.clone() }),
            files: vec!["f".to_string()],
        };
        let executor = ParallelSuiteExecutor {
            mode: ExecutionMode::Serial,
            worker_count: 1,
            fail_fast: false,
            retry_policy: Some(RetryPolicy {
                max_attempts: 3,
                backoff: Backoff {
                    strategy: BackoffStrategy::Fixed,
                    initial: Duration::from_millis(1),
                    max: None,
                },
                retry_categories: Some(vec![FailureCategory::Timeout]),
            }),
        };

        let (tx, mut rx) = mpsc::channel(256);
        let handle = tokio::spawn(async move { executor.run(vec![suite], tx).await });
        while rx.recv().await.is_some() {}
        let result = handle.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1, "non-matching category must not be retried");
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.suites[0].failed, 1);
    }
}
