//! Single entry point binding `SessionManager`, `RunnerRegistry`,
//! `HistoryRecorder`, and `DiagnosticsEngine` behind one small contract:
//! `init`, `build`, `setup`, `run`, `run_suite`, `clean`, `status`,
//! `history`, `diagnose`, `report_fix`.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;

use crate::config::E2EConfig;
use crate::diagnostics::{DiagnosisResult, DiagnosticsEngine, FailureInput};
use crate::docker::DockerEngine;
use crate::error::{ArgusError, Result};
use crate::events::{EventBus, Unsubscribe};
use crate::history::{
    HistoryRecorder, HistoryStore, InMemoryHistoryStore, ResultFormatter, RunContext, RunPage, RunQuery,
    SqliteHistoryStore, Trigger,
};
use crate::knowledge::{FailurePattern, InMemoryKnowledgeStore, KnowledgeStore, SqliteKnowledgeStore};
use crate::orchestrator::MultiServiceOrchestrator;
use crate::parallel::{ExecutionMode, ParallelRunResult, ParallelSuiteExecutor, SuiteDef, SuiteResult, SuiteStatus};
use crate::ports::PortAllocator;
use crate::provenance::{ConfigHash, GitContext};
use crate::retry::RetryPolicy;
use crate::runners::{GenericExecConfig, GenericExecRunner, HttpYamlRunner, RunnerEvent, RunnerRegistry, ShellExecConfig, ShellExecRunner};
use crate::session::{SessionManager, SessionState};

/// Where the caller's run originated.
pub use crate::history::Trigger as RunTrigger;

/// Channel name a dashboard adapter subscribes to for a project's live
/// `run()` events.
pub fn run_events_channel(project_path: &str) -> String {
    format!("run:{}", project_path)
}

/// Facade over the whole core: session lifecycle, build/run orchestration,
/// and history/diagnostics, behind one small async API.
pub struct Argus {
    sessions: SessionManager,
    docker: DockerEngine,
    events: EventBus,
}

impl Argus {
    pub fn new(docker: DockerEngine, ports: PortAllocator) -> Self {
        Self {
            sessions: SessionManager::new(ports),
            docker,
            events: EventBus::new(),
        }
    }

    /// Subscribes to a project's live `run()` event stream (for a dashboard
    /// adapter). Delivery is synchronous and in insertion order, same as any
    /// other [`EventBus`] channel; the handler must not block.
    pub fn subscribe_run_events<F>(&self, project_path: &str, handler: F) -> Unsubscribe
    where
        F: Fn(&crate::events::Event) + Send + Sync + 'static,
    {
        self.events.subscribe(run_events_channel(project_path), handler)
    }

    /// Registers the default runner set for a project. A fuller adapter
    /// might register more per `config.tests.suites[*].runner`; the core
    /// only ships `yaml-http`, `shell-exec`, and `subprocess-exec` out of
    /// the box.
    fn default_registry() -> RunnerRegistry {
        let mut registry = RunnerRegistry::new();
        registry.register(Arc::new(HttpYamlRunner::new()));
        registry.register(Arc::new(ShellExecRunner::new(ShellExecConfig::default())));
        registry.register(Arc::new(GenericExecRunner::new(GenericExecConfig::default())));
        registry
    }

    /// `init(projectPath, config, configPath?)` -- inserts a fresh session at
    /// `initialized` and opens its history/knowledge stores per `.argus/`
    /// layout.
    pub async fn init(&self, project_path: &str, config: &E2EConfig, config_path: Option<String>) -> Result<()> {
        let config_hash = ConfigHash::compute(config).to_string();
        self.sessions
            .create(project_path, config_path, config_hash, config.network.clone())?;

        let history_enabled = config.history.as_ref().map(|h| h.enabled).unwrap_or(false);
        let (history, knowledge): (Arc<dyn HistoryStore>, Arc<dyn KnowledgeStore>) = if history_enabled {
            let db_path = config
                .history
                .as_ref()
                .map(|h| h.db_path.clone())
                .unwrap_or_else(|| ".argus/history.db".to_string());
            ensure_parent_dir(&db_path)?;
            let knowledge_path = sibling_path(&db_path, "knowledge.db");
            (
                Arc::new(SqliteHistoryStore::open(&db_path)?),
                Arc::new(SqliteKnowledgeStore::open(&knowledge_path)?),
            )
        } else {
            (Arc::new(InMemoryHistoryStore::new()), Arc::new(InMemoryKnowledgeStore::new()))
        };
        knowledge.seed_builtins().await?;

        self.sessions.with_session_mut(project_path, |session| {
            session.history = Some(history);
            session.knowledge = Some(knowledge);
        })?;

        self.docker.ensure_network(&config.network).await?;
        Ok(())
    }

    /// `build(projectPath, config, parallel?)` -- builds every service image.
    pub async fn build(&self, project_path: &str, config: &E2EConfig, parallel: bool) -> Result<()> {
        let orchestrator = MultiServiceOrchestrator::new(self.docker.clone());
        orchestrator.build_all(&config.service_defs(), parallel).await?;
        self.sessions.transition(project_path, SessionState::Built)?;
        Ok(())
    }

    /// `setup(projectPath, config)` -- starts every service in dependency
    /// order, honoring healthchecks, then moves the session to `running`.
    pub async fn setup(&self, project_path: &str, config: &E2EConfig) -> Result<()> {
        let orchestrator = MultiServiceOrchestrator::new(self.docker.clone());
        orchestrator.start_all(&config.service_defs()).await?;
        self.sessions.transition(project_path, SessionState::Running)?;
        Ok(())
    }

    /// `run(projectPath, config, trigger)` -- executes every declared suite
    /// per the configured execution mode, then persists the aggregate
    /// history record.
    pub async fn run(&self, project_path: &str, config: &E2EConfig, trigger: Trigger) -> Result<ParallelRunResult> {
        if self.sessions.state_of(project_path)? != SessionState::Running {
            return Err(ArgusError::Other("session must be running before run()".into()));
        }

        let registry = Self::default_registry();
        let tests = config.tests.clone().unwrap_or_default();
        let suites: Vec<SuiteDef> = tests
            .suites
            .iter()
            .filter_map(|s| {
                registry.get(&s.runner).map(|runner| SuiteDef {
                    id: s.id.clone(),
                    runner,
                    files: vec![s.file.clone()],
                })
            })
            .collect();

        let executor = ParallelSuiteExecutor {
            mode: tests.parsed_execution_mode(),
            worker_count: tests.workers.unwrap_or_else(|| num_cpus::get().max(1)),
            fail_fast: tests.fail_fast,
            retry_policy: config.resilience.as_ref().map(RetryPolicy::from),
        };

        let (tx, mut rx) = mpsc::channel(256);
        let run_id = ulid::Ulid::new().to_string();
        let run_id_for_fold = run_id.clone();
        let events = self.events.clone();
        let events_channel = run_events_channel(project_path);

        let drain = tokio::spawn(async move {
            let mut formatter = ResultFormatter::new();
            while let Some(event) = rx.recv().await {
                events.emit(events_channel.clone(), runner_event_to_json(&event));
                formatter.push(&run_id_for_fold, &event);
            }
            formatter
        });

        let start = now_ms();
        let run_result = executor.run(suites, tx).await;
        let formatter = drain.await.map_err(|e| ArgusError::Other(e.to_string()))?;
        let duration = (now_ms() - start) as i64;

        if let Some(history) = self.sessions.with_session(project_path, |s| s.history.clone())? {
            let config_hash = self.sessions.with_session(project_path, |s| s.config_hash.clone())?;
            let recorder = HistoryRecorder::new(history);
            recorder
                .record(
                    run_id,
                    RunContext {
                        project: config.project.name.clone(),
                        trigger,
                        git_commit: None,
                        git_branch: None,
                        config_hash,
                    },
                    start as i64,
                    duration,
                    0,
                    formatter,
                )
                .await?;
        }

        Ok(run_result)
    }

    /// `run_suite(projectPath, config, suiteId)` -- executes exactly one
    /// declared suite, outside the full parallel scheduler.
    pub async fn run_suite(&self, config: &E2EConfig, suite_id: &str) -> Result<SuiteResult> {
        let registry = Self::default_registry();
        let tests = config.tests.clone().unwrap_or_default();
        let suite = tests
            .suites
            .iter()
            .find(|s| s.id == suite_id)
            .ok_or_else(|| ArgusError::SuiteNotFound(suite_id.to_string()))?;

        let runner = registry
            .get(&suite.runner)
            .ok_or_else(|| ArgusError::Config(format!("unknown runner: {}", suite.runner)))?;

        let executor = ParallelSuiteExecutor {
            mode: ExecutionMode::Serial,
            worker_count: 1,
            fail_fast: false,
            retry_policy: config.resilience.as_ref().map(RetryPolicy::from),
        };
        let (tx, mut rx) = mpsc::channel(256);
        let suites = vec![SuiteDef {
            id: suite.id.clone(),
            runner,
            files: vec![suite.file.clone()],
        }];
        let handle = tokio::spawn(async move { executor.run(suites, tx).await });
        while rx.recv().await.is_some() {}
        let mut result = handle.await.map_err(|e| ArgusError::Other(e.to_string()))?;
        result
            .suites
            .pop()
            .ok_or_else(|| ArgusError::SuiteNotFound(suite_id.to_string()))
    }

    /// `clean(projectPath, config)` -- stops every service best-effort and
    /// releases the session's resources.
    pub async fn clean(&self, project_path: &str, config: &E2EConfig) -> Result<Vec<String>> {
        let orchestrator = MultiServiceOrchestrator::new(self.docker.clone());
        let warnings = orchestrator.clean_all(&config.service_defs()).await;
        if self.sessions.has(project_path) {
            let state = self.sessions.state_of(project_path)?;
            if state != SessionState::Stopped {
                self.sessions.transition(project_path, SessionState::Stopped)?;
            }
            self.sessions.remove(project_path).await?;
        }
        self.docker.remove_network(&config.network).await?;
        Ok(warnings)
    }

    /// `status(projectPath)` -- current session lifecycle state.
    pub fn status(&self, project_path: &str) -> Result<SessionState> {
        Ok(self.sessions.state_of(project_path)?)
    }

    /// `history(projectPath, query)` -- filtered run history for the
    /// session's project.
    pub async fn history(&self, project_path: &str, project: &str, query: RunQuery) -> Result<RunPage> {
        let store = self
            .sessions
            .with_session(project_path, |s| s.history.clone())?
            .ok_or(ArgusError::HistoryDisabled)?;
        Ok(store.get_runs(project, query).await?)
    }

    /// `diagnose(projectPath, input)` -- classify + learn-then-match against
    /// the session's knowledge store.
    pub async fn diagnose(&self, project_path: &str, input: &FailureInput) -> Result<DiagnosisResult> {
        let knowledge = self
            .sessions
            .with_session(project_path, |s| s.knowledge.clone())?
            .ok_or(ArgusError::HistoryDisabled)?;
        let engine = DiagnosticsEngine::new(knowledge);
        Ok(engine.diagnose(input).await?)
    }

    /// `report_fix(projectPath, patternId, runId, caseName, description, success)`.
    pub async fn report_fix(
        &self,
        project_path: &str,
        pattern_id: &str,
        run_id: &str,
        case_name: &str,
        description: &str,
        success: bool,
    ) -> Result<FailurePattern> {
        let knowledge = self
            .sessions
            .with_session(project_path, |s| s.knowledge.clone())?
            .ok_or(ArgusError::HistoryDisabled)?;
        let engine = DiagnosticsEngine::new(knowledge);
        Ok(engine.report_fix(pattern_id, run_id, case_name, description, success).await?)
    }
}

/// Flattens a [`RunnerEvent`] into the JSON shape a dashboard adapter
/// expects on the [`EventBus`] -- a discriminated `kind` plus the event's own
/// fields, since `RunnerEvent` itself carries no `Serialize` impl (it's an
/// internal pipeline type, not a wire format).
fn runner_event_to_json(event: &RunnerEvent) -> serde_json::Value {
    use serde_json::json;
    match event {
        RunnerEvent::SuiteStart { suite_id } => json!({"kind": "suite_start", "suiteId": suite_id}),
        RunnerEvent::CaseStart { suite_id, case_name } => {
            json!({"kind": "case_start", "suiteId": suite_id, "caseName": case_name})
        }
        RunnerEvent::CasePass { suite_id, case_name, duration } => json!({
            "kind": "case_pass",
            "suiteId": suite_id,
            "caseName": case_name,
            "durationMs": duration.as_millis() as u64,
        }),
        RunnerEvent::CaseSkip { suite_id, case_name, reason } => json!({
            "kind": "case_skip",
            "suiteId": suite_id,
            "caseName": case_name,
            "reason": reason,
        }),
        RunnerEvent::CaseFail { suite_id, case_name, error, duration } => json!({
            "kind": "case_fail",
            "suiteId": suite_id,
            "caseName": case_name,
            "error": error,
            "durationMs": duration.as_millis() as u64,
        }),
        RunnerEvent::Log { level, message } => json!({
            "kind": "log",
            "level": format!("{:?}", level).to_lowercase(),
            "message": message,
        }),
        RunnerEvent::SuiteEnd { suite_id, passed, failed, skipped, duration } => json!({
            "kind": "suite_end",
            "suiteId": suite_id,
            "passed": passed,
            "failed": failed,
            "skipped": skipped,
            "durationMs": duration.as_millis() as u64,
        }),
    }
}

fn ensure_parent_dir(path: &str) -> Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| ArgusError::Other(e.to_string()))?;
        }
    }
    Ok(())
}

fn sibling_path(path: &str, file_name: &str) -> String {
    Path::new(path)
        .parent()
        .map(|p| p.join(file_name).to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Collects the adapter-visible git context for a project directory. A full
/// implementation would shell out to `git rev-parse`; left to the caller to
/// populate via [`GitContext`] and plumb into `RunContext`.
pub fn git_context_placeholder() -> GitContext {
    GitContext::default()
}

// `Argus` itself wraps a live `DockerEngine` (a `bollard::Docker` connection),
// so exercising `run()` end-to-end needs a container runtime this crate
// doesn't stub out. The event-flattening and channel-naming helpers below
// carry no such dependency and are covered directly.
#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn run_events_channel_is_keyed_by_project_path() {
        assert_eq!(run_events_channel("/srv/app"), "run:/srv/app");
        assert_ne!(run_events_channel("/srv/app"), run_events_channel("/srv/other"));
    }

    #[test]
    fn runner_event_to_json_flattens_case_pass() {
        let event = RunnerEvent::CasePass {
            suite_id: "db".into(),
            case_name: "connects".into(),
            duration: Duration::from_millis(42),
        };
        let json = runner_event_to_json(&event);
        assert_eq!(json["kind"], "case_pass");
        assert_eq!(json["suiteId"], "db");
        assert_eq!(json["caseName"], "connects");
        assert_eq!(json["durationMs"], 42);
    }

    #[test]
    fn runner_event_to_json_flattens_suite_end() {
        let event = RunnerEvent::SuiteEnd {
            suite_id: "db".into(),
            passed: 2,
            failed: 1,
            skipped: 0,
            duration: Duration::from_millis(100),
        };
        let json = runner_event_to_json(&event);
        assert_eq!(json["kind"], "suite_end");
        assert_eq!(json["passed"], 2);
        assert_eq!(json["failed"], 1);
    }

    #[test]
    fn subscribe_run_events_receives_emitted_json_via_bus() {
        let bus = EventBus::new();
        let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let received2 = received.clone();
        let channel = run_events_channel("/proj");
        let _unsub = bus.subscribe(channel.clone(), move |event| {
            received2.lock().push(event.clone());
        });

        let payload = runner_event_to_json(&RunnerEvent::SuiteStart { suite_id: "db".into() });
        bus.emit(channel, payload.clone());

        let guard = received.lock();
        assert_eq!(guard.len(), 1);
        assert_eq!(guard[0].payload, payload);
    }
}
