//! Pluggable test runners producing a unified event stream.

mod generic_exec;
mod http_yaml;
mod shell_exec;
mod subprocess_json;

pub use generic_exec::{GenericExecConfig, GenericExecRunner};
pub use http_yaml::{HttpCase, HttpSuiteConfig, HttpYamlRunner};
pub use shell_exec::{ShellExecConfig, ShellExecRunner};
pub use subprocess_json::{SubprocessJsonConfig, SubprocessJsonRunner};

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::ErrorCode;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("runner not available: {0}")]
    Unavailable(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ErrorCode for RunnerError {
    fn code(&self) -> &'static str {
        match self {
            RunnerError::Unavailable(_) => "CONFIG_ERROR",
            RunnerError::Io(_) => "UNKNOWN",
            RunnerError::Http(_) => "NETWORK_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// Leveled log line emitted alongside case events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One element of the unified runner event stream. Every run
/// emits exactly one `SuiteStart`/`SuiteEnd`; every `CaseStart` is followed
/// eventually by exactly one of `CasePass`/`CaseSkip`/`CaseFail` bearing the
/// same name in the same suite.
#[derive(Debug, Clone)]
pub enum RunnerEvent {
    SuiteStart { suite_id: String },
    CaseStart { suite_id: String, case_name: String },
    CasePass { suite_id: String, case_name: String, duration: Duration },
    CaseSkip { suite_id: String, case_name: String, reason: String },
    CaseFail { suite_id: String, case_name: String, error: String, duration: Duration },
    Log { level: LogLevel, message: String },
    SuiteEnd { suite_id: String, passed: u32, failed: u32, skipped: u32, duration: Duration },
}

impl RunnerEvent {
    pub fn suite_id(&self) -> Option<&str> {
        match self {
            RunnerEvent::SuiteStart { suite_id }
            | RunnerEvent::CaseStart { suite_id, .. }
            | RunnerEvent::CasePass { suite_id, .. }
            | RunnerEvent::CaseSkip { suite_id, .. }
            | RunnerEvent::CaseFail { suite_id, .. }
            | RunnerEvent::SuiteEnd { suite_id, .. } => Some(suite_id),
            RunnerEvent::Log { .. } => None,
        }
    }
}

pub type EventStream = ReceiverStream<RunnerEvent>;

/// Polymorphic contract every runner implements: an id, an
/// availability probe, and a lazy event sequence producer.
#[async_trait]
pub trait Runner: Send + Sync {
    fn id(&self) -> &str;

    /// Whether this runner's backing tool is installed/reachable. Cheap and
    /// synchronous-feeling; never performs the run itself.
    async fn available(&self) -> bool;

    /// Drives `suite_id`/`file` and returns the event stream. The caller
    /// owns pulling the stream to completion; dropping it early does not
    /// retroactively cancel already-spawned child processes (callers that
    /// need cancellation should use [`crate::parallel::CancelToken`]).
    async fn run(&self, suite_id: String, file: String) -> Result<EventStream>;
}

/// Registry of available runners keyed by id.
#[derive(Default)]
pub struct RunnerRegistry {
    runners: Vec<std::sync::Arc<dyn Runner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, runner: std::sync::Arc<dyn Runner>) {
        self.runners.push(runner);
    }

    pub fn get(&self, id: &str) -> Option<std::sync::Arc<dyn Runner>> {
        self.runners.iter().find(|r| r.id() == id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.runners.iter().map(|r| r.id().to_string()).collect()
    }
}

/// Channel pair runner implementations spawn a producer task against, the
/// same lazy/streaming shape `DockerEngine::build_image` uses for build
/// events.
pub(crate) fn channel(capacity: usize) -> (mpsc::Sender<RunnerEvent>, EventStream) {
    let (tx, rx) = mpsc::channel(capacity);
    (tx, ReceiverStream::new(rx))
}
