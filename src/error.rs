//! Stable error taxonomy shared across the core.
//!
//! Every subsystem error enum implements [`ErrorCode`] so that callers at the
//! tool-protocol boundary can surface a stable string instead of matching on
//! `Display` text. [`ArgusError`] aggregates the subsystem errors into one
//! top-level type the way a daemon's top-level error wraps each of its
//! internal subsystems' errors.

use thiserror::Error;

/// Returns the stable taxonomy string for an error.
pub trait ErrorCode {
    fn code(&self) -> &'static str;
}

#[derive(Debug, Error)]
pub enum ArgusError {
    #[error("session error: {0}")]
    Session(#[from] crate::session::SessionError),

    #[error("docker error: {0}")]
    Docker(#[from] crate::docker::DockerEngineError),

    #[error("history error: {0}")]
    History(#[from] crate::history::HistoryError),

    #[error("knowledge error: {0}")]
    Knowledge(#[from] crate::knowledge::KnowledgeError),

    #[error("mock error: {0}")]
    Mock(#[from] crate::mocks::MockError),

    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] crate::orchestrator::OrchestratorError),

    #[error("config error: {0}")]
    Config(String),

    #[error("suite not found: {0}")]
    SuiteNotFound(String),

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("history disabled for this session")]
    HistoryDisabled,

    #[error("{0}")]
    Other(String),
}

impl ErrorCode for ArgusError {
    fn code(&self) -> &'static str {
        match self {
            ArgusError::Session(e) => e.code(),
            ArgusError::Docker(e) => e.code(),
            ArgusError::History(e) => e.code(),
            ArgusError::Knowledge(e) => e.code(),
            ArgusError::Mock(e) => e.code(),
            ArgusError::Orchestrator(e) => e.code(),
            ArgusError::Config(_) => "CONFIG_ERROR",
            ArgusError::SuiteNotFound(_) => "SUITE_NOT_FOUND",
            ArgusError::ServiceNotFound(_) => "SERVICE_NOT_FOUND",
            ArgusError::HistoryDisabled => "HISTORY_DISABLED",
            ArgusError::Other(_) => "UNKNOWN",
        }
    }
}

pub type Result<T> = std::result::Result<T, ArgusError>;
