//! Per-project session state machine and resource handles.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorCode;
use crate::history::HistoryStore;
use crate::knowledge::KnowledgeStore;
use crate::mocks::MockServerHandle;
use crate::ports::PortAllocator;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found for project: {0}")]
    NotFound(String),

    #[error("session already exists for project: {0}")]
    AlreadyExists(String),

    #[error("invalid state transition {from:?} -> {to:?}")]
    InvalidState { from: SessionState, to: SessionState },

    #[error("session is not running")]
    NotRunning,
}

impl ErrorCode for SessionError {
    fn code(&self) -> &'static str {
        match self {
            SessionError::NotFound(_) => "SESSION_NOT_FOUND",
            SessionError::AlreadyExists(_) => "SESSION_EXISTS",
            SessionError::InvalidState { .. } => "INVALID_STATE",
            SessionError::NotRunning => "NOT_RUNNING",
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Session lifecycle state. Transitions follow the DAG
/// `initialized -> built`, `initialized -> stopped`, `built -> running`,
/// `running -> stopped`; any other attempt fails with `INVALID_STATE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Initialized,
    Built,
    Running,
    Stopped,
}

impl SessionState {
    fn allows(&self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::Initialized, SessionState::Built)
                | (SessionState::Initialized, SessionState::Stopped)
                | (SessionState::Built, SessionState::Running)
                | (SessionState::Running, SessionState::Stopped)
        )
    }
}

/// Per-project runtime state. Keyed by absolute project path,
/// which is unique across the process.
pub struct Session {
    pub project_path: String,
    pub session_id: String,
    pub config_path: Option<String>,
    pub config_hash: String,
    pub network_name: String,
    pub state: SessionState,
    pub containers: HashMap<String, String>,
    pub mocks: HashMap<String, MockServerHandle>,
    pub history: Option<Arc<dyn HistoryStore>>,
    pub knowledge: Option<Arc<dyn KnowledgeStore>>,
    pub created_at_ms: u64,
}

impl Session {
    fn new(project_path: String, config_path: Option<String>, config_hash: String, network_name: String) -> Self {
        Self {
            project_path,
            session_id: new_session_id(),
            config_path,
            config_hash,
            network_name,
            state: SessionState::Initialized,
            containers: HashMap::new(),
            mocks: HashMap::new(),
            history: None,
            knowledge: None,
            created_at_ms: now_ms(),
        }
    }
}

fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Concurrent project-path -> `Session` map.
pub struct SessionManager {
    sessions: DashMap<String, Session>,
    ports: PortAllocator,
}

impl SessionManager {
    pub fn new(ports: PortAllocator) -> Self {
        Self {
            sessions: DashMap::new(),
            ports,
        }
    }

    /// Inserts a fresh session at `initialized`. Fails with
    /// `SESSION_EXISTS` if one is already present for `project_path`.
    pub fn create(
        &self,
        project_path: impl Into<String>,
        config_path: Option<String>,
        config_hash: String,
        network_name: String,
    ) -> Result<()> {
        let project_path = project_path.into();
        if self.sessions.contains_key(&project_path) {
            return Err(SessionError::AlreadyExists(project_path));
        }
        self.sessions.insert(
            project_path.clone(),
            Session::new(project_path, config_path, config_hash, network_name),
        );
        Ok(())
    }

    pub fn has(&self, project_path: &str) -> bool {
        self.sessions.contains_key(project_path)
    }

    pub fn state_of(&self, project_path: &str) -> Result<SessionState> {
        self.sessions
            .get(project_path)
            .map(|s| s.state)
            .ok_or_else(|| SessionError::NotFound(project_path.to_string()))
    }

    /// Validates `new_state` against the lifecycle DAG. On success, performs
    /// the transition and -- for `stopped`, a terminal state -- releases the
    /// session's port claims.
    pub fn transition(&self, project_path: &str, new_state: SessionState) -> Result<()> {
        let mut entry = self
            .sessions
            .get_mut(project_path)
            .ok_or_else(|| SessionError::NotFound(project_path.to_string()))?;

        if !entry.state.allows(new_state) {
            return Err(SessionError::InvalidState {
                from: entry.state,
                to: new_state,
            });
        }
        entry.state = new_state;

        if new_state == SessionState::Stopped {
            self.ports.release_session(&entry.session_id);
        }
        Ok(())
    }

    /// Runs `f` against the session's container-id map under the
    /// map-internal lock.
    pub fn with_session_mut<R>(
        &self,
        project_path: &str,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Result<R> {
        let mut entry = self
            .sessions
            .get_mut(project_path)
            .ok_or_else(|| SessionError::NotFound(project_path.to_string()))?;
        Ok(f(&mut entry))
    }

    pub fn with_session<R>(&self, project_path: &str, f: impl FnOnce(&Session) -> R) -> Result<R> {
        let entry = self
            .sessions
            .get(project_path)
            .ok_or_else(|| SessionError::NotFound(project_path.to_string()))?;
        Ok(f(&entry))
    }

    /// Removes the session, closing store handles and releasing ports.
    pub async fn remove(&self, project_path: &str) -> Result<()> {
        let (_, session) = self
            .sessions
            .remove(project_path)
            .ok_or_else(|| SessionError::NotFound(project_path.to_string()))?;

        self.ports.release_session(&session.session_id);
        if let Some(history) = &session.history {
            let _ = history.close().await;
        }
        if let Some(knowledge) = &session.knowledge {
            let _ = knowledge.close().await;
        }
        for (_, handle) in session.mocks {
            handle.shutdown().await;
        }
        Ok(())
    }

    pub fn project_paths(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SessionManager {
        SessionManager::new(PortAllocator::new(9000, 9010))
    }

    #[test]
    fn transitions_follow_initialized_built_running_stopped_order() {
        let mgr = manager();
        mgr.create("/p", None, "hash".into(), "net".into()).unwrap();
        assert_eq!(mgr.state_of("/p").unwrap(), SessionState::Initialized);

        let err = mgr.transition("/p", SessionState::Running).unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");
        assert_eq!(mgr.state_of("/p").unwrap(), SessionState::Initialized);

        mgr.transition("/p", SessionState::Built).unwrap();
        mgr.transition("/p", SessionState::Running).unwrap();
        mgr.transition("/p", SessionState::Stopped).unwrap();
        assert_eq!(mgr.state_of("/p").unwrap(), SessionState::Stopped);
    }

    #[test]
    fn create_twice_fails_with_session_exists() {
        let mgr = manager();
        mgr.create("/p", None, "hash".into(), "net".into()).unwrap();
        let err = mgr.create("/p", None, "hash".into(), "net".into()).unwrap_err();
        assert_eq!(err.code(), "SESSION_EXISTS");
    }

    #[test]
    fn transition_on_missing_session_is_session_not_found() {
        let mgr = manager();
        let err = mgr.transition("/missing", SessionState::Built).unwrap_err();
        assert_eq!(err.code(), "SESSION_NOT_FOUND");
    }

    #[test]
    fn stopping_releases_port_claims() {
        let ports = PortAllocator::new(9000, 9010);
        let mgr = SessionManager::new(ports.clone());
        mgr.create("/p", None, "hash".into(), "net".into()).unwrap();
        let session_id = mgr.with_session("/p", |s| s.session_id.clone()).unwrap();
        ports.claim(9001, "/p", &session_id);

        mgr.transition("/p", SessionState::Built).unwrap();
        mgr.transition("/p", SessionState::Running).unwrap();
        mgr.transition("/p", SessionState::Stopped).unwrap();

        assert!(ports.claim(9001, "/p", "someone-else"));
    }
}
