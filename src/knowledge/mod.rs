//! Failure-pattern knowledge base: built-in seed patterns plus learned
//! entries with confidence updates.

mod memory;
mod sqlite;

pub use memory::InMemoryKnowledgeStore;
pub use sqlite::SqliteKnowledgeStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorCode;

#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pattern not found: {0}")]
    PatternNotFound(String),
}

impl ErrorCode for KnowledgeError {
    fn code(&self) -> &'static str {
        match self {
            KnowledgeError::Sqlite(_) => "UNKNOWN",
            KnowledgeError::Io(_) => "UNKNOWN",
            KnowledgeError::PatternNotFound(_) => "SUITE_NOT_FOUND",
        }
    }
}

pub type Result<T> = std::result::Result<T, KnowledgeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatternSource {
    BuiltIn,
    Learned,
}

impl PatternSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternSource::BuiltIn => "built-in",
            PatternSource::Learned => "learned",
        }
    }
}

/// Failure classification taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCategory {
    AssertionMismatch,
    HttpError,
    Timeout,
    ConnectionRefused,
    ContainerOom,
    ContainerCrash,
    MockMismatch,
    ConfigError,
    NetworkError,
    Unknown,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::AssertionMismatch => "ASSERTION_MISMATCH",
            FailureCategory::HttpError => "HTTP_ERROR",
            FailureCategory::Timeout => "TIMEOUT",
            FailureCategory::ConnectionRefused => "CONNECTION_REFUSED",
            FailureCategory::ContainerOom => "CONTAINER_OOM",
            FailureCategory::ContainerCrash => "CONTAINER_CRASH",
            FailureCategory::MockMismatch => "MOCK_MISMATCH",
            FailureCategory::ConfigError => "CONFIG_ERROR",
            FailureCategory::NetworkError => "NETWORK_ERROR",
            FailureCategory::Unknown => "UNKNOWN",
        }
    }

    /// Parses a config-file category name. Accepts the `as_str()` form
    /// (`"TIMEOUT"`) case-insensitively as well as snake/kebab variants
    /// (`"connection_refused"`, `"connection-refused"`).
    pub fn parse(name: &str) -> Option<Self> {
        let normalized = name.to_uppercase().replace('-', "_");
        Some(match normalized.as_str() {
            "ASSERTION_MISMATCH" => FailureCategory::AssertionMismatch,
            "HTTP_ERROR" => FailureCategory::HttpError,
            "TIMEOUT" => FailureCategory::Timeout,
            "CONNECTION_REFUSED" => FailureCategory::ConnectionRefused,
            "CONTAINER_OOM" => FailureCategory::ContainerOom,
            "CONTAINER_CRASH" => FailureCategory::ContainerCrash,
            "MOCK_MISMATCH" => FailureCategory::MockMismatch,
            "CONFIG_ERROR" => FailureCategory::ConfigError,
            "NETWORK_ERROR" => FailureCategory::NetworkError,
            "UNKNOWN" => FailureCategory::Unknown,
            _ => return None,
        })
    }
}

/// Stored knowledge entry keyed by signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailurePattern {
    pub id: String,
    pub category: String,
    pub signature: String,
    pub signature_pattern: String,
    pub description: String,
    pub suggested_fix: Option<String>,
    pub confidence: f64,
    pub occurrences: u32,
    pub resolutions: u32,
    pub source: PatternSource,
    pub first_seen_ms: i64,
    pub last_seen_ms: i64,
    pub created_ms: i64,
    pub updated_ms: i64,
}

/// Record of a diagnose-suggested or manually-applied fix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixRecord {
    pub id: String,
    pub pattern_id: String,
    pub run_id: String,
    pub case_name: String,
    pub description: String,
    pub success: bool,
    pub created_ms: i64,
}

pub const CONFIDENCE_ALPHA: f64 = 0.7;

/// `newConfidence = clamp(alpha*previous + (1-alpha)*(success?1:0), 0, 1)`
///.
pub fn update_confidence(previous: f64, success: bool) -> f64 {
    let outcome = if success { 1.0 } else { 0.0 };
    (CONFIDENCE_ALPHA * previous + (1.0 - CONFIDENCE_ALPHA) * outcome).clamp(0.0, 1.0)
}

/// The six built-in patterns seeded on first open.
pub fn builtin_seeds(now_ms: i64) -> Vec<FailurePattern> {
    let categories = [
        (FailureCategory::ConnectionRefused, "Upstream connection refused"),
        (FailureCategory::Timeout, "Request or operation exceeded its deadline"),
        (FailureCategory::ContainerOom, "Container was killed by the OOM killer"),
        (FailureCategory::ContainerCrash, "Container exited unexpectedly"),
        (FailureCategory::MockMismatch, "Request did not match any declared mock route"),
        (FailureCategory::NetworkError, "Network path between services is unreachable"),
    ];

    categories
        .iter()
        .map(|(category, description)| FailurePattern {
            id: format!("builtin-{}", category.as_str().to_lowercase()),
            category: category.as_str().to_string(),
            signature: format!("builtin::{}", category.as_str()),
            signature_pattern: format!("{}::*", category.as_str()),
            description: description.to_string(),
            suggested_fix: None,
            confidence: 0.5,
            occurrences: 0,
            resolutions: 0,
            source: PatternSource::BuiltIn,
            first_seen_ms: now_ms,
            last_seen_ms: now_ms,
            created_ms: now_ms,
            updated_ms: now_ms,
        })
        .collect()
}

/// Shared contract for durable and in-memory knowledge stores.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Ensures the six built-in patterns exist; idempotent.
    async fn seed_builtins(&self) -> Result<()>;

    async fn find_by_signature(&self, signature: &str) -> Result<Option<FailurePattern>>;

    async fn find_by_id(&self, id: &str) -> Result<Option<FailurePattern>>;

    async fn insert_pattern(&self, pattern: FailurePattern) -> Result<()>;

    async fn update_pattern(&self, pattern: FailurePattern) -> Result<()>;

    async fn record_fix(&self, fix: FixRecord) -> Result<()>;

    async fn fix_history(&self, pattern_id: &str) -> Result<Vec<FixRecord>>;

    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_update_applies_exponential_moving_average() {
        // 0.7*0.5 + 0.3*1 = 0.65
        let updated = update_confidence(0.5, true);
        assert!((updated - 0.65).abs() < 1e-9);
    }

    #[test]
    fn confidence_clamped_to_unit_interval() {
        assert_eq!(update_confidence(1.0, true), 1.0);
        assert!(update_confidence(0.0, false) >= 0.0);
    }

    #[test]
    fn builtin_seeds_have_stable_signatures() {
        let seeds = builtin_seeds(0);
        assert_eq!(seeds.len(), 6);
        assert!(seeds.iter().all(|p| p.source == PatternSource::BuiltIn));
        assert!(seeds.iter().all(|p| p.confidence == 0.5));
        assert!(seeds.iter().any(|p| p.signature == "builtin::CONNECTION_REFUSED"));
    }
}
