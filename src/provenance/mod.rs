//! `GitContext`/`ConfigHash` contracts that feed provenance into history
//! records. Collecting
//! this data from an actual repository or config file is an adapter's job;
//! the core only defines and stores the shape.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Git metadata an adapter collects and hands to `HistoryRecorder`.
#[derive(Debug, Clone, Default)]
pub struct GitContext {
    pub commit: Option<String>,
    pub branch: Option<String>,
}

/// Stable hash of a canonicalized `E2EConfig`, used so re-running with
/// identical configuration yields a stable hash for trend analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigHash(pub String);

impl ConfigHash {
    /// Hashes `value`'s canonical JSON form (stable key ordering via
    /// `serde_json`'s map serialization over a `BTreeMap`-like structure is
    /// not guaranteed for `serde_json::Value`, so callers should serialize
    /// through a type whose field order is fixed, e.g. a derived struct).
    pub fn compute<T: Serialize>(value: &T) -> Self {
        let canonical = serde_json::to_vec(value).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        Self(hex::encode(hasher.finalize()))
    }
}

impl std::fmt::Display for ConfigHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Sample {
        a: u32,
        b: String,
    }

    #[test]
    fn identical_config_yields_identical_hash() {
        let one = ConfigHash::compute(&Sample { a: 1, b: "x".into() });
        let two = ConfigHash::compute(&Sample { a: 1, b: "x".into() });
        assert_eq!(one, two);
    }

    #[test]
    fn different_config_yields_different_hash() {
        let one = ConfigHash::compute(&Sample { a: 1, b: "x".into() });
        let two = ConfigHash::compute(&Sample { a: 2, b: "x".into() });
        assert_ne!(one, two);
    }
}
