//! Ordered rule chain categorizing failures, plus signature synthesis
//!.

use regex::Regex;

use crate::knowledge::FailureCategory;

/// Structured failure context fed to the classifier.
#[derive(Debug, Clone, Default)]
pub struct FailureInput {
    pub run_id: String,
    pub case_name: String,
    pub suite_id: String,
    pub error: String,
    pub status: Option<u16>,
    pub container_status: Option<String>,
    pub oom_killed: bool,
}

type Rule = fn(&FailureInput) -> bool;

const RULES: &[(Rule, FailureCategory)] = &[
    (|i| i.oom_killed, FailureCategory::ContainerOom),
    (
        |i| matches!(i.container_status.as_deref(), Some("dead") | Some("exited")) && !i.oom_killed,
        FailureCategory::ContainerCrash,
    ),
    (
        |i| contains_ci(&i.error, "econnrefused") || contains_ci(&i.error, "connection refused"),
        FailureCategory::ConnectionRefused,
    ),
    (
        |i| contains_ci(&i.error, "timed out") || contains_ci(&i.error, "timeout") || contains_ci(&i.error, "etimedout"),
        FailureCategory::Timeout,
    ),
    (
        |i| contains_ci(&i.error, "enotfound") || contains_ci(&i.error, "dns") || contains_ci(&i.error, "network unreachable") || contains_ci(&i.error, "enetunreach"),
        FailureCategory::NetworkError,
    ),
    (
        |i| contains_ci(&i.error, "mock") && (contains_ci(&i.error, "no matching route") || contains_ci(&i.error, "unmatched")),
        FailureCategory::MockMismatch,
    ),
    (
        |i| contains_ci(&i.error, "invalid config") || contains_ci(&i.error, "configuration error") || contains_ci(&i.error, "missing required field"),
        FailureCategory::ConfigError,
    ),
    (
        |i| i.status.map_or(false, |s| s >= 400),
        FailureCategory::HttpError,
    ),
    (
        |i| contains_ci(&i.error, "expected") && contains_ci(&i.error, "received"),
        FailureCategory::AssertionMismatch,
    ),
    (
        |i| contains_ci(&i.error, "assert"),
        FailureCategory::AssertionMismatch,
    ),
];

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(needle)
}

/// First-match-wins rule chain over [`FailureInput`].
pub struct Classifier;

impl Classifier {
    pub fn classify(input: &FailureInput) -> FailureCategory {
        for (rule, category) in RULES {
            if rule(input) {
                return *category;
            }
        }
        FailureCategory::Unknown
    }

    /// Normalizes `error` (redacting absolute paths, numeric ids, and
    /// volatile tokens) and emits `<category>::<suiteId>::<normalized>`.
    /// Normalization is a retraction: `normalize(normalize(x)) == normalize(x)`
    ///.
    pub fn signature(input: &FailureInput, category: FailureCategory) -> String {
        let normalized = normalize(&input.error);
        format!("{}::{}::{}", category.as_str(), input.suite_id, normalized)
    }
}

/// Redacts absolute paths, numeric ids, and volatile tokens (timestamps,
/// UUIDs, hex addresses) so repeated occurrences of the same failure class
/// converge to one signature.
pub fn normalize(error: &str) -> String {
    let path_re = Regex::new(r"(?:/[\w.\-]+)+").unwrap();
    let uuid_re = Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}").unwrap();
    let hex_addr_re = Regex::new(r"0x[0-9a-fA-F]+").unwrap();
    let number_re = Regex::new(r"\d+").unwrap();
    let ws_re = Regex::new(r"\s+").unwrap();

    let s = uuid_re.replace_all(error, "<uuid>");
    let s = path_re.replace_all(&s, "<path>");
    let s = hex_addr_re.replace_all(&s, "<addr>");
    let s = number_re.replace_all(&s, "<n>");
    let s = ws_re.replace_all(&s, " ");
    s.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_refused_message_classified_correctly() {
        let input = FailureInput {
            error: "ECONNREFUSED 127.0.0.1:5432".to_string(),
            suite_id: "db".to_string(),
            ..Default::default()
        };
        assert_eq!(Classifier::classify(&input), FailureCategory::ConnectionRefused);
    }

    #[test]
    fn oom_killed_wins_over_crash_text() {
        let input = FailureInput {
            oom_killed: true,
            error: "container exited".to_string(),
            container_status: Some("dead".to_string()),
            ..Default::default()
        };
        assert_eq!(Classifier::classify(&input), FailureCategory::ContainerOom);
    }

    #[test]
    fn falls_back_to_unknown() {
        let input = FailureInput {
            error: "something entirely unexpected happened".to_string(),
            ..Default::default()
        };
        assert_eq!(Classifier::classify(&input), FailureCategory::Unknown);
    }

    #[test]
    fn normalize_is_idempotent_after_first_pass() {
        let raw = "ECONNREFUSED 127.0.0.1:5432 at /home/user/app/src/db.rs:42 id=a1b2c3d4-e5f6-7890-abcd-ef1234567890";
        let once = normalize(raw);
        let twice = normalize(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn signature_embeds_category_and_suite() {
        let input = FailureInput {
            error: "ECONNREFUSED 127.0.0.1:5432".to_string(),
            suite_id: "db".to_string(),
            ..Default::default()
        };
        let category = Classifier::classify(&input);
        let sig = Classifier::signature(&input, category);
        assert!(sig.starts_with("CONNECTION_REFUSED::db::"));
    }
}
