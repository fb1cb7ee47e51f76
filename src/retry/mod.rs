//! Per-case retry policy with fixed/linear/exponential backoff.
//!
//! The backoff math is hand-rolled rather than delegated to a general-purpose
//! backoff crate: callers need the exact per-attempt delay value, which a
//! generic `ExponentialBackoff`-style API doesn't expose attempt-indexed
//! (see DESIGN.md).

use std::time::Duration;

use crate::knowledge::FailureCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub strategy: BackoffStrategy,
    pub initial: Duration,
    pub max: Option<Duration>,
}

impl Backoff {
    /// `fixed -> initial`; `linear -> initial*attempt`;
    /// `exponential -> initial*2^(attempt-1)`; clamped to `max`.
    /// `attempt` is 1-indexed.
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let raw = match self.strategy {
            BackoffStrategy::Fixed => self.initial,
            BackoffStrategy::Linear => self.initial * attempt,
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.initial * factor
            }
        };
        match self.max {
            Some(max) if raw > max => max,
            _ => raw,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Categories this policy retries. `None` retries every category
    /// (the default, unconfigured policy); `Some(list)` restricts retries
    /// to failures classified into one of the listed categories.
    pub retry_categories: Option<Vec<FailureCategory>>,
}

impl RetryPolicy {
    /// A policy with no category restriction: every failure matches.
    pub fn unrestricted(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
            retry_categories: None,
        }
    }

    /// Whether this policy applies to a failure of `category`: matches by
    /// category allowlist when one is configured, otherwise matches
    /// everything.
    pub fn matches(&self, category: FailureCategory) -> bool {
        match &self.retry_categories {
            Some(categories) => categories.contains(&category),
            None => true,
        }
    }
}

/// Outcome of a retried case execution.
#[derive(Debug, Clone)]
pub enum RetryOutcome<T> {
    Success(T),
    Failed { attempts: u32, last_error: String },
}

/// Drives a fallible async case body through `policy`'s retry/backoff
/// schedule. Only failures the policy `matches()` are retried; others
/// surface immediately as a single-attempt failure.
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub async fn run<F, Fut, T>(&self, category: FailureCategory, mut attempt_fn: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, String>>,
    {
        let mut attempt = 1;
        loop {
            match attempt_fn(attempt).await {
                Ok(value) => return RetryOutcome::Success(value),
                Err(error) => {
                    if attempt >= self.policy.max_attempts || !self.policy.matches(category) {
                        return RetryOutcome::Failed {
                            attempts: attempt,
                            last_error: error,
                        };
                    }
                    let delay = self.policy.backoff.compute_delay(attempt);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn fixed_backoff_is_constant() {
        let backoff = Backoff {
            strategy: BackoffStrategy::Fixed,
            initial: Duration::from_millis(100),
            max: None,
        };
        assert_eq!(backoff.compute_delay(1), Duration::from_millis(100));
        assert_eq!(backoff.compute_delay(5), Duration::from_millis(100));
    }

    #[test]
    fn linear_backoff_scales_with_attempt() {
        let backoff = Backoff {
            strategy: BackoffStrategy::Linear,
            initial: Duration::from_millis(100),
            max: None,
        };
        assert_eq!(backoff.compute_delay(3), Duration::from_millis(300));
    }

    #[test]
    fn exponential_backoff_doubles_and_clamps() {
        let backoff = Backoff {
            strategy: BackoffStrategy::Exponential,
            initial: Duration::from_millis(100),
            max: Some(Duration::from_millis(350)),
        };
        assert_eq!(backoff.compute_delay(1), Duration::from_millis(100));
        assert_eq!(backoff.compute_delay(2), Duration::from_millis(200));
        assert_eq!(backoff.compute_delay(3), Duration::from_millis(350)); // 400 clamped
    }

    #[tokio::test]
    async fn retries_until_max_attempts_then_reports_last_error() {
        let executor = RetryExecutor::new(RetryPolicy::unrestricted(
            3,
            Backoff {
                strategy: BackoffStrategy::Fixed,
                initial: Duration::from_millis(1),
                max: None,
            },
        ));

        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let outcome = executor
            .run(FailureCategory::Timeout, move |_attempt| {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), String>("still failing".to_string())
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match outcome {
            RetryOutcome::Failed { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, "still failing");
            }
            RetryOutcome::Success(_) => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn succeeds_on_second_attempt() {
        let executor = RetryExecutor::new(RetryPolicy::unrestricted(
            3,
            Backoff {
                strategy: BackoffStrategy::Fixed,
                initial: Duration::from_millis(1),
                max: None,
            },
        ));

        let outcome = executor
            .run(FailureCategory::Timeout, move |attempt| async move {
                if attempt < 2 {
                    Err("not yet".to_string())
                } else {
                    Ok(42)
                }
            })
            .await;

        match outcome {
            RetryOutcome::Success(value) => assert_eq!(value, 42),
            RetryOutcome::Failed { .. } => panic!("expected success"),
        }
    }

    #[test]
    fn matches_defaults_to_every_category_when_unrestricted() {
        let policy = RetryPolicy::unrestricted(3, Backoff {
            strategy: BackoffStrategy::Fixed,
            initial: Duration::from_millis(1),
            max: None,
        });
        assert!(policy.matches(FailureCategory::Timeout));
        assert!(policy.matches(FailureCategory::AssertionMismatch));
    }

    #[test]
    fn matches_respects_category_allowlist() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: Backoff {
                strategy: BackoffStrategy::Fixed,
                initial: Duration::from_millis(1),
                max: None,
            },
            retry_categories: Some(vec![FailureCategory::Timeout, FailureCategory::ConnectionRefused]),
        };
        assert!(policy.matches(FailureCategory::Timeout));
        assert!(policy.matches(FailureCategory::ConnectionRefused));
        assert!(!policy.matches(FailureCategory::AssertionMismatch));
    }

    #[tokio::test]
    async fn non_matching_category_fails_without_retrying() {
        let executor = RetryExecutor::new(RetryPolicy {
            max_attempts: 5,
            backoff: Backoff {
                strategy: BackoffStrategy::Fixed,
                initial: Duration::from_millis(1),
                max: None,
            },
            retry_categories: Some(vec![FailureCategory::Timeout]),
        });

        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let outcome = executor
            .run(FailureCategory::AssertionMismatch, move |_attempt| {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), String>("assertion failed".to_string())
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match outcome {
            RetryOutcome::Failed { attempts, .. } => assert_eq!(attempts, 1),
            RetryOutcome::Success(_) => panic!("expected failure"),
        }
    }
}
