//! Fixed-schedule retry decisions for failed delivery attempts.
//!
//! Delays come from a fixed table indexed by attempt number; attempts past
//! the end of the table reuse its last entry. A 429 `Retry-After` hint can
//! lengthen a delay but never shorten it. Network errors, timeouts, 5xx and
//! 429 all draw from the destination's single retry budget.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// Default backoff schedule in seconds: 30s, 2m, 5m, 10m, 30m, 1h.
pub const DEFAULT_BACKOFF_SECONDS: [u64; 6] = [30, 120, 300, 600, 1800, 3600];

/// Longest delay a `Retry-After` hint may impose (24h).
pub const MAX_RETRY_AFTER_SECONDS: u64 = 86_400;

/// Retry timing shared by all destinations.
///
/// How many retries a destination gets is part of its configuration; the
/// policy only decides how long to wait between them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before retry N is `schedule_seconds[N - 1]`.
    pub schedule_seconds: Vec<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { schedule_seconds: DEFAULT_BACKOFF_SECONDS.to_vec() }
    }
}

impl RetryPolicy {
    /// Creates a policy from an explicit schedule. An empty schedule falls
    /// back to the default table.
    pub fn with_schedule(schedule_seconds: Vec<u64>) -> Self {
        if schedule_seconds.is_empty() {
            return Self::default();
        }
        Self { schedule_seconds }
    }

    /// Backoff after the given attempt (1-based) failed.
    pub fn backoff_for_attempt(&self, attempt_number: u32) -> Duration {
        let index = usize::try_from(attempt_number.max(1) - 1).unwrap_or(usize::MAX);
        let seconds = self
            .schedule_seconds
            .get(index)
            .or_else(|| self.schedule_seconds.last())
            .copied()
            .unwrap_or(DEFAULT_BACKOFF_SECONDS[0]);
        Duration::from_secs(seconds)
    }
}

/// Everything needed to decide what happens after a failed attempt.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Attempt that just failed (1-based, equals the item's attempt count).
    pub attempt_number: u32,
    /// Destination's retry budget.
    pub max_retries: u32,
    /// Error that ended the attempt.
    pub error: DeliveryError,
    /// When the attempt failed.
    pub failed_at: DateTime<Utc>,
    /// Backoff table.
    pub policy: RetryPolicy,
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Return the item to pending until `next_attempt_at`.
    Retry {
        /// When the item becomes due again
        next_attempt_at: DateTime<Utc>,
        /// Delay applied
        delay: Duration,
    },
    /// Move the item to failed.
    GiveUp {
        /// Reason recorded on the item
        reason: String,
        /// Whether the budget ran out, as opposed to a final rejection
        retries_exhausted: bool,
    },
}

impl RetryContext {
    /// Creates a new retry context for a failed attempt.
    pub fn new(
        attempt_number: u32,
        max_retries: u32,
        error: DeliveryError,
        failed_at: DateTime<Utc>,
        policy: RetryPolicy,
    ) -> Self {
        Self { attempt_number, max_retries, error, failed_at, policy }
    }

    /// Decides between another attempt and giving up.
    ///
    /// A retry is allowed while `attempt_number <= max_retries`, so an item
    /// is attempted at most `max_retries + 1` times.
    pub fn decide_retry(&self) -> RetryDecision {
        if !self.error.is_retryable() {
            return RetryDecision::GiveUp {
                reason: format!("non-retryable error: {}", self.error),
                retries_exhausted: false,
            };
        }

        if self.attempt_number > self.max_retries {
            return RetryDecision::GiveUp {
                reason: format!(
                    "retries exhausted after {} attempts: {}",
                    self.attempt_number, self.error
                ),
                retries_exhausted: true,
            };
        }

        let delay = self.calculate_delay();
        let next_attempt_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|chrono_delay| self.failed_at.checked_add_signed(chrono_delay));
        let Some(next_attempt_at) = next_attempt_at else {
            return RetryDecision::GiveUp {
                reason: "retry delay duration out of range".to_string(),
                retries_exhausted: false,
            };
        };

        RetryDecision::Retry { next_attempt_at, delay }
    }

    /// Scheduled backoff, lengthened by a server hint when one is larger.
    ///
    /// Hints are capped at [`MAX_RETRY_AFTER_SECONDS`].
    pub fn calculate_delay(&self) -> Duration {
        let backoff = self.policy.backoff_for_attempt(self.attempt_number);
        match self.error.retry_after_seconds() {
            Some(hint) => backoff.max(Duration::from_secs(hint.min(MAX_RETRY_AFTER_SECONDS))),
            None => backoff,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn failed_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).single().unwrap()
    }

    fn decide(attempt: u32, max_retries: u32, error: DeliveryError) -> RetryDecision {
        RetryContext::new(attempt, max_retries, error, failed_at(), RetryPolicy::default())
            .decide_retry()
    }

    #[test]
    fn schedule_follows_table_then_repeats_last() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=8).map(|a| policy.backoff_for_attempt(a).as_secs()).collect();
        assert_eq!(delays, vec![30, 120, 300, 600, 1800, 3600, 3600, 3600]);
    }

    #[test]
    fn attempt_zero_uses_first_entry() {
        assert_eq!(RetryPolicy::default().backoff_for_attempt(0), Duration::from_secs(30));
    }

    #[test]
    fn three_retries_then_exhausted() {
        let error = DeliveryError::server_error(503, "unavailable");
        let gaps: Vec<u64> = (1..=3)
            .map(|attempt| match decide(attempt, 3, error.clone()) {
                RetryDecision::Retry { delay, .. } => delay.as_secs(),
                other => panic!("attempt {attempt} should retry, got {other:?}"),
            })
            .collect();
        assert_eq!(gaps, vec![30, 120, 300]);

        assert!(matches!(
            decide(4, 3, error),
            RetryDecision::GiveUp { retries_exhausted: true, .. }
        ));
    }

    #[test]
    fn client_rejection_is_final() {
        assert!(matches!(
            decide(1, 3, DeliveryError::client_rejected(404, "missing")),
            RetryDecision::GiveUp { retries_exhausted: false, .. }
        ));
    }

    #[test]
    fn zero_retry_budget_fails_first_transient_error() {
        assert!(matches!(
            decide(1, 0, DeliveryError::timeout(30)),
            RetryDecision::GiveUp { retries_exhausted: true, .. }
        ));
    }

    #[test]
    fn retry_after_hint_only_lengthens_delay() {
        let long_hint = decide(1, 3, DeliveryError::too_many_requests(Some(900), ""));
        assert_eq!(
            long_hint,
            RetryDecision::Retry {
                next_attempt_at: failed_at() + chrono::Duration::seconds(900),
                delay: Duration::from_secs(900),
            }
        );

        let short_hint = decide(2, 3, DeliveryError::too_many_requests(Some(5), ""));
        assert!(matches!(short_hint, RetryDecision::Retry { delay, .. } if delay.as_secs() == 120));
    }

    #[test]
    fn oversized_retry_after_hint_is_capped() {
        let decision = decide(1, 3, DeliveryError::too_many_requests(Some(9_000_000_000_000), ""));
        assert_eq!(
            decision,
            RetryDecision::Retry {
                next_attempt_at: failed_at() + chrono::Duration::seconds(86_400),
                delay: Duration::from_secs(MAX_RETRY_AFTER_SECONDS),
            }
        );

        let max = decide(1, 3, DeliveryError::too_many_requests(Some(u64::MAX), ""));
        assert!(matches!(max, RetryDecision::Retry { delay, .. } if delay.as_secs() == 86_400));
    }

    #[test]
    fn empty_schedule_uses_default() {
        assert_eq!(RetryPolicy::with_schedule(Vec::new()), RetryPolicy::default());
        let custom = RetryPolicy::with_schedule(vec![1, 2]);
        assert_eq!(custom.backoff_for_attempt(5), Duration::from_secs(2));
    }
}
