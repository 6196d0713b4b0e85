//! Retry policy: bounded attempts with a fixed escalating backoff table.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::error_kind::{ErrorClassifier, ErrorKind, JobError};

/// Default backoff table in seconds.
pub const DEFAULT_BACKOFF_SECONDS: [u64; 3] = [60, 300, 900];

/// Default maximum number of deliveries.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Longest single backoff entry accepted: 30 days.
pub const MAX_BACKOFF_SECONDS: u64 = 30 * 24 * 60 * 60;

/// Retry policy configuration.
///
/// The backoff is a lookup table, not a formula: attempt `n` (1-indexed) waits
/// `backoff_seconds[n - 1]`; attempts beyond the table reuse the last entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (deliveries) before giving up.
    max_attempts: u32,
    /// Escalating delays, in seconds. Never empty.
    backoff_seconds: Vec<u64>,
    #[serde(skip)]
    classifier: ErrorClassifier,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_seconds: DEFAULT_BACKOFF_SECONDS.to_vec(),
            classifier: ErrorClassifier,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_seconds: Vec<u64>) -> Result<Self, DomainError> {
        if backoff_seconds.is_empty() {
            return Err(DomainError::validation("backoff table must not be empty"));
        }
        if backoff_seconds.iter().any(|&secs| secs > MAX_BACKOFF_SECONDS) {
            return Err(DomainError::validation(format!(
                "backoff entries must not exceed {MAX_BACKOFF_SECONDS} seconds"
            )));
        }
        Ok(Self {
            max_attempts,
            backoff_seconds,
            classifier: ErrorClassifier,
        })
    }

    /// Create a policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff_seconds(&self) -> &[u64] {
        &self.backoff_seconds
    }

    /// Whether another attempt is allowed after `attempts` failed deliveries.
    pub fn should_retry(&self, attempts: u32, kind: ErrorKind) -> bool {
        self.classifier.is_retryable(kind) && self.has_attempts_left(attempts)
    }

    pub fn has_attempts_left(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    pub fn classify_and_decide(&self, error: &JobError, attempts: u32) -> bool {
        self.should_retry(attempts, self.classifier.classify(error))
    }

    /// Delay before attempt number `attempt` (1-indexed) may run again.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let last = self.backoff_seconds.len().saturating_sub(1);
        let idx = (attempt.saturating_sub(1) as usize).min(last);
        Duration::from_secs(self.backoff_seconds.get(idx).copied().unwrap_or(0))
    }

    /// Saturates at the latest representable instant.
    pub fn next_retry_at(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.delay_for_attempt(attempt))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn table_backoff_clamps_to_last_entry() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(300));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(900));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(900));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(900));
    }

    #[test]
    fn next_retry_at_is_monotonic_then_flat() {
        let policy = RetryPolicy::default();
        let now = epoch();

        let t1 = policy.next_retry_at(1, now);
        let t2 = policy.next_retry_at(2, now);
        let t3 = policy.next_retry_at(3, now);
        let t4 = policy.next_retry_at(4, now);

        assert_eq!(t1, now + chrono::Duration::seconds(60));
        assert!(t1 < t2 && t2 < t3);
        assert_eq!(t3, t4);
    }

    #[test]
    fn should_retry_respects_kind_and_max_attempts() {
        let policy = RetryPolicy::default();

        assert!(policy.should_retry(0, ErrorKind::Transient));
        assert!(policy.should_retry(2, ErrorKind::RateLimit));
        assert!(!policy.should_retry(3, ErrorKind::Transient));
        assert!(!policy.should_retry(0, ErrorKind::Permanent));
        assert!(!policy.should_retry(1, ErrorKind::NotFound));
        assert!(!RetryPolicy::no_retry().should_retry(0, ErrorKind::Transient));
    }

    #[test]
    fn empty_table_is_rejected() {
        assert!(RetryPolicy::new(3, vec![]).is_err());
        assert_eq!(
            RetryPolicy::new(5, vec![1]).unwrap().delay_for_attempt(9),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn oversized_backoff_is_rejected() {
        assert!(RetryPolicy::new(3, vec![60, MAX_BACKOFF_SECONDS]).is_ok());
        assert!(RetryPolicy::new(3, vec![60, MAX_BACKOFF_SECONDS + 1]).is_err());
        assert!(RetryPolicy::new(3, vec![100_000_000_000_000]).is_err());
    }

    #[test]
    fn next_retry_at_saturates_instead_of_overflowing() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"max_attempts":3,"backoff_seconds":[100000000000000]}"#)
                .unwrap();
        assert_eq!(policy.next_retry_at(1, epoch()), DateTime::<Utc>::MAX_UTC);
        assert_eq!(
            RetryPolicy::default().next_retry_at(1, DateTime::<Utc>::MAX_UTC),
            DateTime::<Utc>::MAX_UTC
        );
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Delays never shrink as the attempt number grows, for any ascending table.
            #[test]
            fn delays_never_decrease(
                mut table in prop::collection::vec(1u64..10_000, 1..6),
                attempt in 1u32..20,
            ) {
                table.sort_unstable();
                let policy = RetryPolicy::new(3, table).unwrap();
                prop_assert!(
                    policy.delay_for_attempt(attempt) <= policy.delay_for_attempt(attempt + 1)
                );
            }
        }
    }
}
