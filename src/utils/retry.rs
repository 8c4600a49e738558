//! Retry policy: bounded attempts with an explicit backoff schedule.
//!
//! The policy is a pure value; the worker consults it after a transient
//! failure to decide between re-enqueueing with a delay and moving the
//! command to the troubleshooting queue.

use serde::{Deserialize, Serialize};

/// Backoff returned when the schedule is empty.
const FALLBACK_BACKOFF_S: i32 = 30;

/// Retry behavior for a command.
///
/// `attempt` is 1-based: the first delivery is attempt 1. A command is
/// retried while `attempt < max_attempts`; the backoff for attempt `n` is
/// `backoff_schedule[min(n - 1, len - 1)]` seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum delivery attempts before the command is exhausted.
    pub max_attempts: i32,
    /// Backoff in seconds per attempt; the last entry repeats.
    pub backoff_schedule: Vec<i32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_schedule: vec![10, 60, 300],
        }
    }
}

impl RetryPolicy {
    /// Policy with a custom attempt cap and the default schedule.
    pub fn with_max_attempts(max_attempts: i32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Whether another delivery should happen after a failed `attempt`.
    pub fn should_retry(&self, attempt: i32) -> bool {
        attempt < self.max_attempts
    }

    /// Backoff in seconds before the next delivery of a failed `attempt`.
    ///
    /// Returns `0` when the policy says not to retry.
    pub fn backoff_for(&self, attempt: i32) -> i32 {
        if !self.should_retry(attempt) {
            return 0;
        }
        if self.backoff_schedule.is_empty() {
            return FALLBACK_BACKOFF_S;
        }
        let index = (attempt - 1).clamp(0, self.backoff_schedule.len() as i32 - 1);
        self.backoff_schedule[index as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff_schedule, vec![10, 60, 300]);
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn test_backoff_follows_schedule() {
        let policy = RetryPolicy {
            max_attempts: 4,
            backoff_schedule: vec![10, 60, 300],
        };
        assert_eq!(policy.backoff_for(1), 10);
        assert_eq!(policy.backoff_for(2), 60);
        assert_eq!(policy.backoff_for(3), 300);
    }

    #[test]
    fn test_backoff_repeats_last_entry() {
        let policy = RetryPolicy {
            max_attempts: 10,
            backoff_schedule: vec![5, 15],
        };
        assert_eq!(policy.backoff_for(2), 15);
        assert_eq!(policy.backoff_for(9), 15);
    }

    #[test]
    fn test_backoff_zero_when_exhausted() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(3), 0);
        assert_eq!(policy.backoff_for(100), 0);
    }

    #[test]
    fn test_backoff_fallback_on_empty_schedule() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_schedule: vec![],
        };
        assert_eq!(policy.backoff_for(1), 30);
        assert_eq!(policy.backoff_for(2), 30);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let policy: RetryPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy, RetryPolicy::default());

        let policy: RetryPolicy =
            serde_json::from_str(r#"{"max_attempts": 1, "backoff_schedule": [2]}"#).unwrap();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.backoff_schedule, vec![2]);
    }
}
