//! Exponential backoff schedule shared by provider submission retries,
//! status polling, and outbound webhook delivery.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Tunable parameters for an exponential-backoff schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the second attempt.
    pub initial_interval: Duration,
    /// Factor by which the delay grows after each attempt.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_interval: Duration,
    /// Total attempts, including the first.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            multiplier: 2.0,
            max_interval: Duration::from_secs(60),
            max_attempts: 3,
        }
    }
}

impl BackoffPolicy {
    /// Schedule for provider status polling.
    pub fn polling() -> Self {
        Self {
            initial_interval: Duration::from_secs(5),
            multiplier: 1.5,
            max_interval: Duration::from_secs(60),
            max_attempts: 40,
        }
    }

    /// Schedule for retrying transient provider submission failures.
    pub fn provider_submit() -> Self {
        Self {
            initial_interval: Duration::from_secs(2),
            multiplier: 2.0,
            max_interval: Duration::from_secs(120),
            max_attempts: 5,
        }
    }

    /// Calculate the delay that follows `current`, clamped to
    /// [`max_interval`](Self::max_interval).
    pub fn next_delay(&self, current: Duration) -> Duration {
        let next_ms = (current.as_millis() as f64 * self.multiplier) as u64;
        Duration::from_millis(next_ms).min(self.max_interval)
    }

    /// Delay to wait after attempt number `attempt` (1-based) fails.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_interval.min(self.max_interval);
        for _ in 1..attempt {
            delay = self.next_delay(delay);
        }
        delay
    }

    /// Reject schedules that would never make progress.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_attempts == 0 {
            return Err(CoreError::Validation(
                "max_attempts must be at least 1".into(),
            ));
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(CoreError::Validation(
                "multiplier must be at least 1.0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_delay_doubles() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.next_delay(Duration::from_secs(1)), Duration::from_secs(2));
    }

    #[test]
    fn next_delay_clamps_at_max() {
        let policy = BackoffPolicy {
            max_interval: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(policy.next_delay(Duration::from_secs(8)), Duration::from_secs(10));
    }

    #[test]
    fn custom_multiplier() {
        let policy = BackoffPolicy {
            multiplier: 1.5,
            ..Default::default()
        };
        assert_eq!(policy.next_delay(Duration::from_secs(2)), Duration::from_secs(3));
    }

    #[test]
    fn full_backoff_sequence() {
        let policy = BackoffPolicy {
            max_interval: Duration::from_secs(30),
            ..Default::default()
        };
        let expected = [1, 2, 4, 8, 16, 30, 30, 30];

        for (i, &expected_secs) in expected.iter().enumerate() {
            assert_eq!(policy.delay_after(i as u32 + 1).as_secs(), expected_secs);
        }
    }

    #[test]
    fn zero_attempts_rejected() {
        let policy = BackoffPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn shrinking_multiplier_rejected() {
        let policy = BackoffPolicy {
            multiplier: 0.5,
            ..Default::default()
        };
        assert!(policy.validate().is_err());
        assert!(BackoffPolicy::polling().validate().is_ok());
    }
}
