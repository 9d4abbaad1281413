//! Retry scheduling for step activities.

use rocketship_types::{EngineError, RetryPolicy, StepError};
use rocketship_util::parse_duration;
use std::time::Duration;

const FALLBACK_INITIAL_INTERVAL: Duration = Duration::from_secs(1);

/// View over a step's retry policy with the defaults applied.
pub struct RetrySchedule<'a> {
    policy: Option<&'a RetryPolicy>,
}

impl<'a> RetrySchedule<'a> {
    pub fn new(policy: Option<&'a RetryPolicy>) -> Self {
        Self { policy }
    }

    /// Total invocation budget (at least 1).
    pub fn maximum_attempts(&self) -> u32 {
        self.policy
            .map(|policy| policy.maximum_attempts.max(1))
            .unwrap_or(1)
    }

    /// Backoff delay after the given 1-based attempt:
    /// `initial_interval * backoff_coefficient^(attempt - 1)`.
    pub fn interval_after(&self, attempt: u32) -> Duration {
        let Some(policy) = self.policy else {
            return FALLBACK_INITIAL_INTERVAL;
        };
        let initial =
            parse_duration(&policy.initial_interval).unwrap_or(FALLBACK_INITIAL_INTERVAL);
        let coefficient = policy.backoff_coefficient.max(1.0);
        let factor = coefficient.powi(attempt.saturating_sub(1) as i32);
        initial.mul_f64(factor)
    }

    /// Whether this failure may be retried under the policy.
    pub fn allows_retry(&self, error: &StepError) -> bool {
        let non_retryable = self
            .policy
            .map(|policy| policy.non_retryable_errors.as_slice())
            .unwrap_or_default();
        EngineError::new(error.kind, error.message.clone()).is_retryable_under(non_retryable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rocketship_types::ErrorKind;

    fn policy(yaml: &str) -> RetryPolicy {
        serde_yaml::from_str(yaml).expect("parse policy")
    }

    #[test]
    fn intervals_back_off_exponentially() {
        let policy = policy(
            "maximum_attempts: 3\ninitial_interval: 100ms\nbackoff_coefficient: 2.0\n",
        );
        let schedule = RetrySchedule::new(Some(&policy));
        assert_eq!(schedule.maximum_attempts(), 3);
        assert_eq!(schedule.interval_after(1), Duration::from_millis(100));
        assert_eq!(schedule.interval_after(2), Duration::from_millis(200));
        assert_eq!(schedule.interval_after(3), Duration::from_millis(400));
    }

    #[test]
    fn absent_policy_means_a_single_attempt() {
        let schedule = RetrySchedule::new(None);
        assert_eq!(schedule.maximum_attempts(), 1);
    }

    #[test]
    fn non_retryable_kinds_and_listed_kinds_block_retry() {
        let policy = policy(
            "maximum_attempts: 5\nnon_retryable_errors: [STEP_TIMEOUT]\n",
        );
        let schedule = RetrySchedule::new(Some(&policy));

        let plugin_error = StepError {
            kind: ErrorKind::PluginError,
            message: "boom".to_string(),
        };
        assert!(schedule.allows_retry(&plugin_error));

        let assertion = StepError {
            kind: ErrorKind::AssertionFailed,
            message: "mismatch".to_string(),
        };
        assert!(!schedule.allows_retry(&assertion));

        let timeout = StepError {
            kind: ErrorKind::StepTimeout,
            message: "slow".to_string(),
        };
        assert!(!schedule.allows_retry(&timeout));
    }
}
