//! Retry backoff
//!
//! Exponential policies plus the rule choosing which policy applies to a
//! given failure.

use std::cmp;
use std::time::Duration;

use rand::Rng;

use super::errors::{ResourceExhaustedCause, TaskError};
use crate::config::{BackoffPolicyConfig, TaskConfig};

/// Exponential backoff with a cap and proportional jitter
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    initial_interval: Duration,
    backoff_coefficient: f64,
    maximum_interval: Duration,
    jitter_fraction: f64,
}

impl RetryPolicy {
    pub fn new(initial_interval: Duration, backoff_coefficient: f64, maximum_interval: Duration) -> Self {
        Self {
            initial_interval,
            backoff_coefficient,
            maximum_interval,
            jitter_fraction: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter_fraction: f64) -> Self {
        self.jitter_fraction = jitter_fraction.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let millis = self.initial_interval.as_millis() as f64 * self.backoff_coefficient.powi(exponent);
        let capped = millis.min(self.maximum_interval.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay before retry number `attempt`, reduced by up to the jitter
    /// fraction.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter_fraction <= 0.0 {
            return base;
        }
        let reduction = rand::thread_rng().gen_range(0.0..self.jitter_fraction);
        base.mul_f64(1.0 - reduction)
    }
}

impl From<&BackoffPolicyConfig> for RetryPolicy {
    fn from(config: &BackoffPolicyConfig) -> Self {
        RetryPolicy::new(
            Duration::from_millis(config.initial_interval_ms),
            config.backoff_coefficient,
            Duration::from_millis(config.maximum_interval_ms),
        )
        .with_jitter(config.jitter_fraction)
    }
}

/// Policy set and the per-error selection rule
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicies {
    pub reschedule: RetryPolicy,
    /// Slower policy for failures that need another component to move first
    pub task_not_ready: RetryPolicy,
    pub dependency_not_completed: RetryPolicy,
}

impl BackoffPolicies {
    pub fn from_config(config: &TaskConfig) -> Self {
        Self {
            reschedule: (&config.reschedule_policy).into(),
            task_not_ready: (&config.task_not_ready_policy).into(),
            dependency_not_completed: (&config.dependency_not_completed_policy).into(),
        }
    }

    /// Delay before rescheduling after `err`.
    pub fn delay_for(&self, err: &TaskError, attempt: u32, resource_exhausted_count: u32) -> Duration {
        match err {
            TaskError::TerminalFailure(inner) | TaskError::DestinationDown(inner) => {
                self.delay_for(inner, attempt, resource_exhausted_count)
            }
            TaskError::StandbyRetry(_) | TaskError::NamespaceHandover(_) | TaskError::Internal(_) => {
                self.task_not_ready.next_delay(attempt)
            }
            TaskError::DependencyNotCompleted(_) => self.dependency_not_completed.next_delay(attempt),
            TaskError::ResourceExhausted { cause, .. }
                if *cause != ResourceExhaustedCause::BusyWorkflow =>
            {
                cmp::max(
                    self.reschedule.next_delay(attempt),
                    self.task_not_ready.next_delay(resource_exhausted_count),
                )
            }
            _ => self.reschedule.next_delay(attempt),
        }
    }
}

/// Whether a failed task goes straight back to the scheduler instead of
/// waiting in the rescheduler.
pub fn should_resubmit(
    attempt: u32,
    resource_exhausted_count: u32,
    err: &TaskError,
    config: &TaskConfig,
) -> bool {
    if attempt > config.resubmit_max_attempts {
        return false;
    }
    match err {
        TaskError::ShardOwnershipLost(_) | TaskError::Internal(_) => false,
        TaskError::ResourceExhausted { cause, .. } => {
            *cause == ResourceExhaustedCause::BusyWorkflow
                || resource_exhausted_count <= config.resource_exhausted_resubmit_max_attempts
        }
        TaskError::DestinationDown(inner) => {
            should_resubmit(attempt, resource_exhausted_count, inner, config)
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(1), 2.0, Duration::from_secs(5))
    }

    #[test]
    fn test_base_delay_grows_and_caps() {
        let p = policy();
        assert_eq!(p.base_delay(1), Duration::from_secs(1));
        assert_eq!(p.base_delay(2), Duration::from_secs(2));
        assert_eq!(p.base_delay(3), Duration::from_secs(4));
        assert_eq!(p.base_delay(4), Duration::from_secs(5));
        assert_eq!(p.base_delay(1000), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_only_shortens() {
        let p = policy().with_jitter(0.2);
        for _ in 0..50 {
            let d = p.next_delay(2);
            assert!(d <= Duration::from_secs(2));
            assert!(d >= Duration::from_millis(1600));
        }
    }

    #[test]
    fn test_slow_policy_for_handover_and_internal() {
        let config = TaskConfig::default();
        let policies = BackoffPolicies::from_config(&config);
        let slow = policies.task_not_ready.base_delay(1);
        for err in [
            TaskError::NamespaceHandover("h".into()),
            TaskError::Internal("i".into()),
        ] {
            let d = policies.delay_for(&err, 1, 0);
            assert!(d <= slow && d >= slow.mul_f64(0.8));
        }
    }

    #[test]
    fn test_resubmit_rules() {
        let config = TaskConfig::default();
        let busy = TaskError::resource_exhausted(ResourceExhaustedCause::BusyWorkflow, "b");
        let rps = TaskError::resource_exhausted(ResourceExhaustedCause::RpsLimit, "r");

        assert!(should_resubmit(10, 5, &busy, &config));
        assert!(!should_resubmit(11, 0, &busy, &config));
        assert!(should_resubmit(1, 1, &rps, &config));
        assert!(!should_resubmit(1, 2, &rps, &config));
        assert!(!should_resubmit(1, 0, &TaskError::ShardOwnershipLost("s".into()), &config));
        assert!(!should_resubmit(1, 0, &TaskError::Internal("i".into()), &config));
        assert!(should_resubmit(1, 0, &TaskError::Unexpected("u".into()), &config));
    }
}
