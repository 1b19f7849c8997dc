use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::error::{Result, SchedulerError};
use crate::types::{ExecutionStatus, JobExecution, RetryPolicy};

/// Upper bound on attempts a policy may request.
const MAX_ATTEMPTS_LIMIT: u32 = 100;

/// What should happen after an execution reached a terminal status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Nothing to retry (success or cancellation).
    Done,
    /// Schedule a successor attempt no earlier than `next_attempt_at`.
    Retry {
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
        delay: Duration,
    },
    /// The failure is permanent: attempts are exhausted or the policy
    /// excludes this kind of failure. The schedule enters alert state.
    GiveUp { reason: String },
}

/// Decides whether and when a failed execution is retried.
///
/// Delay for attempt `n` (1-based) is
/// `min(base * multiplier^(n-1) + jitter, max_backoff)` where jitter is drawn
/// uniformly from `[0, jitter_fraction * backoff]`.
#[derive(Debug, Clone)]
pub struct RetryController {
    jitter_fraction: f64,
}

impl RetryController {
    pub fn new(jitter_fraction: f64) -> Self {
        Self {
            jitter_fraction: jitter_fraction.clamp(0.0, 1.0),
        }
    }

    pub fn on_outcome(
        &self,
        execution: &JobExecution,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        match execution.status {
            ExecutionStatus::Failed => {}
            ExecutionStatus::TimedOut if policy.retry_on_timeout => {}
            ExecutionStatus::TimedOut => {
                return RetryDecision::GiveUp {
                    reason: "timed out and the retry policy excludes timeouts".to_string(),
                }
            }
            _ => return RetryDecision::Done,
        }

        if execution.attempt >= policy.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!(
                    "attempt {} of {} failed, retries exhausted",
                    execution.attempt, policy.max_attempts
                ),
            };
        }

        let delay = self.backoff_delay(policy, execution.attempt);
        let step = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        RetryDecision::Retry {
            attempt: execution.attempt + 1,
            next_attempt_at: now.checked_add_signed(step).unwrap_or(now),
            delay,
        }
    }

    /// Delay before the attempt following `failed_attempt`.
    pub fn backoff_delay(&self, policy: &RetryPolicy, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = policy.backoff_base_ms as f64 * policy.backoff_multiplier.powi(exponent);
        let max = policy.max_backoff_ms as f64;
        let base = if raw.is_finite() { raw.min(max) } else { max };

        let jitter_cap = base * self.jitter_fraction;
        let jitter = if jitter_cap >= 1.0 {
            rand::rng().random_range(0.0..=jitter_cap)
        } else {
            0.0
        };
        Duration::from_millis((base + jitter).min(max).max(0.0) as u64)
    }
}

/// Reject retry policies that cannot be evaluated sensibly.
pub fn validate_policy(policy: &RetryPolicy) -> Result<()> {
    if policy.max_attempts == 0 || policy.max_attempts > MAX_ATTEMPTS_LIMIT {
        return Err(SchedulerError::Validation(format!(
            "retry_policy.max_attempts must be within 1..={MAX_ATTEMPTS_LIMIT}, got {}",
            policy.max_attempts
        )));
    }
    if !policy.backoff_multiplier.is_finite() || policy.backoff_multiplier < 1.0 {
        return Err(SchedulerError::Validation(format!(
            "retry_policy.backoff_multiplier must be a finite number >= 1, got {}",
            policy.backoff_multiplier
        )));
    }
    if policy.backoff_base_ms > policy.max_backoff_ms {
        return Err(SchedulerError::Validation(format!(
            "retry_policy.backoff_base_ms ({}) exceeds max_backoff_ms ({})",
            policy.backoff_base_ms, policy.max_backoff_ms
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Trigger;
    use unisched_core::{ExecutionId, ScheduleId};

    fn execution(status: ExecutionStatus, attempt: u32) -> JobExecution {
        let now = Utc::now();
        JobExecution {
            id: ExecutionId::new(),
            schedule_id: ScheduleId::from("s"),
            attempt,
            parent_execution_id: None,
            status,
            trigger: Trigger::Schedule,
            scheduled_for: now,
            started_at: Some(now),
            finished_at: Some(now),
            error: None,
            result_summary: None,
            progress: None,
            instance_id: None,
            created_at: now,
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 3_000,
            retry_on_timeout: true,
        }
    }

    #[test]
    fn exponential_delays_are_capped_without_jitter() {
        let rc = RetryController::new(0.0);
        let p = policy();
        assert_eq!(rc.backoff_delay(&p, 1), Duration::from_millis(1_000));
        assert_eq!(rc.backoff_delay(&p, 2), Duration::from_millis(2_000));
        assert_eq!(rc.backoff_delay(&p, 3), Duration::from_millis(3_000));
        assert_eq!(rc.backoff_delay(&p, 40), Duration::from_millis(3_000));
    }

    #[test]
    fn jitter_stays_within_fraction_and_cap() {
        let rc = RetryController::new(0.5);
        let p = RetryPolicy {
            max_backoff_ms: 100_000,
            ..policy()
        };
        for _ in 0..100 {
            let d = rc.backoff_delay(&p, 1).as_millis();
            assert!((1_000..=1_500).contains(&d), "delay {d} out of range");
        }
        // at the cap, jitter cannot push past max_backoff_ms
        let capped = rc.backoff_delay(&policy(), 3).as_millis();
        assert_eq!(capped, 3_000);
    }

    #[test]
    fn failure_below_max_attempts_retries_with_next_attempt_number() {
        let rc = RetryController::new(0.0);
        let now = Utc::now();
        match rc.on_outcome(&execution(ExecutionStatus::Failed, 1), &policy(), now) {
            RetryDecision::Retry {
                attempt,
                next_attempt_at,
                delay,
            } => {
                assert_eq!(attempt, 2);
                assert_eq!(delay, Duration::from_millis(1_000));
                assert_eq!(next_attempt_at, now + chrono::Duration::milliseconds(1_000));
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn last_attempt_gives_up() {
        let rc = RetryController::new(0.0);
        let d = rc.on_outcome(&execution(ExecutionStatus::Failed, 3), &policy(), Utc::now());
        assert!(matches!(d, RetryDecision::GiveUp { .. }));
    }

    #[test]
    fn timeouts_follow_policy_flag() {
        let rc = RetryController::new(0.0);
        let timed_out = execution(ExecutionStatus::TimedOut, 1);
        assert!(matches!(
            rc.on_outcome(&timed_out, &policy(), Utc::now()),
            RetryDecision::Retry { .. }
        ));

        let strict = RetryPolicy {
            retry_on_timeout: false,
            ..policy()
        };
        assert!(matches!(
            rc.on_outcome(&timed_out, &strict, Utc::now()),
            RetryDecision::GiveUp { .. }
        ));
    }

    #[test]
    fn success_and_cancellation_are_done() {
        let rc = RetryController::new(0.0);
        for status in [ExecutionStatus::Succeeded, ExecutionStatus::Cancelled] {
            assert_eq!(
                rc.on_outcome(&execution(status, 1), &policy(), Utc::now()),
                RetryDecision::Done
            );
        }
    }

    #[test]
    fn policy_validation() {
        assert!(validate_policy(&policy()).is_ok());
        assert!(validate_policy(&RetryPolicy::none()).is_ok());
        assert!(validate_policy(&RetryPolicy { max_attempts: 0, ..policy() }).is_err());
        assert!(validate_policy(&RetryPolicy { backoff_multiplier: 0.5, ..policy() }).is_err());
        assert!(validate_policy(&RetryPolicy {
            backoff_multiplier: f64::NAN,
            ..policy()
        })
        .is_err());
        assert!(validate_policy(&RetryPolicy { backoff_base_ms: 10_000, ..policy() }).is_err());
    }
}
