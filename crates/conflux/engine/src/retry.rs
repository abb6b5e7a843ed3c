//! Retry policy engine
//!
//! Decides whether a failed task run attempt is retried and after how long.

use conflux_types::{Failure, RetryDecision, RetryPolicy, TaskRun};
use rand::Rng;
use std::time::Duration;

/// Stateless retry decisions over a task run's snapshotted policy
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicyEngine;

impl RetryPolicyEngine {
    /// Decide what happens after `task_run` failed with `failure`
    pub fn on_failure<R: Rng + ?Sized>(
        task_run: &TaskRun,
        failure: &Failure,
        rng: &mut R,
    ) -> RetryDecision {
        Self::decide(&task_run.retry_policy, task_run.attempt, failure, rng)
    }

    /// Decide for failed attempt `attempt` (1-based) under `policy`
    pub fn decide<R: Rng + ?Sized>(
        policy: &RetryPolicy,
        attempt: u32,
        failure: &Failure,
        rng: &mut R,
    ) -> RetryDecision {
        if attempt >= policy.max_attempts {
            return RetryDecision::GiveUp;
        }
        if !policy.retry_on.allows(&failure.kind) {
            return RetryDecision::GiveUp;
        }

        let delay = policy.delay.base_delay(attempt);
        RetryDecision::Retry(apply_jitter(delay, policy.delay.jitter(), rng))
    }
}

/// Spread `delay` uniformly within `±fraction` of itself
pub fn apply_jitter<R: Rng + ?Sized>(delay: Duration, fraction: f64, rng: &mut R) -> Duration {
    if delay.is_zero() || fraction.is_nan() || fraction <= 0.0 {
        return delay;
    }
    let fraction = fraction.min(1.0);
    let factor = rng.gen_range((1.0 - fraction)..=(1.0 + fraction));
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use conflux_types::{FlowRunId, RetryCondition, State, TaskKey};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn task_run(policy: RetryPolicy, attempt: u32) -> TaskRun {
        TaskRun::new(
            FlowRunId::generate(),
            "extract",
            TaskKey::for_invocation("extract", 0),
            attempt,
            policy,
            State::scheduled(Utc::now()),
        )
    }

    #[test]
    fn test_gives_up_at_max_attempts() {
        let mut rng = StdRng::seed_from_u64(7);
        let policy = RetryPolicy::fixed(3, Duration::from_secs(1));
        let failure = Failure::new("TransientError", "timeout");

        assert_eq!(
            RetryPolicyEngine::on_failure(&task_run(policy.clone(), 2), &failure, &mut rng),
            RetryDecision::Retry(Duration::from_secs(1))
        );
        assert_eq!(
            RetryPolicyEngine::on_failure(&task_run(policy, 3), &failure, &mut rng),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_condition_filters_failure_kinds() {
        let mut rng = StdRng::seed_from_u64(7);
        let policy = RetryPolicy::fixed(5, Duration::ZERO)
            .with_condition(RetryCondition::Only(vec!["TransientError".into()]));

        let transient = Failure::new("TransientError", "timeout");
        let validation = Failure::new("ValidationError", "bad row");
        assert!(RetryPolicyEngine::decide(&policy, 1, &transient, &mut rng).is_retry());
        assert_eq!(
            RetryPolicyEngine::decide(&policy, 1, &validation, &mut rng),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_exponential_without_jitter() {
        let mut rng = StdRng::seed_from_u64(7);
        let policy =
            RetryPolicy::exponential(10, Duration::from_millis(100), Duration::from_millis(500));
        let failure = Failure::new("TransientError", "timeout");
        let delays: Vec<_> = (1..=5)
            .map(|attempt| RetryPolicyEngine::decide(&policy, attempt, &failure, &mut rng))
            .collect();
        assert_eq!(
            delays,
            vec![
                RetryDecision::Retry(Duration::from_millis(100)),
                RetryDecision::Retry(Duration::from_millis(200)),
                RetryDecision::Retry(Duration::from_millis(400)),
                RetryDecision::Retry(Duration::from_millis(500)),
                RetryDecision::Retry(Duration::from_millis(500)),
            ]
        );
    }

    #[test]
    fn test_jitter_stays_in_band_and_is_seeded() {
        let base = Duration::from_secs(10);
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let delay = apply_jitter(base, 0.2, &mut a);
            assert!((7_999..=12_001).contains(&delay.as_millis()));
            assert_eq!(delay, apply_jitter(base, 0.2, &mut b));
        }
    }

    #[test]
    fn test_jitter_near_max_saturates() {
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..50 {
            let delay = apply_jitter(Duration::MAX, 0.5, &mut rng);
            assert!(delay >= Duration::MAX / 3);
        }

        let policy = RetryPolicy::exponential(100, Duration::from_secs(1), Duration::MAX)
            .with_jitter(0.5);
        let failure = Failure::new("TransientError", "timeout");
        assert!(RetryPolicyEngine::decide(&policy, 80, &failure, &mut rng).is_retry());
    }
}
