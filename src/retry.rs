use crate::config::RetryPolicy;
use std::time::Duration;

/// What the worker should do with a job after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue as `Delayed`, eligible again after the given backoff.
    RetryAfter(Duration),
    /// Attempts exhausted; mark terminally `Failed`.
    Fail,
}

/// Decide the fate of a job whose attempt number `attempts` (1-based,
/// already incremented by the claim) just failed.
pub fn on_failure(policy: &RetryPolicy, attempts: u32, max_attempts: u32) -> RetryDecision {
    if attempts >= max_attempts {
        return RetryDecision::Fail;
    }
    RetryDecision::RetryAfter(backoff(policy, attempts))
}

/// Backoff before attempt `attempts + 1`:
/// `initial_delay * multiplier^(attempts - 1)`, capped at `max_delay`.
pub fn backoff(policy: &RetryPolicy, attempts: u32) -> Duration {
    let exp = attempts.saturating_sub(1);
    let factor = policy.multiplier.powi(exp.min(i32::MAX as u32) as i32);
    let secs = policy.initial_delay.as_secs_f64() * factor;
    if !secs.is_finite() || secs >= policy.max_delay.as_secs_f64() {
        policy.max_delay
    } else {
        Duration::from_secs_f64(secs)
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
    }

    #[test]
    fn default_backoff_sequence() {
        let p = policy();
        assert_eq!(backoff(&p, 1), Duration::from_secs(2));
        assert_eq!(backoff(&p, 2), Duration::from_secs(4));
        assert_eq!(backoff(&p, 3), Duration::from_secs(8));
    }

    #[test]
    fn last_attempt_is_terminal() {
        let p = policy();
        assert_eq!(on_failure(&p, 3, 3), RetryDecision::Fail);
        assert_eq!(on_failure(&p, 5, 3), RetryDecision::Fail);
        assert!(matches!(on_failure(&p, 2, 3), RetryDecision::RetryAfter(_)));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        /// Backoff grows geometrically, not linearly.
        #[test]
        fn prop_backoff_geometric(attempt in 2u32..12) {
            let p = policy();
            let current = backoff(&p, attempt);
            let previous = backoff(&p, attempt - 1);
            if current < p.max_delay {
                prop_assert_eq!(current, previous * 2);
            }
        }

        /// Backoff never exceeds the configured cap.
        #[test]
        fn prop_backoff_capped(attempt in 1u32..64) {
            let p = policy();
            prop_assert!(backoff(&p, attempt) <= p.max_delay);
        }

        /// With continuous failure a job is retried exactly
        /// `max_attempts - 1` times before the terminal decision.
        #[test]
        fn prop_attempt_ceiling(max_attempts in 1u32..8) {
            let p = policy();
            let mut retries = 0u32;
            for attempt in 1..=max_attempts {
                match on_failure(&p, attempt, max_attempts) {
                    RetryDecision::RetryAfter(_) => retries += 1,
                    RetryDecision::Fail => {
                        prop_assert_eq!(attempt, max_attempts);
                    }
                }
            }
            prop_assert_eq!(retries, max_attempts - 1);
        }

        /// A multiplier below 1.0 is clamped so the delay never shrinks.
        #[test]
        fn prop_backoff_monotone(m in 0.1f64..4.0, attempt in 1u32..10) {
            let p = RetryPolicy::new().multiplier(m);
            prop_assert!(backoff(&p, attempt + 1) >= backoff(&p, attempt));
        }
    }
}
