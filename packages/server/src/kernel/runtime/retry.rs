//! Retry delay computation.
//!
//! `next_delay = clamp(initial × factor^(attempt-1), max)` with a jitter
//! ratio in `[0, 1]`. Attempts count from 1; the policy's `max_attempts`
//! bounds the total number of executions, not retries.

use rand::Rng;
use std::time::Duration;

use super::model::{RetryPolicy, RetryStrategy};

/// Whether another attempt is allowed after `attempt` executions.
pub fn attempts_remain(policy: &RetryPolicy, attempt: i32, run_max_attempts: Option<i32>) -> bool {
    if policy.strategy == RetryStrategy::None {
        return false;
    }
    let cap = run_max_attempts.or(policy.max_attempts);
    match cap {
        Some(max) => attempt < max,
        // No cap configured: a retry policy without maxAttempts retries
        // indefinitely.
        None => true,
    }
}

/// Delay before the next attempt. `attempt` is the number of executions so
/// far (>= 1).
pub fn next_delay(policy: &RetryPolicy, attempt: i32) -> Duration {
    let base = match policy.strategy {
        RetryStrategy::None => return Duration::ZERO,
        RetryStrategy::Fixed => policy.initial_delay_ms,
        RetryStrategy::Exponential => {
            let factor = 2f64.powi((attempt - 1).max(0));
            (policy.initial_delay_ms as f64 * factor) as i64
        }
    };
    let capped = match policy.max_delay_ms {
        Some(max) => base.min(max),
        None => base,
    }
    .max(0);

    let jitter_ratio = policy.jitter_ratio.clamp(0.0, 1.0);
    let jittered = if jitter_ratio > 0.0 {
        let spread = (capped as f64 * jitter_ratio) as i64;
        if spread > 0 {
            capped - spread / 2 + rand::thread_rng().gen_range(0..=spread)
        } else {
            capped
        }
    } else {
        capped
    };

    Duration::from_millis(jittered.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(strategy: RetryStrategy) -> RetryPolicy {
        RetryPolicy {
            strategy,
            initial_delay_ms: 100,
            max_delay_ms: Some(1_000),
            max_attempts: Some(3),
            jitter_ratio: 0.0,
        }
    }

    #[test]
    fn none_strategy_never_retries() {
        let p = policy(RetryStrategy::None);
        assert!(!attempts_remain(&p, 1, None));
        assert_eq!(next_delay(&p, 1), Duration::ZERO);
    }

    #[test]
    fn fixed_strategy_uses_initial_delay() {
        let p = policy(RetryStrategy::Fixed);
        assert_eq!(next_delay(&p, 1), Duration::from_millis(100));
        assert_eq!(next_delay(&p, 5), Duration::from_millis(100));
    }

    #[test]
    fn exponential_strategy_doubles_and_clamps() {
        let p = policy(RetryStrategy::Exponential);
        assert_eq!(next_delay(&p, 1), Duration::from_millis(100));
        assert_eq!(next_delay(&p, 2), Duration::from_millis(200));
        assert_eq!(next_delay(&p, 3), Duration::from_millis(400));
        // 100 * 2^5 = 3200, clamped to 1000.
        assert_eq!(next_delay(&p, 6), Duration::from_millis(1_000));
    }

    #[test]
    fn attempts_are_bounded_by_policy_or_run() {
        let p = policy(RetryStrategy::Exponential);
        assert!(attempts_remain(&p, 1, None));
        assert!(attempts_remain(&p, 2, None));
        assert!(!attempts_remain(&p, 3, None));
        // Run-level cap wins over the policy cap.
        assert!(!attempts_remain(&p, 2, Some(2)));
        assert!(attempts_remain(&p, 5, Some(10)));
    }

    #[test]
    fn jitter_stays_within_spread() {
        let p = RetryPolicy {
            strategy: RetryStrategy::Fixed,
            initial_delay_ms: 1_000,
            max_delay_ms: None,
            max_attempts: None,
            jitter_ratio: 0.5,
        };
        for _ in 0..50 {
            let d = next_delay(&p, 1).as_millis() as i64;
            assert!((750..=1_250).contains(&d), "delay {d} outside jitter band");
        }
    }
}
