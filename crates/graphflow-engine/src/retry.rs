use std::time::Duration;

use graphflow_core::error::FlowError;
use graphflow_core::graph::{BackoffStrategy, RetryPolicy};

/// Whether a handler should retry after this error, given attempts so far.
pub fn should_retry(err: &FlowError, retries_done: u32, policy: &RetryPolicy) -> bool {
    err.is_retryable() && retries_done < policy.max_retries
}

/// Delay before retry number `attempt` (1-based), capped at `max_delay_ms`.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    let base = policy.initial_delay_ms;
    let ms = match policy.backoff {
        BackoffStrategy::Fixed => base,
        BackoffStrategy::Linear => base.saturating_mul(attempt as u64),
        BackoffStrategy::Exponential => exponential(base, attempt),
        BackoffStrategy::Jittered => {
            // 0.8x to 1.2x of the exponential delay
            let jitter = 0.8 + rand::random::<f64>() * 0.4;
            (exponential(base, attempt) as f64 * jitter) as u64
        }
    };
    Duration::from_millis(ms.min(policy.max_delay_ms))
}

fn exponential(base: u64, attempt: u32) -> u64 {
    let shift = (attempt - 1).min(32);
    base.saturating_mul(1u64 << shift)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(backoff: BackoffStrategy) -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            backoff,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
        }
    }

    #[test]
    fn test_strategies() {
        let fixed = policy(BackoffStrategy::Fixed);
        assert_eq!(backoff_delay(&fixed, 3), Duration::from_millis(100));

        let linear = policy(BackoffStrategy::Linear);
        assert_eq!(backoff_delay(&linear, 3), Duration::from_millis(300));

        let exp = policy(BackoffStrategy::Exponential);
        assert_eq!(backoff_delay(&exp, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&exp, 3), Duration::from_millis(400));
        assert_eq!(backoff_delay(&exp, 10), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let jittered = policy(BackoffStrategy::Jittered);
        for _ in 0..50 {
            let d = backoff_delay(&jittered, 2).as_millis();
            assert!((160..=240).contains(&d), "delay {} out of band", d);
        }
    }

    #[test]
    fn test_should_retry() {
        let p = policy(BackoffStrategy::Fixed);
        let transient = FlowError::ModelRequest("503".into());
        assert!(should_retry(&transient, 0, &p));
        assert!(!should_retry(&transient, 3, &p));
        assert!(!should_retry(&FlowError::Cancelled, 0, &p));
    }
}
