use std::time::Duration;

use rand::Rng;

use crate::types::{BackoffStrategy, RetryPolicy};

/// Deterministic part of the delay before the attempt after `attempt`
/// (1-based) fails: fixed, or `delay * factor^(attempt-1)` capped at
/// `max_delay`.
pub fn base_delay_ms(policy: &RetryPolicy, attempt: u32) -> u64 {
    let base = match policy.strategy {
        BackoffStrategy::Fixed => policy.delay_ms as f64,
        BackoffStrategy::Exponential => {
            policy.delay_ms as f64 * policy.backoff_factor.powi(attempt.saturating_sub(1) as i32)
        }
    };
    let capped = match policy.max_delay_ms {
        Some(max) => base.min(max as f64),
        None => base,
    };
    capped.max(0.0) as u64
}

/// Full backoff delay including additive random jitter.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let jitter = match policy.jitter_ms {
        Some(0) | None => 0,
        Some(max) => rand::thread_rng().gen_range(0..=max),
    };
    Duration::from_millis(base_delay_ms(policy, attempt) + jitter)
}
