use chrono::Duration;
use rand::Rng;

use leadgen_common::RetryPolicy;

/// Delay before retry number `failures` (1-based): `base * 2^(failures - 1)`,
/// capped at `max_delay_secs`, then spread by ±`jitter_ratio`.
pub fn retry_delay(policy: &RetryPolicy, failures: i32) -> Duration {
    let jitter = rand::rng().random_range(-1.0..=1.0);
    retry_delay_with_jitter(policy, failures, jitter)
}

/// Deterministic core of [`retry_delay`]; `jitter` is in `-1.0..=1.0`.
pub fn retry_delay_with_jitter(policy: &RetryPolicy, failures: i32, jitter: f64) -> Duration {
    let exponent = (failures - 1).clamp(0, 30);
    let max = policy.max_delay_secs as f64;
    let raw = (policy.base_delay_secs as f64 * 2f64.powi(exponent)).min(max);
    let spread = raw * (1.0 + policy.jitter_ratio * jitter.clamp(-1.0, 1.0));
    let secs = spread.clamp(0.0, max);
    Duration::milliseconds((secs * 1000.0).round() as i64)
}
