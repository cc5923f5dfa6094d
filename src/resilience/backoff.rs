//! Exponential backoff with jitter for the Resilience Service's outer retry (§4.11).
//!
//! Formula: `min(base * multiplier^attempt, max) + uniform_jitter`
//! where jitter is `±(duration * jitter_fraction)`.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter_fraction: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 200,
            max_ms: 30_000,
            multiplier: 2.0,
            jitter_fraction: 0.25,
        }
    }
}

/// Calculate the next backoff duration for `attempt` (0-indexed).
pub fn next_backoff(attempt: u32, config: &BackoffConfig) -> Duration {
    let base = config.base_ms as f64;
    let raw = base * config.multiplier.powi(attempt as i32);
    let capped = raw.min(config.max_ms as f64);

    let jitter_range = capped * config.jitter_fraction;
    let pseudo_random_fraction = pseudo_rand(attempt) * jitter_range;
    let with_jitter = (capped + pseudo_random_fraction).max(0.0);

    Duration::from_millis(with_jitter as u64)
}

pub async fn backoff_sleep(attempt: u32, config: &BackoffConfig) {
    tokio::time::sleep(next_backoff(attempt, config)).await;
}

/// Produce a float in [-0.5, 0.5) using a simple LCG seeded by `attempt`.
/// Avoids adding a `rand` dependency for jitter spread.
fn pseudo_rand(attempt: u32) -> f64 {
    const A: u64 = 1_664_525;
    const C: u64 = 1_013_904_223;
    const M: u64 = 1u64 << 32;
    let state = A.wrapping_mul(attempt as u64).wrapping_add(C) % M;
    (state as f64 / M as f64) - 0.5
}
