//! Exponential reconnect backoff with jitter.

use neural_types::config::ReconnectConfig;
use rand::Rng;
use std::time::Duration;

/// Compute the delay before reconnect attempt `attempt` (0-indexed).
///
/// Formula: `min(base * 2^attempt, max) * (1 + fraction * jitter)`, clamped to
/// `max`. With `jitter <= 1` the sequence over increasing attempts is
/// non-decreasing for any fractions, since doubling always dominates the
/// jitter of the previous step.
pub fn compute_backoff(config: &ReconnectConfig, attempt: u32, fraction: f64) -> Duration {
    let base = config
        .base_delay_ms
        .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    let capped = base.min(config.max_delay_ms);

    if config.jitter <= 0.0 {
        return Duration::from_millis(capped);
    }

    let fraction = fraction.clamp(0.0, 1.0);
    let with_jitter = (capped as f64) * (1.0 + fraction * config.jitter);
    Duration::from_millis((with_jitter as u64).min(config.max_delay_ms))
}

/// Tracks consecutive connection failures and hands out the matching delays.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    failures: u32,
    last_delay: Option<Duration>,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            failures: 0,
            last_delay: None,
        }
    }

    /// Record a failure and return how long to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let fraction = rand::thread_rng().gen::<f64>();
        let delay = compute_backoff(&self.config, self.failures, fraction);
        self.failures = self.failures.saturating_add(1);
        self.last_delay = Some(delay);
        delay
    }

    /// Clear the failure counter after a successful connection.
    pub fn reset(&mut self) {
        self.failures = 0;
        self.last_delay = None;
    }

    /// Consecutive failures since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn last_delay(&self) -> Option<Duration> {
        self.last_delay
    }

    /// Whether the failure budget is used up.
    pub fn exhausted(&self) -> bool {
        self.failures >= self.config.max_failures
    }
}
