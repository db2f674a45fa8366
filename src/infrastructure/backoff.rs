//! Exponential backoff with jitter for outbox and webhook retries

use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
    /// Multiplier for exponential growth
    pub multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 300_000, // 5 minutes
            multiplier: 2.0,
            jitter_factor: 0.1, // 10% jitter
        }
    }
}

/// Stateless backoff policy.
///
/// The outbox stores the attempt count on each message, so the delay for
/// attempt `n` is computed from `n` alone instead of from mutable state.
#[derive(Debug, Clone, Default)]
pub struct BackoffPolicy {
    config: BackoffConfig,
}

impl BackoffPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let raw = self.config.initial_delay_ms as f64 * self.config.multiplier.powi(exponent);
        let capped = raw.min(self.config.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Delay before retry number `attempt` (1-based) with jitter applied.
    ///
    /// Jitter never pushes the delay above the configured ceiling.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_millis() as f64;

        let final_delay = if self.config.jitter_factor > 0.0 && base > 0.0 {
            let jitter_range = base * self.config.jitter_factor;
            let jitter = rand::rng().random_range(-jitter_range..jitter_range);
            (base + jitter)
                .min(self.config.max_delay_ms as f64)
                .max(1.0)
        } else {
            base
        };

        Duration::from_millis(final_delay as u64)
    }

    /// Upper bound on the total time spent waiting across `max_attempts` attempts.
    pub fn max_horizon(&self, max_attempts: u32) -> Duration {
        (1..=max_attempts).fold(Duration::ZERO, |total, attempt| {
            let base = self.base_delay(attempt).as_millis() as f64;
            let with_jitter = (base * (1.0 + self.config.jitter_factor))
                .min(self.config.max_delay_ms as f64);
            total + Duration::from_millis(with_jitter as u64)
        })
    }
}
