use rand::Rng as _;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy for outbound calls (see the `retry` table in config.toml).
/// Immutable once constructed.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the initial one.
    /// TOML: `retry.max_retries`. Default: `3`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay before the first retry, in milliseconds.
    /// TOML: `retry.base_delay_ms`. Default: `1000`.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on any computed delay, in milliseconds.
    /// TOML: `retry.max_delay_ms`. Default: `60000`.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Exponential growth factor between attempts.
    /// TOML: `retry.backoff_multiplier`. Default: `2.0`.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Fraction of the capped delay added as uniform random jitter (0–1).
    /// TOML: `retry.jitter_factor`. Default: `0.1`.
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_jitter_factor() -> f64 {
    0.1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl RetryPolicy {
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Capped exponential delay for `attempt` (0-based), before jitter.
    /// Monotonically non-decreasing in `attempt`.
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        let exponential =
            self.base_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(exponential.min(self.max_delay_ms as f64) as u64)
    }

    /// Delay actually slept before retrying after `attempt`: the capped
    /// exponential plus uniform jitter in `[0, capped * jitter_factor)`.
    /// Jitter desynchronizes concurrent retriers hitting the same upstream.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let capped = self.capped_delay(attempt);
        capped + capped.mul_f64(self.jitter_factor * rand::rng().random::<f64>())
    }
}
