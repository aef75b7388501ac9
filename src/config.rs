use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, sync::LazyLock, time::Duration};

use crate::resilience::backoff::RetryPolicy;

/// Circuit breaker defaults (see the `breaker` table in config.toml).
/// `RateLimitService::create_circuit_breaker` accepts per-endpoint overrides.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    /// TOML: `breaker.failure_threshold`. Default: `5`.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Cooldown before a half-open probe is allowed, in milliseconds.
    /// TOML: `breaker.open_timeout_ms`. Default: `60000`.
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_open_timeout_ms() -> u64 {
    60_000
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_timeout_ms: default_open_timeout_ms(),
        }
    }
}

impl BreakerConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

/// Application configuration managed by Figment.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Retry policy for outbound calls (see `retry` table in config.toml).
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Circuit breaker defaults (see `breaker` table in config.toml).
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Log level for tracing subscriber initialization (e.g., "error",
    /// "warn", "info", "debug", "trace"). TOML: `loglevel`. Default: `info`.
    #[serde(default = "default_loglevel")]
    pub loglevel: String,
}

fn default_loglevel() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
            loglevel: default_loglevel(),
        }
    }
}

const DEFAULT_CONFIG_FILE: &str = "config.toml";

impl Config {
    /// Builds a Figment that merges defaults and a config TOML file.
    pub fn figment() -> Figment {
        let figment = Figment::new().merge(Serialized::defaults(Config::default()));
        if PathBuf::from(DEFAULT_CONFIG_FILE).is_file() {
            figment.merge(Toml::file(DEFAULT_CONFIG_FILE))
        } else {
            figment
        }
    }

    /// Loads configuration by merging defaults and `config.toml` if present,
    /// panicking on unextractable or nonsensical values.
    pub fn from_optional_toml() -> Self {
        let cfg: Self = Self::figment().extract().unwrap_or_else(|err| {
            panic!("failed to extract configuration (defaults + optional config.toml): {err}")
        });
        cfg.validate();
        cfg
    }

    fn validate(&self) {
        if self.retry.backoff_multiplier <= 1.0 {
            panic!(
                "retry.backoff_multiplier must be > 1 (got {})",
                self.retry.backoff_multiplier
            );
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            panic!(
                "retry.jitter_factor must be within 0..=1 (got {})",
                self.retry.jitter_factor
            );
        }
        if self.retry.base_delay_ms == 0 {
            panic!("retry.base_delay_ms must be > 0");
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            panic!(
                "retry.max_delay_ms ({}) must be >= retry.base_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.base_delay_ms
            );
        }
        if self.breaker.failure_threshold == 0 {
            panic!("breaker.failure_threshold must be > 0");
        }
    }
}

/// Global, lazily-initialized configuration instance.
pub static CONFIG: LazyLock<Config> = LazyLock::new(Config::from_optional_toml);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_policy() {
        let cfg = Config::default();
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.retry.base_delay_ms, 1000);
        assert_eq!(cfg.retry.max_delay_ms, 60_000);
        assert_eq!(cfg.breaker.failure_threshold, 5);
        assert_eq!(cfg.breaker.open_timeout(), Duration::from_secs(60));
        cfg.validate();
    }

    #[test]
    #[should_panic(expected = "backoff_multiplier")]
    fn multiplier_at_or_below_one_is_rejected() {
        let cfg = Config {
            retry: RetryPolicy {
                backoff_multiplier: 1.0,
                ..RetryPolicy::default()
            },
            ..Config::default()
        };
        cfg.validate();
    }

    #[test]
    #[should_panic(expected = "jitter_factor")]
    fn jitter_factor_above_one_is_rejected() {
        let cfg = Config {
            retry: RetryPolicy {
                jitter_factor: 1.5,
                ..RetryPolicy::default()
            },
            ..Config::default()
        };
        cfg.validate();
    }
}
