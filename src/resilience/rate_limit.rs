use ahash::RandomState;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::utils::clock::Clock;

/// Window limit assumed when the upstream omits `x-ratelimit-limit`.
const DEFAULT_WINDOW_LIMIT: u32 = 10_000;
/// Window length assumed when the upstream omits `x-ratelimit-reset`.
const DEFAULT_WINDOW: Duration = Duration::from_secs(600);

/// Throttle once remaining drops to this share of the limit (floored, min 1).
const THROTTLE_MARGIN: f64 = 0.05;
/// Warn once remaining drops below this share of the limit.
const NEAR_LIMIT_WARN_FRACTION: f64 = 0.10;
/// Statistics count an endpoint as near-limit below this share.
const NEAR_LIMIT_STATS_FRACTION: f64 = 0.20;

/// If the window resets this soon, a preemptive delay just waits it out.
const RESET_SOON: Duration = Duration::from_secs(30);
const RESET_BUFFER: Duration = Duration::from_secs(1);

/// Most recently observed throughput-limit state for one endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitInfo {
    /// Requests left in the current window.
    pub remaining: u32,
    /// Total requests allowed per window.
    pub limit: u32,
    /// When the window resets.
    pub reset_at: DateTime<Utc>,
    /// Requests consumed in the current window.
    pub used: u32,
    /// Most recent observation for this endpoint.
    pub last_request_at: DateTime<Utc>,
}

/// Rate-limit fields parsed from upstream response headers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub remaining: Option<u32>,
    pub limit: Option<u32>,
    /// Window reset, epoch seconds.
    pub reset: Option<i64>,
    pub used: Option<u32>,
}

impl RateLimitHeaders {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            remaining: parse_header(headers, "x-ratelimit-remaining"),
            limit: parse_header(headers, "x-ratelimit-limit"),
            reset: parse_header(headers, "x-ratelimit-reset"),
            used: parse_header(headers, "x-ratelimit-used"),
        }
    }

    /// True when no field that would create a tracker entry is present.
    /// `used` alone never creates an entry.
    pub fn is_empty(&self) -> bool {
        self.remaining.is_none() && self.limit.is_none() && self.reset.is_none()
    }
}

fn parse_header<T: FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

/// Aggregate view over all tracked endpoints.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct RateLimitStatistics {
    pub total_endpoints: usize,
    pub throttled_endpoints: usize,
    pub average_remaining_requests: u32,
    pub near_limit_endpoints: usize,
}

/// Per-endpoint rate-limit state, shared by all in-flight calls.
///
/// The tracker's view is always stale relative to concurrent requests, so
/// throttling decisions are deliberately conservative (margin, not exact
/// exhaustion) and advisory: the remote service stays authoritative.
pub struct RateLimitTracker {
    limits: Mutex<HashMap<String, RateLimitInfo, RandomState>>,
    clock: Arc<dyn Clock>,
    /// Cap on the preemptive wait when a window is exhausted.
    max_preemptive_delay: Duration,
}

impl RateLimitTracker {
    pub fn new(clock: Arc<dyn Clock>, max_preemptive_delay: Duration) -> Self {
        Self {
            limits: Mutex::new(HashMap::default()),
            clock,
            max_preemptive_delay,
        }
    }

    fn limits(&self) -> MutexGuard<'_, HashMap<String, RateLimitInfo, RandomState>> {
        // Never held across an await point.
        self.limits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records observed rate-limit state for `endpoint`. No-op when the
    /// headers carry none of remaining/limit/reset.
    pub fn observe(&self, endpoint: &str, observed: &RateLimitHeaders) {
        if observed.is_empty() {
            return;
        }

        let now = self.clock.now();
        let info = RateLimitInfo {
            remaining: observed.remaining.unwrap_or(0),
            limit: observed.limit.unwrap_or(DEFAULT_WINDOW_LIMIT),
            reset_at: observed
                .reset
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
                .unwrap_or(now + DEFAULT_WINDOW),
            used: observed.used.unwrap_or(0),
            last_request_at: now,
        };

        debug!(
            endpoint,
            remaining = info.remaining,
            limit = info.limit,
            reset_at = %info.reset_at,
            "Rate limit updated"
        );

        if (info.remaining as f64) < info.limit as f64 * NEAR_LIMIT_WARN_FRACTION {
            warn!(
                endpoint,
                remaining = info.remaining,
                limit = info.limit,
                "Approaching rate limit"
            );
        }

        self.limits().insert(endpoint.to_string(), info);
    }

    /// Whether calls to `endpoint` should back off right now. Entries whose
    /// window has reset are discarded and no longer throttle.
    pub fn should_throttle(&self, endpoint: &str) -> bool {
        let mut limits = self.limits();
        let Some(info) = limits.get(endpoint) else {
            return false;
        };

        if self.clock.now() >= info.reset_at {
            limits.remove(endpoint);
            return false;
        }

        let threshold = ((info.limit as f64 * THROTTLE_MARGIN).floor() as u32).max(1);
        info.remaining <= threshold
    }

    /// How long a throttled call should wait before its next attempt.
    pub fn preemptive_delay(&self, endpoint: &str) -> Duration {
        let limits = self.limits();
        let Some(info) = limits.get(endpoint) else {
            return Duration::ZERO;
        };

        let until_reset = (info.reset_at - self.clock.now())
            .to_std()
            .unwrap_or(Duration::ZERO);

        if until_reset > Duration::ZERO && until_reset < RESET_SOON {
            return until_reset + RESET_BUFFER;
        }

        if info.remaining == 0 {
            return until_reset.min(self.max_preemptive_delay);
        }

        Duration::ZERO
    }

    pub fn status(&self, endpoint: &str) -> Option<RateLimitInfo> {
        self.limits().get(endpoint).cloned()
    }

    pub fn all_statuses(&self) -> HashMap<String, RateLimitInfo, RandomState> {
        self.limits().clone()
    }

    pub fn has_rate_limited_endpoints(&self) -> bool {
        let endpoints: Vec<String> = self.limits().keys().cloned().collect();
        endpoints.iter().any(|e| self.should_throttle(e))
    }

    pub fn statistics(&self) -> RateLimitStatistics {
        let snapshot: Vec<(String, RateLimitInfo)> = self
            .limits()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let total_endpoints = snapshot.len();
        let mut throttled_endpoints = 0;
        let mut total_remaining: u64 = 0;
        let mut near_limit_endpoints = 0;

        for (endpoint, info) in &snapshot {
            if self.should_throttle(endpoint) {
                throttled_endpoints += 1;
            }
            total_remaining += u64::from(info.remaining);
            if (info.remaining as f64) < info.limit as f64 * NEAR_LIMIT_STATS_FRACTION {
                near_limit_endpoints += 1;
            }
        }

        RateLimitStatistics {
            total_endpoints,
            throttled_endpoints,
            average_remaining_requests: if total_endpoints > 0 {
                (total_remaining as f64 / total_endpoints as f64).round() as u32
            } else {
                0
            },
            near_limit_endpoints,
        }
    }

    pub fn clear(&self, endpoint: &str) {
        self.limits().remove(endpoint);
        debug!(endpoint, "Cleared rate limit info");
    }

    pub fn clear_all(&self) {
        self.limits().clear();
        info!("Cleared all rate limit information");
    }
}
