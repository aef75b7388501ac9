use ahash::RandomState;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::audit::AuditSink;
use crate::config::Config;
use crate::error::RelayError;
use crate::resilience::breaker::CircuitBreaker;
use crate::resilience::rate_limit::{
    RateLimitHeaders, RateLimitInfo, RateLimitStatistics, RateLimitTracker,
};
use crate::resilience::retry::RetryExecutor;
use crate::utils::clock::{Clock, SystemClock};

/// Facade over the resilience layer: one shared rate-limit tracker, one
/// retry executor, and a factory for per-endpoint circuit breakers.
///
/// This is the sole entry point tool handlers use for outbound calls.
/// Endpoint keys must be normalized templates ("GET /users/{id}"), never
/// literal paths with embedded resource IDs, or the per-endpoint maps grow
/// without bound.
pub struct RateLimitService {
    tracker: Arc<RateLimitTracker>,
    executor: Arc<RetryExecutor>,
    clock: Arc<dyn Clock>,
    config: Config,
}

impl RateLimitService {
    pub fn new(config: &Config, audit: Arc<dyn AuditSink>) -> Self {
        Self::with_clock(config, audit, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &Config, audit: Arc<dyn AuditSink>, clock: Arc<dyn Clock>) -> Self {
        let tracker = Arc::new(RateLimitTracker::new(clock.clone(), config.retry.max_delay()));
        let executor = Arc::new(RetryExecutor::new(tracker.clone(), config.retry, audit));

        info!(
            max_retries = config.retry.max_retries,
            base_delay_ms = config.retry.base_delay_ms,
            "Rate limit service initialized"
        );

        Self {
            tracker,
            executor,
            clock,
            config: config.clone(),
        }
    }

    /// See [`RetryExecutor::execute`].
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        endpoint: &str,
        label: &str,
        operation: F,
    ) -> Result<T, RelayError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RelayError>>,
    {
        self.executor.execute(endpoint, label, operation).await
    }

    /// See [`RetryExecutor::execute_http`].
    pub async fn execute_http<F, Fut>(
        &self,
        endpoint: &str,
        label: &str,
        send: F,
    ) -> Result<reqwest::Response, RelayError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<reqwest::Response, reqwest::Error>>,
    {
        self.executor.execute_http(endpoint, label, send).await
    }

    /// Opt-in circuit breaker for an endpoint that warrants one. Breakers
    /// share this service's tracker and executor.
    pub fn create_circuit_breaker(
        &self,
        endpoint: &str,
        failure_threshold: Option<u32>,
        open_timeout: Option<Duration>,
    ) -> CircuitBreaker {
        CircuitBreaker::new(
            endpoint.to_string(),
            failure_threshold.unwrap_or(self.config.breaker.failure_threshold),
            open_timeout.unwrap_or(self.config.breaker.open_timeout()),
            self.executor.clone(),
            self.clock.clone(),
        )
    }

    /// Feeds externally observed response metadata into the tracker, for
    /// callers that manage their own transport.
    pub fn observe(&self, endpoint: &str, headers: &RateLimitHeaders) {
        self.tracker.observe(endpoint, headers);
    }

    pub fn rate_limit_status(&self, endpoint: &str) -> Option<RateLimitInfo> {
        self.tracker.status(endpoint)
    }

    pub fn all_rate_limit_statuses(&self) -> HashMap<String, RateLimitInfo, RandomState> {
        self.tracker.all_statuses()
    }

    pub fn has_rate_limited_endpoints(&self) -> bool {
        self.tracker.has_rate_limited_endpoints()
    }

    pub fn statistics(&self) -> RateLimitStatistics {
        self.tracker.statistics()
    }

    pub fn clear_rate_limit(&self, endpoint: &str) {
        self.tracker.clear(endpoint);
    }

    pub fn clear_all_rate_limits(&self) {
        self.tracker.clear_all();
    }
}
