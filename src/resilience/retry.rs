use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::audit::AuditSink;
use crate::error::{Classify, ErrorClass, RelayError, error_from_response};
use crate::resilience::backoff::RetryPolicy;
use crate::resilience::rate_limit::{RateLimitHeaders, RateLimitTracker};

/// Runs operations against the upstream directory API, retrying transient
/// failures with exponential backoff and consulting the rate-limit tracker
/// between attempts.
///
/// Retries of a single call are strictly sequential; the total wall-clock
/// cost is bounded by the sum of per-attempt delays plus operation latency.
pub struct RetryExecutor {
    tracker: Arc<RateLimitTracker>,
    policy: RetryPolicy,
    audit: Arc<dyn AuditSink>,
}

impl RetryExecutor {
    pub(crate) fn new(
        tracker: Arc<RateLimitTracker>,
        policy: RetryPolicy,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            tracker,
            policy,
            audit,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn tracker(&self) -> &Arc<RateLimitTracker> {
        &self.tracker
    }

    /// Executes `operation`, retrying per the policy. Either returns the
    /// first successful result or propagates the terminal error unchanged;
    /// failure is never swallowed.
    pub async fn execute<T, F, Fut>(
        &self,
        endpoint: &str,
        label: &str,
        operation: F,
    ) -> Result<T, RelayError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RelayError>>,
    {
        let max_retries = self.policy.max_retries;

        for attempt in 0..=max_retries {
            if attempt > 0 && self.tracker.should_throttle(endpoint) {
                let delay = self.tracker.preemptive_delay(endpoint);
                if delay > Duration::ZERO {
                    info!(
                        endpoint,
                        delay_ms = delay.as_millis() as u64,
                        "Preemptive throttling before retry"
                    );
                    tokio::time::sleep(delay).await;
                }
            }

            let err = match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(endpoint, label, retries = attempt, "Succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            match err.class() {
                ErrorClass::RateLimited(advertised) => {
                    let retry_after =
                        advertised.unwrap_or_else(|| self.policy.backoff_delay(attempt));
                    self.audit
                        .record_rate_limit_event(endpoint, retry_after, attempt, label);

                    if attempt < max_retries {
                        warn!(
                            endpoint,
                            label,
                            retry_in_ms = retry_after.as_millis() as u64,
                            attempt = attempt + 1,
                            max_retries,
                            "Rate limit exceeded, retrying"
                        );
                        tokio::time::sleep(retry_after).await;
                        continue;
                    }
                }
                ErrorClass::Retryable => {
                    if attempt < max_retries {
                        let delay = self.policy.backoff_delay(attempt);
                        warn!(
                            endpoint,
                            label,
                            error = %err,
                            retry_in_ms = delay.as_millis() as u64,
                            attempt = attempt + 1,
                            max_retries,
                            "Transient upstream failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                }
                ErrorClass::Terminal => return Err(err),
            }

            error!(
                endpoint,
                label,
                error = %err,
                retries = max_retries,
                "Failed after exhausting retries"
            );
            return Err(err);
        }

        unreachable!("retry loop returns on success or on the final attempt")
    }

    /// HTTP flavor of [`execute`](Self::execute): sends a request, feeds the
    /// response's rate-limit headers into the tracker, and maps non-success
    /// statuses through the upstream error classifier.
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
        self.execute(endpoint, label, || async {
            let resp = send().await.map_err(RelayError::from)?;

            // 429 responses carry rate-limit headers too; observe before
            // deciding success.
            self.tracker
                .observe(endpoint, &RateLimitHeaders::from_headers(resp.headers()));

            if resp.status().is_success() {
                Ok(resp)
            } else {
                Err(error_from_response(endpoint, resp).await)
            }
        })
        .await
    }
}
