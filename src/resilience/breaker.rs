use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::RelayError;
use crate::resilience::retry::RetryExecutor;
use crate::utils::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    /// Consecutive failures since the last success or reset.
    failure_count: u32,
    last_failure_at: Option<DateTime<Utc>>,
}

/// Per-endpoint guard that stops calling an upstream in sustained failure.
///
/// Closed passes calls to the retry executor; `failure_threshold`
/// consecutive failures open the circuit. Open rejects calls with
/// [`RelayError::CircuitOpen`] without any network traffic until
/// `open_timeout` has elapsed since the last failure, at which point the
/// next call becomes a half-open probe. The probe's outcome closes or
/// re-opens the circuit; while it is in flight, other calls are rejected.
pub struct CircuitBreaker {
    endpoint: String,
    failure_threshold: u32,
    open_timeout: Duration,
    executor: Arc<RetryExecutor>,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub(crate) fn new(
        endpoint: String,
        failure_threshold: u32,
        open_timeout: Duration,
        executor: Arc<RetryExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            endpoint,
            failure_threshold,
            open_timeout,
            executor,
            clock,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure_at: None,
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admission check; moves Open to HalfOpen once the cooldown has
    /// elapsed — the admitted call itself is the probe.
    fn admit(&self) -> Result<(), RelayError> {
        let mut inner = self.inner();
        match inner.state {
            BreakerState::Closed => Ok(()),
            // A probe is already in flight; shed everything else.
            BreakerState::HalfOpen => Err(RelayError::CircuitOpen {
                endpoint: self.endpoint.clone(),
            }),
            BreakerState::Open => {
                let cooled_down = inner.last_failure_at.is_none_or(|at| {
                    self.clock
                        .now()
                        .signed_duration_since(at)
                        .to_std()
                        .unwrap_or(Duration::ZERO)
                        >= self.open_timeout
                });

                if cooled_down {
                    inner.state = BreakerState::HalfOpen;
                    // Keep memory of partial instability rather than a full
                    // reset; a failed probe re-opens immediately regardless.
                    inner.failure_count /= 2;
                    info!(endpoint = %self.endpoint, "Circuit breaker half-open, probing");
                    Ok(())
                } else {
                    Err(RelayError::CircuitOpen {
                        endpoint: self.endpoint.clone(),
                    })
                }
            }
        }
    }

    /// Runs `operation` through the retry executor if the circuit admits it.
    pub async fn execute<T, F, Fut>(&self, label: &str, operation: F) -> Result<T, RelayError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RelayError>>,
    {
        self.admit()?;

        match self.executor.execute(&self.endpoint, label, operation).await {
            Ok(value) => {
                let mut inner = self.inner();
                inner.failure_count = 0;
                inner.state = BreakerState::Closed;
                Ok(value)
            }
            Err(err) => {
                let mut inner = self.inner();
                inner.failure_count += 1;
                inner.last_failure_at = Some(self.clock.now());

                match inner.state {
                    BreakerState::HalfOpen => {
                        inner.state = BreakerState::Open;
                        warn!(endpoint = %self.endpoint, "Circuit breaker probe failed, re-opening");
                    }
                    BreakerState::Closed if inner.failure_count >= self.failure_threshold => {
                        inner.state = BreakerState::Open;
                        warn!(
                            endpoint = %self.endpoint,
                            failures = inner.failure_count,
                            "Circuit breaker opened"
                        );
                    }
                    _ => {}
                }

                Err(err)
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner().state
    }

    pub fn is_open(&self) -> bool {
        self.inner().state == BreakerState::Open
    }

    pub fn failure_count(&self) -> u32 {
        self.inner().failure_count
    }

    pub fn reset(&self) {
        let mut inner = self.inner();
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.last_failure_at = None;
        info!(endpoint = %self.endpoint, "Circuit breaker reset");
    }
}
