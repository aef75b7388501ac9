use palisade::config::Config;
use palisade::resilience::backoff::RetryPolicy;
use palisade::resilience::rate_limit::RateLimitHeaders;
use palisade::utils::clock::ManualClock;
use palisade::{AuditSink, RateLimitService, RelayError};
use reqwest::StatusCode;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
struct AuditEvent {
    endpoint: String,
    retry_after: Duration,
    attempt: u32,
    label: String,
}

#[derive(Default)]
struct CaptureSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl CaptureSink {
    fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl AuditSink for CaptureSink {
    fn record_rate_limit_event(
        &self,
        endpoint: &str,
        retry_after: Duration,
        attempt: u32,
        label: &str,
    ) {
        self.events.lock().unwrap().push(AuditEvent {
            endpoint: endpoint.to_string(),
            retry_after,
            attempt,
            label: label.to_string(),
        });
    }
}

fn test_config(max_retries: u32) -> Config {
    Config {
        retry: RetryPolicy {
            max_retries,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        },
        ..Config::default()
    }
}

fn service(max_retries: u32) -> (Arc<CaptureSink>, RateLimitService) {
    let sink = Arc::new(CaptureSink::default());
    let service = RateLimitService::new(&test_config(max_retries), sink.clone());
    (sink, service)
}

fn unavailable() -> RelayError {
    RelayError::Upstream {
        status: StatusCode::SERVICE_UNAVAILABLE,
        code: "ServiceUnavailable".to_string(),
        message: "upstream down".to_string(),
        retry_after: None,
    }
}

fn bad_request() -> RelayError {
    RelayError::Upstream {
        status: StatusCode::BAD_REQUEST,
        code: "BadRequest".to_string(),
        message: "invalid filter".to_string(),
        retry_after: None,
    }
}

fn rate_limited(retry_after: Option<Duration>) -> RelayError {
    RelayError::Upstream {
        status: StatusCode::TOO_MANY_REQUESTS,
        code: "TooManyRequests".to_string(),
        message: "slow down".to_string(),
        retry_after,
    }
}

#[tokio::test(start_paused = true)]
async fn permanently_failing_operation_is_attempted_max_retries_plus_one_times() {
    let (_, service) = service(3);
    let calls = Arc::new(AtomicU32::new(0));

    let result: Result<(), _> = service
        .execute_with_retry("GET /users", "list users", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(unavailable())
            }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert!(matches!(
        result,
        Err(RelayError::Upstream { status, .. }) if status == StatusCode::SERVICE_UNAVAILABLE
    ));
}

#[tokio::test(start_paused = true)]
async fn terminal_error_is_not_retried() {
    let (sink, service) = service(5);
    let calls = Arc::new(AtomicU32::new(0));

    let result: Result<(), _> = service
        .execute_with_retry("GET /users", "list users", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(bad_request())
            }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(
        result,
        Err(RelayError::Upstream { status, .. }) if status == StatusCode::BAD_REQUEST
    ));
    assert!(sink.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn transient_failures_back_off_exponentially_then_succeed() {
    let (_, service) = service(3);
    let calls = Arc::new(AtomicU32::new(0));
    let started = tokio::time::Instant::now();

    let result = service
        .execute_with_retry("GET /groups", "list groups", || {
            let calls = calls.clone();
            async move {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                if attempt < 3 {
                    Err(unavailable())
                } else {
                    Ok("groups page")
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), "groups page");
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    // Zero jitter: 1000ms + 2000ms + 4000ms of backoff.
    assert_eq!(started.elapsed(), Duration::from_millis(7000));
}

#[tokio::test(start_paused = true)]
async fn advertised_retry_after_is_honoured_and_audited() {
    let (sink, service) = service(2);
    let calls = Arc::new(AtomicU32::new(0));
    let started = tokio::time::Instant::now();

    let result = service
        .execute_with_retry("POST /mail/send", "send mail", || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(rate_limited(Some(Duration::from_secs(5))))
                } else {
                    Ok(())
                }
            }
        })
        .await;

    assert!(result.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(started.elapsed(), Duration::from_secs(5));

    assert_eq!(
        sink.events(),
        vec![AuditEvent {
            endpoint: "POST /mail/send".to_string(),
            retry_after: Duration::from_secs(5),
            attempt: 0,
            label: "send mail".to_string(),
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn rate_limit_without_advertised_wait_falls_back_to_backoff() {
    let (sink, service) = service(3);
    let calls = Arc::new(AtomicU32::new(0));

    let result: Result<(), _> = service
        .execute_with_retry("GET /calendar", "list events", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(rate_limited(None))
            }
        })
        .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    // One audit event per failed attempt, including the terminal one.
    let events = sink.events();
    assert_eq!(events.len(), 4);
    assert_eq!(events[0].retry_after, Duration::from_millis(1000));
    assert_eq!(events[1].retry_after, Duration::from_millis(2000));
    assert_eq!(events[2].retry_after, Duration::from_millis(4000));
    assert_eq!(
        events.iter().map(|e| e.attempt).collect::<Vec<_>>(),
        vec![0, 1, 2, 3]
    );
}

#[tokio::test(start_paused = true)]
async fn retries_consult_the_tracker_before_attempting() {
    let sink = Arc::new(CaptureSink::default());
    let clock = Arc::new(ManualClock::new(
        chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
    ));
    let service = RateLimitService::with_clock(&test_config(3), sink, clock.clone());

    // Window exhausted, resets in 20s: preemptive delay is 21s.
    service.observe(
        "GET /users",
        &RateLimitHeaders {
            remaining: Some(0),
            limit: Some(100),
            reset: Some(1_700_000_000 + 20),
            used: Some(100),
        },
    );

    let calls = Arc::new(AtomicU32::new(0));
    let started = tokio::time::Instant::now();

    let result = service
        .execute_with_retry("GET /users", "list users", || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(unavailable())
                } else {
                    Ok(())
                }
            }
        })
        .await;

    assert!(result.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    // 1000ms backoff after the first failure, then the 21s preemptive wait
    // before the retry attempt.
    assert_eq!(started.elapsed(), Duration::from_millis(22_000));
}

#[tokio::test(start_paused = true)]
async fn zero_max_retries_fails_on_first_transient_error() {
    let (_, service) = service(0);
    let calls = Arc::new(AtomicU32::new(0));

    let result: Result<(), _> = service
        .execute_with_retry("GET /teams", "list teams", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(unavailable())
            }
        })
        .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
