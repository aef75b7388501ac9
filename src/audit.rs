use std::time::Duration;

/// Collaborator that records rate-limit events for later inspection.
///
/// Called inline on the retry path; implementations must be infallible and
/// cheap (fire-and-forget).
pub trait AuditSink: Send + Sync {
    fn record_rate_limit_event(
        &self,
        endpoint: &str,
        retry_after: Duration,
        attempt: u32,
        label: &str,
    );
}

/// Default sink: emits a structured tracing event per rate-limit hit.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn record_rate_limit_event(
        &self,
        endpoint: &str,
        retry_after: Duration,
        attempt: u32,
        label: &str,
    ) {
        tracing::warn!(
            endpoint,
            retry_after_ms = retry_after.as_millis() as u64,
            attempt,
            label,
            "Upstream rate limit hit"
        );
    }
}
