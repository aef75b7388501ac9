use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error as ThisError;

use crate::utils::logging::with_pretty_json_debug;

pub const UPSTREAM_BODY_PREVIEW_CHARS: usize = 300;

/// Errors surfaced by the resilience layer for outbound directory API calls.
#[derive(Debug, ThisError)]
pub enum RelayError {
    /// Upstream responded with a non-success status. `code` carries the
    /// directory API's machine-readable error code when the error envelope
    /// parsed, otherwise a code derived from the status line.
    #[error("Upstream error {status}: {code}: {message}")]
    Upstream {
        status: StatusCode,
        code: String,
        message: String,
        /// Wait advertised by the server (Retry-After), if any.
        retry_after: Option<Duration>,
    },

    #[error("HTTP request error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Synthetic rejection raised by a circuit breaker without touching the
    /// network. Callers can match on this to apply fallbacks (e.g. cache).
    #[error("Circuit breaker is open for {endpoint}")]
    CircuitOpen { endpoint: String },
}

/// How the retry executor should treat a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Server signaled throughput exhaustion; retried with the advertised
    /// wait when present, computed backoff otherwise.
    RateLimited(Option<Duration>),
    /// Server-side or network-level failure; retried with backoff.
    Retryable,
    /// Retrying cannot change the outcome; propagated immediately.
    Terminal,
}

pub trait Classify {
    fn class(&self) -> ErrorClass;
}

/// Directory API codes that indicate a transient server-side failure.
const RETRYABLE_CODES: [&str; 5] = [
    "ServiceNotAvailable",
    "InternalServerError",
    "BadGateway",
    "ServiceUnavailable",
    "GatewayTimeout",
];

const RATE_LIMIT_CODES: [&str; 2] = ["TooManyRequests", "RateLimitExceeded"];

impl Classify for RelayError {
    fn class(&self) -> ErrorClass {
        match self {
            RelayError::Upstream {
                status,
                code,
                retry_after,
                ..
            } => {
                if *status == StatusCode::TOO_MANY_REQUESTS
                    || RATE_LIMIT_CODES.contains(&code.as_str())
                {
                    ErrorClass::RateLimited(*retry_after)
                } else if status.is_server_error() || RETRYABLE_CODES.contains(&code.as_str()) {
                    ErrorClass::Retryable
                } else {
                    ErrorClass::Terminal
                }
            }
            RelayError::Transport(e) => {
                // Malformed payloads and misbuilt requests won't improve on
                // retry; connection-level failures usually do.
                if e.is_decode() || e.is_builder() {
                    ErrorClass::Terminal
                } else {
                    ErrorClass::Retryable
                }
            }
            RelayError::Json(_) | RelayError::CircuitOpen { .. } => ErrorClass::Terminal,
        }
    }
}

/// Structured error envelope returned by the directory API.
#[derive(Debug, Deserialize, Serialize)]
pub struct DirectoryErrorBody {
    pub error: DirectoryErrorDetail,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DirectoryErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Parses a `Retry-After` header given in seconds.
pub(crate) fn retry_after_header(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Consumes a non-success response and maps it into [`RelayError::Upstream`].
///
/// Tries the structured envelope first; otherwise falls back to a code
/// derived from the status line plus a truncated body preview.
pub async fn error_from_response(endpoint: &str, resp: reqwest::Response) -> RelayError {
    let status = resp.status();
    let retry_after = retry_after_header(resp.headers());
    let bytes = resp.bytes().await.unwrap_or_default();

    if let Ok(body) = serde_json::from_slice::<DirectoryErrorBody>(&bytes) {
        with_pretty_json_debug(&body, |pretty| {
            tracing::debug!(endpoint, %status, body = %pretty, "Upstream structured error");
        });

        return RelayError::Upstream {
            status,
            code: body.error.code,
            message: body.error.message,
            retry_after,
        };
    }

    let raw_body = String::from_utf8_lossy(&bytes).into_owned();
    tracing::debug!(
        endpoint,
        %status,
        body = %format!("{:.len$}", raw_body, len = UPSTREAM_BODY_PREVIEW_CHARS),
        "Upstream unstructured error"
    );

    RelayError::Upstream {
        status,
        code: status
            .canonical_reason()
            .unwrap_or("UnknownError")
            .replace(' ', ""),
        message: format!("{:.len$}", raw_body, len = UPSTREAM_BODY_PREVIEW_CHARS),
        retry_after,
    }
}
