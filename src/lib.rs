pub mod audit;
pub mod config;
pub mod error;
pub mod resilience;
pub mod utils;

pub use audit::{AuditSink, LogAuditSink};
pub use error::{Classify, ErrorClass, RelayError};
pub use resilience::backoff::RetryPolicy;
pub use resilience::breaker::{BreakerState, CircuitBreaker};
pub use resilience::rate_limit::{RateLimitInfo, RateLimitStatistics, RateLimitTracker};
pub use resilience::service::RateLimitService;
