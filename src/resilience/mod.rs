pub mod backoff;
pub mod breaker;
pub mod rate_limit;
pub mod retry;
pub mod service;

pub use backoff::RetryPolicy;
pub use breaker::{BreakerState, CircuitBreaker};
pub use rate_limit::{RateLimitHeaders, RateLimitInfo, RateLimitStatistics, RateLimitTracker};
pub use retry::RetryExecutor;
pub use service::RateLimitService;
