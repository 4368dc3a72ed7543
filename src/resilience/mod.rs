// Resilience layer for metered vendor APIs: rate limiting, response caching,
// retry/backoff and the permanent-disable breaker, bundled per vendor into
// an `ApiGuard`.

pub mod cache;
pub mod guard;
pub mod rate_limiter;
pub mod retry;

pub use cache::{fingerprint, CacheSettings, CachedResponse, ResponseCache};
pub use guard::{ApiGuard, CallOutcome};
pub use rate_limiter::RateLimiter;
pub use retry::{classify_http, CallError, RateLimitPolicy, RetryPolicy};
