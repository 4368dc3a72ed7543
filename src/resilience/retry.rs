// Failure classification and backoff policy for vendor API calls.
//
// Vendor clients map HTTP failures into `CallError` so the guard can decide
// uniformly: rate limits are retried with jittered exponential backoff under
// a total sleep budget, auth and quota failures disable the vendor for the
// rest of the process, and everything else gives up immediately.

use std::time::Duration;

use rand::Rng;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("rate limited: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("quota exhausted: {0}")]
    Quota(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<reqwest::Error> for CallError {
    fn from(e: reqwest::Error) -> Self {
        CallError::Other(anyhow::Error::new(e))
    }
}

/// What to do when a vendor says "slow down".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitPolicy {
    Retry,
    Skip,
}

impl RateLimitPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "retry" => Some(RateLimitPolicy::Retry),
            "skip" => Some(RateLimitPolicy::Skip),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Upper bound on attempts after the first.
    pub max_retries: u32,
    /// Upper bound on retries caused by rate limiting.
    pub max_rate_limit_retries: u32,
    pub backoff_base: Duration,
    /// Cap for any single sleep.
    pub backoff_max: Duration,
    /// Cap for all sleeps of one call combined.
    pub max_total_sleep: Duration,
    pub on_rate_limit: RateLimitPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 6,
            max_rate_limit_retries: 3,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(10),
            max_total_sleep: Duration::from_secs(30),
            on_rate_limit: RateLimitPolicy::Retry,
        }
    }
}

impl RetryPolicy {
    /// Sleep before retry number `attempt` (0-based). A server hint wins over
    /// the computed `base * 2^attempt` (with +/-25% jitter); both are capped.
    pub fn backoff(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let delay = match retry_after {
            Some(hint) => hint,
            None => {
                let base = self.backoff_base.as_secs_f64() * 2f64.powi(attempt.min(30) as i32);
                let jitter = rand::rng().random_range(0.75..=1.25);
                Duration::try_from_secs_f64((base * jitter).max(0.0)).unwrap_or(self.backoff_max)
            }
        };
        delay.min(self.backoff_max)
    }
}

/// Parse a `Retry-After` value given in (possibly fractional) seconds.
///
/// Values too large for a `Duration` saturate; `backoff` caps them anyway.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?;
    let secs: f64 = raw.trim().trim_end_matches('s').parse().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
}

/// Map a non-success HTTP response onto the retry taxonomy.
pub fn classify_http(status: StatusCode, headers: &HeaderMap, body: &str) -> CallError {
    let message = format!("HTTP {}: {}", status.as_u16(), snippet(body));
    let lower = body.to_ascii_lowercase();

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return CallError::Auth(message);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        // Some vendors report a hard quota as 429 with a billing message.
        if lower.contains("insufficient_quota") || lower.contains("billing") {
            return CallError::Quota(message);
        }
        return CallError::RateLimited {
            retry_after: parse_retry_after(headers),
            message,
        };
    }
    if status == StatusCode::PAYMENT_REQUIRED {
        return CallError::Quota(message);
    }
    if is_auth_message(&lower) {
        return CallError::Auth(message);
    }
    CallError::Other(anyhow::anyhow!(message))
}

/// Vendor messages that mean the credential itself is dead.
pub fn is_auth_message(lower: &str) -> bool {
    ["deactivated", "invalid api key", "invalid_api_key", "unauthorized"]
        .iter()
        .any(|needle| lower.contains(needle))
}

fn snippet(body: &str) -> String {
    crate::output::truncate_chars(body.trim(), 300)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_backoff_prefers_server_hint_but_caps_it() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.backoff(0, Some(Duration::from_secs(3))),
            Duration::from_secs(3)
        );
        assert_eq!(
            policy.backoff(0, Some(Duration::from_secs(120))),
            policy.backoff_max
        );
    }

    #[test]
    fn test_retry_after_rejects_garbage_and_saturates_huge_values() {
        let header = |v: &str| {
            let mut h = HeaderMap::new();
            h.insert(RETRY_AFTER, HeaderValue::from_str(v).unwrap());
            h
        };
        assert_eq!(parse_retry_after(&header("2.5")), Some(Duration::from_millis(2500)));
        assert_eq!(parse_retry_after(&header("1e30")), Some(Duration::MAX));
        assert_eq!(parse_retry_after(&header("-4")), None);
        assert_eq!(parse_retry_after(&header("soon")), None);
        assert_eq!(parse_retry_after(&header("NaN")), None);
        assert_eq!(parse_retry_after(&HeaderMap::new()), None);

        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0, parse_retry_after(&header("1e30"))), policy.backoff_max);
    }

    #[test]
    fn test_backoff_with_huge_base_is_capped() {
        let policy = RetryPolicy {
            backoff_base: Duration::MAX,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(30, None), policy.backoff_max);
    }

    #[test]
    fn test_backoff_grows_with_jitter_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 0..3 {
            let expected = 2f64.powi(attempt as i32);
            let got = policy.backoff(attempt, None).as_secs_f64();
            assert!(got >= expected * 0.75 - 1e-9 && got <= expected * 1.25 + 1e-9);
        }
        // 2^6 = 64s, capped
        assert_eq!(policy.backoff(6, None), policy.backoff_max);
    }

    #[test]
    fn test_classify_status_codes() {
        let empty = HeaderMap::new();
        assert!(matches!(
            classify_http(StatusCode::UNAUTHORIZED, &empty, ""),
            CallError::Auth(_)
        ));
        assert!(matches!(
            classify_http(StatusCode::PAYMENT_REQUIRED, &empty, ""),
            CallError::Quota(_)
        ));
        assert!(matches!(
            classify_http(StatusCode::BAD_REQUEST, &empty, "Your account was deactivated"),
            CallError::Auth(_)
        ));
        assert!(matches!(
            classify_http(StatusCode::INTERNAL_SERVER_ERROR, &empty, "boom"),
            CallError::Other(_)
        ));
    }

    #[test]
    fn test_classify_429_reads_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("2.5"));
        match classify_http(StatusCode::TOO_MANY_REQUESTS, &headers, "slow down") {
            CallError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_millis(2500)));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[test]
    fn test_rate_limit_policy_parse() {
        assert_eq!(RateLimitPolicy::parse(" Skip "), Some(RateLimitPolicy::Skip));
        assert_eq!(RateLimitPolicy::parse("retry"), Some(RateLimitPolicy::Retry));
        assert_eq!(RateLimitPolicy::parse("maybe"), None);
    }
}
