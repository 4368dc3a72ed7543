// Minimum-interval rate limiter shared by every caller of one vendor API.
//
// Callers reserve the next free slot under the lock and sleep outside it.
// Reserving (rather than stamping "now" after the sleep) means two
// concurrent callers can never both believe they own the same slot, so the
// aggregate request rate stays bounded however many inputs run in parallel.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// A rate limiter that spaces requests at least `interval` apart.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<RateLimiterInner>>,
}

struct RateLimiterInner {
    /// Minimum time between requests. Zero disables limiting.
    interval: Duration,
    /// Start time of the most recently reserved slot
    last_slot: Option<Instant>,
}

impl RateLimiter {
    /// Create a limiter from a minimum interval in seconds. Values <= 0,
    /// non-finite values and values too large for a `Duration` disable
    /// limiting.
    pub fn from_secs(min_interval_secs: f64) -> Self {
        let interval = if min_interval_secs > 0.0 {
            Duration::try_from_secs_f64(min_interval_secs).unwrap_or(Duration::ZERO)
        } else {
            Duration::ZERO
        };
        Self::new(interval)
    }

    pub fn new(interval: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RateLimiterInner {
                interval,
                last_slot: None,
            })),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Reserve the next slot and wait for it. Returns how long we waited.
    pub async fn acquire(&self) -> Duration {
        let wait = {
            let mut inner = self.inner.lock().await;
            let now = Instant::now();
            let slot = match inner.last_slot {
                // An interval past the clock's range can't be scheduled.
                Some(last) => last.checked_add(inner.interval).map_or(now, |next| next.max(now)),
                None => now,
            };
            inner.last_slot = Some(slot);
            slot - now
        };

        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        wait
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_allows_first_request_immediately() {
        let limiter = RateLimiter::from_secs(1.0);
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_delays_second_request() {
        let limiter = RateLimiter::from_secs(0.5);
        limiter.acquire().await;
        let start = Instant::now();
        limiter.acquire().await;
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(500),
            "Expected ~500ms delay, got {:?}",
            elapsed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_get_distinct_slots() {
        let limiter = RateLimiter::from_secs(1.0);
        let start = Instant::now();
        let (a, b, c) = tokio::join!(limiter.acquire(), limiter.acquire(), limiter.acquire());
        let mut waits = vec![a, b, c];
        waits.sort();
        assert_eq!(waits[0], Duration::ZERO);
        assert_eq!(waits[1], Duration::from_secs(1));
        assert_eq!(waits[2], Duration::from_secs(2));
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_positive_interval_disables_limiting() {
        let limiter = RateLimiter::from_secs(0.0);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(RateLimiter::from_secs(-3.0).acquire().await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_interval_disables_limiting() {
        for secs in [1e30, f64::INFINITY, f64::NAN] {
            let limiter = RateLimiter::from_secs(secs);
            assert_eq!(limiter.acquire().await, Duration::ZERO);
            assert_eq!(limiter.acquire().await, Duration::ZERO);
        }

        let limiter = RateLimiter::new(Duration::MAX);
        assert_eq!(limiter.acquire().await, Duration::ZERO);
        assert_eq!(limiter.acquire().await, Duration::ZERO);
    }
}
