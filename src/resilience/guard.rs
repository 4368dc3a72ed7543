// ApiGuard: the one door every paid API call goes through.
//
// Order of operations for a call: disabled? -> per-key lock -> cache hit? ->
// rate-limit slot -> attempt -> classify failure -> maybe back off and retry.
// Nothing here ever returns an error to the detector; every failure becomes
// a `Skipped` outcome with a reason, matching how the pipeline reports
// dependency failures.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, warn};

use super::cache::{CachedResponse, ResponseCache};
use super::rate_limiter::RateLimiter;
use super::retry::{CallError, RateLimitPolicy, RetryPolicy};
use crate::detectors::DisableFlag;
use crate::output::truncate_chars;

/// Result of a guarded call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// A live vendor response (already written to the cache).
    Fresh(CachedResponse),
    /// Served from the cache without a network call.
    Cached(CachedResponse),
    /// Not attempted or given up on, with the reason.
    Skipped(String),
}

pub struct ApiGuard {
    vendor: String,
    limiter: RateLimiter,
    cache: ResponseCache,
    policy: RetryPolicy,
    disabled: DisableFlag,
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ApiGuard {
    pub fn new(vendor: &str, limiter: RateLimiter, cache: ResponseCache, policy: RetryPolicy) -> Self {
        Self {
            vendor: vendor.to_string(),
            limiter,
            cache,
            policy,
            disabled: DisableFlag::new(),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn disabled_reason(&self) -> Option<String> {
        self.disabled.reason()
    }

    pub fn disable(&self, reason: &str) {
        if !self.disabled.is_disabled() {
            warn!(vendor = %self.vendor, reason, "Disabling API for the rest of this run");
        }
        self.disabled.disable(reason);
    }

    /// Run `op` behind the cache, rate limiter and retry policy.
    ///
    /// Concurrent calls for the same `key` are serialized, so the second one
    /// sees the first one's cached response instead of paying again.
    pub async fn call<F, Fut>(&self, key: &str, op: F) -> CallOutcome
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<CachedResponse, CallError>>,
    {
        if let Some(reason) = self.disabled_reason() {
            return CallOutcome::Skipped(reason);
        }

        let entry = InflightKey::acquire(self, key);
        let _held = entry.lock.lock().await;
        if let Some(hit) = self.cache.get(key) {
            debug!(vendor = %self.vendor, "Cache hit");
            return CallOutcome::Cached(hit);
        }
        let outcome = self.call_uncached(&op).await;
        if let CallOutcome::Fresh(response) = &outcome {
            self.cache.insert(key.to_string(), response.clone());
        }
        outcome
    }

    async fn call_uncached<F, Fut>(&self, op: &F) -> CallOutcome
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<CachedResponse, CallError>>,
    {
        let mut slept = Duration::ZERO;
        let mut rate_limit_retries = 0u32;
        let mut last_error = String::from("no attempt made");

        for attempt in 0..=self.policy.max_retries {
            // A parallel call may have tripped the breaker while we slept.
            if let Some(reason) = self.disabled_reason() {
                return CallOutcome::Skipped(reason);
            }
            self.limiter.acquire().await;

            match op().await {
                Ok(response) => return CallOutcome::Fresh(response),
                Err(CallError::Auth(msg)) => {
                    let reason = format!(
                        "{} disabled: invalid or deactivated credentials ({})",
                        self.vendor,
                        truncate_chars(&msg, 200)
                    );
                    self.disable(&reason);
                    return CallOutcome::Skipped(reason);
                }
                Err(CallError::Quota(msg)) => {
                    let reason = format!(
                        "{} disabled: quota/limit ({})",
                        self.vendor,
                        truncate_chars(&msg, 200)
                    );
                    self.disable(&reason);
                    return CallOutcome::Skipped(reason);
                }
                Err(CallError::RateLimited { retry_after, message }) => {
                    last_error = message;
                    if self.policy.on_rate_limit == RateLimitPolicy::Skip
                        || rate_limit_retries >= self.policy.max_rate_limit_retries
                        || attempt >= self.policy.max_retries
                    {
                        break;
                    }
                    let delay = self.policy.backoff(rate_limit_retries, retry_after);
                    if slept.saturating_add(delay) > self.policy.max_total_sleep {
                        warn!(
                            vendor = %self.vendor,
                            slept_ms = slept.as_millis() as u64,
                            "Rate limit backoff budget exhausted, giving up"
                        );
                        break;
                    }
                    warn!(
                        vendor = %self.vendor,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Rate limited, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    slept += delay;
                    rate_limit_retries += 1;
                }
                Err(CallError::Other(e)) => {
                    last_error = format!("{e:#}");
                    break;
                }
            }
        }

        CallOutcome::Skipped(format!(
            "rate/quota or error: {}",
            truncate_chars(&last_error, 400)
        ))
    }

    #[cfg(test)]
    fn inflight_len(&self) -> usize {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Per-key lock handle; removes the map entry on drop, including when the
/// call is cancelled or unwinds.
struct InflightKey<'a> {
    guard: &'a ApiGuard,
    key: &'a str,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> InflightKey<'a> {
    fn acquire(guard: &'a ApiGuard, key: &'a str) -> Self {
        let mut map = guard.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        let lock = Arc::clone(map.entry(key.to_string()).or_default());
        Self { guard, key, lock }
    }
}

impl Drop for InflightKey<'_> {
    fn drop(&mut self) {
        let mut map = self.guard.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        // Map + our handle = 2; anything more means someone is still waiting.
        if Arc::strong_count(&self.lock) <= 2 {
            map.remove(self.key);
        }
    }
}
