// Integration tests for the API resilience layer.
//
// Covers what the unit tests inside src/resilience don't: cache hits
// surviving a process restart through the on-disk file, the quota breaker
// shared by every later call, and rate-limiter spacing across calls made
// through one guard. Timing tests run on a paused clock.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use modgate::detectors::Scores;
use modgate::resilience::{
    fingerprint, ApiGuard, CacheSettings, CachedResponse, CallError, CallOutcome, RateLimiter,
    ResponseCache, RetryPolicy,
};

fn response(value: f64) -> CachedResponse {
    let mut scores = Scores::new();
    scores.insert("violence".into(), value);
    CachedResponse {
        scores,
        details: Default::default(),
    }
}

fn persisted(path: &std::path::Path) -> ResponseCache {
    ResponseCache::new(CacheSettings {
        enabled: true,
        path: Some(path.to_path_buf()),
        max_items: 100,
        flush_every: 1000,
    })
}

// ============================================================
// Cache keys
// ============================================================

#[test]
fn fingerprint_is_stable_for_identical_submissions() {
    let frames: [&[u8]; 2] = [b"frame-a", b"frame-b"];
    let a = fingerprint("omni-moderation-latest", "caption", frames);
    let b = fingerprint("omni-moderation-latest", "caption", frames);
    assert_eq!(a, b);
    assert_eq!(a.len(), 64);

    // Frame order is part of what was sent.
    let swapped: [&[u8]; 2] = [b"frame-b", b"frame-a"];
    assert_ne!(a, fingerprint("omni-moderation-latest", "caption", swapped));
}

// ============================================================
// Cache persistence across guards
// ============================================================

#[tokio::test(start_paused = true)]
async fn cached_response_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache").join("openai_cache.json");
    let key = fingerprint("model", "", [b"jpeg".as_slice()]);
    let calls = AtomicU32::new(0);
    let counter = &calls;
    let op = move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok::<_, CallError>(response(0.7))
    };

    let first = ApiGuard::new("OpenAI", RateLimiter::unlimited(), persisted(&path), RetryPolicy::default());
    assert_eq!(first.call(&key, op).await, CallOutcome::Fresh(response(0.7)));
    first.cache().flush().unwrap();
    assert!(path.exists());

    let second = ApiGuard::new("OpenAI", RateLimiter::unlimited(), persisted(&path), RetryPolicy::default());
    assert_eq!(second.call(&key, op).await, CallOutcome::Cached(response(0.7)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn skipped_calls_are_not_cached() {
    let guard = ApiGuard::new(
        "Sightengine",
        RateLimiter::unlimited(),
        ResponseCache::in_memory(10),
        RetryPolicy::default(),
    );
    let op = || async { Err::<CachedResponse, _>(CallError::Other(anyhow::anyhow!("HTTP 500"))) };
    assert!(matches!(guard.call("k", op).await, CallOutcome::Skipped(_)));
    assert!(guard.cache().is_empty());
}

// ============================================================
// Breaker
// ============================================================

#[tokio::test(start_paused = true)]
async fn quota_failure_disables_every_later_call() {
    let guard = ApiGuard::new(
        "Sightengine",
        RateLimiter::unlimited(),
        ResponseCache::in_memory(10),
        RetryPolicy::default(),
    );
    let calls = AtomicU32::new(0);
    let counter = &calls;
    let op = move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Err::<CachedResponse, _>(CallError::Quota("daily usage limit reached".into()))
    };

    match guard.call("a", op).await {
        CallOutcome::Skipped(reason) => assert!(reason.contains("quota/limit")),
        other => panic!("expected skipped, got {other:?}"),
    }
    assert!(guard.disabled_reason().is_some());

    // Different key, still no network call.
    assert!(matches!(guard.call("b", op).await, CallOutcome::Skipped(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ============================================================
// Rate limiting
// ============================================================

#[tokio::test(start_paused = true)]
async fn guard_spaces_distinct_calls_by_min_interval() {
    let guard = ApiGuard::new(
        "OpenAI",
        RateLimiter::from_secs(1.0),
        ResponseCache::in_memory(10),
        RetryPolicy::default(),
    );
    let op = || async { Ok::<_, CallError>(response(0.1)) };

    let start = tokio::time::Instant::now();
    for key in ["a", "b", "c"] {
        assert!(matches!(guard.call(key, op).await, CallOutcome::Fresh(_)));
    }
    assert!(start.elapsed() >= Duration::from_secs(2));

    // Cache hits never wait for a slot.
    let before = tokio::time::Instant::now();
    assert!(matches!(guard.call("a", op).await, CallOutcome::Cached(_)));
    assert_eq!(before.elapsed(), Duration::ZERO);
}
