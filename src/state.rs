// Process-wide mutable state, built once and handed to detectors.
//
// Everything that must be shared across inputs in a batch lives here: one
// ApiGuard per vendor (rate limiter, response cache, retry policy, disable
// flag) and the pHash list store. Tests build a fresh instance each.

use std::sync::Arc;

use anyhow::Result;
use tracing::warn;

use crate::config::{ApiSettings, Config};
use crate::phash::PhashStore;
use crate::resilience::{ApiGuard, RateLimiter, ResponseCache};

pub struct SharedState {
    pub openai: Arc<ApiGuard>,
    pub sightengine: Arc<ApiGuard>,
    pub phash: Arc<PhashStore>,
}

fn guard_for(vendor: &str, settings: &ApiSettings) -> Arc<ApiGuard> {
    Arc::new(ApiGuard::new(
        vendor,
        RateLimiter::from_secs(settings.min_interval_secs),
        ResponseCache::new(settings.cache.clone()),
        settings.retry.clone(),
    ))
}

impl SharedState {
    pub fn from_config(config: &Config) -> Self {
        Self {
            openai: guard_for("OpenAI", &config.openai.api),
            sightengine: guard_for("Sightengine", &config.sightengine.api),
            phash: Arc::new(PhashStore::new()),
        }
    }

    /// Fresh state with in-memory caches and no rate limiting.
    pub fn in_memory() -> Self {
        let guard = |vendor: &str| {
            Arc::new(ApiGuard::new(
                vendor,
                RateLimiter::unlimited(),
                ResponseCache::in_memory(2000),
                Default::default(),
            ))
        };
        Self {
            openai: guard("OpenAI"),
            sightengine: guard("Sightengine"),
            phash: Arc::new(PhashStore::new()),
        }
    }

    /// Persist dirty API caches. Logs and returns the first failure.
    pub fn flush(&self) -> Result<()> {
        let mut first_err = None;
        for guard in [&self.openai, &self.sightengine] {
            if let Err(e) = guard.cache().flush() {
                warn!(vendor = guard.vendor(), error = %e, "Failed to flush API cache");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
