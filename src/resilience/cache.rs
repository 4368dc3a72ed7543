// Content-addressed response cache for paid API calls.
//
// Keys are fingerprints over everything that determines a vendor response
// (model identity, prompt text, the exact image bytes sent). The cache is a
// single JSON object on disk, loaded lazily on first use, capped at
// `max_items` with oldest-inserted eviction, and written back every
// `flush_every` inserts plus once at shutdown. Writes go to a temp file that
// is renamed over the original so a crash never leaves a torn file.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::detectors::{Details, Scores};

/// What we remember about one vendor call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    #[serde(default)]
    pub scores: Scores,
    #[serde(default)]
    pub details: Details,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    /// Where to persist. `None` keeps the cache in memory only.
    pub path: Option<PathBuf>,
    pub max_items: usize,
    pub flush_every: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            max_items: 2000,
            flush_every: 25,
        }
    }
}

/// Insertion-ordered map. Eviction drops the oldest insert, not the least
/// recently read.
#[derive(Debug, Default)]
struct OrderedEntries {
    map: HashMap<String, CachedResponse>,
    order: VecDeque<String>,
}

impl OrderedEntries {
    fn get(&self, key: &str) -> Option<&CachedResponse> {
        self.map.get(key)
    }

    fn insert(&mut self, key: String, value: CachedResponse) {
        // Re-inserting an existing key keeps its original position.
        if self.map.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
        }
    }

    fn evict_to(&mut self, cap: usize) -> usize {
        let mut evicted = 0;
        while self.map.len() > cap {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if self.map.remove(&oldest).is_some() {
                evicted += 1;
            }
        }
        evicted
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

impl Serialize for OrderedEntries {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.order.len()))?;
        for key in &self.order {
            if let Some(value) = self.map.get(key) {
                map.serialize_entry(key, value)?;
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for OrderedEntries {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = OrderedEntries;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a JSON object of cached responses")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = OrderedEntries::default();
                while let Some((key, value)) = access.next_entry::<String, CachedResponse>()? {
                    entries.insert(key, value);
                }
                Ok(entries)
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

#[derive(Default)]
struct CacheState {
    loaded: bool,
    entries: OrderedEntries,
    dirty: bool,
    writes_since_flush: usize,
    /// Bumped on every snapshot so a slow background write can't clobber a newer one.
    generation: u64,
}

pub struct ResponseCache {
    settings: CacheSettings,
    state: Mutex<CacheState>,
    /// Generation last written to disk; also serializes writers.
    persisted: Arc<Mutex<u64>>,
}

impl ResponseCache {
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(CacheState::default()),
            persisted: Arc::new(Mutex::new(0)),
        }
    }

    pub fn disabled() -> Self {
        Self::new(CacheSettings {
            enabled: false,
            ..CacheSettings::default()
        })
    }

    /// In-memory only, no persistence.
    pub fn in_memory(max_items: usize) -> Self {
        Self::new(CacheSettings {
            enabled: true,
            path: None,
            max_items,
            flush_every: usize::MAX,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    pub fn path(&self) -> Option<&Path> {
        self.settings.path.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<CachedResponse> {
        if !self.settings.enabled {
            return None;
        }
        let mut state = self.lock_state();
        self.ensure_loaded(&mut state);
        state.entries.get(key).cloned()
    }

    pub fn insert(&self, key: String, value: CachedResponse) {
        if !self.settings.enabled {
            return;
        }
        let snapshot = {
            let mut state = self.lock_state();
            self.ensure_loaded(&mut state);
            state.entries.insert(key, value);
            let evicted = state.entries.evict_to(self.settings.max_items.max(1));
            if evicted > 0 {
                debug!(evicted, "Evicted oldest cache entries");
            }
            state.dirty = true;
            state.writes_since_flush += 1;

            if state.writes_since_flush >= self.settings.flush_every.max(1) {
                self.take_snapshot(&mut state)
            } else {
                None
            }
        };

        if let Some((generation, json)) = snapshot {
            self.write_in_background(generation, json);
        }
    }

    pub fn len(&self) -> usize {
        if !self.settings.enabled {
            return 0;
        }
        let mut state = self.lock_state();
        self.ensure_loaded(&mut state);
        state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write pending changes now. Used at shutdown.
    pub fn flush(&self) -> Result<()> {
        let snapshot = {
            let mut state = self.lock_state();
            if !state.dirty {
                return Ok(());
            }
            self.take_snapshot(&mut state)
        };
        match (snapshot, self.settings.path.as_deref()) {
            (Some((generation, json)), Some(path)) => {
                persist(path, &self.persisted, generation, &json)
            }
            _ => Ok(()),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_loaded(&self, state: &mut CacheState) {
        if state.loaded {
            return;
        }
        state.loaded = true;
        let Some(path) = self.settings.path.as_deref() else {
            return;
        };
        match fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str::<OrderedEntries>(&text) {
                Ok(mut entries) => {
                    entries.evict_to(self.settings.max_items.max(1));
                    debug!(path = %path.display(), entries = entries.len(), "Loaded response cache");
                    state.entries = entries;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring unreadable response cache");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read response cache");
            }
        }
    }

    /// Serialize current entries and reset the pending-write counters.
    fn take_snapshot(&self, state: &mut CacheState) -> Option<(u64, String)> {
        self.settings.path.as_ref()?;
        match serde_json::to_string(&state.entries) {
            Ok(json) => {
                state.generation += 1;
                state.dirty = false;
                state.writes_since_flush = 0;
                Some((state.generation, json))
            }
            Err(e) => {
                warn!(error = %e, "Failed to serialize response cache");
                None
            }
        }
    }

    fn write_in_background(&self, generation: u64, json: String) {
        let Some(path) = self.settings.path.clone() else {
            return;
        };
        let persisted = Arc::clone(&self.persisted);
        let write = move || {
            if let Err(e) = persist(&path, &persisted, generation, &json) {
                warn!(path = %path.display(), error = %e, "Response cache flush failed");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(write);
            }
            Err(_) => write(),
        }
    }
}

impl Drop for ResponseCache {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(error = %e, "Response cache flush on drop failed");
        }
    }
}

fn persist(path: &Path, persisted: &Mutex<u64>, generation: u64, json: &str) -> Result<()> {
    let mut last = persisted.lock().unwrap_or_else(PoisonError::into_inner);
    if *last >= generation {
        return Ok(());
    }
    write_atomic(path, json)?;
    *last = generation;
    debug!(path = %path.display(), generation, "Flushed response cache");
    Ok(())
}

/// Write to `<path>.tmp` then rename over `path`.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to move {} into place", tmp.display()))?;
    Ok(())
}

/// Stable cache key over a model identity, optional text and the exact
/// bytes of every frame sent.
pub fn fingerprint<'a>(identity: &str, text: &str, frames: impl IntoIterator<Item = &'a [u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity.as_bytes());
    hasher.update(b"\n");
    hasher.update(text.as_bytes());
    hasher.update(b"\n");
    for bytes in frames {
        hasher.update(hex::encode(Sha256::digest(bytes)).as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(score: f64) -> CachedResponse {
        let mut scores = Scores::new();
        scores.insert("sexual".into(), score);
        CachedResponse {
            scores,
            details: Details::new(),
        }
    }

    #[test]
    fn test_fingerprint_depends_on_every_input() {
        let base = fingerprint("m", "t", [b"a".as_slice()]);
        assert_eq!(base, fingerprint("m", "t", [b"a".as_slice()]));
        assert_ne!(base, fingerprint("m2", "t", [b"a".as_slice()]));
        assert_ne!(base, fingerprint("m", "t2", [b"a".as_slice()]));
        assert_ne!(base, fingerprint("m", "t", [b"b".as_slice()]));
        assert_ne!(base, fingerprint("m", "t", [b"a".as_slice(), b"a".as_slice()]));
    }

    #[test]
    fn test_eviction_is_insertion_order() {
        let cache = ResponseCache::in_memory(2);
        cache.insert("a".into(), response(0.1));
        cache.insert("b".into(), response(0.2));
        // reading "a" must not protect it
        assert!(cache.get("a").is_some());
        cache.insert("c".into(), response(0.3));

        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_disabled_cache_stores_nothing() {
        let cache = ResponseCache::disabled();
        cache.insert("a".into(), response(0.1));
        assert!(cache.get("a").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_flush_and_reload_preserve_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let settings = CacheSettings {
            enabled: true,
            path: Some(path.clone()),
            max_items: 10,
            flush_every: 100,
        };

        let cache = ResponseCache::new(settings.clone());
        cache.insert("z".into(), response(0.9));
        cache.insert("a".into(), response(0.1));
        assert!(!path.exists());
        cache.flush().unwrap();
        assert!(path.exists());

        let reloaded = ResponseCache::new(CacheSettings {
            max_items: 1,
            ..settings
        });
        // cap of one keeps only the newest insert from the file
        assert!(reloaded.get("z").is_none());
        assert_eq!(reloaded.get("a"), Some(response(0.1)));
    }

    #[test]
    fn test_flush_every_writes_without_explicit_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.json");
        let cache = ResponseCache::new(CacheSettings {
            enabled: true,
            path: Some(path.clone()),
            max_items: 10,
            flush_every: 2,
        });
        cache.insert("a".into(), response(0.1));
        assert!(!path.exists());
        // outside a runtime the threshold write happens inline
        cache.insert("b".into(), response(0.2));
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"a\"") && text.contains("\"b\""));
    }

    #[test]
    fn test_corrupt_cache_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(&path, "{not json").unwrap();
        let cache = ResponseCache::new(CacheSettings {
            enabled: true,
            path: Some(path),
            max_items: 10,
            flush_every: 100,
        });
        assert!(cache.is_empty());
    }
}
