// Process-wide cache of parsed list files, plus idempotent appends.
//
// Each list is re-parsed only when its modification time changes. Appends
// take a store-wide lock so two concurrent learners can't both add the same
// hash, and they drop the cached index so the next lookup sees the new line.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use anyhow::{Context, Result};
use tracing::debug;

use super::{ListIndex, PerceptualHash, PhashMatch};

#[derive(Default)]
pub struct PhashStore {
    cache: Mutex<HashMap<PathBuf, (SystemTime, Arc<ListIndex>)>>,
    append_lock: Mutex<()>,
}

impl PhashStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parsed index for `path`, or `None` when the file doesn't exist.
    pub fn load(&self, path: &Path, default_label: &str) -> Result<Option<Arc<ListIndex>>> {
        let mtime = match fs::metadata(path) {
            Ok(meta) => meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to stat list {}", path.display()))
            }
        };

        {
            let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some((cached_mtime, index)) = cache.get(path) {
                if *cached_mtime == mtime {
                    return Ok(Some(Arc::clone(index)));
                }
            }
        }

        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read list {}", path.display()))?;
        let index = Arc::new(ListIndex::parse(&text, default_label));
        debug!(path = %path.display(), entries = index.len(), "Loaded pHash list");

        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_path_buf(), (mtime, Arc::clone(&index)));
        Ok(Some(index))
    }

    /// Look `hash` up in the list at `path`. A missing list never matches.
    pub fn lookup(
        &self,
        path: &Path,
        default_label: &str,
        hash: &PerceptualHash,
        nearest: Option<u32>,
    ) -> Result<Option<PhashMatch>> {
        Ok(self
            .load(path, default_label)?
            .and_then(|index| index.lookup(hash, nearest)))
    }

    /// Append `hash,label` unless the hash is already listed.
    ///
    /// Returns whether a line was written. Creates the file and its parent
    /// directory if needed.
    pub fn append(&self, path: &Path, hash: &PerceptualHash, label: &str) -> Result<bool> {
        let _guard = self.append_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let existing = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read list {}", path.display()))
            }
        };
        if ListIndex::parse(&existing, label).contains(hash) {
            return Ok(false);
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open list {} for append", path.display()))?;
        let mut line = String::new();
        if !existing.is_empty() && !existing.ends_with('\n') {
            line.push('\n');
        }
        line.push_str(&format!("{},{}\n", hash.hex(), label.trim()));
        file.write_all(line.as_bytes())
            .with_context(|| format!("failed to append to {}", path.display()))?;

        self.invalidate(path);
        Ok(true)
    }

    pub fn invalidate(&self, path: &Path) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
    }

    /// Number of entries in the list at `path` (0 when missing).
    pub fn len(&self, path: &Path, default_label: &str) -> Result<usize> {
        Ok(self.load(path, default_label)?.map_or(0, |index| index.len()))
    }
}
