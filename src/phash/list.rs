// Parsed allow/block list and lookups against it.
//
// File format: one `hash_hex[,label]` per line, `#` comments and blank lines
// ignored, label defaulting per list kind. Unparsable hashes are skipped.

use std::collections::HashMap;

use serde::Serialize;

use super::PerceptualHash;

/// Which list a file represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListKind {
    Allow,
    Block,
}

impl ListKind {
    /// Label used for entries that don't carry one.
    pub fn default_label(&self) -> &'static str {
        match self {
            ListKind::Allow => "ok",
            ListKind::Block => "not_ok",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ListKind::Allow => "allowlist",
            ListKind::Block => "blocklist",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub hash: PerceptualHash,
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    Exact,
    Nearest,
}

impl MatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMode::Exact => "exact",
            MatchMode::Nearest => "nearest",
        }
    }
}

/// A successful list lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhashMatch {
    pub distance: u32,
    pub label: String,
    pub matched_hash: String,
    pub mode: MatchMode,
}

/// In-memory index of one list file.
#[derive(Debug, Default)]
pub struct ListIndex {
    entries: Vec<ListEntry>,
    /// hex length -> hash bytes -> entry position
    exact: HashMap<usize, HashMap<Vec<u8>, usize>>,
}

impl ListIndex {
    pub fn parse(text: &str, default_label: &str) -> Self {
        let mut index = ListIndex::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (hash_part, label_part) = match line.split_once(',') {
                Some((h, l)) => (h, Some(l.trim())),
                None => (line, None),
            };
            let Some(hash) = PerceptualHash::from_hex(hash_part) else {
                continue;
            };
            let label = match label_part {
                Some(l) if !l.is_empty() => l.to_string(),
                _ => default_label.to_string(),
            };
            index.push(ListEntry { hash, label });
        }
        index
    }

    fn push(&mut self, entry: ListEntry) {
        let pos = self.entries.len();
        // Later duplicates overwrite earlier ones in the exact map.
        self.exact
            .entry(entry.hash.hex_len())
            .or_default()
            .insert(entry.hash.as_bytes().to_vec(), pos);
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ListEntry] {
        &self.entries
    }

    pub fn contains(&self, hash: &PerceptualHash) -> bool {
        self.exact_match(hash).is_some()
    }

    /// O(1) exact lookup within the hash's length bucket.
    pub fn exact_match(&self, hash: &PerceptualHash) -> Option<&ListEntry> {
        let pos = self.exact.get(&hash.hex_len())?.get(hash.as_bytes())?;
        self.entries.get(*pos)
    }

    /// Closest same-length entry within `max_distance`. Ties keep the
    /// earliest entry in file order.
    pub fn nearest_match(&self, hash: &PerceptualHash, max_distance: u32) -> Option<(u32, &ListEntry)> {
        let mut best: Option<(u32, &ListEntry)> = None;
        for entry in &self.entries {
            let Some(d) = hash.distance(&entry.hash) else {
                continue;
            };
            if d <= max_distance && best.map_or(true, |(bd, _)| d < bd) {
                best = Some((d, entry));
            }
        }
        best
    }

    /// Exact match first, then the optional nearest-neighbour fallback.
    pub fn lookup(&self, hash: &PerceptualHash, nearest: Option<u32>) -> Option<PhashMatch> {
        if let Some(entry) = self.exact_match(hash) {
            return Some(PhashMatch {
                distance: 0,
                label: entry.label.clone(),
                matched_hash: entry.hash.hex().to_string(),
                mode: MatchMode::Exact,
            });
        }
        let max_distance = nearest?;
        self.nearest_match(hash, max_distance)
            .map(|(distance, entry)| PhashMatch {
                distance,
                label: entry.label.clone(),
                matched_hash: entry.hash.hex().to_string(),
                mode: MatchMode::Nearest,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST: &str = "\
# known content
ffffffffffffffff,cat_meme
0000000000000000

abc,short
not-a-hash,junk
";

    fn hash(hex: &str) -> PerceptualHash {
        PerceptualHash::from_hex(hex).unwrap()
    }

    #[test]
    fn test_parse_skips_comments_and_garbage() {
        let index = ListIndex::parse(LIST, "ok");
        assert_eq!(index.len(), 3);
        assert_eq!(index.entries()[0].label, "cat_meme");
        assert_eq!(index.entries()[1].label, "ok");
    }

    #[test]
    fn test_exact_match_respects_length_bucket() {
        let index = ListIndex::parse(LIST, "ok");
        assert!(index.exact_match(&hash("0000000000000000")).is_some());
        // same numeric value, different length bucket
        assert!(index.exact_match(&hash("00")).is_none());
        assert_eq!(index.exact_match(&hash("ABC")).unwrap().label, "short");
    }

    #[test]
    fn test_nearest_match_within_distance() {
        let index = ListIndex::parse(LIST, "ok");
        let (d, entry) = index.nearest_match(&hash("fffffffffffffff0"), 4).unwrap();
        assert_eq!(d, 4);
        assert_eq!(entry.label, "cat_meme");
        assert!(index.nearest_match(&hash("ffffffffffffff00"), 4).is_none());
    }

    #[test]
    fn test_lookup_prefers_exact_and_honours_disabled_nearest() {
        let index = ListIndex::parse(LIST, "ok");
        let m = index.lookup(&hash("ffffffffffffffff"), Some(4)).unwrap();
        assert_eq!(m.mode, MatchMode::Exact);
        assert_eq!(m.distance, 0);

        assert!(index.lookup(&hash("fffffffffffffffe"), None).is_none());
        let m = index.lookup(&hash("fffffffffffffffe"), Some(4)).unwrap();
        assert_eq!(m.mode, MatchMode::Nearest);
        assert_eq!(m.distance, 1);
    }
}
