// pHash allowlist / blocklist detectors.
//
// Both are the same matcher pointed at different list files. They hash the
// first frame (and the last one for animations when configured) and report
// a 1.0/0.0 match score plus the distance and label of the best hit.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use super::names;
use super::traits::{Availability, Detector, DetectorResult, DisableFlag, Scores};
use crate::config::PhashConfig;
use crate::frames::Frame;
use crate::phash::{ListKind, PhashMatch, PhashStore};

pub struct PhashListDetector {
    kind: ListKind,
    path: PathBuf,
    nearest: Option<u32>,
    check_last_frame: bool,
    store: Arc<PhashStore>,
    disabled: DisableFlag,
}

impl PhashListDetector {
    pub fn new(kind: ListKind, config: &PhashConfig, store: Arc<PhashStore>) -> Self {
        let path = match kind {
            ListKind::Allow => config.allowlist.clone(),
            ListKind::Block => config.blocklist.clone(),
        };
        Self {
            kind,
            path,
            nearest: config.nearest_distance(),
            check_last_frame: config.check_last_frame,
            store,
            disabled: DisableFlag::new(),
        }
    }

    pub fn allowlist(config: &PhashConfig, store: Arc<PhashStore>) -> Self {
        Self::new(ListKind::Allow, config, store)
    }

    pub fn blocklist(config: &PhashConfig, store: Arc<PhashStore>) -> Self {
        Self::new(ListKind::Block, config, store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn score_key(&self) -> &'static str {
        match self.kind {
            ListKind::Allow => "phash_allow_match",
            ListKind::Block => "phash_block_match",
        }
    }
}

#[async_trait]
impl Detector for PhashListDetector {
    fn name(&self) -> &str {
        match self.kind {
            ListKind::Allow => names::PHASH_ALLOWLIST,
            ListKind::Block => names::PHASH_BLOCKLIST,
        }
    }

    fn availability(&self) -> Availability {
        if let Some(reason) = self.disabled.reason() {
            return Availability::Unavailable(reason);
        }
        if !self.path.exists() {
            return Availability::Unavailable(format!(
                "{} not found ({})",
                self.kind.as_str(),
                self.path.display()
            ));
        }
        Availability::Ready
    }

    async fn run(&self, _path: &Path, frames: &[Frame], _max_api_frames: usize) -> Result<DetectorResult> {
        let Some(first) = frames.first() else {
            return Ok(DetectorResult::skipped(self.name(), "no frames"));
        };

        let mut candidates = vec![first];
        if self.check_last_frame && frames.len() > 1 {
            if let Some(last) = frames.last() {
                candidates.push(last);
            }
        }

        let default_label = self.kind.default_label();
        let mut best: Option<(usize, PhashMatch)> = None;
        for frame in &candidates {
            let hit = self
                .store
                .lookup(&self.path, default_label, frame.phash(), self.nearest)?;
            if let Some(hit) = hit {
                if best.as_ref().map_or(true, |(_, b)| hit.distance < b.distance) {
                    best = Some((frame.idx, hit));
                }
            }
        }

        let mut scores = Scores::new();
        let matched = best.is_some();
        scores.insert(self.score_key().to_string(), if matched { 1.0 } else { 0.0 });

        let mut result = DetectorResult::ok(self.name(), scores)
            .with_detail("hash", first.phash().hex())
            .with_detail("frames_checked", json!(candidates.iter().map(|f| f.idx).collect::<Vec<_>>()))
            .with_detail("list", self.path.display().to_string());

        if let Some((frame_idx, hit)) = best {
            debug!(list = self.kind.as_str(), distance = hit.distance, label = %hit.label, "pHash list match");
            result = result
                .with_detail("distance", hit.distance)
                .with_detail("match_label", hit.label)
                .with_detail("matched_hash", hit.matched_hash)
                .with_detail("mode", hit.mode.as_str())
                .with_detail("frame", frame_idx);
        }
        Ok(result)
    }

    fn disable(&self, reason: &str) {
        self.disabled.disable(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgb, RgbImage};

    fn config(dir: &Path) -> PhashConfig {
        PhashConfig {
            allowlist: dir.join("allow.txt"),
            blocklist: dir.join("block.txt"),
            max_distance: 4,
            nearest: true,
            check_last_frame: false,
        }
    }

    fn frame() -> Frame {
        let mut img = RgbImage::new(32, 32);
        for (x, y, px) in img.enumerate_pixels_mut() {
            *px = Rgb([(x * 8) as u8, (y * 8) as u8, 64]);
        }
        Frame::new(0, DynamicImage::ImageRgb8(img))
    }

    #[tokio::test]
    async fn test_missing_list_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let det = PhashListDetector::blocklist(&config(dir.path()), Arc::new(PhashStore::new()));
        assert!(!det.availability().is_ready());
    }

    #[tokio::test]
    async fn test_exact_match_reports_label_and_distance() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let f = frame();
        std::fs::write(&cfg.blocklist, format!("{},known_bad\n", f.phash().hex())).unwrap();

        let det = PhashListDetector::blocklist(&cfg, Arc::new(PhashStore::new()));
        assert!(det.availability().is_ready());
        let res = det.run(Path::new("x.png"), &[f], 3).await.unwrap();
        assert_eq!(res.score("phash_block_match"), 1.0);
        assert_eq!(res.detail_str("match_label"), Some("known_bad"));
        assert_eq!(res.details["distance"], json!(0));
        assert_eq!(res.detail_str("mode"), Some("exact"));
    }

    #[tokio::test]
    async fn test_no_match_scores_zero() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        std::fs::write(&cfg.allowlist, "# empty list\n").unwrap();

        let det = PhashListDetector::allowlist(&cfg, Arc::new(PhashStore::new()));
        let res = det.run(Path::new("x.png"), &[frame()], 3).await.unwrap();
        assert!(res.is_ok());
        assert_eq!(res.score("phash_allow_match"), 0.0);
        assert!(res.details.get("distance").is_none());
    }
}
