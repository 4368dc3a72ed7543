// YOLO weapons: offline firearm/knife detection with any YOLOv8-format
// export plus a labels file (one class name per line, in output order).
//
// Class names are matched loosely so open-vocabulary exports (OpenImages,
// YOLO-World prompts) work without a fixed label map.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use tracing::debug;

use super::names;
use super::onnx::{letterbox, to_nchw_rgb, yolo_class_maxima, OnnxModel};
use super::traits::{clamp01, Availability, Detector, DetectorResult, DisableFlag, Scores};
use crate::config::YoloConfig;
use crate::frames::Frame;

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct WeaponScores {
    pub firearm: f64,
    pub firearm_realistic: f64,
    pub firearm_toy: f64,
    pub knife: f64,
    pub knife_dangerous: f64,
}

impl WeaponScores {
    /// Fold one class confidence in by name.
    pub fn observe(&mut self, class_name: &str, confidence: f64) {
        let name = class_name.to_lowercase();
        let gun_like = ["firearm", "gun", "rifle", "pistol"].iter().any(|k| name.contains(k));
        if gun_like {
            self.firearm = self.firearm.max(confidence);
            self.firearm_realistic = self.firearm_realistic.max(confidence);
        }
        if name.contains("toy") && (name.contains("gun") || name.contains("firearm")) {
            self.firearm_toy = self.firearm_toy.max(confidence);
        }
        if name.contains("knife") || name.contains("dagger") {
            self.knife = self.knife.max(confidence);
            // High-confidence knives count as dangerous.
            self.knife_dangerous = self.knife_dangerous.max(confidence);
        }
    }

    pub fn merge(&mut self, other: &WeaponScores) {
        self.firearm = self.firearm.max(other.firearm);
        self.firearm_realistic = self.firearm_realistic.max(other.firearm_realistic);
        self.firearm_toy = self.firearm_toy.max(other.firearm_toy);
        self.knife = self.knife.max(other.knife);
        self.knife_dangerous = self.knife_dangerous.max(other.knife_dangerous);
    }

    pub fn to_scores(&self) -> Scores {
        let any = self.firearm.max(self.firearm_realistic).max(self.firearm_toy);
        [
            ("yolo_firearm_realistic", self.firearm_realistic),
            ("yolo_firearm_toy", self.firearm_toy),
            ("yolo_firearm", self.firearm),
            ("yolo_knife", self.knife),
            ("yolo_knife_dangerous", self.knife_dangerous),
            ("yolo_firearm_any", any),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), clamp01(v)))
        .collect()
    }
}

pub fn parse_labels(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
        .collect()
}

struct LoadedModel {
    model: OnnxModel,
    labels: Vec<String>,
}

pub struct YoloWeaponsDetector {
    config: YoloConfig,
    loaded: OnceCell<LoadedModel>,
    disabled: DisableFlag,
}

impl YoloWeaponsDetector {
    pub fn new(config: YoloConfig) -> Self {
        Self {
            config,
            loaded: OnceCell::new(),
            disabled: DisableFlag::new(),
        }
    }

    fn loaded(&self) -> Result<&LoadedModel> {
        self.loaded.get_or_try_init(|| {
            let text = std::fs::read_to_string(&self.config.labels)
                .with_context(|| format!("failed to read labels {}", self.config.labels.display()))?;
            let labels = parse_labels(&text);
            if labels.is_empty() {
                anyhow::bail!("labels file is empty: {}", self.config.labels.display());
            }
            let model = OnnxModel::load(&self.config.model)?;
            Ok(LoadedModel { model, labels })
        })
    }
}

#[async_trait]
impl Detector for YoloWeaponsDetector {
    fn name(&self) -> &str {
        names::YOLO_WEAPONS
    }

    fn availability(&self) -> Availability {
        if let Some(reason) = self.disabled.reason() {
            return Availability::Unavailable(reason);
        }
        if self.config.disabled {
            return Availability::Unavailable("disabled via YOLO_DISABLE=1".into());
        }
        for (what, path) in [("model", &self.config.model), ("labels", &self.config.labels)] {
            if !path.exists() {
                return Availability::Unavailable(format!("{what} not found ({})", path.display()));
            }
        }
        Availability::Ready
    }

    async fn run(&self, _path: &Path, frames: &[Frame], _max_api_frames: usize) -> Result<DetectorResult> {
        let loaded = self.loaded()?;
        let conf = self.config.conf as f32;

        let mut total = WeaponScores::default();
        for frame in frames.iter().take(self.config.max_frames.max(1)) {
            let input = to_nchw_rgb(&letterbox(&frame.image, self.config.imgsz));
            let output = loaded.model.infer(input).await?;
            let maxima = yolo_class_maxima(&output, loaded.labels.len(), conf)?;

            let mut per_frame = WeaponScores::default();
            for (label, score) in loaded.labels.iter().zip(&maxima) {
                if *score > 0.0 {
                    per_frame.observe(label, *score as f64);
                }
            }
            debug!(frame = frame.idx, firearm = per_frame.firearm, knife = per_frame.knife, "YOLO frame scored");
            total.merge(&per_frame);
        }

        Ok(DetectorResult::ok(self.name(), total.to_scores()))
    }

    fn disable(&self, reason: &str) {
        self.disabled.disable(reason);
    }
}
