// NudeNet: offline nudity detection with the 320n YOLOv8 export.
//
// Only class confidences matter here. Every *_EXPOSED class feeds
// `nudity_exposed` and every *_COVERED class feeds `nudity_covered`, maxed
// over the first and last frame.

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use tracing::debug;

use super::names;
use super::onnx::{letterbox, to_nchw_rgb, yolo_class_maxima, OnnxModel};
use super::traits::{clamp01, Availability, Detector, DetectorResult, DisableFlag, Scores};
use crate::config::OnnxModelConfig;
use crate::frames::{first_and_last, Frame};

const INPUT_SIZE: u32 = 320;
const MIN_CONFIDENCE: f32 = 0.2;

/// Output class order of the 320n export.
pub const LABELS: [&str; 18] = [
    "FEMALE_GENITALIA_COVERED",
    "FACE_FEMALE",
    "BUTTOCKS_EXPOSED",
    "FEMALE_BREAST_EXPOSED",
    "FEMALE_GENITALIA_EXPOSED",
    "MALE_BREAST_EXPOSED",
    "ANUS_EXPOSED",
    "FEET_EXPOSED",
    "BELLY_COVERED",
    "FEET_COVERED",
    "ARMPITS_COVERED",
    "ARMPITS_EXPOSED",
    "FACE_MALE",
    "BELLY_EXPOSED",
    "MALE_GENITALIA_EXPOSED",
    "ANUS_COVERED",
    "FEMALE_BREAST_COVERED",
    "BUTTOCKS_COVERED",
];

/// Fold per-class maxima into (exposed, covered).
pub fn nudity_scores(maxima: &[f32]) -> (f64, f64) {
    let mut exposed = 0f64;
    let mut covered = 0f64;
    for (label, score) in LABELS.iter().zip(maxima) {
        let score = *score as f64;
        if label.ends_with("_EXPOSED") {
            exposed = exposed.max(score);
        } else if label.ends_with("_COVERED") {
            covered = covered.max(score);
        }
    }
    (clamp01(exposed), clamp01(covered))
}

pub struct NudeNetDetector {
    config: OnnxModelConfig,
    model: OnceCell<OnnxModel>,
    disabled: DisableFlag,
}

impl NudeNetDetector {
    pub fn new(config: OnnxModelConfig) -> Self {
        Self {
            config,
            model: OnceCell::new(),
            disabled: DisableFlag::new(),
        }
    }

    fn model(&self) -> Result<&OnnxModel> {
        self.model.get_or_try_init(|| OnnxModel::load(&self.config.model))
    }
}

#[async_trait]
impl Detector for NudeNetDetector {
    fn name(&self) -> &str {
        names::NUDENET
    }

    fn availability(&self) -> Availability {
        if let Some(reason) = self.disabled.reason() {
            return Availability::Unavailable(reason);
        }
        if self.config.disabled {
            return Availability::Unavailable("disabled via NUDENET_DISABLE=1".into());
        }
        if !self.config.model.exists() {
            return Availability::Unavailable(format!(
                "model not found ({})",
                self.config.model.display()
            ));
        }
        Availability::Ready
    }

    async fn run(&self, _path: &Path, frames: &[Frame], _max_api_frames: usize) -> Result<DetectorResult> {
        let model = self.model()?;

        let mut exposed = 0f64;
        let mut covered = 0f64;
        for frame in first_and_last(frames) {
            let input = to_nchw_rgb(&letterbox(&frame.image, INPUT_SIZE));
            let output = model.infer(input).await?;
            let maxima = yolo_class_maxima(&output, LABELS.len(), MIN_CONFIDENCE)?;
            let (e, c) = nudity_scores(&maxima);
            debug!(frame = frame.idx, exposed = e, covered = c, "NudeNet frame scored");
            exposed = exposed.max(e);
            covered = covered.max(c);
        }

        let mut scores = Scores::new();
        scores.insert("nudity_exposed".into(), exposed);
        scores.insert("nudity_covered".into(), covered);
        Ok(DetectorResult::ok(self.name(), scores))
    }

    fn disable(&self, reason: &str) {
        self.disabled.disable(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nudity_scores_split_by_suffix() {
        let mut maxima = vec![0f32; LABELS.len()];
        maxima[3] = 0.7; // FEMALE_BREAST_EXPOSED
        maxima[7] = 0.9; // FEET_EXPOSED
        maxima[16] = 0.5; // FEMALE_BREAST_COVERED
        maxima[1] = 0.99; // FACE_FEMALE, ignored
        let (exposed, covered) = nudity_scores(&maxima);
        assert!((exposed - 0.9).abs() < 1e-6);
        assert!((covered - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_disabled_flag_wins() {
        let det = NudeNetDetector::new(OnnxModelConfig {
            disabled: true,
            model: "/nonexistent/model.onnx".into(),
        });
        assert!(matches!(det.availability(), Availability::Unavailable(r) if r.contains("NUDENET_DISABLE")));
    }

    #[test]
    fn test_missing_model_is_unavailable() {
        let det = NudeNetDetector::new(OnnxModelConfig {
            disabled: false,
            model: "/nonexistent/model.onnx".into(),
        });
        assert!(!det.availability().is_ready());
    }
}
