// OpenNSFW2: offline two-way SFW/NSFW classifier.
//
// Caffe-style preprocessing: resize to 256, center-crop 224, BGR with the
// channel means subtracted, NHWC. Index 1 of the output is the NSFW class.

use std::path::Path;

use anyhow::{bail, Result};
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use tracing::debug;

use super::names;
use super::onnx::{as_probabilities, resize_center_crop, to_nhwc_bgr_mean, OnnxModel};
use super::traits::{clamp01, Availability, Detector, DetectorResult, DisableFlag, Scores};
use crate::config::OnnxModelConfig;
use crate::frames::{first_and_last, Frame};

const RESIZE: u32 = 256;
const CROP: u32 = 224;
const MEAN_BGR: [f32; 3] = [104.0, 117.0, 123.0];

pub struct OpenNsfw2Detector {
    config: OnnxModelConfig,
    model: OnceCell<OnnxModel>,
    disabled: DisableFlag,
}

impl OpenNsfw2Detector {
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

/// NSFW probability from the raw two-element output.
pub fn nsfw_probability(output: &[f32]) -> Result<f64> {
    if output.len() < 2 {
        bail!("expected 2 outputs, got {}", output.len());
    }
    let probs = as_probabilities(&output[..2]);
    Ok(clamp01(probs[1] as f64))
}

#[async_trait]
impl Detector for OpenNsfw2Detector {
    fn name(&self) -> &str {
        names::OPENNSFW2
    }

    fn availability(&self) -> Availability {
        if let Some(reason) = self.disabled.reason() {
            return Availability::Unavailable(reason);
        }
        if self.config.disabled {
            return Availability::Unavailable("disabled via OPENNSFW2_DISABLE=1".into());
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

        let mut nsfw = 0f64;
        for frame in first_and_last(frames) {
            let input = to_nhwc_bgr_mean(&resize_center_crop(&frame.image, RESIZE, CROP), MEAN_BGR);
            let output = model.infer(input).await?;
            let p = nsfw_probability(&output.data)?;
            debug!(frame = frame.idx, nsfw = p, "OpenNSFW2 frame scored");
            nsfw = nsfw.max(p);
        }

        let mut scores = Scores::new();
        scores.insert("nsfw_probability".into(), nsfw);
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
    fn test_nsfw_probability_from_probs_and_logits() {
        assert!((nsfw_probability(&[0.2, 0.8]).unwrap() - 0.8).abs() < 1e-6);
        // Logits get softmaxed.
        let p = nsfw_probability(&[-3.0, 3.0]).unwrap();
        assert!(p > 0.99);
        assert!(nsfw_probability(&[1.0]).is_err());
    }
}
