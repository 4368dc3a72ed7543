// Detectors: every opinion the verdict engine folds together.
//
// Pre-detectors are the two pHash lists, which can short-circuit a run.
// Main detectors are everything else. The builders below decide the run
// order that ends up in reports; the verdict engine doesn't depend on it.

pub mod names;
pub mod nudenet;
pub mod ocr;
pub mod onnx;
pub mod openai;
pub mod opennsfw2;
pub mod phash;
pub mod sightengine;
pub mod traits;
pub mod yolo_weapons;

use std::sync::Arc;

use anyhow::Result;

pub use traits::{clamp01, Availability, Details, Detector, DetectorResult, DisableFlag, Scores, Status};

use crate::config::Config;
use crate::state::SharedState;

/// Blocklist first so block precedence also holds in report order.
pub fn build_pre_detectors(config: &Config, state: &SharedState) -> Vec<Arc<dyn Detector>> {
    vec![
        Arc::new(phash::PhashListDetector::blocklist(&config.phash, Arc::clone(&state.phash))),
        Arc::new(phash::PhashListDetector::allowlist(&config.phash, Arc::clone(&state.phash))),
    ]
}

/// Offline detectors, then the paid APIs unless `no_apis` is set.
pub fn build_main_detectors(config: &Config, state: &SharedState, no_apis: bool) -> Result<Vec<Arc<dyn Detector>>> {
    let mut detectors: Vec<Arc<dyn Detector>> = vec![
        Arc::new(ocr::OcrDetector::with_tesseract(config.ocr.clone())),
        Arc::new(nudenet::NudeNetDetector::new(config.models.nudenet.clone())),
        Arc::new(opennsfw2::OpenNsfw2Detector::new(config.models.opennsfw2.clone())),
        Arc::new(yolo_weapons::YoloWeaponsDetector::new(config.models.yolo.clone())),
    ];
    if !no_apis {
        detectors.push(Arc::new(openai::OpenAiDetector::new(
            config.openai.clone(),
            Arc::clone(&state.openai),
        )?));
        detectors.push(Arc::new(sightengine::SightengineDetector::new(
            config.sightengine.clone(),
            Arc::clone(&state.sightengine),
        )?));
    }
    Ok(detectors)
}
