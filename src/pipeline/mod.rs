// Orchestration: frames -> pre-detectors -> short-circuit -> main detectors
// -> verdict -> auto-learn.
//
// Detectors run one after another for a given input. A detector that is not
// available is recorded as skipped without calling `run`; one that returns
// an error or panics is recorded as an error result. Nothing here fails the
// batch: the worst outcome for an input is a REVIEW verdict.

pub mod input;

use std::path::Path;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use futures::FutureExt;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{AutoLearnConfig, Config, PhashConfig};
use crate::detectors::{self, names, Availability, Detector, DetectorResult};
use crate::frames::{self, Frame};
use crate::output::truncate_tail;
use crate::phash::{ListKind, PhashStore};
use crate::state::SharedState;
use crate::verdict::{compute_verdict, Label, Verdict, VerdictConfig};

const TRACE_CHARS: usize = 2000;

/// Everything produced for one input.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub name: String,
    pub path: String,
    pub verdict: Verdict,
    pub results: Vec<DetectorResult>,
    pub auto_learn: Option<String>,
}

impl Report {
    pub fn is_ok(&self) -> bool {
        self.verdict.is_ok()
    }
}

pub struct Pipeline {
    pre: Vec<Arc<dyn Detector>>,
    main: Vec<Arc<dyn Detector>>,
    verdict: VerdictConfig,
    phash: PhashConfig,
    auto_learn: AutoLearnConfig,
    store: Arc<PhashStore>,
    short_circuit: bool,
    sample_frames: usize,
    max_api_frames: usize,
    http: Client,
}

impl Pipeline {
    pub fn new(
        pre: Vec<Arc<dyn Detector>>,
        main: Vec<Arc<dyn Detector>>,
        config: &Config,
        store: Arc<PhashStore>,
    ) -> Self {
        Self {
            pre,
            main,
            verdict: config.verdict.clone(),
            phash: config.phash.clone(),
            auto_learn: config.pipeline.auto_learn.clone(),
            store,
            short_circuit: config.pipeline.short_circuit,
            sample_frames: config.pipeline.sample_frames,
            max_api_frames: config.pipeline.max_api_frames,
            http: Client::new(),
        }
    }

    /// The standard detector set wired to `state`.
    pub fn from_config(config: &Config, state: &SharedState, no_apis: bool) -> Result<Self> {
        let pre = detectors::build_pre_detectors(config, state);
        let main = detectors::build_main_detectors(config, state, no_apis)?;
        Ok(Self::new(pre, main, config, Arc::clone(&state.phash)))
    }

    pub fn with_sample_frames(mut self, sample_frames: usize) -> Self {
        self.sample_frames = sample_frames.max(1);
        self
    }

    pub fn detectors(&self) -> impl Iterator<Item = &Arc<dyn Detector>> {
        self.pre.iter().chain(self.main.iter())
    }

    /// Scan one file path or URL. Never fails; problems become the verdict.
    pub async fn run_on_input(&self, input: &str) -> Report {
        let mut download = None;
        let mut display_name = input.to_string();

        let loaded = async {
            let path = if input::is_url(input) {
                let temp = input::download_to_temp(&self.http, input).await?;
                display_name = temp.display_name.clone();
                let path = temp.path.clone();
                download = Some(temp);
                path
            } else {
                Path::new(input).to_path_buf()
            };
            let sample = self.sample_frames;
            let frames = {
                let path = path.clone();
                tokio::task::spawn_blocking(move || frames::load_frames(&path, sample)).await??
            };
            Ok::<_, anyhow::Error>((path, frames))
        }
        .await;

        let (path, frames) = match loaded {
            Ok(v) => v,
            Err(e) => {
                warn!(input, error = %e, "Failed to load input");
                return loader_failure(display_name, input, &e);
            }
        };

        let (verdict, results) = self.evaluate(&path, &frames).await;
        let auto_learn = self.maybe_auto_learn(&verdict, &frames);
        drop(download);

        info!(input = %display_name, label = %verdict.label, "Scanned");
        Report {
            name: display_name,
            path: input.to_string(),
            verdict,
            results,
            auto_learn,
        }
    }

    /// Run detectors over already-decoded frames and decide.
    pub async fn evaluate(&self, path: &Path, frames: &[Frame]) -> (Verdict, Vec<DetectorResult>) {
        let pre_results = run_detectors(path, frames, &self.pre, self.max_api_frames).await;

        if self.short_circuit {
            if let Some(verdict) = short_circuit(&pre_results) {
                debug!(label = %verdict.label, "pHash short-circuit");
                return (verdict, pre_results);
            }
        }

        let mut results = pre_results;
        results.extend(run_detectors(path, frames, &self.main, self.max_api_frames).await);
        let verdict = compute_verdict(&results, &self.verdict);
        (verdict, results)
    }

    /// Append the input's hash to the list matching a confident verdict.
    ///
    /// OK learns into the allowlist, BLOCK into the blocklist, REVIEW never.
    /// Failures are logged and otherwise ignored.
    pub fn maybe_auto_learn(&self, verdict: &Verdict, frames: &[Frame]) -> Option<String> {
        let cfg = &self.auto_learn;
        let (kind, label) = match verdict.label {
            Label::Ok if cfg.allow_append => (ListKind::Allow, cfg.allow_label.as_str()),
            Label::Block if cfg.block_append => (ListKind::Block, cfg.block_label.as_str()),
            _ => return None,
        };
        let first = frames.first()?;

        let mut picked = vec![first];
        if cfg.first_and_last && frames.len() > 1 {
            picked = frames::first_and_last(frames);
        }

        let path = match kind {
            ListKind::Allow => &self.phash.allowlist,
            ListKind::Block => &self.phash.blocklist,
        };
        let mut added = false;
        for frame in picked {
            match self.store.append(path, frame.phash(), label) {
                Ok(new) => added |= new,
                Err(e) => {
                    warn!(list = kind.as_str(), error = %e, "Auto-learn append failed");
                    return None;
                }
            }
        }
        added.then(|| format!("Auto-added pHash to {} ({})", kind.as_str(), path.display()))
    }
}

fn loader_failure(name: String, input: &str, err: &anyhow::Error) -> Report {
    Report {
        name,
        path: input.to_string(),
        verdict: Verdict::new(
            Label::Review,
            0.0,
            0.0,
            0.0,
            vec![format!("loader_failure: {err:#}")],
        ),
        results: vec![DetectorResult::error(names::LOADER, format!("failed to load image: {err:#}"))],
        auto_learn: None,
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Run each detector in order, converting every outcome into a result.
pub async fn run_detectors(
    path: &Path,
    frames: &[Frame],
    detectors: &[Arc<dyn Detector>],
    max_api_frames: usize,
) -> Vec<DetectorResult> {
    let mut results = Vec::with_capacity(detectors.len());
    for detector in detectors {
        let start = Instant::now();
        let name = detector.name().to_string();

        if let Availability::Unavailable(reason) = detector.availability() {
            debug!(detector = %name, reason = %reason, "Detector skipped");
            results.push(DetectorResult::skipped(&name, reason).with_took_ms(elapsed_ms(start)));
            continue;
        }

        let outcome = AssertUnwindSafe(detector.run(path, frames, max_api_frames))
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(Ok(mut result)) => {
                if result.took_ms.is_none() {
                    result.took_ms = Some(elapsed_ms(start));
                }
                result
            }
            Ok(Err(e)) => DetectorResult::error(&name, format!("{e:#}"))
                .with_detail("trace", truncate_tail(&format!("{e:?}"), TRACE_CHARS))
                .with_took_ms(elapsed_ms(start)),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                DetectorResult::error(&name, format!("panicked: {message}"))
                    .with_detail("trace", truncate_tail(&message, TRACE_CHARS))
                    .with_took_ms(elapsed_ms(start))
            }
        };
        debug!(
            detector = %name,
            status = %result.status,
            took_ms = result.took_ms.unwrap_or(0),
            error = result.error.as_deref().unwrap_or(""),
            "Detector finished"
        );
        results.push(result);
    }
    results
}

fn distance_of(result: &DetectorResult) -> String {
    match result.details.get("distance") {
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => other.to_string(),
        None => "n/a".to_string(),
    }
}

/// Block precedence over allow; `None` when neither list matched.
pub fn short_circuit(pre_results: &[DetectorResult]) -> Option<Verdict> {
    let matched = |name: &str, key: &str| {
        pre_results
            .iter()
            .find(|r| r.is_ok() && r.name == name && r.score(key) >= 1.0)
    };

    if let Some(r) = matched(names::PHASH_BLOCKLIST, "phash_block_match") {
        return Some(Verdict::block(vec![format!(
            "Blocklist match (distance={})",
            distance_of(r)
        )]));
    }
    if let Some(r) = matched(names::PHASH_ALLOWLIST, "phash_allow_match") {
        return Some(Verdict::allow(vec![format!(
            "Allowlist match (distance={})",
            distance_of(r)
        )]));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::Scores;
    use serde_json::json;

    fn matched(name: &str, key: &str, distance: u32) -> DetectorResult {
        let mut scores = Scores::new();
        scores.insert(key.into(), 1.0);
        DetectorResult::ok(name, scores).with_detail("distance", distance)
    }

    #[test]
    fn test_short_circuit_block_wins() {
        let results = vec![
            matched(names::PHASH_BLOCKLIST, "phash_block_match", 2),
            matched(names::PHASH_ALLOWLIST, "phash_allow_match", 0),
        ];
        let v = short_circuit(&results).unwrap();
        assert_eq!(v.label, Label::Block);
        assert_eq!(v.reasons, vec!["Blocklist match (distance=2)".to_string()]);
    }

    #[test]
    fn test_short_circuit_allow_and_none() {
        let results = vec![matched(names::PHASH_ALLOWLIST, "phash_allow_match", 3)];
        let v = short_circuit(&results).unwrap();
        assert_eq!(v.label, Label::Ok);
        assert_eq!(v.max_risk(), 0.0);

        let none = vec![DetectorResult::skipped(names::PHASH_BLOCKLIST, "missing")];
        assert!(short_circuit(&none).is_none());
    }

    #[test]
    fn test_loader_failure_is_review() {
        let report = loader_failure("x.png".into(), "x.png", &anyhow::anyhow!("bad header"));
        assert_eq!(report.verdict.label, Label::Review);
        assert!(report.verdict.reasons[0].starts_with("loader_failure: bad header"));
        assert_eq!(report.results[0].name, names::LOADER);
        assert_eq!(report.results[0].error.as_deref(), Some("failed to load image: bad header"));
        assert_eq!(serde_json::to_value(&report).unwrap()["auto_learn"], json!(null));
    }

    #[test]
    fn test_panic_message_extracts_text() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
    }
}
