// Detector trait: the contract every moderation check implements.
//
// Offline models, OCR, the pHash lists and the paid API clients all sit
// behind this trait. The pipeline only ever sees `dyn Detector`, so a new
// check can be added without touching orchestration or the verdict rules.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::frames::Frame;

/// Normalized scores, conventionally in [0, 1]. Sorted keys keep reports stable.
pub type Scores = BTreeMap<String, f64>;

/// Free-form audit data attached to a result.
pub type Details = BTreeMap<String, Value>;

/// Outcome class of a single detector run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// The detector ran and produced scores.
    Ok,
    /// The detector chose not to run (missing model, credential, disabled, rate limited).
    Skipped,
    /// The detector ran and something unexpected broke.
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::Skipped => "skipped",
            Status::Error => "error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One detector's opinion about one input.
///
/// Created exactly once per detector per run. The only later mutation is the
/// orchestrator backfilling `took_ms` when the detector didn't set it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorResult {
    pub name: String,
    pub status: Status,
    #[serde(default)]
    pub scores: Scores,
    #[serde(default)]
    pub details: Details,
    pub error: Option<String>,
    pub took_ms: Option<u64>,
}

impl DetectorResult {
    pub fn ok(name: &str, scores: Scores) -> Self {
        Self {
            name: name.to_string(),
            status: Status::Ok,
            scores,
            details: Details::new(),
            error: None,
            took_ms: None,
        }
    }

    pub fn skipped(name: &str, reason: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status: Status::Skipped,
            scores: Scores::new(),
            details: Details::new(),
            error: Some(reason.into()),
            took_ms: None,
        }
    }

    pub fn error(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status: Status::Error,
            scores: Scores::new(),
            details: Details::new(),
            error: Some(message.into()),
            took_ms: None,
        }
    }

    pub fn with_details(mut self, details: Details) -> Self {
        self.details.extend(details);
        self
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn with_took_ms(mut self, took_ms: u64) -> Self {
        self.took_ms = Some(took_ms);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    /// Score lookup clamped to [0, 1]; missing or non-finite values read as 0.
    pub fn score(&self, key: &str) -> f64 {
        self.scores.get(key).copied().map(clamp01).unwrap_or(0.0)
    }

    /// A string-valued detail, if present.
    pub fn detail_str(&self, key: &str) -> Option<&str> {
        self.details.get(key).and_then(Value::as_str)
    }
}

/// Clamp a score to [0, 1], mapping NaN to 0.
pub fn clamp01(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Whether a detector can run right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Ready,
    Unavailable(String),
}

impl Availability {
    pub fn is_ready(&self) -> bool {
        matches!(self, Availability::Ready)
    }
}

/// A moderation check over the decoded frames of one input.
///
/// `availability` must be cheap and side-effect free. `run` does the work and
/// should turn its own expected failures into skipped/error results; anything
/// that still escapes (an `Err` or a panic) is recorded by the orchestrator as
/// an error result.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Stable display name, also used by the verdict rules and the core set.
    fn name(&self) -> &str;

    fn availability(&self) -> Availability;

    async fn run(&self, path: &Path, frames: &[Frame], max_api_frames: usize)
        -> Result<DetectorResult>;

    /// Permanently disable this detector for the rest of the process.
    fn disable(&self, reason: &str);
}

/// Shared "disabled for the rest of the process" marker.
///
/// Clones share the same slot, so every detector built from the same shared
/// state observes a disable triggered by any of them.
#[derive(Debug, Clone, Default)]
pub struct DisableFlag(Arc<Mutex<Option<String>>>);

impl DisableFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the reason. The first reason wins.
    pub fn disable(&self, reason: &str) {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(reason.to_string());
        }
    }

    pub fn reason(&self) -> Option<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_disabled(&self) -> bool {
        self.reason().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&Status::Skipped).unwrap();
        assert_eq!(json, "\"skipped\"");
    }

    #[test]
    fn test_score_clamps_and_defaults() {
        let mut scores = Scores::new();
        scores.insert("high".into(), 3.0);
        scores.insert("nan".into(), f64::NAN);
        let result = DetectorResult::ok("x", scores);
        assert_eq!(result.score("high"), 1.0);
        assert_eq!(result.score("nan"), 0.0);
        assert_eq!(result.score("missing"), 0.0);
    }

    #[test]
    fn test_disable_flag_is_shared_and_first_reason_wins() {
        let flag = DisableFlag::new();
        let clone = flag.clone();
        clone.disable("quota");
        flag.disable("auth");
        assert_eq!(flag.reason().as_deref(), Some("quota"));
    }
}
