// Verdict engine: fold every detector result into OK / REVIEW / BLOCK.
//
// Evaluation is deterministic and order-sensitive:
//   1. core-detector errors, per the configured error policy
//   2. "nothing ran" fallback
//   3. the fixed-order rule table in `rules.rs` (list/OCR/minors overrides
//      end evaluation; continuous scores max-combine into three risks)
//   4. final thresholds on the three risks
// Risks only ever grow by `max`, never by addition, so one confident
// detector dominates however many weak ones disagree.

pub mod policy;
mod rules;

use serde::{Deserialize, Serialize};

use crate::detectors::{clamp01, DetectorResult, Status};

pub use policy::{ErrorPolicy, VerdictConfig, WeightedThreshold};

/// Final decision for one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Label {
    Ok,
    Review,
    Block,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Ok => "OK",
            Label::Review => "REVIEW",
            Label::Block => "BLOCK",
        }
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub label: Label,
    pub nudity_risk: f64,
    pub violence_risk: f64,
    pub hate_risk: f64,
    pub reasons: Vec<String>,
}

impl Verdict {
    pub fn new(label: Label, nudity: f64, violence: f64, hate: f64, reasons: Vec<String>) -> Self {
        Self {
            label,
            nudity_risk: clamp01(nudity),
            violence_risk: clamp01(violence),
            hate_risk: clamp01(hate),
            reasons,
        }
    }

    /// BLOCK with every risk at 1.0.
    pub fn block(reasons: Vec<String>) -> Self {
        Self::new(Label::Block, 1.0, 1.0, 1.0, reasons)
    }

    /// OK with every risk at 0.0.
    pub fn allow(reasons: Vec<String>) -> Self {
        Self::new(Label::Ok, 0.0, 0.0, 0.0, reasons)
    }

    pub fn is_ok(&self) -> bool {
        self.label == Label::Ok
    }

    pub fn max_risk(&self) -> f64 {
        self.nudity_risk.max(self.violence_risk).max(self.hate_risk)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Nudity,
    Violence,
    Hate,
}

/// Running state while rules are evaluated.
#[derive(Debug, Default)]
struct Accumulator {
    nudity: f64,
    violence: f64,
    hate: f64,
    reasons: Vec<String>,
    /// Reasons recorded by per-detector rules (not error/fallback notes).
    rule_hits: usize,
}

impl Accumulator {
    fn slot(&mut self, axis: Axis) -> &mut f64 {
        match axis {
            Axis::Nudity => &mut self.nudity,
            Axis::Violence => &mut self.violence,
            Axis::Hate => &mut self.hate,
        }
    }

    /// Max-combine `value` into `axis`, recording `reason` when it reaches `threshold`.
    fn bump(&mut self, axis: Axis, value: f64, threshold: f64, reason: impl FnOnce() -> String) {
        if value >= threshold {
            self.hit(reason());
        }
        self.combine(axis, value);
    }

    fn combine(&mut self, axis: Axis, value: f64) {
        let slot = self.slot(axis);
        *slot = slot.max(clamp01(value));
    }

    /// Saturate `axis` with a reason.
    fn raise(&mut self, axis: Axis, reason: String) {
        self.hit(reason);
        *self.slot(axis) = 1.0;
    }

    fn hit(&mut self, reason: String) {
        self.reasons.push(reason);
        self.rule_hits += 1;
    }

    fn note(&mut self, reason: impl Into<String>) {
        self.reasons.push(reason.into());
    }

    fn floor(&mut self, value: f64) {
        for axis in [Axis::Nudity, Axis::Violence, Axis::Hate] {
            let slot = self.slot(axis);
            *slot = slot.max(value);
        }
    }

    fn label(&self, cfg: &VerdictConfig) -> Label {
        let max = self.nudity.max(self.violence).max(self.hate);
        if max >= cfg.block_threshold {
            Label::Block
        } else if max >= cfg.review_threshold {
            Label::Review
        } else {
            Label::Ok
        }
    }

    fn finish(self, label: Label) -> Verdict {
        Verdict::new(label, self.nudity, self.violence, self.hate, self.reasons)
    }

    /// Terminal override: keep reasons gathered so far, add `reason`.
    fn decide(mut self, verdict: fn(Vec<String>) -> Verdict, reason: String) -> Verdict {
        self.reasons.push(reason);
        verdict(self.reasons)
    }
}

fn join_names(results: &[&DetectorResult]) -> String {
    results
        .iter()
        .take(6)
        .map(|r| r.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Aggregate all detector results into a single verdict.
pub fn compute_verdict(results: &[DetectorResult], cfg: &VerdictConfig) -> Verdict {
    let mut acc = Accumulator::default();

    let errored: Vec<&DetectorResult> = results
        .iter()
        .filter(|r| r.status == Status::Error)
        .collect();
    let core_errors: Vec<&DetectorResult> = errored
        .iter()
        .copied()
        .filter(|r| cfg.is_core(&r.name))
        .collect();

    let mut floored = false;
    if !core_errors.is_empty() {
        acc.note(format!("Some checks failed: {}", join_names(&core_errors)));
        match cfg.error_policy {
            ErrorPolicy::Block => {
                acc.floor(cfg.block_floor);
                return acc.finish(Label::Block);
            }
            ErrorPolicy::Review => {
                acc.floor(cfg.review_floor);
                floored = true;
            }
            ErrorPolicy::Ignore => {}
        }
    } else if !errored.is_empty() {
        acc.note(format!(
            "Non-core checks failed (ignored): {}",
            join_names(&errored)
        ));
    }

    // Absence of evidence is not evidence of harm, unless a core check broke.
    if !results.iter().any(DetectorResult::is_ok) && !floored {
        acc.note("No checks ran (all detectors skipped/disabled).");
        return acc.finish(Label::Ok);
    }

    for rule in rules::RULES {
        for result in results.iter().filter(|r| r.is_ok() && r.name == rule.detector) {
            let view = rules::ScoreView::new(result);
            if let rules::Flow::Decide(outcome) = (rule.apply)(&view, cfg, &mut acc) {
                return acc.decide(outcome.verdict, outcome.reason);
            }
        }
    }

    let label = acc.label(cfg);
    if label != Label::Ok && acc.rule_hits == 0 {
        acc.note("Borderline content detected by one or more detectors.");
    }
    acc.finish(label)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::{names, Scores};

    fn ok(name: &str, scores: &[(&str, f64)]) -> DetectorResult {
        let scores: Scores = scores.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        DetectorResult::ok(name, scores)
    }

    #[test]
    fn test_all_skipped_is_ok_with_reason() {
        let results = vec![DetectorResult::skipped(names::OPENAI, "OPENAI_API_KEY not set")];
        let v = compute_verdict(&results, &VerdictConfig::default());
        assert_eq!(v.label, Label::Ok);
        assert!(v.reasons[0].to_lowercase().contains("no checks ran"));
    }

    #[test]
    fn test_accumulator_bump_is_max_not_sum() {
        let mut acc = Accumulator::default();
        acc.bump(Axis::Nudity, 0.3, 0.5, || "a".into());
        acc.bump(Axis::Nudity, 0.3, 0.5, || "b".into());
        assert_eq!(acc.nudity, 0.3);
        assert!(acc.reasons.is_empty());
        acc.bump(Axis::Nudity, 0.6, 0.5, || "c".into());
        assert_eq!(acc.nudity, 0.6);
        assert_eq!(acc.reasons, vec!["c".to_string()]);
    }

    #[test]
    fn test_core_error_under_block_policy_blocks() {
        let cfg = VerdictConfig {
            error_policy: ErrorPolicy::Block,
            ..VerdictConfig::default()
        };
        let results = vec![
            DetectorResult::error(names::OCR, "tesseract crashed"),
            ok(names::OPENAI, &[("sexual", 0.9)]),
        ];
        let v = compute_verdict(&results, &cfg);
        assert_eq!(v.label, Label::Block);
        assert_eq!(v.nudity_risk, 0.5);
        assert!(v.reasons[0].starts_with("Some checks failed: OCR text"));
    }

    #[test]
    fn test_core_error_with_nothing_else_is_review() {
        let results = vec![DetectorResult::error(names::OPENAI, "boom")];
        let v = compute_verdict(&results, &VerdictConfig::default());
        assert_eq!(v.label, Label::Review);
        assert!(v.nudity_risk >= 0.40 && v.violence_risk >= 0.40 && v.hate_risk >= 0.40);
        assert!(v.reasons.iter().any(|r| r.starts_with("Borderline content")));
    }

    #[test]
    fn test_non_core_error_is_noted_but_harmless() {
        let results = vec![
            DetectorResult::error(names::NUDENET, "bad model"),
            ok(names::OPENAI, &[("sexual", 0.1)]),
        ];
        let v = compute_verdict(&results, &VerdictConfig::default());
        assert_eq!(v.label, Label::Ok);
        assert_eq!(v.nudity_risk, 0.1);
        assert_eq!(v.reasons, vec!["Non-core checks failed (ignored): NudeNet".to_string()]);
    }

    #[test]
    fn test_ignore_policy_leaves_risk_untouched() {
        let cfg = VerdictConfig {
            error_policy: ErrorPolicy::Ignore,
            ..VerdictConfig::default()
        };
        let results = vec![
            DetectorResult::error(names::SIGHTENGINE, "boom"),
            ok(names::OPENAI, &[]),
        ];
        let v = compute_verdict(&results, &cfg);
        assert_eq!(v.label, Label::Ok);
        assert_eq!(v.max_risk(), 0.0);
    }
}
