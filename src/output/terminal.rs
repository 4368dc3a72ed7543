// Colored terminal output for scan reports and detector status.
//
// Score lines are trimmed for readability: Sightengine returns dozens of
// keys, so it gets its own compact/full/keys selection; every other detector
// shows its strongest few scores.

use colored::Colorize;

use crate::config::{DisplayConfig, SightengineScoreMode};
use crate::detectors::{names, DetectorResult, Scores, Status};
use crate::pipeline::Report;
use crate::verdict::Label;

const SIGHTENGINE_COMPACT_KEYS: &[&str] = &[
    "nudity_safe",
    "nudity_raw",
    "nudity_partial",
    "weapon_firearm",
    "weapon_firearm_toy",
    "weapon_knife",
    "gore_prob",
    "violence_prob",
    "offensive_max",
];

/// Pick which scores to print for one result.
pub fn select_scores(detector: &str, scores: &Scores, display: &DisplayConfig) -> Vec<(String, f64)> {
    let all = || scores.iter().map(|(k, v)| (k.clone(), *v)).collect::<Vec<_>>();
    if display.verbose {
        return all();
    }

    if detector == names::SIGHTENGINE {
        return match display.sightengine_mode {
            SightengineScoreMode::Full => all(),
            SightengineScoreMode::Keys => display
                .sightengine_keys
                .iter()
                .filter_map(|k| scores.get(k).map(|v| (k.clone(), *v)))
                .collect(),
            SightengineScoreMode::Compact => SIGHTENGINE_COMPACT_KEYS
                .iter()
                .filter_map(|k| scores.get(*k).map(|v| (k.to_string(), *v)))
                .collect(),
        };
    }

    let mut ranked = all();
    // Stable sort keeps key order among ties.
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked.truncate(display.max_keys);
    ranked
}

fn colorize_label(label: Label) -> colored::ColoredString {
    match label {
        Label::Ok => label.as_str().green().bold(),
        Label::Review => label.as_str().yellow().bold(),
        Label::Block => label.as_str().red().bold(),
    }
}

fn colorize_status(status: Status) -> colored::ColoredString {
    let tag = format!("{:<7}", status.as_str());
    match status {
        Status::Ok => tag.green(),
        Status::Skipped => tag.dimmed(),
        Status::Error => tag.red(),
    }
}

fn result_message(result: &DetectorResult, display: &DisplayConfig) -> String {
    if result.status == Status::Ok && !result.scores.is_empty() {
        select_scores(&result.name, &result.scores, display)
            .iter()
            .map(|(k, v)| format!("{k}={v:.2}"))
            .collect::<Vec<_>>()
            .join(", ")
    } else {
        result.error.clone().unwrap_or_default()
    }
}

/// Print one report block.
pub fn display_report(report: &Report, display: &DisplayConfig) {
    let v = &report.verdict;
    println!("{}", "=".repeat(70).dimmed());
    println!("{}", report.name.bold());

    let final_tag = if v.is_ok() { "OK".green().bold() } else { "NOT_OK".red().bold() };
    println!(
        "FINAL: {}  (verdict={}) | nudity={:.2} violence={:.2} hate={:.2}",
        final_tag,
        colorize_label(v.label),
        v.nudity_risk,
        v.violence_risk,
        v.hate_risk,
    );
    for reason in &v.reasons {
        println!(" - {reason}");
    }
    if let Some(msg) = &report.auto_learn {
        println!(" - {}", msg.cyan());
    }

    for result in &report.results {
        println!(
            "   [{}] {:<22} ({}ms) {}",
            colorize_status(result.status),
            result.name,
            result.took_ms.unwrap_or(0),
            result_message(result, display),
        );
    }
}

/// Summary line after a multi-input batch.
pub fn display_summary(reports: &[Report]) {
    let count = |label: Label| reports.iter().filter(|r| r.verdict.label == label).count();
    println!();
    println!(
        "{} scanned: {} ok, {} review, {} block",
        reports.len(),
        count(Label::Ok).to_string().green(),
        count(Label::Review).to_string().yellow(),
        count(Label::Block).to_string().red(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(pairs: &[(&str, f64)]) -> Scores {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_generic_detector_keeps_strongest_keys() {
        let display = DisplayConfig {
            max_keys: 2,
            ..DisplayConfig::default()
        };
        let picked = select_scores(names::OPENAI, &scores(&[("a", 0.1), ("b", 0.9), ("c", 0.5)]), &display);
        assert_eq!(picked, vec![("b".to_string(), 0.9), ("c".to_string(), 0.5)]);
    }

    #[test]
    fn test_sightengine_compact_and_keys_modes() {
        let s = scores(&[("nudity_raw", 0.2), ("weapon_firearm", 0.4), ("operations_used", 5.0)]);
        let compact = select_scores(names::SIGHTENGINE, &s, &DisplayConfig::default());
        assert_eq!(compact.len(), 2);
        assert_eq!(compact[0].0, "nudity_raw");

        let keys = DisplayConfig {
            sightengine_mode: SightengineScoreMode::Keys,
            sightengine_keys: vec!["operations_used".into(), "missing".into()],
            ..DisplayConfig::default()
        };
        assert_eq!(select_scores(names::SIGHTENGINE, &s, &keys), vec![("operations_used".to_string(), 5.0)]);
    }

    #[test]
    fn test_verbose_shows_everything() {
        let display = DisplayConfig {
            verbose: true,
            max_keys: 1,
            ..DisplayConfig::default()
        };
        let s = scores(&[("a", 0.1), ("b", 0.2), ("c", 0.3)]);
        assert_eq!(select_scores(names::NUDENET, &s, &display).len(), 3);
    }

    #[test]
    fn test_error_message_shown_for_non_ok() {
        let r = DetectorResult::skipped(names::OPENAI, "OPENAI_API_KEY not set");
        assert_eq!(result_message(&r, &DisplayConfig::default()), "OPENAI_API_KEY not set");
    }
}
