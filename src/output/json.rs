// JSON report output.
//
// One input writes a single report object; a batch writes an array in input
// order. `-` means stdout.

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;

use crate::pipeline::Report;
use crate::resilience::cache::write_atomic;

/// Serialize reports into the shape written to disk.
pub fn to_json(reports: &[Report]) -> Result<Value> {
    let value = match reports {
        [single] => serde_json::to_value(single)?,
        many => serde_json::to_value(many)?,
    };
    Ok(value)
}

pub fn write_reports(path: &Path, reports: &[Report]) -> Result<()> {
    let text = serde_json::to_string_pretty(&to_json(reports)?).context("failed to serialize reports")?;
    if path.as_os_str() == "-" {
        println!("{text}");
        return Ok(());
    }
    write_atomic(path, &format!("{text}\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::{names, DetectorResult, Scores};
    use crate::verdict::Verdict;

    fn report(name: &str) -> Report {
        let mut scores = Scores::new();
        scores.insert("phash_allow_match".into(), 1.0);
        Report {
            name: name.into(),
            path: format!("/in/{name}"),
            verdict: Verdict::allow(vec!["Allowlist match (distance=0)".into()]),
            results: vec![DetectorResult::ok(names::PHASH_ALLOWLIST, scores).with_took_ms(3)],
            auto_learn: None,
        }
    }

    #[test]
    fn test_single_report_is_an_object() {
        let value = to_json(&[report("a.png")]).unwrap();
        assert_eq!(value["verdict"]["label"], "OK");
        assert_eq!(value["results"][0]["took_ms"], 3);
        assert_eq!(value["results"][0]["scores"]["phash_allow_match"], 1.0);
    }

    #[test]
    fn test_batch_is_an_array_in_order() {
        let value = to_json(&[report("a.png"), report("b.png")]).unwrap();
        let items = value.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1]["name"], "b.png");
    }

    #[test]
    fn test_write_reports_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("report.json");
        write_reports(&path, &[report("a.png")]).unwrap();
        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["name"], "a.png");
    }
}
