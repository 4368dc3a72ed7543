// Sightengine check.json, one multipart request per frame.
//
// Each frame goes through the vendor's ApiGuard on its own, so frames are
// cached independently and a GIF that shares frames with an earlier input
// only pays for the new ones. Per-frame scores are max-combined.
//
// Responses vary by model version; `extract_scores` flattens the legacy and
// current nudity schemas plus weapon/gore/violence/offensive into one
// namespace (`nudity_*`, `weapon_*`, `gore_*`, `violence_*`, `offensive_*`).
//
// API docs: https://sightengine.com/docs/reference

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::names;
use super::traits::{clamp01, Availability, Details, Detector, DetectorResult, Scores};
use crate::config::SightengineConfig;
use crate::frames::Frame;
use crate::output::truncate_chars;
use crate::resilience::{classify_http, fingerprint, ApiGuard, CachedResponse, CallError, CallOutcome};

/// Accept `a,b`, `['a', 'b']` or `["a","b"]`; dedup, keep order.
pub fn normalize_models(raw: &str) -> String {
    let mut s = raw.trim();
    if s.starts_with('[') && s.ends_with(']') && s.len() >= 2 {
        s = s[1..s.len() - 1].trim();
    }

    let strip = |m: &str| -> String {
        let m = m.trim().trim_matches(|c| c == '"' || c == '\'');
        let m = m.trim().trim_start_matches('[').trim_end_matches(']');
        m.trim().trim_matches(|c| c == '"' || c == '\'').to_string()
    };

    let mut out: Vec<String> = Vec::new();
    for item in s.split(',').map(strip) {
        if !item.is_empty() && !out.contains(&item) {
            out.push(item);
        }
    }
    out.join(",")
}

fn num(v: Option<&Value>) -> f64 {
    v.and_then(Value::as_f64).unwrap_or(0.0)
}

fn pick<'a>(data: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| data.get(*k))
}

const NON_SUGGESTIVE: &[&str] = &[
    "none",
    "safe",
    "neutral",
    "other",
    "non_suggestive",
    "normal",
    "ok",
    "no_nudity",
    "non_nudity",
    "clothed",
    "fully_clothed",
    "covered",
    "not_nude",
    "nonnude",
];

/// Largest number anywhere under `value`, skipping safe-sounding labels.
fn suggestive_max(value: &Value) -> f64 {
    match value {
        Value::Object(map) => map
            .iter()
            .filter(|(k, _)| !NON_SUGGESTIVE.contains(&k.trim().to_lowercase().as_str()))
            .map(|(_, v)| match v {
                Value::Number(n) => n.as_f64().unwrap_or(0.0),
                other => suggestive_max(other),
            })
            .fold(0.0, f64::max),
        Value::Array(items) => items.iter().map(suggestive_max).fold(0.0, f64::max),
        _ => 0.0,
    }
}

fn extract_nudity(nud: &Map<String, Value>, scores: &mut Scores) {
    let mut legacy = false;
    for key in ["raw", "partial", "safe"] {
        if let Some(v) = nud.get(key).and_then(Value::as_f64) {
            scores.insert(format!("nudity_{key}"), v);
            legacy = true;
        }
    }
    if legacy {
        return;
    }

    // nudity-2.1 intensity classes.
    let safe = clamp01(num(nud.get("none").or_else(|| nud.get("safe"))));
    let raw = ["sexual_activity", "sexual_display", "erotica"]
        .iter()
        .map(|k| num(nud.get(*k)))
        .fold(0.0, f64::max);
    let intensity = ["very_suggestive", "suggestive", "mildly_suggestive"]
        .iter()
        .map(|k| num(nud.get(*k)))
        .fold(0.0, f64::max);
    let classes = nud.get("suggestive_classes").map(suggestive_max).unwrap_or(0.0);

    let mut partial = clamp01(intensity.max(classes));
    if safe > 0.0 {
        partial = partial.min((1.0 - safe).max(0.0));
    }
    scores.insert("nudity_safe".into(), safe);
    scores.insert("nudity_raw".into(), clamp01(raw));
    scores.insert("nudity_partial".into(), partial);
}

fn insert_numbers(map: Option<&Value>, prefix: &str, scores: &mut Scores) {
    if let Some(Value::Object(map)) = map {
        for (k, v) in map {
            if let Some(v) = v.as_f64() {
                scores.insert(format!("{prefix}{k}"), v);
            }
        }
    }
}

fn extract_weapon(wpn: &Map<String, Value>, scores: &mut Scores) {
    insert_numbers(wpn.get("classes"), "weapon_", scores);
    for key in ["firearm", "knife", "firearm_toy", "firearm_gesture"] {
        if let Some(v) = wpn.get(key).and_then(Value::as_f64) {
            scores.insert(format!("weapon_{key}"), v);
        }
    }
    insert_numbers(wpn.get("firearm_type"), "weapon_firearm_type_", scores);
    let action = wpn
        .get("firearm_action")
        .filter(|v| v.is_object())
        .or_else(|| wpn.get("firearm_gesture"));
    insert_numbers(action, "weapon_firearm_action_", scores);
}

/// `prob`, `classes.*` and flat numeric fields under one model key.
fn extract_prob_classes(model: &Value, prefix: &str, scores: &mut Scores) {
    match model {
        Value::Number(n) => {
            scores.insert(format!("{prefix}_prob"), n.as_f64().unwrap_or(0.0));
        }
        Value::Object(map) => {
            if let Some(prob) = map.get("prob").and_then(Value::as_f64) {
                scores.insert(format!("{prefix}_prob"), prob);
            }
            insert_numbers(map.get("classes"), &format!("{prefix}_"), scores);
            for (k, v) in map {
                if k == "prob" || k == "classes" {
                    continue;
                }
                if let Some(v) = v.as_f64() {
                    scores.insert(format!("{prefix}_{k}"), v);
                }
            }
        }
        _ => {}
    }
}

fn offensive_max(off: &Map<String, Value>) -> Option<f64> {
    let prob = off.get("prob").and_then(Value::as_f64);
    let classes = off
        .get("classes")
        .and_then(Value::as_object)
        .into_iter()
        .flat_map(|c| c.values().filter_map(Value::as_f64));
    let flat = off
        .iter()
        .filter(|(k, _)| *k != "prob" && *k != "classes")
        .filter_map(|(_, v)| v.as_f64());
    prob.into_iter().chain(classes).chain(flat).reduce(f64::max)
}

/// Flatten one check.json response into scores.
pub fn extract_scores(data: &Value) -> Scores {
    let mut scores = Scores::new();

    if let Some(ops) = data.get("operations").and_then(Value::as_f64) {
        scores.insert("operations_used".into(), ops);
    }
    if let Some(Value::Object(nud)) = pick(data, &["nudity", "nudity-2.1", "nudity_2_1"]) {
        extract_nudity(nud, &mut scores);
    }
    if let Some(Value::Object(wpn)) = pick(data, &["weapon", "weapons"]) {
        extract_weapon(wpn, &mut scores);
    }
    if let Some(gore) = pick(data, &["gore", "gore-2.0", "gore_2_0"]) {
        extract_prob_classes(gore, "gore", &mut scores);
    }
    if let Some(violence) = pick(data, &["violence", "violence-2.0", "violence_2_0"]) {
        extract_prob_classes(violence, "violence", &mut scores);
    }
    if let Some(off) = pick(data, &["offensive", "offensive-2.0", "offensive_2_0"]) {
        match off {
            Value::Number(n) => {
                scores.insert("offensive_max".into(), n.as_f64().unwrap_or(0.0));
            }
            Value::Object(map) => {
                extract_prob_classes(off, "offensive", &mut scores);
                if let Some(max) = offensive_max(map) {
                    scores.insert("offensive_max".into(), max);
                }
            }
            _ => {}
        }
    }
    scores
}

/// Reject `status != success` bodies; quota/limit messages disable the vendor.
pub fn check_status(data: &Value) -> Result<(), CallError> {
    if data.get("status").and_then(Value::as_str) == Some("success") {
        return Ok(());
    }
    let message = data
        .get("error")
        .map(|e| match e.get("message").and_then(Value::as_str) {
            Some(m) => m.to_string(),
            None => e.to_string(),
        })
        .or_else(|| data.get("message").and_then(Value::as_str).map(String::from))
        .unwrap_or_else(|| data.to_string());
    let message = truncate_chars(&message, 400);

    let lower = message.to_lowercase();
    if lower.contains("quota") || lower.contains("limit") {
        return Err(CallError::Quota(message));
    }
    Err(CallError::Other(anyhow::anyhow!("Sightengine error: {message}")))
}

pub struct SightengineDetector {
    config: SightengineConfig,
    client: Client,
    guard: Arc<ApiGuard>,
}

impl SightengineDetector {
    pub fn new(config: SightengineConfig, guard: Arc<ApiGuard>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.api.request_timeout)
            .build()
            .context("Failed to build Sightengine HTTP client")?;
        Ok(Self {
            config,
            client,
            guard,
        })
    }

    async fn check(&self, jpeg: &[u8]) -> Result<CachedResponse, CallError> {
        let (Some(user), Some(secret)) = (&self.config.api_user, &self.config.api_secret) else {
            return Err(CallError::Auth("SIGHTENGINE_USER / SIGHTENGINE_SECRET not set".into()));
        };

        let media = Part::bytes(jpeg.to_vec())
            .file_name("frame.jpg")
            .mime_str("image/jpeg")?;
        let form = Form::new()
            .text("models", self.config.models.clone())
            .text("api_user", user.clone())
            .text("api_secret", secret.clone())
            .part("media", media);

        let response = self
            .client
            .post(&self.config.endpoint)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(classify_http(status, &headers, &body));
        }

        let data: Value = serde_json::from_str(&body)
            .with_context(|| format!("Sightengine returned non-JSON: {}", truncate_chars(&body, 200)))?;
        check_status(&data)?;

        Ok(CachedResponse {
            scores: extract_scores(&data),
            details: Details::new(),
        })
    }
}

#[async_trait]
impl Detector for SightengineDetector {
    fn name(&self) -> &str {
        names::SIGHTENGINE
    }

    fn availability(&self) -> Availability {
        if self.config.disabled {
            return Availability::Unavailable("disabled via SIGHTENGINE_DISABLE=1".into());
        }
        if let Some(reason) = self.guard.disabled_reason() {
            return Availability::Unavailable(reason);
        }
        if self.config.api_user.is_none() || self.config.api_secret.is_none() {
            return Availability::Unavailable("SIGHTENGINE_USER / SIGHTENGINE_SECRET not set".into());
        }
        Availability::Ready
    }

    async fn run(&self, _path: &Path, frames: &[Frame], max_api_frames: usize) -> Result<DetectorResult> {
        if frames.is_empty() {
            return Ok(DetectorResult::skipped(self.name(), "no frames"));
        }
        let use_frames = &frames[..max_api_frames.max(1).min(frames.len())];
        let identity = format!("sightengine:{}", self.config.models);

        let mut best = Scores::new();
        let mut per_frame = Vec::with_capacity(use_frames.len());
        let mut all_cached = true;
        for frame in use_frames {
            let jpeg = frame.jpeg_bytes()?;
            let key = fingerprint(&identity, "", [jpeg]);

            let (response, cached) = match self.guard.call(&key, move || self.check(jpeg)).await {
                CallOutcome::Fresh(r) => (r, false),
                CallOutcome::Cached(r) => (r, true),
                CallOutcome::Skipped(reason) => return Ok(DetectorResult::skipped(self.name(), reason)),
            };
            all_cached &= cached;

            for (k, v) in &response.scores {
                let slot = best.entry(k.clone()).or_insert(0.0);
                *slot = slot.max(*v);
            }
            per_frame.push(json!({"frame": frame.idx, "scores": response.scores, "cache_hit": cached}));
        }
        debug!(frames = use_frames.len(), keys = best.len(), "Sightengine scored");

        let mut result = DetectorResult::ok(self.name(), best)
            .with_detail("per_frame", per_frame)
            .with_detail("frames_used", json!(use_frames.iter().map(|f| f.idx).collect::<Vec<_>>()))
            .with_detail("models", self.config.models.clone());
        if all_cached {
            result = result.with_detail("cache_hit", true);
        }
        Ok(result)
    }

    fn disable(&self, reason: &str) {
        self.guard.disable(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_models_variants() {
        assert_eq!(normalize_models("nudity-2.1,weapon"), "nudity-2.1,weapon");
        assert_eq!(normalize_models("['nudity-2.1', 'weapon']"), "nudity-2.1,weapon");
        assert_eq!(normalize_models(" [\"gore-2.0\",\"gore-2.0\", offensive-2.0 ] "), "gore-2.0,offensive-2.0");
        assert_eq!(normalize_models(""), "");
    }

    #[test]
    fn test_extract_legacy_nudity() {
        let s = extract_scores(&json!({"nudity": {"raw": 0.1, "partial": 0.7, "safe": 0.2}}));
        assert_eq!(s["nudity_raw"], 0.1);
        assert_eq!(s["nudity_partial"], 0.7);
        assert_eq!(s["nudity_safe"], 0.2);
    }

    #[test]
    fn test_extract_nudity_21_caps_partial_by_safe() {
        let s = extract_scores(&json!({
            "nudity": {
                "sexual_activity": 0.01,
                "erotica": 0.05,
                "suggestive": 0.3,
                "none": 0.9,
                "suggestive_classes": {"bikini": 0.8, "cleavage_categories": {"very_revealing": 0.6, "none": 0.99}}
            }
        }));
        assert_eq!(s["nudity_raw"], 0.05);
        assert_eq!(s["nudity_safe"], 0.9);
        assert!((s["nudity_partial"] - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_extract_weapon_gore_violence_offensive() {
        let s = extract_scores(&json!({
            "operations": 5,
            "weapon": {
                "classes": {"firearm": 0.8, "knife": 0.1, "firearm_toy": 0.05},
                "firearm_type": {"animated": 0.6},
                "firearm_action": {"aiming_threat": 0.4}
            },
            "gore": {"prob": 0.02, "classes": {"very_bloody": 0.3}},
            "violence": {"prob": 0.1, "classes": {"physical_violence": 0.4}},
            "offensive": {"prob": 0.2, "nazi": 0.7}
        }));
        assert_eq!(s["operations_used"], 5.0);
        assert_eq!(s["weapon_firearm"], 0.8);
        assert_eq!(s["weapon_firearm_type_animated"], 0.6);
        assert_eq!(s["weapon_firearm_action_aiming_threat"], 0.4);
        assert_eq!(s["gore_prob"], 0.02);
        assert_eq!(s["gore_very_bloody"], 0.3);
        assert_eq!(s["violence_physical_violence"], 0.4);
        assert_eq!(s["offensive_nazi"], 0.7);
        assert_eq!(s["offensive_max"], 0.7);
    }

    #[test]
    fn test_check_status_classifies_quota() {
        assert!(check_status(&json!({"status": "success"})).is_ok());
        let quota = json!({"status": "failure", "error": {"type": "usage_limit", "message": "Daily usage limit reached"}});
        assert!(matches!(check_status(&quota), Err(CallError::Quota(_))));
        let other = json!({"status": "failure", "error": {"message": "media too large"}});
        assert!(matches!(check_status(&other), Err(CallError::Other(_))));
    }
}
