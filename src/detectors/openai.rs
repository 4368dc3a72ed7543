// OpenAI Moderation (omni-moderation) over up to `max_api_frames` frames.
//
// One request carries the optional text prompt plus every selected frame as
// a JPEG data URL. The call goes through the vendor's ApiGuard, so the
// response is cached by content fingerprint and a dead key disables the
// detector for the rest of the run.
//
// API docs: https://platform.openai.com/docs/api-reference/moderations

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use super::names;
use super::traits::{clamp01, Availability, Details, Detector, DetectorResult, Scores};
use crate::config::OpenAiConfig;
use crate::frames::Frame;
use crate::resilience::{classify_http, fingerprint, ApiGuard, CachedResponse, CallError, CallOutcome};

/// Categories reported as scores, in the vendor's naming.
pub const CATEGORIES: [&str; 13] = [
    "sexual",
    "sexual/minors",
    "violence",
    "violence/graphic",
    "self-harm",
    "self-harm/intent",
    "self-harm/instructions",
    "hate",
    "hate/threatening",
    "harassment",
    "harassment/threatening",
    "illicit",
    "illicit/violent",
];

pub struct OpenAiDetector {
    config: OpenAiConfig,
    client: Client,
    guard: Arc<ApiGuard>,
}

impl OpenAiDetector {
    pub fn new(config: OpenAiConfig, guard: Arc<ApiGuard>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.api.request_timeout)
            .build()
            .context("Failed to build OpenAI HTTP client")?;
        Ok(Self {
            config,
            client,
            guard,
        })
    }

    async fn moderate(&self, request: &ModerationRequest<'_>, frames_used: &[usize]) -> Result<CachedResponse, CallError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| CallError::Auth("OPENAI_API_KEY not set".into()))?;

        let response = self
            .client
            .post(format!("{}/moderations", self.config.base_url))
            .bearer_auth(api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http(status, &headers, &body));
        }

        let body: Value = response
            .json()
            .await
            .context("Failed to parse OpenAI moderation response")?;
        Ok(parse_moderation(&body, frames_used, !self.config.extra_text.is_empty())?)
    }
}

#[derive(Serialize)]
struct ModerationRequest<'a> {
    model: &'a str,
    input: Vec<InputPart>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InputPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

fn image_part(jpeg: &[u8]) -> InputPart {
    InputPart::ImageUrl {
        image_url: ImageUrl {
            url: format!("data:image/jpeg;base64,{}", BASE64.encode(jpeg)),
        },
    }
}

/// Turn the first moderation result into scores and details.
pub fn parse_moderation(body: &Value, frames_used: &[usize], has_text: bool) -> Result<CachedResponse> {
    let result = body
        .get("results")
        .and_then(Value::as_array)
        .and_then(|r| r.first())
        .context("moderation response has no results")?;

    let category_scores = result.get("category_scores");
    let mut scores = Scores::new();
    for category in CATEGORIES {
        let value = category_scores
            .and_then(|s| s.get(category))
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        scores.insert(category.to_string(), clamp01(value));
    }
    let max_any = scores.values().copied().fold(0.0, f64::max);
    scores.insert("max_any_category".into(), max_any);
    let flagged = result.get("flagged").and_then(Value::as_bool).unwrap_or(false);
    scores.insert("flagged".into(), if flagged { 1.0 } else { 0.0 });

    let mut details = Details::new();
    details.insert(
        "categories".into(),
        result.get("categories").cloned().unwrap_or_else(|| json!({})),
    );
    details.insert("frames_used".into(), json!(frames_used));
    details.insert("has_text".into(), json!(has_text));
    details.insert(
        "category_applied_input_types".into(),
        result.get("category_applied_input_types").cloned().unwrap_or(Value::Null),
    );

    Ok(CachedResponse { scores, details })
}

#[async_trait]
impl Detector for OpenAiDetector {
    fn name(&self) -> &str {
        names::OPENAI
    }

    fn availability(&self) -> Availability {
        if self.config.disabled {
            return Availability::Unavailable("disabled via OPENAI_DISABLE=1".into());
        }
        if let Some(reason) = self.guard.disabled_reason() {
            return Availability::Unavailable(reason);
        }
        if self.config.api_key.is_none() {
            return Availability::Unavailable("OPENAI_API_KEY not set".into());
        }
        Availability::Ready
    }

    async fn run(&self, _path: &Path, frames: &[Frame], max_api_frames: usize) -> Result<DetectorResult> {
        if frames.is_empty() {
            return Ok(DetectorResult::skipped(self.name(), "no frames"));
        }
        let use_frames = &frames[..max_api_frames.max(1).min(frames.len())];
        let jpegs = use_frames
            .iter()
            .map(Frame::jpeg_bytes)
            .collect::<Result<Vec<&[u8]>>>()?;
        let frames_used: Vec<usize> = use_frames.iter().map(|f| f.idx).collect();

        let key = fingerprint(&self.config.model, &self.config.extra_text, jpegs.iter().copied());

        let mut input = Vec::with_capacity(jpegs.len() + 1);
        if !self.config.extra_text.is_empty() {
            input.push(InputPart::Text {
                text: self.config.extra_text.clone(),
            });
        }
        input.extend(jpegs.iter().map(|j| image_part(j)));
        let request = ModerationRequest {
            model: &self.config.model,
            input,
        };

        let request = &request;
        let frames_used = frames_used.as_slice();
        let outcome = self
            .guard
            .call(&key, move || self.moderate(request, frames_used))
            .await;

        Ok(match outcome {
            CallOutcome::Fresh(response) => {
                debug!(max_any = response.scores.get("max_any_category").copied().unwrap_or(0.0), "OpenAI moderation scored");
                DetectorResult::ok(self.name(), response.scores).with_details(response.details)
            }
            CallOutcome::Cached(response) => DetectorResult::ok(self.name(), response.scores)
                .with_details(response.details)
                .with_detail("cache_hit", true),
            CallOutcome::Skipped(reason) => DetectorResult::skipped(self.name(), reason),
        })
    }

    fn disable(&self, reason: &str) {
        self.guard.disable(reason);
    }
}
