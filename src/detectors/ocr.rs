// OCR text detector: read text off the first frames and match it against a
// blocklist of case-insensitive patterns.
//
// Recognition sits behind `TextRecognizer` so the tesseract subprocess can
// be swapped out (tests inject a fake). Patterns that don't compile as a
// regex are matched literally. The compiled list is cached by file mtime.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use regex_lite::{Regex, RegexBuilder};
use tokio::process::Command;
use tracing::{debug, warn};

use super::names;
use super::traits::{Availability, Detector, DetectorResult, DisableFlag, Scores};
use crate::config::OcrConfig;
use crate::frames::Frame;
use crate::output::truncate_chars;

const MAX_TEXT_CHARS: usize = 2000;

/// Turns a frame into text.
#[async_trait]
pub trait TextRecognizer: Send + Sync {
    fn availability(&self) -> Availability;

    async fn recognize(&self, frame: &Frame) -> Result<String>;
}

/// Runs the `tesseract` CLI on a temporary PNG of the frame.
pub struct TesseractRecognizer {
    command: String,
    lang: String,
}

impl TesseractRecognizer {
    pub fn new(command: &str, lang: &str) -> Self {
        Self {
            command: command.to_string(),
            lang: lang.to_string(),
        }
    }

    fn resolve_command(&self) -> Option<PathBuf> {
        let candidate = Path::new(&self.command);
        if candidate.components().count() > 1 {
            return candidate.is_file().then(|| candidate.to_path_buf());
        }
        let paths = env::var_os("PATH")?;
        env::split_paths(&paths).find_map(|dir| {
            [self.command.clone(), format!("{}.exe", self.command)]
                .into_iter()
                .map(|name| dir.join(name))
                .find(|p| p.is_file())
        })
    }
}

#[async_trait]
impl TextRecognizer for TesseractRecognizer {
    fn availability(&self) -> Availability {
        match self.resolve_command() {
            Some(_) => Availability::Ready,
            None => Availability::Unavailable(format!(
                "tesseract not found (TESSERACT_CMD={})",
                self.command
            )),
        }
    }

    async fn recognize(&self, frame: &Frame) -> Result<String> {
        let png = env::temp_dir().join(format!("modgate-ocr-{:016x}.png", rand::random::<u64>()));
        frame
            .image
            .to_rgb8()
            .save(&png)
            .with_context(|| format!("failed to write OCR input {}", png.display()))?;

        let output = Command::new(&self.command)
            .arg(&png)
            .arg("stdout")
            .arg("-l")
            .arg(&self.lang)
            .output()
            .await;
        let _ = tokio::fs::remove_file(&png).await;

        let output = output.with_context(|| format!("failed to run {}", self.command))?;
        if !output.status.success() {
            bail!(
                "tesseract exited with {}: {}",
                output.status,
                truncate_chars(String::from_utf8_lossy(&output.stderr).trim(), 200)
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Lowercase non-ASCII characters only.
///
/// regex-lite folds case for ASCII alone, so non-ASCII letters are folded on
/// both sides instead. ASCII is left alone because escapes like `\S` and
/// `\W` are case-sensitive.
pub fn fold_non_ascii(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            out.extend(c.to_lowercase());
        }
    }
    out
}

/// Compile blocklist lines; invalid regexes fall back to literal matches.
pub fn compile_patterns(text: &str) -> Vec<Regex> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = fold_non_ascii(line);
            RegexBuilder::new(&line)
                .case_insensitive(true)
                .build()
                .or_else(|_| {
                    RegexBuilder::new(&regex_lite::escape(&line))
                        .case_insensitive(true)
                        .build()
                })
                .ok()
        })
        .collect()
}

pub struct OcrDetector {
    config: OcrConfig,
    recognizer: Box<dyn TextRecognizer>,
    patterns: Mutex<Option<(SystemTime, Arc<Vec<Regex>>)>>,
    disabled: DisableFlag,
}

impl OcrDetector {
    pub fn new(config: OcrConfig, recognizer: Box<dyn TextRecognizer>) -> Self {
        Self {
            config,
            recognizer,
            patterns: Mutex::new(None),
            disabled: DisableFlag::new(),
        }
    }

    pub fn with_tesseract(config: OcrConfig) -> Self {
        let recognizer = TesseractRecognizer::new(&config.tesseract_cmd, &config.lang);
        Self::new(config, Box::new(recognizer))
    }

    fn load_patterns(&self) -> Result<Arc<Vec<Regex>>> {
        let path = &self.config.blocklist;
        let mtime = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .with_context(|| format!("failed to stat {}", path.display()))?;

        let mut cached = self.patterns.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((cached_mtime, patterns)) = cached.as_ref() {
            if *cached_mtime == mtime {
                return Ok(Arc::clone(patterns));
            }
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let patterns = Arc::new(compile_patterns(&text));
        debug!(count = patterns.len(), "Loaded OCR blocklist");
        *cached = Some((mtime, Arc::clone(&patterns)));
        Ok(patterns)
    }
}

#[async_trait]
impl Detector for OcrDetector {
    fn name(&self) -> &str {
        names::OCR
    }

    fn availability(&self) -> Availability {
        if let Some(reason) = self.disabled.reason() {
            return Availability::Unavailable(reason);
        }
        if !self.config.enabled {
            return Availability::Unavailable("disabled (set OCR_ENABLE=1)".into());
        }
        if !self.config.blocklist.exists() {
            return Availability::Unavailable(format!(
                "blocklist not found ({})",
                self.config.blocklist.display()
            ));
        }
        self.recognizer.availability()
    }

    async fn run(&self, _path: &Path, frames: &[Frame], _max_api_frames: usize) -> Result<DetectorResult> {
        let patterns = self.load_patterns()?;
        if patterns.is_empty() {
            return Ok(DetectorResult::skipped(self.name(), "ocr blocklist empty"));
        }

        let mut texts = Vec::new();
        let mut attempted = 0;
        let mut failures = Vec::new();
        for frame in frames.iter().take(self.config.max_frames.max(1)) {
            attempted += 1;
            match self.recognizer.recognize(frame).await {
                Ok(text) if !text.trim().is_empty() => texts.push(text),
                Ok(_) => {}
                Err(e) => {
                    warn!(frame = frame.idx, error = %e, "OCR failed on frame");
                    failures.push(e);
                }
            }
        }
        // A recognizer that fails on every frame is an outage, not clean text.
        if attempted > 0 && failures.len() == attempted {
            if let Some(e) = failures.pop() {
                return Err(e.context(format!("OCR failed on all {attempted} frame(s)")));
            }
        }

        let joined = texts.join("\n").trim().to_string();
        let mut scores = Scores::new();
        if joined.chars().count() < self.config.min_len {
            scores.insert("ocr_match".into(), 0.0);
            return Ok(DetectorResult::ok(self.name(), scores).with_detail("text", ""));
        }

        let folded = fold_non_ascii(&joined);
        let hit = patterns
            .iter()
            .find(|p| p.is_match(&folded))
            .map(|p| p.as_str().to_string());
        scores.insert("ocr_match".into(), if hit.is_some() { 1.0 } else { 0.0 });
        if let Some(pattern) = &hit {
            debug!(pattern = %pattern, "OCR text matched blocklist");
        }

        Ok(DetectorResult::ok(self.name(), scores)
            .with_detail("hit", hit)
            .with_detail("text", truncate_chars(&joined, MAX_TEXT_CHARS)))
    }

    fn disable(&self, reason: &str) {
        self.disabled.disable(reason);
    }
}
