use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

use crate::resilience::{CacheSettings, RateLimitPolicy, RetryPolicy};
use crate::verdict::VerdictConfig;

/// Read-only view over a key/value source, normally the process environment.
///
/// Every getter falls back to its default on a missing or unparsable value
/// (with a warning), so a typo in `.env` never stops a batch.
pub struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

fn process_env(key: &str) -> Option<String> {
    env::var(key).ok()
}

impl<'a> Env<'a> {
    pub fn new(lookup: &'a dyn Fn(&str) -> Option<String>) -> Self {
        Self { lookup }
    }

    pub fn process() -> Env<'static> {
        Env { lookup: &process_env }
    }

    /// Trimmed value, `None` when unset or blank.
    pub fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    pub fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    pub fn flag(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            None => default,
            Some(raw) => match parse_flag(&raw) {
                Some(v) => v,
                None => {
                    warn!(key, value = %raw, "Not a boolean, using default");
                    default
                }
            },
        }
    }

    /// Like `flag`, but `None` when unset so callers can layer defaults.
    pub fn opt_flag(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|raw| parse_flag(&raw))
    }

    pub fn f64(&self, key: &str, default: f64) -> f64 {
        self.parsed(key, default, |raw| raw.parse::<f64>().ok().filter(|v| v.is_finite()))
    }

    pub fn u32(&self, key: &str, default: u32) -> u32 {
        self.parsed(key, default, |raw| raw.parse().ok())
    }

    pub fn usize(&self, key: &str, default: usize) -> usize {
        self.parsed(key, default, |raw| raw.parse().ok())
    }

    /// Non-negative seconds that fit in a `Duration`; anything else is a
    /// bad value and falls back to the default.
    pub fn secs(&self, key: &str, default_secs: f64) -> Duration {
        let default = Duration::try_from_secs_f64(default_secs.max(0.0)).unwrap_or_default();
        self.parsed(key, default, |raw| {
            raw.parse::<f64>()
                .ok()
                .filter(|v| *v >= 0.0)
                .and_then(|v| Duration::try_from_secs_f64(v).ok())
        })
    }

    pub fn path(&self, key: &str, default: PathBuf) -> PathBuf {
        self.get(key).map(PathBuf::from).unwrap_or(default)
    }

    fn parsed<T: Copy>(&self, key: &str, default: T, parse: impl Fn(&str) -> Option<T>) -> T {
        match self.get(key) {
            None => default,
            Some(raw) => parse(&raw).unwrap_or_else(|| {
                warn!(key, value = %raw, "Unparsable value, using default");
                default
            }),
        }
    }
}

pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Root for lists, caches and models: `MODGATE_DATA_DIR` or `<data_dir>/modgate`.
pub fn default_data_dir(env: &Env) -> PathBuf {
    env.get("MODGATE_DATA_DIR").map(PathBuf::from).unwrap_or_else(|| {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("modgate")
    })
}

/// Central configuration loaded from environment variables.
///
/// Secrets come from env vars only. The .env file is loaded at startup via
/// dotenvy before this runs.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub pipeline: PipelineConfig,
    pub phash: PhashConfig,
    pub openai: OpenAiConfig,
    pub sightengine: SightengineConfig,
    pub ocr: OcrConfig,
    pub models: ModelConfig,
    pub verdict: VerdictConfig,
    pub display: DisplayConfig,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Stop after the pHash lists when one of them matches.
    pub short_circuit: bool,
    /// Frames sampled from animations.
    pub sample_frames: usize,
    /// Frames each API detector may send.
    pub max_api_frames: usize,
    /// Inputs processed concurrently in a batch.
    pub concurrency: usize,
    pub auto_learn: AutoLearnConfig,
}

#[derive(Debug, Clone)]
pub struct AutoLearnConfig {
    pub allow_append: bool,
    pub block_append: bool,
    /// Learn the last frame of animations as well as the first.
    pub first_and_last: bool,
    pub allow_label: String,
    pub block_label: String,
}

impl AutoLearnConfig {
    pub fn disabled() -> Self {
        Self {
            allow_append: false,
            block_append: false,
            first_and_last: false,
            allow_label: "ok".into(),
            block_label: "not_ok".into(),
        }
    }

    fn from_env(env: &Env) -> Self {
        let master = env.flag("PHASH_AUTO_LEARN_ENABLE", false);
        let legacy_append = env.flag("PHASH_AUTO_APPEND", false);
        let explicit_allow = env.opt_flag("PHASH_AUTO_ALLOW_APPEND");
        let explicit_block = env.opt_flag("PHASH_AUTO_BLOCK_APPEND");

        let (allow_append, block_append) = if master {
            (explicit_allow.unwrap_or(true), explicit_block.unwrap_or(true))
        } else if legacy_append || explicit_allow == Some(true) {
            // Older setups only ever learned from OK verdicts.
            (true, explicit_block.unwrap_or(false))
        } else {
            (false, false)
        };

        let shared_label = env.get("PHASH_AUTO_LABEL");
        Self {
            allow_append,
            block_append,
            first_and_last: env.flag("PHASH_GIF_LEARN_FIRST_LAST", false),
            allow_label: env
                .get("PHASH_AUTO_ALLOW_LABEL")
                .or_else(|| shared_label.clone())
                .unwrap_or_else(|| "ok".into()),
            block_label: env
                .get("PHASH_AUTO_BLOCK_LABEL")
                .or(shared_label)
                .unwrap_or_else(|| "not_ok".into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PhashConfig {
    pub allowlist: PathBuf,
    pub blocklist: PathBuf,
    pub max_distance: u32,
    /// Fall back to Hamming-distance matching when there's no exact hit.
    pub nearest: bool,
    /// Also hash the last frame of animations.
    pub check_last_frame: bool,
}

impl PhashConfig {
    /// Max distance for lookups, or `None` when nearest matching is off.
    pub fn nearest_distance(&self) -> Option<u32> {
        self.nearest.then_some(self.max_distance)
    }
}

/// Transport and resilience settings shared by both vendor clients.
#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub min_interval_secs: f64,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub cache: CacheSettings,
}

impl ApiSettings {
    fn from_env(env: &Env, prefix: &str, cache_path: PathBuf) -> Self {
        let key = |name: &str| format!("{prefix}_{name}");
        let on_rate_limit = env
            .get(&key("429_POLICY"))
            .map(|raw| {
                RateLimitPolicy::parse(&raw).unwrap_or_else(|| {
                    warn!(key = %key("429_POLICY"), value = %raw, "Unknown 429 policy, using retry");
                    RateLimitPolicy::Retry
                })
            })
            .unwrap_or(RateLimitPolicy::Retry);

        Self {
            min_interval_secs: env.secs(&key("MIN_INTERVAL_SEC"), 1.0).as_secs_f64(),
            request_timeout: env.secs(&key("REQUEST_TIMEOUT_SEC"), 20.0),
            retry: RetryPolicy {
                max_retries: env.u32(&key("MAX_RETRIES"), 6),
                max_rate_limit_retries: env.u32(&key("MAX_429_RETRIES"), 3),
                backoff_base: env.secs(&key("BACKOFF_BASE_SEC"), 1.0),
                backoff_max: env.secs(&key("BACKOFF_MAX_SEC"), 10.0),
                max_total_sleep: env.secs(&key("MAX_TOTAL_SLEEP_SEC"), 30.0),
                on_rate_limit,
            },
            cache: CacheSettings {
                enabled: env.flag(&key("CACHE_ENABLE"), true),
                path: Some(env.path(&key("CACHE_PATH"), cache_path)),
                max_items: env.usize(&key("CACHE_MAX_ITEMS"), 2000),
                flush_every: env.usize(&key("CACHE_FLUSH_EVERY"), 25),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub disabled: bool,
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    /// Optional text sent alongside the images.
    pub extra_text: String,
    pub api: ApiSettings,
}

#[derive(Debug, Clone)]
pub struct SightengineConfig {
    pub disabled: bool,
    pub api_user: Option<String>,
    pub api_secret: Option<String>,
    /// Normalized comma-separated model list.
    pub models: String,
    pub endpoint: String,
    pub api: ApiSettings,
}

#[derive(Debug, Clone)]
pub struct OcrConfig {
    pub enabled: bool,
    pub blocklist: PathBuf,
    pub tesseract_cmd: String,
    pub lang: String,
    pub max_frames: usize,
    pub min_len: usize,
}

#[derive(Debug, Clone)]
pub struct OnnxModelConfig {
    pub disabled: bool,
    pub model: PathBuf,
}

#[derive(Debug, Clone)]
pub struct YoloConfig {
    pub disabled: bool,
    pub model: PathBuf,
    pub labels: PathBuf,
    pub conf: f64,
    pub imgsz: u32,
    pub max_frames: usize,
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub nudenet: OnnxModelConfig,
    pub opennsfw2: OnnxModelConfig,
    pub yolo: YoloConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SightengineScoreMode {
    Compact,
    Full,
    Keys,
}

#[derive(Debug, Clone)]
pub struct DisplayConfig {
    pub verbose: bool,
    pub max_keys: usize,
    pub sightengine_mode: SightengineScoreMode,
    pub sightengine_keys: Vec<String>,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            max_keys: 8,
            sightengine_mode: SightengineScoreMode::Compact,
            sightengine_keys: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn load() -> Result<Self> {
        Self::from_env(&Env::process())
    }

    pub fn from_env(env: &Env) -> Result<Self> {
        let data_dir = default_data_dir(env);
        let lists = data_dir.join("lists");
        let caches = data_dir.join("cache");
        let models = data_dir.join("models");

        let pipeline = PipelineConfig {
            short_circuit: env.flag("SHORT_CIRCUIT_PHASH", true),
            sample_frames: env.usize("SAMPLE_FRAMES", 12).max(1),
            max_api_frames: env.usize("MAX_API_FRAMES", 3).max(1),
            concurrency: env.usize("MODGATE_CONCURRENCY", 1).max(1),
            auto_learn: AutoLearnConfig::from_env(env),
        };

        let phash = PhashConfig {
            allowlist: env.path("PHASH_ALLOWLIST", lists.join("phash_allowlist.txt")),
            blocklist: env.path("PHASH_BLOCKLIST", lists.join("phash_blocklist.txt")),
            max_distance: env.u32("PHASH_MAX_DISTANCE", 4),
            nearest: env.flag("PHASH_NEAREST_ENABLE", true),
            check_last_frame: env.flag("PHASH_CHECK_LAST_FRAME", false),
        };

        let openai = OpenAiConfig {
            disabled: env.flag("OPENAI_DISABLE", false),
            api_key: env.get("OPENAI_API_KEY").filter(|k| !is_placeholder(k)),
            model: env.string("OPENAI_MODERATION_MODEL", "omni-moderation-latest"),
            base_url: env
                .string("OPENAI_BASE_URL", "https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            extra_text: env.string("OPENAI_EXTRA_TEXT", ""),
            api: ApiSettings::from_env(env, "OPENAI", caches.join("openai_cache.json")),
        };

        let sightengine = SightengineConfig {
            disabled: env.flag("SIGHTENGINE_DISABLE", false),
            api_user: env.get("SIGHTENGINE_USER"),
            api_secret: env.get("SIGHTENGINE_SECRET"),
            models: crate::detectors::sightengine::normalize_models(&env.string(
                "SIGHTENGINE_MODELS",
                "nudity-2.1,weapon,violence,gore-2.0,offensive-2.0",
            )),
            endpoint: env.string(
                "SIGHTENGINE_ENDPOINT",
                "https://api.sightengine.com/1.0/check.json",
            ),
            api: ApiSettings::from_env(env, "SIGHTENGINE", caches.join("sightengine_cache.json")),
        };

        let ocr = OcrConfig {
            enabled: env.flag("OCR_ENABLE", false),
            blocklist: env.path("OCR_BLOCKLIST", lists.join("ocr_blocklist.txt")),
            tesseract_cmd: env.string("TESSERACT_CMD", "tesseract"),
            lang: env.string("OCR_LANG", "eng"),
            max_frames: env.usize("OCR_MAX_FRAMES", 2).max(1),
            min_len: env.usize("OCR_MIN_LEN", 3),
        };

        let models = ModelConfig {
            nudenet: OnnxModelConfig {
                disabled: env.flag("NUDENET_DISABLE", false),
                model: env.path("NUDENET_MODEL", models.join("nudenet_320n.onnx")),
            },
            opennsfw2: OnnxModelConfig {
                disabled: env.flag("OPENNSFW2_DISABLE", false),
                model: env.path("OPENNSFW2_MODEL", models.join("open_nsfw2.onnx")),
            },
            yolo: YoloConfig {
                disabled: env.flag("YOLO_DISABLE", false),
                model: env.path("YOLO_MODEL", models.join("yolo_weapons.onnx")),
                labels: env.path("YOLO_LABELS", models.join("yolo_weapons.txt")),
                conf: env.f64("YOLO_CONF", 0.25),
                imgsz: env.u32("YOLO_IMGSZ", 640).max(32),
                max_frames: env.usize("YOLO_MAX_FRAMES", 2).max(1),
            },
        };

        let display = DisplayConfig {
            verbose: env.flag("SCORE_VERBOSE", false),
            max_keys: env.usize("SCORE_MAX_KEYS", 8),
            sightengine_mode: match env.string("SIGHTENGINE_SCORE_MODE", "compact").to_ascii_lowercase().as_str() {
                "full" => SightengineScoreMode::Full,
                "keys" => SightengineScoreMode::Keys,
                _ => SightengineScoreMode::Compact,
            },
            sightengine_keys: env
                .string("SIGHTENGINE_SCORE_KEYS", "")
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect(),
        };

        Ok(Self {
            data_dir,
            pipeline,
            phash,
            openai,
            sightengine,
            ocr,
            models,
            verdict: VerdictConfig::from_env(env),
            display,
        })
    }

    /// List file for learned hashes of the given kind.
    pub fn list_path(&self, kind: crate::phash::ListKind) -> &Path {
        match kind {
            crate::phash::ListKind::Allow => &self.phash.allowlist,
            crate::phash::ListKind::Block => &self.phash.blocklist,
        }
    }
}

/// Template values people forget to replace in `.env`.
fn is_placeholder(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    lower.contains("your_") || lower.contains("xxxx") || lower == "sk-..." || lower == "changeme"
}
