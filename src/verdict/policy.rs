// Tunables for the verdict engine.
//
// Defaults mirror the production rule set. Every threshold can be overridden
// from the environment; the names are listed next to each field load below.

use std::collections::BTreeSet;

use tracing::warn;

use crate::config::Env;
use crate::detectors::names;

/// How errors from core detectors affect the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Carry on as if the detector had been skipped.
    Ignore,
    /// Raise every risk to the review floor.
    Review,
    /// Block immediately.
    Block,
}

impl ErrorPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ignore" | "lenient" | "loose" | "open" | "allow" => Some(ErrorPolicy::Ignore),
            "review" | "strict" | "hard" => Some(ErrorPolicy::Review),
            "block" | "not_ok" | "fail" | "fail_closed" | "deny" => Some(ErrorPolicy::Block),
            _ => None,
        }
    }
}

/// A down-weighted signal and the raw level at which it earns a reason.
///
/// Keeping the weight and trigger together means the reason can never
/// disagree with the risk the signal contributes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedThreshold {
    pub weight: f64,
    /// Raw (unweighted) level at which a reason is recorded.
    pub trigger: f64,
}

impl WeightedThreshold {
    pub fn risk(&self, raw: f64) -> f64 {
        (raw * self.weight).clamp(0.0, 1.0)
    }

    pub fn fires(&self, raw: f64) -> bool {
        raw >= self.trigger
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct YoloRules {
    pub firearm: f64,
    pub toy: f64,
    /// Let toy/uncertain firearms through.
    pub allow_toy: bool,
    pub dangerous_knife: f64,
    pub knife: f64,
    /// Count any knife, not just dangerous ones.
    pub knife_block_all: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SightengineRules {
    pub raw_nudity: f64,
    pub partial_nudity: WeightedThreshold,
    pub firearm: f64,
    pub block_any_firearm: bool,
    pub violence: f64,
    pub gore: f64,
    pub offensive: f64,
    pub knife: f64,
    pub knife_context: f64,
    pub knife_block_all: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenAiRules {
    /// Strictly-greater-than cutoff for `sexual/minors`.
    pub minors: f64,
    pub sexual: f64,
    pub violence: f64,
    pub hate: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerdictConfig {
    pub review_threshold: f64,
    pub block_threshold: f64,
    /// Detector names whose errors count. Empty means every detector.
    pub core_detectors: BTreeSet<String>,
    pub error_policy: ErrorPolicy,
    /// Risk floor applied by `ErrorPolicy::Review`.
    pub review_floor: f64,
    /// Risk floor applied by `ErrorPolicy::Block`.
    pub block_floor: f64,
    pub opennsfw2: f64,
    pub nudenet_exposed: f64,
    pub nudenet_covered: WeightedThreshold,
    pub yolo: YoloRules,
    pub sightengine: SightengineRules,
    pub openai: OpenAiRules,
}

pub fn default_core_detectors() -> BTreeSet<String> {
    [
        names::PHASH_ALLOWLIST,
        names::PHASH_BLOCKLIST,
        names::OCR,
        names::OPENAI,
        names::SIGHTENGINE,
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Map short aliases onto display names; unknown names pass through.
pub fn resolve_core_alias(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "phash_allowlist" | "phash_allow" => names::PHASH_ALLOWLIST.to_string(),
        "phash_blocklist" | "phash_block" => names::PHASH_BLOCKLIST.to_string(),
        "ocr" => names::OCR.to_string(),
        "openai" => names::OPENAI.to_string(),
        "sightengine" => names::SIGHTENGINE.to_string(),
        _ => raw.trim().to_string(),
    }
}

impl Default for VerdictConfig {
    fn default() -> Self {
        Self {
            review_threshold: 0.40,
            block_threshold: 0.85,
            core_detectors: default_core_detectors(),
            error_policy: ErrorPolicy::Review,
            review_floor: 0.40,
            block_floor: 0.50,
            opennsfw2: 0.50,
            nudenet_exposed: 0.40,
            nudenet_covered: WeightedThreshold {
                weight: 0.5,
                trigger: 0.80,
            },
            yolo: YoloRules {
                firearm: 0.35,
                toy: 0.25,
                allow_toy: false,
                dangerous_knife: 0.35,
                knife: 0.65,
                knife_block_all: false,
            },
            sightengine: SightengineRules {
                raw_nudity: 0.30,
                partial_nudity: WeightedThreshold {
                    weight: 0.6,
                    trigger: 0.70,
                },
                firearm: 0.35,
                block_any_firearm: false,
                violence: 0.30,
                gore: 0.20,
                offensive: 0.50,
                knife: 0.65,
                knife_context: 0.25,
                knife_block_all: false,
            },
            openai: OpenAiRules {
                minors: 0.01,
                sexual: 0.50,
                violence: 0.50,
                hate: 0.50,
            },
        }
    }
}

impl VerdictConfig {
    pub fn from_env(env: &Env) -> Self {
        let d = Self::default();

        let core_detectors = match env.get("CORE_ENGINES") {
            Some(raw) if raw == "*" || raw.eq_ignore_ascii_case("all") => BTreeSet::new(),
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(resolve_core_alias)
                .collect(),
            None => d.core_detectors.clone(),
        };

        let error_policy = match env.get("ENGINE_ERROR_POLICY") {
            None => d.error_policy,
            Some(raw) => ErrorPolicy::parse(&raw).unwrap_or_else(|| {
                warn!(value = %raw, "Unknown ENGINE_ERROR_POLICY, using review");
                ErrorPolicy::Review
            }),
        };

        let mut review_threshold = env.f64("FINAL_REVIEW_THRESHOLD", d.review_threshold);
        let mut block_threshold = env.f64("FINAL_BLOCK_THRESHOLD", d.block_threshold);
        if review_threshold >= block_threshold {
            warn!(
                review_threshold,
                block_threshold, "Review threshold must be below block threshold, using defaults"
            );
            review_threshold = d.review_threshold;
            block_threshold = d.block_threshold;
        }

        Self {
            review_threshold,
            block_threshold,
            core_detectors,
            error_policy,
            review_floor: env.f64("ENGINE_ERROR_REVIEW_FLOOR", d.review_floor),
            block_floor: d.block_floor,
            opennsfw2: env.f64("OPENNSFW2_THRESH", d.opennsfw2),
            nudenet_exposed: env.f64("NUDENET_EXPOSED_THRESH", d.nudenet_exposed),
            nudenet_covered: WeightedThreshold {
                weight: env.f64("NUDENET_COVERED_WEIGHT", d.nudenet_covered.weight),
                trigger: env.f64("NUDENET_COVERED_THRESH", d.nudenet_covered.trigger),
            },
            yolo: YoloRules {
                firearm: env.f64("YOLO_FIREARM_THRESH", d.yolo.firearm),
                toy: env.f64("YOLO_FIREARM_TOY_THRESH", d.yolo.toy),
                allow_toy: env.flag("ALLOW_TOY_GUN", d.yolo.allow_toy),
                dangerous_knife: env.f64("YOLO_DANGEROUS_KNIFE_THRESH", d.yolo.dangerous_knife),
                knife: env.f64("YOLO_KNIFE_THRESH", d.yolo.knife),
                knife_block_all: env.flag("YOLO_KNIFE_BLOCK_ALL", d.yolo.knife_block_all),
            },
            sightengine: SightengineRules {
                raw_nudity: env.f64("SE_RAW_NUDITY_THRESH", d.sightengine.raw_nudity),
                partial_nudity: WeightedThreshold {
                    weight: env.f64("SE_PARTIAL_WEIGHT", d.sightengine.partial_nudity.weight),
                    trigger: env.f64("SE_PARTIAL_THRESH", d.sightengine.partial_nudity.trigger),
                },
                firearm: env.f64("SE_FIREARM_THRESH", d.sightengine.firearm),
                block_any_firearm: env.flag("SE_BLOCK_ANY_FIREARM", d.sightengine.block_any_firearm),
                violence: env.f64("SE_VIOLENCE_THRESH", d.sightengine.violence),
                gore: env.f64("SE_GORE_THRESH", d.sightengine.gore),
                offensive: env.f64("SE_OFFENSIVE_THRESH", d.sightengine.offensive),
                knife: env.f64("SE_KNIFE_THRESH", d.sightengine.knife),
                knife_context: env.f64("SE_KNIFE_CONTEXT_THRESH", d.sightengine.knife_context),
                knife_block_all: env.flag("SE_KNIFE_BLOCK_ALL", d.sightengine.knife_block_all),
            },
            openai: OpenAiRules {
                minors: env.f64("OPENAI_MINORS_THRESH", d.openai.minors),
                sexual: env.f64("OPENAI_SEXUAL_THRESH", d.openai.sexual),
                violence: env.f64("OPENAI_VIOLENCE_THRESH", d.openai.violence),
                hate: env.f64("OPENAI_HATE_THRESH", d.openai.hate),
            },
        }
    }

    /// Whether errors from `name` influence the verdict.
    pub fn is_core(&self, name: &str) -> bool {
        self.core_detectors.is_empty() || self.core_detectors.contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(vars: &[(&str, &str)]) -> VerdictConfig {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let lookup = move |key: &str| map.get(key).cloned();
        VerdictConfig::from_env(&Env::new(&lookup))
    }

    #[test]
    fn test_error_policy_aliases() {
        assert_eq!(ErrorPolicy::parse("lenient"), Some(ErrorPolicy::Ignore));
        assert_eq!(ErrorPolicy::parse("STRICT"), Some(ErrorPolicy::Review));
        assert_eq!(ErrorPolicy::parse("fail_closed"), Some(ErrorPolicy::Block));
        assert_eq!(ErrorPolicy::parse("whatever"), None);
    }

    #[test]
    fn test_core_engines_aliases_resolve_to_names() {
        let cfg = from(&[("CORE_ENGINES", "ocr, OpenAI , NudeNet")]);
        assert!(cfg.is_core("OCR text"));
        assert!(cfg.is_core("OpenAI Moderation"));
        assert!(cfg.is_core("NudeNet"));
        assert!(!cfg.is_core("Sightengine"));
    }

    #[test]
    fn test_default_core_set_excludes_offline_models() {
        let cfg = VerdictConfig::default();
        assert!(cfg.is_core("pHash blocklist"));
        assert!(!cfg.is_core("NudeNet"));
        assert!(!cfg.is_core("OpenNSFW2"));
    }

    #[test]
    fn test_inverted_thresholds_fall_back() {
        let cfg = from(&[("FINAL_REVIEW_THRESHOLD", "0.9"), ("FINAL_BLOCK_THRESHOLD", "0.5")]);
        assert_eq!(cfg.review_threshold, 0.40);
        assert_eq!(cfg.block_threshold, 0.85);
    }

    #[test]
    fn test_weighted_threshold_pairs_risk_and_reason() {
        let pair = WeightedThreshold {
            weight: 0.6,
            trigger: 0.70,
        };
        assert!(pair.fires(0.70));
        assert!(!pair.fires(0.69));
        assert!((pair.risk(0.70) - 0.42).abs() < 1e-9);
    }
}
