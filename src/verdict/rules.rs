// Per-detector rules, evaluated in table order.
//
// Each rule reads one detector's scores through `ScoreView` and either
// max-combines into the accumulator or ends evaluation with an override.

use super::{Accumulator, Axis, Verdict, VerdictConfig};
use crate::detectors::{names, DetectorResult};

/// Clamped read access to one result's scores.
pub(super) struct ScoreView<'a> {
    result: &'a DetectorResult,
}

impl<'a> ScoreView<'a> {
    pub(super) fn new(result: &'a DetectorResult) -> Self {
        Self { result }
    }

    fn get(&self, key: &str) -> f64 {
        self.result.score(key)
    }

    fn max_of(&self, keys: &[&str]) -> f64 {
        keys.iter().map(|k| self.get(k)).fold(0.0, f64::max)
    }

    fn label(&self) -> Option<&str> {
        self.result
            .detail_str("match_label")
            .or_else(|| self.result.detail_str("matched_label"))
            .filter(|l| !l.is_empty())
    }
}

pub(super) struct Override {
    pub(super) verdict: fn(Vec<String>) -> Verdict,
    pub(super) reason: String,
}

pub(super) enum Flow {
    Continue,
    Decide(Override),
}

fn block(reason: String) -> Flow {
    Flow::Decide(Override {
        verdict: Verdict::block,
        reason,
    })
}

fn allow(reason: String) -> Flow {
    Flow::Decide(Override {
        verdict: Verdict::allow,
        reason,
    })
}

type RuleFn = fn(&ScoreView<'_>, &VerdictConfig, &mut Accumulator) -> Flow;

pub(super) struct Rule {
    pub(super) detector: &'static str,
    pub(super) apply: RuleFn,
}

/// Fixed evaluation order. Block overrides come before allow overrides.
pub(super) const RULES: &[Rule] = &[
    Rule { detector: names::PHASH_BLOCKLIST, apply: phash_blocklist },
    Rule { detector: names::PHASH_ALLOWLIST, apply: phash_allowlist },
    Rule { detector: names::OCR, apply: ocr_text },
    Rule { detector: names::OPENNSFW2, apply: opennsfw2 },
    Rule { detector: names::NUDENET, apply: nudenet },
    Rule { detector: names::YOLO_WEAPONS, apply: yolo_weapons },
    Rule { detector: names::SIGHTENGINE, apply: sightengine },
    Rule { detector: names::OPENAI, apply: openai },
];

fn with_label(prefix: &str, label: Option<&str>) -> String {
    match label {
        Some(l) => format!("{prefix} ({l})"),
        None => prefix.to_string(),
    }
}

fn phash_blocklist(s: &ScoreView<'_>, _: &VerdictConfig, _: &mut Accumulator) -> Flow {
    if s.get("phash_block_match") >= 1.0 {
        return block(with_label("pHash blocklist match", s.label()));
    }
    Flow::Continue
}

fn phash_allowlist(s: &ScoreView<'_>, _: &VerdictConfig, _: &mut Accumulator) -> Flow {
    if s.get("phash_allow_match") >= 1.0 {
        return allow(with_label("pHash allowlist match", s.label()));
    }
    Flow::Continue
}

fn ocr_text(s: &ScoreView<'_>, _: &VerdictConfig, _: &mut Accumulator) -> Flow {
    if s.get("ocr_match") >= 1.0 {
        return block("OCR text blocked".to_string());
    }
    Flow::Continue
}

fn opennsfw2(s: &ScoreView<'_>, cfg: &VerdictConfig, acc: &mut Accumulator) -> Flow {
    let nsfw = s.get("nsfw_probability");
    acc.bump(Axis::Nudity, nsfw, cfg.opennsfw2, || format!("OpenNSFW2 NSFW={nsfw:.2}"));
    Flow::Continue
}

fn nudenet(s: &ScoreView<'_>, cfg: &VerdictConfig, acc: &mut Accumulator) -> Flow {
    let exposed = s.get("nudity_exposed");
    let covered = s.get("nudity_covered");
    acc.bump(Axis::Nudity, exposed, cfg.nudenet_exposed, || {
        format!("NudeNet exposed={exposed:.2}")
    });

    let pair = cfg.nudenet_covered;
    if pair.fires(covered) {
        acc.hit(format!("NudeNet covered={covered:.2}"));
    }
    acc.combine(Axis::Nudity, pair.risk(covered));
    Flow::Continue
}

fn yolo_weapons(s: &ScoreView<'_>, cfg: &VerdictConfig, acc: &mut Accumulator) -> Flow {
    let rules = &cfg.yolo;

    let realistic = s.get("yolo_firearm_realistic");
    if realistic >= rules.firearm {
        acc.raise(Axis::Violence, format!("YOLO firearm realistic={realistic:.2}"));
    }

    // Cutouts and renders often classify as toys; still counted unless allowed.
    let toy = s.get("yolo_firearm_toy");
    let any_firearm = s.get("yolo_firearm");
    if !rules.allow_toy && (toy >= rules.toy || any_firearm >= rules.firearm) {
        acc.raise(
            Axis::Violence,
            format!("YOLO firearm-like (toy/uncertain)={:.2}", toy.max(any_firearm)),
        );
    }

    let dangerous = s.get("yolo_knife_dangerous");
    if dangerous >= rules.dangerous_knife {
        acc.raise(Axis::Violence, format!("YOLO dangerous knife={dangerous:.2}"));
    }

    let knife = s.get("yolo_knife");
    if rules.knife_block_all && knife >= rules.knife {
        acc.raise(Axis::Violence, format!("YOLO knife={knife:.2}"));
    }
    Flow::Continue
}

const GORE_KEYS: &[&str] = &[
    "gore_prob",
    "gore_very_bloody",
    "gore_slightly_bloody",
    "gore_serious_injury",
    "gore_superficial_injury",
    "gore_corpse",
    "gore_body_organ",
];

fn sightengine(s: &ScoreView<'_>, cfg: &VerdictConfig, acc: &mut Accumulator) -> Flow {
    let rules = &cfg.sightengine;

    let raw = s.get("nudity_raw");
    let safe = s.get("nudity_safe");
    let mut partial = s.get("nudity_partial");
    if safe > 0.0 {
        partial = partial.min((1.0 - safe).max(0.0));
    }
    acc.bump(Axis::Nudity, raw, rules.raw_nudity, || {
        format!("Sightengine raw nudity={raw:.2}")
    });
    if rules.partial_nudity.fires(partial) {
        acc.hit(format!("Sightengine partial nudity={partial:.2}"));
    }
    acc.combine(Axis::Nudity, rules.partial_nudity.risk(partial));

    let firearm = s.get("weapon_firearm");
    let toy = s.get("weapon_firearm_toy");
    let gesture = s.get("weapon_firearm_gesture");
    let animated = s.get("weapon_firearm_type_animated");
    let realistic = firearm * (1.0 - toy.max(gesture).max(animated));
    if rules.block_any_firearm && firearm >= rules.firearm {
        acc.raise(
            Axis::Violence,
            format!(
                "Sightengine firearm(any)={firearm:.2} (toy={toy:.2}, gesture={gesture:.2}, animated={animated:.2})"
            ),
        );
    }
    if realistic >= rules.firearm {
        acc.raise(
            Axis::Violence,
            format!(
                "Sightengine firearm: realistic={realistic:.2} (firearm={firearm:.2}, toy={toy:.2}, gesture={gesture:.2}, animated={animated:.2})"
            ),
        );
    }

    let vio_prob = s.get("violence_prob");
    let vio_physical = s.get("violence_physical_violence");
    let vio_threat = s.get("violence_firearm_threat");
    let violence = vio_prob.max(vio_physical).max(vio_threat);
    if violence >= rules.violence {
        acc.raise(
            Axis::Violence,
            format!(
                "Sightengine violence: prob={vio_prob:.2} physical={vio_physical:.2} firearm_threat={vio_threat:.2}"
            ),
        );
    }

    let gore_prob = s.get("gore_prob");
    let gore = s.max_of(GORE_KEYS);
    if gore >= rules.gore {
        acc.raise(
            Axis::Violence,
            format!("Sightengine gore/blood: score={gore:.2} (prob={gore_prob:.2})"),
        );
    }

    let offensive = s.get("offensive_max");
    if offensive >= rules.offensive {
        acc.raise(
            Axis::Hate,
            format!("Sightengine offensive symbols: score={offensive:.2}"),
        );
    }

    let knife = s.get("weapon_knife");
    let context = violence.max(gore);
    if knife >= rules.knife && (rules.knife_block_all || context >= rules.knife_context) {
        acc.raise(
            Axis::Violence,
            format!("Sightengine knife: score={knife:.2} ctx={context:.2}"),
        );
    }
    Flow::Continue
}

fn openai(s: &ScoreView<'_>, cfg: &VerdictConfig, acc: &mut Accumulator) -> Flow {
    let rules = &cfg.openai;

    // Zero tolerance, not risk-accumulated.
    if s.get("sexual/minors") > rules.minors {
        return block("OpenAI: sexual/minors detected".to_string());
    }

    let sexual = s.get("sexual");
    let violence = s.max_of(&["violence", "violence/graphic"]);
    let hate = s.max_of(&["hate", "hate/threatening"]);
    acc.bump(Axis::Nudity, sexual, rules.sexual, || format!("OpenAI sexual={sexual:.2}"));
    acc.bump(Axis::Violence, violence, rules.violence, || {
        format!("OpenAI violence={violence:.2}")
    });
    acc.bump(Axis::Hate, hate, rules.hate, || format!("OpenAI hate={hate:.2}"));
    Flow::Continue
}
