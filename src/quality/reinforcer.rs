//! Reinforcement gate and per-invocation quality stats.
//!
//! The lexicons here are kept apart from the validator's on purpose: the two
//! gates overlap, but a miss in one is meant to be caught by the other.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::personas::Persona;
use crate::quality::validator::EXPERT_THRESHOLD;

/// Minimum aggregate green-flag score for a response to pass.
pub const ACCEPTABLE_GREEN_SCORE: u32 = 10;
/// A response with this many red flags fails regardless of green score.
pub const MAX_RED_FLAGS: usize = 2;

const RED_FLAGS: &[(&str, &str)] = &[
    ("comprehensive", r"\bcomprehensive\b"),
    ("it is recommended", r"\bit is recommended\b"),
    ("further research", r"\bfurther research\b"),
    ("synergies", r"\bsynerg(?:y|ies)\b"),
    ("stakeholders", r"\bstakeholders?\b"),
    ("holistic", r"\bholistic\b"),
    ("going forward", r"\bgoing forward\b"),
    ("in conclusion", r"\bin conclusion\b"),
    ("robust", r"\brobust\b"),
    ("various factors", r"\bvarious factors\b"),
    ("as an AI", r"\bas an ai\b"),
    ("it depends", r"\bit depends\b"),
];

const GREEN_FLAGS: &[(&str, &str, u32)] = &[
    ("gut reaction", r"\bmy gut\b|\bgut says\b", 3),
    ("lived experience", r"\bi've seen\b|\bin my experience\b|\bi remember\b", 3),
    (
        "worked arithmetic",
        r"\bback of the envelope\b|\b(?:rough|quick) (?:math|numbers)\b|\bthe numbers say\b",
        3,
    ),
    ("dated precedent", r"\bin (?:19|20)\d{2}\b", 2),
    ("bear case", r"\bbear case\b|\bworst case\b", 2),
    ("bull case", r"\bbull case\b", 1),
    ("owns being wrong", r"\bi'm wrong\b|\bi (?:could|might) be wrong\b", 2),
    ("first-person call", r"\bi'd\b|\bi would\b", 2),
    ("searched again", r"\bsearch(?:ed)? again\b|\bsecond look\b", 1),
];

struct Lexicon {
    red: Vec<(&'static str, Regex)>,
    green: Vec<(&'static str, Regex, u32)>,
}

fn lexicon() -> &'static Lexicon {
    static LEXICON: OnceLock<Lexicon> = OnceLock::new();
    LEXICON.get_or_init(|| Lexicon {
        red: RED_FLAGS
            .iter()
            .map(|(name, p)| {
                let re = Regex::new(&format!("(?i){}", p)).expect("red flag pattern is valid");
                (*name, re)
            })
            .collect(),
        green: GREEN_FLAGS
            .iter()
            .map(|(name, p, w)| {
                let re = Regex::new(&format!("(?i){}", p)).expect("green flag pattern is valid");
                (*name, re, *w)
            })
            .collect(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagAssessment {
    pub green_score: u32,
    pub green_flags: Vec<String>,
    pub red_flags: Vec<String>,
}

impl FlagAssessment {
    pub fn acceptable(&self) -> bool {
        self.green_score >= ACCEPTABLE_GREEN_SCORE && self.red_flags.len() < MAX_RED_FLAGS
    }
}

pub fn assess(text: &str) -> FlagAssessment {
    let lex = lexicon();
    let mut green_score = 0;
    let mut green_flags = Vec::new();
    for (name, re, weight) in &lex.green {
        if re.is_match(text) {
            green_score += weight;
            green_flags.push(name.to_string());
        }
    }
    let red_flags = lex
        .red
        .iter()
        .filter(|(_, re)| re.is_match(text))
        .map(|(name, _)| name.to_string())
        .collect();
    FlagAssessment {
        green_score,
        green_flags,
        red_flags,
    }
}

/// `None` when `text` is acceptable, otherwise a follow-up prompt fragment for `persona`.
pub fn reinforcement_for(text: &str, persona: &Persona) -> Option<String> {
    let assessment = assess(text);
    if assessment.acceptable() {
        return None;
    }
    debug!(
        agent = %persona.name,
        green = assessment.green_score,
        red = assessment.red_flags.len(),
        "response needs reinforcement"
    );
    Some(build_addendum(&assessment, persona))
}

fn build_addendum(assessment: &FlagAssessment, persona: &Persona) -> String {
    let mut out = String::new();
    out.push_str("STOP. That answer reads like a consulting report, not like you.\n\n");

    if !assessment.red_flags.is_empty() {
        out.push_str("Phrases you must drop:\n");
        for flag in &assessment.red_flags {
            out.push_str(&format!("- \"{}\"\n", flag));
        }
        out.push('\n');
    }
    if !persona.tone_forbidden_phrases.is_empty() {
        out.push_str(&format!(
            "Never write: {}.\n\n",
            persona.tone_forbidden_phrases.join(", ")
        ));
    }

    out.push_str(&format!(
        "Rewrite the analysis as the {} you are. Make every one of these moves:\n",
        persona.title
    ));
    for (i, step) in persona.required_moves.iter().enumerate() {
        out.push_str(&format!("{}. {}\n", i + 1, step));
    }
    if !persona.tone_required_phrases.is_empty() {
        out.push_str(&format!(
            "\nSound like yourself: use phrases such as {}.\n",
            persona
                .tone_required_phrases
                .iter()
                .map(|p| format!("\"{}\"", p))
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    out.push_str("\nThis is what your voice sounds like:\n");
    out.push_str(&persona.exemplar);
    out.push_str("\n\nKeep citing facts as [Per extraction: \"<exact quote>\"] or say NOT IN EXTRACTED DATA.");
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    Stable,
    Declining,
}

/// Points of average movement needed before a trend is called.
const TREND_DELTA: f64 = 5.0;
const TREND_WINDOW: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityStats {
    pub turns: usize,
    pub average_score: f64,
    pub expert_rate: f64,
    pub reinforcements_issued: usize,
    pub trend: Trend,
}

/// Rolling (agent, score) record for one pipeline invocation.
#[derive(Debug, Clone, Default)]
pub struct QualityTracker {
    turns: Vec<(String, u32)>,
    reinforcements: usize,
}

impl QualityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, agent: &str, score: u32, reinforced: bool) {
        self.turns.push((agent.to_string(), score));
        if reinforced {
            self.reinforcements += 1;
        }
    }

    pub fn stats(&self) -> QualityStats {
        let scores: Vec<f64> = self.turns.iter().map(|(_, s)| f64::from(*s)).collect();
        let average_score = mean(&scores).unwrap_or(0.0);
        let expert_rate = if self.turns.is_empty() {
            0.0
        } else {
            self.turns
                .iter()
                .filter(|(_, s)| *s >= EXPERT_THRESHOLD)
                .count() as f64
                / self.turns.len() as f64
        };

        let trend = if scores.len() <= TREND_WINDOW {
            Trend::Stable
        } else {
            let split = scores.len() - TREND_WINDOW;
            let earlier = mean(&scores[..split]).unwrap_or(0.0);
            let recent = mean(&scores[split..]).unwrap_or(0.0);
            if recent - earlier > TREND_DELTA {
                Trend::Improving
            } else if earlier - recent > TREND_DELTA {
                Trend::Declining
            } else {
                Trend::Stable
            }
        };

        QualityStats {
            turns: self.turns.len(),
            average_score,
            expert_rate,
            reinforcements_issued: self.reinforcements,
            trend,
        }
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}
