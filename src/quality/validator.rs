//! Post-generation scoring of reasoning style.
//!
//! `validate` is pure and deterministic: the same text always yields the same
//! report, field for field.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::citations;
use crate::numeric;

const BASE_SCORE: i32 = 40;
const SIGNAL_POINTS: i32 = 10;
const SIGNAL_CAP: i32 = 80;
const ANTI_PATTERN_PENALTY: i32 = 15;
const MISSING_ELEMENT_PENALTY: i32 = 10;
/// Scores at or above this count as expert-level reasoning.
pub const EXPERT_THRESHOLD: u32 = 60;
const MAX_EXAMPLES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Grade {
    #[serde(rename = "A+")]
    APlus,
    #[serde(rename = "A")]
    A,
    #[serde(rename = "B+")]
    BPlus,
    #[serde(rename = "B")]
    B,
    #[serde(rename = "C-")]
    CMinus,
}

impl Grade {
    pub fn from_score(score: u32) -> Self {
        match score {
            85.. => Grade::APlus,
            70..=84 => Grade::A,
            55..=69 => Grade::BPlus,
            40..=54 => Grade::B,
            _ => Grade::CMinus,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMatch {
    pub category: String,
    pub count: usize,
    pub examples: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkingChecks {
    pub gut_reaction: bool,
    pub iterative_search: bool,
    pub historical_analogy: bool,
    pub mental_arithmetic: bool,
    pub self_challenge: bool,
    pub cross_domain: bool,
    pub explicit_recommendation: bool,
    pub cites_sources: bool,
    pub score: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecommendationChecks {
    pub has_verdict: bool,
    pub has_quantified_target: bool,
    pub has_timeline: bool,
    pub has_conditions: bool,
    pub has_risk_mitigation: bool,
    pub score: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// False when validation was disabled and this is a placeholder.
    pub evaluated: bool,
    pub overall_score: u32,
    pub grade: Grade,
    pub expert_level: bool,
    pub expert_signals: Vec<SignalMatch>,
    pub anti_patterns: Vec<SignalMatch>,
    pub missing_elements: Vec<String>,
    pub thinking_checks: ThinkingChecks,
    pub recommendation_checks: Option<RecommendationChecks>,
    pub recommendations: Vec<String>,
}

impl ValidationReport {
    /// Placeholder carried when validation is switched off.
    pub fn not_evaluated() -> Self {
        Self {
            evaluated: false,
            overall_score: 0,
            grade: Grade::CMinus,
            expert_level: false,
            expert_signals: Vec::new(),
            anti_patterns: Vec::new(),
            missing_elements: Vec::new(),
            thinking_checks: ThinkingChecks::default(),
            recommendation_checks: None,
            recommendations: Vec::new(),
        }
    }

    /// 0.7 × expert score blended with 0.3 × recommendation score, in [0, 1].
    pub fn confidence(&self) -> f64 {
        let expert = f64::from(self.overall_score) / 100.0;
        match &self.recommendation_checks {
            Some(rec) => 0.7 * expert + 0.3 * f64::from(rec.score) / 100.0,
            None => expert,
        }
    }
}

struct Category {
    name: &'static str,
    patterns: Vec<Regex>,
}

impl Category {
    fn new(name: &'static str, patterns: &[&str]) -> Self {
        Self {
            name,
            patterns: patterns
                .iter()
                .map(|p| Regex::new(&format!("(?i){}", p)).expect("validator pattern is valid"))
                .collect(),
        }
    }

    /// Total matches, distinct patterns hit, and the first few matched snippets.
    fn scan(&self, text: &str) -> (usize, usize, Vec<String>) {
        let mut count = 0;
        let mut distinct = 0;
        let mut examples: Vec<String> = Vec::new();
        for re in &self.patterns {
            let mut hit = false;
            for m in re.find_iter(text) {
                hit = true;
                count += 1;
                let snippet: String = m.as_str().chars().take(60).collect();
                if examples.len() < MAX_EXAMPLES && !examples.contains(&snippet) {
                    examples.push(snippet);
                }
            }
            if hit {
                distinct += 1;
            }
        }
        (count, distinct, examples)
    }
}

struct Rules {
    signals: Vec<Category>,
    anti_patterns: Vec<Category>,
    gut: Regex,
    verdict: Regex,
    timeline: Regex,
    conditions: Regex,
    mitigation: Regex,
}

const MENTAL_ARITHMETIC: &str = "mental_arithmetic";
const HISTORICAL_ANALOGY: &str = "historical_analogy";
const ITERATIVE_SEARCH: &str = "iterative_search";
const SELF_CHALLENGE: &str = "self_challenge";
const CROSS_DOMAIN: &str = "cross_domain";
const QUANTIFIED_RISK: &str = "quantified_risk";
const VETERAN_REGISTER: &str = "veteran_register";

/// Elements whose absence costs points on top of not earning the signal.
const CRITICAL_ELEMENTS: &[&str] = &[MENTAL_ARITHMETIC, SELF_CHALLENGE, QUANTIFIED_RISK];

fn rules() -> &'static Rules {
    static RULES: OnceLock<Rules> = OnceLock::new();
    RULES.get_or_init(|| Rules {
        signals: vec![
            Category::new(
                MENTAL_ARITHMETIC,
                &[
                    r"\d[\d,.]*\s*(?:x|×|\*|/|times|divided by)\s*\d",
                    r"back[- ]of[- ]the[- ]envelope",
                    r"\b(?:rough|quick) (?:math|numbers|maths)\b",
                    r"=\s*(?:QR|\$)?\s?\d",
                    r"\b(?:that's|which is|works out to) (?:about |roughly |around )?(?:QR |\$)?\d",
                ],
            ),
            Category::new(
                HISTORICAL_ANALOGY,
                &[
                    r"\bin (?:19|20)\d{2}\b",
                    r"\bi've seen\b",
                    r"\breminds me of\b",
                    r"\blast time\b",
                    r"\bsame thing happened\b",
                    r"\bwe saw this\b",
                ],
            ),
            Category::new(
                ITERATIVE_SEARCH,
                &[
                    r"\bsearch(?:ed)? again\b",
                    r"\bdigging (?:deeper|further)\b",
                    r"\bfirst pass\b",
                    r"\bsecond look\b",
                    r"\blooking again\b",
                    r"\bwent back to the (?:data|numbers)\b",
                    r"\bcross-?check(?:ed|ing)?\b",
                ],
            ),
            Category::new(
                SELF_CHALLENGE,
                &[
                    r"\bbear case\b",
                    r"\bbull case\b",
                    r"\bi (?:could|might) be wrong\b",
                    r"\bi'm wrong\b",
                    r"\bdevil's advocate\b",
                    r"\bcounter-?argument\b",
                    r"\bwhat would change my mind\b",
                ],
            ),
            Category::new(
                CROSS_DOMAIN,
                &[
                    r"\bknock-on\b",
                    r"\bripple effect\b",
                    r"\bspills? over\b",
                    r"\bties? (?:in|back) to\b",
                    r"\bon the (?:financing|finance|tourism|hospitality|infrastructure|property|real estate) side\b",
                    r"\bconnects? (?:to|with) (?:the )?(?:financing|tourism|hotel|infrastructure|property|metro|cooling)\b",
                ],
            ),
            Category::new(
                QUANTIFIED_RISK,
                &[
                    r"\d+\s?%\s?(?:chance|probability|likelihood|downside|risk)",
                    r"\b(?:downside|exposure|loss|hit) of (?:about |roughly )?(?:QR|\$|USD)?\s?\d",
                    r"\b\d+\s?bps\b",
                    r"\bif [^.]{0,60}\b(?:drops?|falls?|rises?|slips?|halves?)\b[^.]{0,30}\d",
                    r"\bworst case[^.]{0,60}\d",
                ],
            ),
            Category::new(
                VETERAN_REGISTER,
                &[
                    r"\bmy gut\b",
                    r"\bi'd\b",
                    r"\bin my experience\b",
                    r"\bi've (?:watched|been|run|built)\b",
                    r"\bfrankly\b",
                    r"\bhere's what i'd do\b",
                ],
            ),
        ],
        anti_patterns: vec![
            Category::new(
                "consulting_cliches",
                &[
                    r"\bcomprehensive analysis\b",
                    r"\bleverag(?:e|ing) synergies\b",
                    r"\bholistic approach\b",
                    r"\bit is recommended that\b",
                    r"\bfurther research\b",
                    r"\bbest practices\b",
                    r"\bvalue creation opportunities\b",
                    r"\bparadigm shift\b",
                    r"\brobust framework\b",
                    r"\bstakeholder alignment\b",
                ],
            ),
            Category::new(
                "generic_hedging",
                &[
                    r"\bvarious factors\b",
                    r"\bthere are many factors\b",
                    r"\bmay or may not\b",
                    r"\bcould potentially\b",
                    r"\bit is important to consider\b",
                    r"\bcareful consideration\b",
                    r"\bfurther (?:study|analysis) (?:is|would be) (?:needed|required)\b",
                ],
            ),
            Category::new(
                "ai_self_reference",
                &[
                    r"\bas an ai\b",
                    r"\bas a (?:large )?language model\b",
                    r"\bi don't have access\b",
                    r"\bi cannot provide\b",
                    r"\bi'm unable to\b",
                    r"\bmy training data\b",
                ],
            ),
        ],
        gut: Regex::new(r"(?i)\b(?:my gut|gut (?:says|reaction|feel)|my instinct|first reaction|honestly)\b")
            .expect("gut regex is valid"),
        verdict: Regex::new(
            r"(?i)(?:\bno-go\b|\bgo\b\s*(?:/|on|:)|\bconditional\b|\bi'd (?:proceed|invest|back|put|pick|fund|walk|avoid|buy|sell|hold|go)\b|\bi would (?:proceed|invest|not)\b|\bmy recommendation\b|\bverdict\b)",
        )
        .expect("verdict regex is valid"),
        timeline: Regex::new(
            r"(?i)\b(?:Q[1-4]\b|H[12]\b|within \d+|by (?:19|20)\d{2}|next (?:year|quarter|month)|\d+ (?:months?|years?|weeks?))",
        )
        .expect("timeline regex is valid"),
        conditions: Regex::new(r"(?i)\b(?:if|unless|trigger|provided that|condition(?:al|s)?)\b")
            .expect("conditions regex is valid"),
        mitigation: Regex::new(
            r"(?i)\b(?:mitigat\w*|hedg\w*|cap (?:our|the) exposure|kill criterion|walk away|exit|phase(?:d)?|stag(?:e|ed|ing))\b",
        )
        .expect("mitigation regex is valid"),
    })
}

/// Score `text` against the expert-signal and anti-pattern rubrics.
pub fn validate(text: &str) -> ValidationReport {
    let rules = rules();

    let mut expert_signals = Vec::new();
    let mut matched: Vec<&str> = Vec::new();
    for cat in &rules.signals {
        let (count, _, examples) = cat.scan(text);
        if count > 0 {
            matched.push(cat.name);
            expert_signals.push(SignalMatch {
                category: cat.name.to_string(),
                count,
                examples,
            });
        }
    }

    let mut anti_patterns = Vec::new();
    let mut anti_hits = 0i32;
    for cat in &rules.anti_patterns {
        let (count, distinct, examples) = cat.scan(text);
        if count > 0 {
            anti_hits += distinct as i32;
            anti_patterns.push(SignalMatch {
                category: cat.name.to_string(),
                count,
                examples,
            });
        }
    }

    let missing_elements: Vec<String> = CRITICAL_ELEMENTS
        .iter()
        .filter(|c| !matched.contains(c))
        .map(|c| c.to_string())
        .collect();

    let raw = BASE_SCORE + (SIGNAL_POINTS * matched.len() as i32).min(SIGNAL_CAP)
        - ANTI_PATTERN_PENALTY * anti_hits
        - MISSING_ELEMENT_PENALTY * missing_elements.len() as i32;
    let overall_score = raw.clamp(0, 100) as u32;

    let thinking_checks = thinking_checks(text, &matched, rules);
    let recommendation_checks = recommendation_checks(text, rules);

    let mut recommendations = Vec::new();
    for element in &missing_elements {
        recommendations.push(match element.as_str() {
            MENTAL_ARITHMETIC => "Show the arithmetic: units, prices and ratios worked out in the text".to_string(),
            SELF_CHALLENGE => "Challenge the first view with an explicit bear case and bull case".to_string(),
            _ => "Quantify the main risk: size of the downside and the trigger that causes it".to_string(),
        });
    }
    for anti in &anti_patterns {
        recommendations.push(format!(
            "Remove {} ({})",
            anti.category.replace('_', " "),
            anti.examples.join(", ")
        ));
    }
    if !thinking_checks.cites_sources {
        recommendations.push(
            "Cite facts with [Per extraction: \"...\"] or state NOT IN EXTRACTED DATA".to_string(),
        );
    }

    ValidationReport {
        evaluated: true,
        overall_score,
        grade: Grade::from_score(overall_score),
        expert_level: overall_score >= EXPERT_THRESHOLD,
        expert_signals,
        anti_patterns,
        missing_elements,
        thinking_checks,
        recommendation_checks: Some(recommendation_checks),
        recommendations,
    }
}

fn thinking_checks(text: &str, matched: &[&str], rules: &Rules) -> ThinkingChecks {
    let opening: String = text.chars().take(400).collect();
    let mut checks = ThinkingChecks {
        gut_reaction: rules.gut.is_match(&opening),
        iterative_search: matched.contains(&ITERATIVE_SEARCH),
        historical_analogy: matched.contains(&HISTORICAL_ANALOGY),
        mental_arithmetic: matched.contains(&MENTAL_ARITHMETIC),
        self_challenge: matched.contains(&SELF_CHALLENGE),
        cross_domain: matched.contains(&CROSS_DOMAIN),
        explicit_recommendation: rules.verdict.is_match(text),
        cites_sources: citations::has_citation_marker(text),
        score: 0,
    };
    let passed = [
        checks.gut_reaction,
        checks.iterative_search,
        checks.historical_analogy,
        checks.mental_arithmetic,
        checks.self_challenge,
        checks.cross_domain,
        checks.explicit_recommendation,
        checks.cites_sources,
    ]
    .iter()
    .filter(|b| **b)
    .count() as u32;
    checks.score = passed * 100 / 8;
    checks
}

fn recommendation_checks(text: &str, rules: &Rules) -> RecommendationChecks {
    let mut checks = RecommendationChecks {
        has_verdict: rules.verdict.is_match(text),
        has_quantified_target: !numeric::scan(text).is_empty(),
        has_timeline: rules.timeline.is_match(text),
        has_conditions: rules.conditions.is_match(text),
        has_risk_mitigation: rules.mitigation.is_match(text),
        score: 0,
    };
    let passed = [
        checks.has_verdict,
        checks.has_quantified_target,
        checks.has_timeline,
        checks.has_conditions,
        checks.has_risk_mitigation,
    ]
    .iter()
    .filter(|b| **b)
    .count() as u32;
    checks.score = passed * 100 / 5;
    checks
}
