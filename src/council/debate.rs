//! Lexical stance classification across specialists.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Regex, RegexSet};
use serde::{Deserialize, Serialize};

use crate::council::sheet::AnalysisRecord;

pub const DEBATE_TOPIC: &str = "strategic direction";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stance {
    Positive,
    Negative,
    Hedged,
    NotDetected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    High,
    Medium,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebateRecord {
    pub topic: String,
    pub per_agent_stance: BTreeMap<String, Stance>,
    pub supporting: Vec<String>,
    pub opposing: Vec<String>,
    pub importance: Importance,
}

impl DebateRecord {
    /// One-line description used in the synthesis prompt.
    pub fn describe(&self) -> String {
        format!(
            "Contradiction on {}: {} argue to proceed; {} argue against.",
            self.topic,
            self.supporting.join(", "),
            self.opposing.join(", ")
        )
    }
}

struct StanceLexicon {
    positive: RegexSet,
    negative: RegexSet,
    hedged: Regex,
}

fn lexicon() -> &'static StanceLexicon {
    static LEXICON: OnceLock<StanceLexicon> = OnceLock::new();
    LEXICON.get_or_init(|| StanceLexicon {
        positive: RegexSet::new([
            r"(?i)\bgo for it\b",
            r"(?i)\bgo ahead\b",
            r"(?i)\bi'd (?:proceed|invest|back|fund|buy)\b",
            r"(?i)\bwe should (?:proceed|invest|launch)\b",
            r"(?i)\bgreen ?light\b",
            r"(?i)\bstrongly (?:recommend|support)\b",
            r"(?i)\bworth doing\b",
        ])
        .expect("positive stance patterns are valid"),
        negative: RegexSet::new([
            r"(?i)\bdon't do it\b",
            r"(?i)\bdo not do it\b",
            r"(?i)\bavoid\b",
            r"(?i)\bwalk away\b",
            r"(?i)\bno-go\b",
            r"(?i)\bi'd pass\b",
            r"(?i)\btoo risky\b",
            r"(?i)\bstay out\b",
            r"(?i)\bi (?:would not|wouldn't)\b",
            r"(?i)\bdon't (?:invest|proceed|buy|build)\b",
        ])
        .expect("negative stance patterns are valid"),
        hedged: Regex::new(r"(?i)\b(?:it depends|either way|wait and see|on balance|too early to (?:say|call))\b")
            .expect("hedge pattern is valid"),
    })
}

/// Positive or negative needs a 2:1 majority of distinct markers; otherwise both
/// sides present is hedged.
pub fn classify_stance(text: &str) -> Stance {
    let lex = lexicon();
    let pos = lex.positive.matches(text).iter().count();
    let neg = lex.negative.matches(text).iter().count();
    match (pos, neg) {
        (0, 0) if lex.hedged.is_match(text) => Stance::Hedged,
        (0, 0) => Stance::NotDetected,
        (p, 0) if p > 0 => Stance::Positive,
        (0, n) if n > 0 => Stance::Negative,
        (p, n) if p >= 2 * n => Stance::Positive,
        (p, n) if n >= 2 * p => Stance::Negative,
        _ => Stance::Hedged,
    }
}

/// At most one record: emitted when available specialists hold opposing
/// non-hedged stances.
pub fn detect_debates(analyses: &[AnalysisRecord]) -> Vec<DebateRecord> {
    let per_agent_stance: BTreeMap<String, Stance> = analyses
        .iter()
        .filter(|a| a.available)
        .map(|a| (a.agent_name.clone(), classify_stance(&a.raw_text)))
        .collect();

    let with = |stance: Stance| -> Vec<String> {
        per_agent_stance
            .iter()
            .filter(|(_, s)| **s == stance)
            .map(|(name, _)| name.clone())
            .collect()
    };
    let supporting = with(Stance::Positive);
    let opposing = with(Stance::Negative);
    if supporting.is_empty() || opposing.is_empty() {
        return Vec::new();
    }

    let importance = if supporting.len() >= 2 && opposing.len() >= 2 {
        Importance::High
    } else {
        Importance::Medium
    };
    vec![DebateRecord {
        topic: DEBATE_TOPIC.to_string(),
        per_agent_stance,
        supporting,
        opposing,
        importance,
    }]
}
