//! Ground-truth fact extraction from retrieved text.
//!
//! The extractor never invents a value: every fact is parsed out of a sentence
//! of the supplied sources and that sentence is kept verbatim as the quote.

use std::collections::{BTreeMap, HashSet};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::numeric::{self, NumericToken};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedFact {
    pub value: f64,
    pub unit: String,
    pub fiscal_period: Option<String>,
    /// Exact substring of one of the source texts.
    pub quote: String,
    pub confidence: f64,
}

/// Metric name → fact. Ordered so prompts and sheets are deterministic.
pub type FactMap = BTreeMap<String, ExtractedFact>;

pub trait FactExtractor: Send + Sync {
    fn extract(&self, query: &str, sources: &[String]) -> Result<FactMap>;
}

/// Words that make a sentence worth mining even when the query does not name them.
const METRIC_VOCABULARY: &[&str] = &[
    "revenue", "revenues", "income", "profit", "ebitda", "margin", "occupancy", "adr", "revpar",
    "rent", "rents", "rental", "price", "prices", "sales", "debt", "capex", "arrivals",
    "visitors", "capacity", "ridership", "yield", "valuation", "cost", "costs", "dividend",
    "assets", "noi", "cash", "leverage", "absorption", "supply", "demand", "units", "passengers",
];

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "of", "in", "at", "to", "for", "and", "or", "was", "were", "is", "are",
    "with", "by", "on", "from", "as", "its", "their", "our", "we", "stood", "reached", "hit",
    "totalled", "totaled", "held", "about", "around", "approximately", "up", "down", "per",
    "which", "that", "this", "be", "been", "will", "should", "would", "rose", "fell",
];

/// Sentence-level heuristic extractor.
#[derive(Debug, Default, Clone)]
pub struct HeuristicFactExtractor;

impl FactExtractor for HeuristicFactExtractor {
    fn extract(&self, query: &str, sources: &[String]) -> Result<FactMap> {
        let query_terms: HashSet<String> = words(query)
            .into_iter()
            .filter(|w| w.len() > 2 && !STOP_WORDS.contains(&w.as_str()))
            .collect();

        let mut facts = FactMap::new();
        for source in sources {
            for sentence in sentences(source) {
                let tokens = numeric::scan(sentence);
                if tokens.is_empty() {
                    continue;
                }
                let period = fiscal_period(sentence);
                let mut floor = 0;
                for token in &tokens {
                    let label = label_before(&sentence[floor..token.start]);
                    floor = token.end;
                    if label.is_empty() {
                        continue;
                    }
                    let relevant = label.iter().any(|w| {
                        query_terms.contains(w) || METRIC_VOCABULARY.contains(&w.as_str())
                    });
                    if !relevant {
                        continue;
                    }

                    let name = metric_name(period.as_deref(), &label);
                    let fact = ExtractedFact {
                        value: token.value,
                        unit: token.unit(),
                        fiscal_period: period.clone(),
                        quote: sentence.to_string(),
                        confidence: confidence(token, period.is_some(), sentence),
                    };
                    match facts.get(&name) {
                        Some(existing) if existing.confidence >= fact.confidence => {}
                        _ => {
                            facts.insert(name, fact);
                        }
                    }
                }
            }
        }

        let facts = retain_grounded(facts, sources);
        debug!(facts = facts.len(), sources = sources.len(), "facts extracted");
        Ok(facts)
    }
}

/// Drop any fact whose quote does not occur verbatim in some source.
pub fn retain_grounded(facts: FactMap, sources: &[String]) -> FactMap {
    facts
        .into_iter()
        .filter(|(_, f)| !f.quote.is_empty() && sources.iter().any(|s| s.contains(&f.quote)))
        .collect()
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Sentences as trimmed slices of `text`. A period only ends a sentence when
/// followed by whitespace, so decimals stay intact.
fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, ch)) = chars.next() {
        let boundary = match ch {
            '\n' => true,
            '.' | '!' | '?' | ';' => chars.peek().map_or(true, |(_, next)| next.is_whitespace()),
            _ => false,
        };
        if boundary {
            let end = i + ch.len_utf8();
            let piece = text[start..end].trim();
            if !piece.is_empty() {
                out.push(piece);
            }
            start = end;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

/// "Q2 2025", "FY2024", "H1 2023" or a bare year, whichever appears first.
fn fiscal_period(sentence: &str) -> Option<String> {
    use std::sync::OnceLock;
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        regex::Regex::new(r"(?i)\b(?:(Q[1-4]|H[12])\s?((?:19|20)\d{2})|FY\s?((?:19|20)\d{2})|((?:19|20)\d{2}))\b")
            .expect("period regex is valid")
    });
    let caps = re.captures(sentence)?;
    if let (Some(part), Some(year)) = (caps.get(1), caps.get(2)) {
        return Some(format!("{} {}", part.as_str().to_uppercase(), year.as_str()));
    }
    if let Some(year) = caps.get(3) {
        return Some(format!("FY{}", year.as_str()));
    }
    caps.get(4).map(|y| y.as_str().to_string())
}

/// Up to three meaningful words of the text preceding a token, closest last.
fn label_before(before: &str) -> Vec<String> {
    let mut picked: Vec<String> = words(before)
        .into_iter()
        .rev()
        .filter(|w| {
            !STOP_WORDS.contains(&w.as_str())
                && !w.chars().all(|c| c.is_ascii_digit())
                && !is_period_word(w)
        })
        .take(3)
        .collect();
    picked.reverse();
    picked
}

fn is_period_word(w: &str) -> bool {
    let bytes = w.as_bytes();
    matches!(bytes.first(), Some(b'q') | Some(b'h')) && bytes.len() == 2 && bytes[1].is_ascii_digit()
        || (w.starts_with("fy") && w[2..].chars().all(|c| c.is_ascii_digit()))
}

fn metric_name(period: Option<&str>, label: &[String]) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(p) = period {
        parts.extend(words(p));
    }
    parts.extend(label.iter().cloned());
    parts.join("_")
}

fn confidence(token: &NumericToken, has_period: bool, sentence: &str) -> f64 {
    let mut c: f64 = 0.7;
    if token.currency.is_some() || token.percent {
        c += 0.1;
    }
    if has_period {
        c += 0.1;
    }
    if sentence.chars().count() > 300 {
        c -= 0.2;
    }
    c.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sources() -> Vec<String> {
        vec![
            "Q2 2025 revenue was QR 412.5 million, up 6% year on year. The board met twice.".to_string(),
            "Hotel occupancy reached 78% in 2024; average daily rate held at QR 620.".to_string(),
            "The committee discussed 3 agenda items.".to_string(),
        ]
    }

    #[test]
    fn test_extracts_named_metric_with_period() {
        let facts = HeuristicFactExtractor.extract("revenue outlook", &sources()).unwrap();
        let fact = facts.get("q2_2025_revenue").expect("revenue fact");
        assert_eq!(fact.value, 412.5);
        assert_eq!(fact.unit, "QR million");
        assert_eq!(fact.fiscal_period.as_deref(), Some("Q2 2025"));
        assert!(fact.quote.starts_with("Q2 2025 revenue"));
    }

    #[test]
    fn test_quotes_are_verbatim_substrings() {
        let src = sources();
        let facts = HeuristicFactExtractor.extract("occupancy and rates", &src).unwrap();
        assert!(!facts.is_empty());
        for fact in facts.values() {
            assert!(src.iter().any(|s| s.contains(&fact.quote)));
        }
    }

    #[test]
    fn test_no_sources_no_facts() {
        let facts = HeuristicFactExtractor.extract("anything", &[]).unwrap();
        assert!(facts.is_empty());
    }

    #[test]
    fn test_unitless_numbers_omitted() {
        let src = vec!["The committee discussed 3 agenda items in 2024.".to_string()];
        assert!(HeuristicFactExtractor.extract("committee", &src).unwrap().is_empty());
    }

    #[test]
    fn test_retain_grounded_drops_foreign_quotes() {
        let mut facts = FactMap::new();
        facts.insert(
            "made_up".to_string(),
            ExtractedFact {
                value: 1.0,
                unit: String::new(),
                fiscal_period: None,
                quote: "not present anywhere".to_string(),
                confidence: 0.9,
            },
        );
        assert!(retain_grounded(facts, &sources()).is_empty());
    }

    #[test]
    fn test_sentences_keep_decimals() {
        let s = sentences("Revenue was QR 412.5 million. Costs rose.");
        assert_eq!(s, vec!["Revenue was QR 412.5 million.", "Costs rose."]);
    }

    #[test]
    fn test_fiscal_period_forms() {
        assert_eq!(fiscal_period("in Q3 2024 we"), Some("Q3 2024".to_string()));
        assert_eq!(fiscal_period("FY2023 results"), Some("FY2023".to_string()));
        assert_eq!(fiscal_period("during 2019"), Some("2019".to_string()));
        assert_eq!(fiscal_period("no period"), None);
    }
}
