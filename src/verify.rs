//! Post-hoc numeric verification against the extracted facts.
//!
//! Every number of magnitude 10 or more, bare counts included, must either match
//! a fact within 1% or sit near a citation marker. Years and labels are skipped. Anything else is reported as a
//! fabrication finding.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::citations;
use crate::facts::{ExtractedFact, FactMap};
use crate::numeric::{self, NumericToken};

/// Unscaled values below this are treated as ratios or counts and skipped.
pub const MIN_VERIFIED_MAGNITUDE: f64 = 10.0;
/// Characters of context inspected either side of a number.
pub const CONTEXT_RADIUS: usize = 80;
pub const MATCH_TOLERANCE: f64 = 0.01;
/// Multiplier applied to confidence when any fabrication is found.
pub const FABRICATION_PENALTY: f64 = 0.7;
pub const MAX_CONFIDENCE: f64 = 0.95;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FabricationFinding {
    pub agent_name: String,
    /// Value as written in the text, before scaling.
    pub numeric_value: f64,
    pub unit: String,
    pub surrounding_context: String,
    pub cited: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentVerification {
    pub agent_name: String,
    pub total: usize,
    pub verified: usize,
}

impl AgentVerification {
    /// A text with nothing to check counts as fully verified.
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.verified as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub findings: Vec<FabricationFinding>,
    pub per_agent: Vec<AgentVerification>,
    pub confidence: f64,
}

/// Checks finished texts against the extracted facts.
pub trait Verifier: Send + Sync {
    fn verify(&self, texts: &[(String, String)], facts: &FactMap) -> VerificationReport;
}

/// The numeric verifier used by the pipeline.
#[derive(Debug, Default, Clone)]
pub struct NumericVerifier;

impl Verifier for NumericVerifier {
    fn verify(&self, texts: &[(String, String)], facts: &FactMap) -> VerificationReport {
        verify(texts, facts)
    }
}

/// Check every `(agent, text)` pair against `facts`.
pub fn verify(texts: &[(String, String)], facts: &FactMap) -> VerificationReport {
    let mut findings = Vec::new();
    let mut per_agent = Vec::with_capacity(texts.len());

    for (agent, text) in texts {
        let mut tally = AgentVerification {
            agent_name: agent.clone(),
            total: 0,
            verified: 0,
        };
        for token in numeric::scan_claims(text) {
            if token.value.abs() < MIN_VERIFIED_MAGNITUDE && token.scale == numeric::Scale::Unit {
                continue;
            }
            tally.total += 1;

            let context = numeric::context_window(text, token.start, token.end, CONTEXT_RADIUS);
            let matched = facts.values().any(|f| matches_fact(&token, f));
            let cited = citations::has_citation_marker(context);
            if matched || cited {
                tally.verified += 1;
                continue;
            }

            warn!(
                agent = %agent,
                value = token.value,
                unit = %token.unit(),
                "ungrounded number"
            );
            findings.push(FabricationFinding {
                agent_name: agent.clone(),
                numeric_value: token.value,
                unit: token.unit(),
                surrounding_context: context.trim().to_string(),
                cited,
            });
        }
        debug!(agent = %agent, total = tally.total, verified = tally.verified, "verified");
        per_agent.push(tally);
    }

    let confidence = confidence(&per_agent, !findings.is_empty());
    VerificationReport {
        findings,
        per_agent,
        confidence,
    }
}

fn confidence(per_agent: &[AgentVerification], fabricated: bool) -> f64 {
    let mean = if per_agent.is_empty() {
        1.0
    } else {
        per_agent.iter().map(|a| a.ratio()).sum::<f64>() / per_agent.len() as f64
    };
    let penalised = if fabricated {
        mean * FABRICATION_PENALTY
    } else {
        mean
    };
    penalised.clamp(0.0, MAX_CONFIDENCE)
}

fn relative_diff(a: f64, b: f64) -> f64 {
    (a - b).abs() / a.abs().max(b.abs()).max(1.0)
}

/// Raw values within tolerance, or the same quantity once both scales are applied.
fn matches_fact(token: &NumericToken, fact: &ExtractedFact) -> bool {
    if relative_diff(token.value, fact.value) < MATCH_TOLERANCE {
        return true;
    }
    relative_diff(token.absolute(), fact.value * unit_multiplier(&fact.unit)) < MATCH_TOLERANCE
}

fn unit_multiplier(unit: &str) -> f64 {
    let unit = unit.to_ascii_lowercase();
    if unit.contains("billion") {
        1e9
    } else if unit.contains("million") {
        1e6
    } else if unit.contains("thousand") {
        1e3
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fact(value: f64, unit: &str) -> ExtractedFact {
        ExtractedFact {
            value,
            unit: unit.to_string(),
            fiscal_period: Some("Q2 2025".to_string()),
            quote: "Q2 2025 revenue was QR 412.5 million".to_string(),
            confidence: 0.9,
        }
    }

    fn texts(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(a, t)| (a.to_string(), t.to_string()))
            .collect()
    }

    #[test]
    fn test_uncited_unmatched_number_is_fabrication() {
        let report = verify(
            &texts(&[
                ("finance_expert", "Revenue will hit QR 987.6m next year"),
                ("tourism_expert", "Occupancy looks soft."),
                ("real_estate_expert", "Hold the land."),
                ("infrastructure_expert", "Wait for the metro."),
                ("master_orchestrator", "CONDITIONAL GO."),
            ]),
            &FactMap::new(),
        );
        assert_eq!(report.findings.len(), 1);
        let finding = &report.findings[0];
        assert_eq!(finding.agent_name, "finance_expert");
        assert_eq!(finding.numeric_value, 987.6);
        assert_eq!(finding.unit, "QR million");
        assert!(!finding.cited);
        assert!((report.confidence - 0.56).abs() < 1e-9);
    }

    #[test]
    fn test_matched_fact_is_verified() {
        let mut facts = FactMap::new();
        facts.insert("q2_2025_revenue".to_string(), fact(412.5, "QR million"));
        let report = verify(
            &texts(&[("finance_expert", "Revenue came in at QR 413m for the quarter")]),
            &facts,
        );
        assert!(report.findings.is_empty());
        assert_eq!(report.per_agent[0].verified, 1);
        assert_eq!(report.confidence, MAX_CONFIDENCE);
    }

    #[test]
    fn test_scaled_match() {
        let mut facts = FactMap::new();
        facts.insert("revenue".to_string(), fact(412.5, "QR million"));
        let report = verify(
            &texts(&[("finance_expert", "That is about QR 0.4125 billion of revenue")]),
            &facts,
        );
        assert!(report.findings.is_empty());
    }

    #[test]
    fn test_cited_number_is_not_fabrication() {
        let report = verify(
            &texts(&[(
                "tourism_expert",
                "Cruise arrivals could add QR 150m, based on market knowledge of past seasons.",
            )]),
            &FactMap::new(),
        );
        assert!(report.findings.is_empty());
        assert_eq!(report.confidence, MAX_CONFIDENCE);
    }

    #[test]
    fn test_small_values_ignored() {
        let report = verify(
            &texts(&[("finance_expert", "Leverage of 3.4x and a 6% margin, 5 percent growth")]),
            &FactMap::new(),
        );
        assert_eq!(report.per_agent[0].total, 0);
        assert!(report.findings.is_empty());
    }

    #[test]
    fn test_bare_uncited_count_is_fabrication() {
        let report = verify(
            &texts(&[(
                "tourism_expert",
                "Our ADR will reach 850 next year and we will sell 2,400 units",
            )]),
            &FactMap::new(),
        );
        assert_eq!(report.per_agent[0].total, 2);
        let values: Vec<f64> = report.findings.iter().map(|f| f.numeric_value).collect();
        assert_eq!(values, vec![850.0, 2400.0]);
        assert_eq!(report.findings[0].unit, "");
        assert_eq!(report.confidence, 0.0);
    }

    #[test]
    fn test_bare_count_matching_fact_is_verified() {
        let mut facts = FactMap::new();
        facts.insert("units_unsold".to_string(), fact(1200.0, ""));
        let report = verify(
            &texts(&[("real_estate_expert", "We still hold 1,200 units and it was like this in 2015.")]),
            &facts,
        );
        assert_eq!(report.per_agent[0].total, 1);
        assert!(report.findings.is_empty());
    }

    #[test]
    fn test_no_numbers_fully_verified() {
        let report = verify(
            &texts(&[("a", "No numbers here at all."), ("b", "")]),
            &FactMap::new(),
        );
        assert_eq!(report.confidence, MAX_CONFIDENCE);
        assert!(report.findings.is_empty());
        assert_eq!(verify(&[], &FactMap::new()).confidence, MAX_CONFIDENCE);
    }

    #[test]
    fn test_confidence_bounds() {
        let report = verify(
            &texts(&[("a", "QR 500m, QR 700m and USD 90 million, all invented")]),
            &FactMap::new(),
        );
        assert_eq!(report.findings.len(), 3);
        assert_eq!(report.confidence, 0.0);
    }
}
