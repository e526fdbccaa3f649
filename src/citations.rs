//! Citation markers: the one list both the validator and the verifier accept as
//! evidence that a claim is grounded, or openly acknowledged as ungrounded.

use crate::facts::FactMap;

/// Literal form specialists are told to use for extracted facts.
pub const EXTRACTION_MARKER: &str = "[Per extraction:";
/// Literal form for declaring a missing datum.
pub const MISSING_DATA_MARKER: &str = "NOT IN EXTRACTED DATA";

/// Lowercase phrases; matched case-insensitively.
pub const CITATION_MARKERS: &[&str] = &[
    "per extraction",
    "not in extracted data",
    "based on market knowledge",
    "based on operational assessment",
    "based on industry benchmark",
    "based on historical precedent",
    "per the extracted data",
];

/// Whether `text` carries any accepted citation marker.
pub fn has_citation_marker(text: &str) -> bool {
    let lower = text.to_lowercase();
    CITATION_MARKERS.iter().any(|m| lower.contains(m))
}

/// Number of marker occurrences across the whole text.
pub fn count_citation_markers(text: &str) -> usize {
    let lower = text.to_lowercase();
    CITATION_MARKERS
        .iter()
        .map(|m| lower.matches(m).count())
        .sum()
}

/// Quotes inside every `[Per extraction: "..."]` marker, in order.
/// Tolerates straight or curly quotes and a missing closing quote.
pub fn extract_extraction_quotes(text: &str) -> Vec<String> {
    // ASCII folding keeps byte offsets aligned with `text`.
    let lower = text.to_ascii_lowercase();
    let needle = EXTRACTION_MARKER.to_ascii_lowercase();
    let mut quotes = Vec::new();
    let mut from = 0;

    while let Some(pos) = lower[from..].find(&needle) {
        let body_start = from + pos + needle.len();
        let rest = &text[body_start..];
        let Some(close) = rest.find(']') else { break };
        let inner = rest[..close]
            .trim()
            .trim_matches(|c| matches!(c, '"' | '“' | '”' | '\''))
            .trim();
        if !inner.is_empty() {
            quotes.push(inner.to_string());
        }
        from = body_start + close + 1;
    }
    quotes
}

/// Cited quotes that are backed by some extracted fact's quote.
pub fn count_grounded_citations(text: &str, facts: &FactMap) -> usize {
    extract_extraction_quotes(text)
        .iter()
        .filter(|q| {
            facts
                .values()
                .any(|f| f.quote.contains(q.as_str()) || q.contains(f.quote.as_str()))
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::ExtractedFact;

    #[test]
    fn test_marker_case_insensitive() {
        assert!(has_citation_marker("Revenue QR 412.5m [Per extraction: \"x\"]"));
        assert!(has_citation_marker("Based on operational assessment: 30 keys"));
        assert!(has_citation_marker("cap rate NOT IN EXTRACTED DATA"));
        assert!(!has_citation_marker("Revenue will hit QR 987.6m next year"));
    }

    #[test]
    fn test_extract_quotes() {
        let text = r#"Revenue [Per extraction: "Q2 2025 revenue was QR 412.5 million"] and
            occupancy [per extraction: “78% in 2024”]; broken [Per extraction: no close"#;
        let quotes = extract_extraction_quotes(text);
        assert_eq!(
            quotes,
            vec![
                "Q2 2025 revenue was QR 412.5 million".to_string(),
                "78% in 2024".to_string()
            ]
        );
    }

    #[test]
    fn test_count_markers() {
        assert_eq!(
            count_citation_markers("per extraction ... Per Extraction ... based on market knowledge"),
            3
        );
    }

    #[test]
    fn test_grounded_citations() {
        let mut facts = FactMap::new();
        facts.insert(
            "q2_2025_revenue".to_string(),
            ExtractedFact {
                value: 412.5,
                unit: "QR million".to_string(),
                fiscal_period: Some("Q2 2025".to_string()),
                quote: "Q2 2025 revenue was QR 412.5 million, up 6% year on year.".to_string(),
                confidence: 0.9,
            },
        );
        let text = r#"[Per extraction: "Q2 2025 revenue was QR 412.5 million"] vs [Per extraction: "made up"]"#;
        assert_eq!(count_grounded_citations(text, &facts), 1);
        assert_eq!(count_grounded_citations(text, &FactMap::new()), 0);
    }
}
