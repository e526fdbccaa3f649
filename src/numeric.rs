//! Unit-aware numeric token scanning shared by fact extraction and verification.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scale {
    Unit,
    Thousand,
    Million,
    Billion,
}

impl Scale {
    pub fn multiplier(&self) -> f64 {
        match self {
            Scale::Unit => 1.0,
            Scale::Thousand => 1e3,
            Scale::Million => 1e6,
            Scale::Billion => 1e9,
        }
    }

    fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "k" | "thousand" => Scale::Thousand,
            "m" | "mn" | "million" => Scale::Million,
            "bn" | "b" | "billion" => Scale::Billion,
            _ => Scale::Unit,
        }
    }

    pub fn label(&self) -> Option<&'static str> {
        match self {
            Scale::Unit => None,
            Scale::Thousand => Some("thousand"),
            Scale::Million => Some("million"),
            Scale::Billion => Some("billion"),
        }
    }
}

/// A number found in text, with its currency, scale suffix or percent sign when present.
#[derive(Debug, Clone, PartialEq)]
pub struct NumericToken {
    /// Value as written, before applying the scale.
    pub value: f64,
    pub scale: Scale,
    pub currency: Option<String>,
    pub percent: bool,
    /// Byte span of the whole match in the scanned text.
    pub start: usize,
    pub end: usize,
}

impl NumericToken {
    pub fn absolute(&self) -> f64 {
        self.value * self.scale.multiplier()
    }

    /// e.g. "QR million", "%", "million".
    pub fn unit(&self) -> String {
        if self.percent {
            return "%".to_string();
        }
        match (&self.currency, self.scale.label()) {
            (Some(c), Some(s)) => format!("{} {}", c, s),
            (Some(c), None) => c.clone(),
            (None, Some(s)) => s.to_string(),
            (None, None) => String::new(),
        }
    }
}

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?ix)
            (?:(?P<cur>QAR|QR|USD|US\$|AED|SAR|EUR|GBP|\$|€|£)\s?)?
            (?P<sign>[-+−])?
            (?P<num>\d{1,3}(?:,\d{3})+(?:\.\d+)?|\d+(?:\.\d+)?)
            (?:\s?(?P<scale>billion|million|thousand|bn|mn|m|k)\b)?
            (?P<pct>\s?%|\s?percent\b)?
            (?:\s(?P<cur2>QAR|QR|riyals?|USD|dollars?)\b)?",
        )
        .expect("numeric token regex is valid")
    })
}

/// Every unit-bearing numeric token in `text`, in order of appearance.
/// Bare numbers (years, counts, ordinals) are not tokens.
pub fn scan(text: &str) -> Vec<NumericToken> {
    scan_tokens(text, false)
}

/// Unit-bearing tokens plus bare quantities ("850", "2,400 units").
/// Years and digits glued to a label ("Q2", "A380", "10x") are still skipped.
pub fn scan_claims(text: &str) -> Vec<NumericToken> {
    scan_tokens(text, true)
}

fn scan_tokens(text: &str, include_bare: bool) -> Vec<NumericToken> {
    let mut out = Vec::new();
    for caps in token_regex().captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        let Some(num) = caps.name("num") else { continue };

        // Digits glued to a word ("Q2", "H1", "A380") are labels, not quantities.
        let glued = text[..num.start()]
            .chars()
            .next_back()
            .map(|c| c.is_alphanumeric() || c == '_' || c == '.')
            .unwrap_or(false);
        let currency = caps
            .name("cur")
            .or_else(|| caps.name("cur2"))
            .map(|m| normalize_currency(m.as_str()));
        if glued && caps.name("cur").is_none() {
            continue;
        }

        let scale = caps
            .name("scale")
            .map(|m| Scale::parse(m.as_str()))
            .unwrap_or(Scale::Unit);
        let percent = caps.name("pct").is_some();
        let bare = currency.is_none() && scale == Scale::Unit && !percent;
        if bare && !include_bare {
            continue;
        }

        let Ok(mut value) = num.as_str().replace(',', "").parse::<f64>() else {
            continue;
        };
        if bare && (is_year(num.as_str()) || glued_after(text, whole.end())) {
            continue;
        }
        if matches!(caps.name("sign").map(|m| m.as_str()), Some("-") | Some("−")) {
            value = -value;
        }

        out.push(NumericToken {
            value,
            scale,
            currency,
            percent,
            start: whole.start(),
            end: whole.end(),
        });
    }
    out
}

/// Four plain digits in 1900..=2099.
fn is_year(raw: &str) -> bool {
    raw.len() == 4
        && raw.bytes().all(|b| b.is_ascii_digit())
        && raw.parse::<u32>().map(|y| (1900..=2099).contains(&y)).unwrap_or(false)
}

fn glued_after(text: &str, end: usize) -> bool {
    text[end..]
        .chars()
        .next()
        .map(|c| c.is_alphanumeric() || c == '_')
        .unwrap_or(false)
}

fn normalize_currency(raw: &str) -> String {
    match raw.to_ascii_lowercase().as_str() {
        "qar" | "qr" | "riyal" | "riyals" => "QR".to_string(),
        "usd" | "us$" | "$" | "dollar" | "dollars" => "USD".to_string(),
        "eur" | "€" => "EUR".to_string(),
        "gbp" | "£" => "GBP".to_string(),
        other => other.to_ascii_uppercase(),
    }
}

/// Up to `radius` characters either side of the byte span, snapped to char boundaries.
pub fn context_window(text: &str, start: usize, end: usize, radius: usize) -> &str {
    let from = text[..start]
        .char_indices()
        .rev()
        .nth(radius.saturating_sub(1))
        .map(|(i, _)| i)
        .unwrap_or(0);
    let to = text[end..]
        .char_indices()
        .nth(radius)
        .map(|(i, _)| end + i)
        .unwrap_or(text.len());
    &text[from..to]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_currency_with_scale_suffix() {
        let tokens = scan("Revenue will hit QR 987.6m next year");
        assert_eq!(tokens.len(), 1);
        let t = &tokens[0];
        assert_eq!(t.value, 987.6);
        assert_eq!(t.scale, Scale::Million);
        assert_eq!(t.currency.as_deref(), Some("QR"));
        assert_eq!(t.unit(), "QR million");
        assert!((t.absolute() - 987_600_000.0).abs() < 1.0);
    }

    #[test]
    fn test_thousands_separator_and_suffix_currency() {
        let tokens = scan("rents of 9,500 QAR per month");
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].value, 9500.0);
        assert_eq!(tokens[0].currency.as_deref(), Some("QR"));
    }

    #[test]
    fn test_percent_and_sign() {
        let tokens = scan("margins fell -12.5% while occupancy hit 78 percent");
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].value, -12.5);
        assert!(tokens[0].percent);
        assert_eq!(tokens[1].value, 78.0);
        assert_eq!(tokens[1].unit(), "%");
    }

    #[test]
    fn test_bare_numbers_and_labels_skipped() {
        assert!(scan("In 2008 we had 12 towers in Q2 and H1").is_empty());
        assert!(scan("the A380m fleet").is_empty());
    }

    #[test]
    fn test_word_scales() {
        let tokens = scan("a $2.4 billion program and 350 thousand visitors");
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].scale, Scale::Billion);
        assert_eq!(tokens[0].currency.as_deref(), Some("USD"));
        assert_eq!(tokens[1].scale, Scale::Thousand);
    }

    #[test]
    fn test_months_not_a_scale() {
        assert!(scan("over 18 months").is_empty());
    }

    #[test]
    fn test_claims_include_bare_quantities() {
        let tokens = scan_claims("Our ADR will reach 850 next year and we will sell 2,400 units");
        let values: Vec<f64> = tokens.iter().map(|t| t.value).collect();
        assert_eq!(values, vec![850.0, 2400.0]);
        assert!(tokens.iter().all(|t| t.unit().is_empty()));
        assert!(scan("Our ADR will reach 850 next year").is_empty());
    }

    #[test]
    fn test_claims_skip_years_and_labels() {
        let tokens = scan_claims("In 2008 we had Q2 and A380 fleets, 10x cover, FY2024 and 2024-2026");
        assert!(tokens.is_empty(), "{:?}", tokens);
        let tokens = scan_claims("QR 90m across 1,999 keys");
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[1].value, 1999.0);
    }

    #[test]
    fn test_context_window_char_safe() {
        let text = "ééééé QR 500m ééééé";
        let tokens = scan(text);
        let ctx = context_window(text, tokens[0].start, tokens[0].end, 3);
        assert_eq!(ctx, "éé QR 500m éé");
        assert_eq!(context_window("QR 20m", 0, 6, 80), "QR 20m");
    }
}
