use std::sync::Arc;

use tracing::{debug, info};

use crate::council::debate::DebateRecord;
use crate::council::prompts;
use crate::council::sheet::AnalysisRecord;
use crate::llm::{
    complete_with_retry, CompletionClient, CompletionError, CompletionRequest, Message, RetryPolicy,
};
use crate::personas::Persona;

/// Paragraphs shorter than this are skipped when picking the executive summary.
const MIN_SUMMARY_CHARS: usize = 80;

const SECTION_LABELS: &[&str] = &[
    "executive summary",
    "strategic rationale",
    "execution plan",
    "risk mitigation",
    "decision recommendation",
];

#[derive(Debug, Clone)]
pub struct Synthesis {
    pub text: String,
    pub executive_summary: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

pub struct Orchestrator {
    persona: Persona,
    client: Arc<dyn CompletionClient>,
    retry: RetryPolicy,
}

impl Orchestrator {
    pub fn new(persona: Persona, client: Arc<dyn CompletionClient>, retry: RetryPolicy) -> Self {
        Self {
            persona,
            client,
            retry,
        }
    }

    pub fn persona(&self) -> &Persona {
        &self.persona
    }

    pub async fn synthesize(
        &self,
        query: &str,
        analyses: &[AnalysisRecord],
        debates: &[DebateRecord],
    ) -> Result<Synthesis, CompletionError> {
        let prompt = prompts::orchestrator_prompt(&self.persona, query, analyses, debates);
        let request = CompletionRequest {
            label: self.persona.name.clone(),
            messages: vec![Message::user(prompt)],
            tier: self.persona.tier,
            temperature: self.persona.temperature,
            max_tokens: self.persona.max_tokens,
        };
        let completion = complete_with_retry(self.client.as_ref(), &request, self.retry).await?;

        let executive_summary = executive_summary(&completion.text);
        info!(
            chars = completion.text.len(),
            debates = debates.len(),
            "synthesis complete"
        );
        debug!(summary = %executive_summary, "executive summary");

        Ok(Synthesis {
            text: completion.text,
            executive_summary,
            input_tokens: completion.input_tokens,
            output_tokens: completion.output_tokens,
        })
    }
}

/// First substantial paragraph of `text` with headings and section labels removed.
pub fn executive_summary(text: &str) -> String {
    let paragraphs: Vec<String> = text
        .split("\n\n")
        .map(clean_paragraph)
        .filter(|p| !p.is_empty())
        .collect();
    paragraphs
        .iter()
        .find(|p| p.chars().count() >= MIN_SUMMARY_CHARS)
        .or_else(|| paragraphs.first())
        .cloned()
        .unwrap_or_default()
}

fn clean_paragraph(paragraph: &str) -> String {
    let lines: Vec<&str> = paragraph
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#') && !is_label_line(l))
        .collect();
    let joined = lines.join(" ");
    strip_label_prefix(&joined).trim().to_string()
}

fn label_core(line: &str) -> String {
    line.trim_matches(|c: char| c == '*' || c == ':' || c == '.' || c.is_ascii_digit() || c.is_whitespace())
        .to_ascii_lowercase()
}

fn is_label_line(line: &str) -> bool {
    SECTION_LABELS.contains(&label_core(line).as_str())
}

/// "**Executive Summary:** text" → "text".
fn strip_label_prefix(text: &str) -> &str {
    let trimmed = text.trim_start_matches(|c: char| c == '*' || c.is_whitespace());
    for label in SECTION_LABELS {
        if trimmed.len() >= label.len()
            && trimmed.is_char_boundary(label.len())
            && trimmed[..label.len()].eq_ignore_ascii_case(label)
        {
            return trimmed[label.len()..]
                .trim_start_matches(|c: char| c == '*' || c == ':' || c == '-' || c.is_whitespace());
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedCompletionClient;
    use crate::llm::ModelTier;
    use crate::personas::PersonaCatalog;
    use crate::quality::ValidationReport;
    use std::time::Duration;

    const SYNTHESIS: &str = "## Executive Summary\n\nCONDITIONAL GO on The Pearl mid-market, NO-GO on Lusail luxury until absorption recovers below eighteen months of stock.\n\n## Strategic Rationale\n\nFinance and infrastructure agree.";

    #[test]
    fn test_summary_skips_headings() {
        assert!(executive_summary(SYNTHESIS).starts_with("CONDITIONAL GO on The Pearl"));
    }

    #[test]
    fn test_summary_strips_inline_label() {
        let text = "**Executive Summary:** NO-GO on Lusail luxury this cycle; the numbers do not work at current absorption rates and leverage.";
        assert!(executive_summary(text).starts_with("NO-GO on Lusail"));
    }

    #[test]
    fn test_summary_falls_back_to_short_paragraph() {
        assert_eq!(executive_summary("1. Executive Summary\nGO.\n\nshort"), "GO.");
        assert_eq!(executive_summary(""), "");
    }

    #[tokio::test]
    async fn test_synthesize_uses_deep_tier() {
        let catalog = PersonaCatalog::builtin().unwrap();
        let client = Arc::new(ScriptedCompletionClient::new("").reply("master_orchestrator", SYNTHESIS));
        let orch = Orchestrator::new(
            catalog.orchestrator().clone(),
            client.clone(),
            RetryPolicy {
                max_attempts: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
        );
        let analyses = vec![AnalysisRecord {
            agent_name: "finance_expert".to_string(),
            domain: "finance".to_string(),
            raw_text: "I'd fund The Pearl.".to_string(),
            retries: 0,
            validation: ValidationReport::not_evaluated(),
            reinforcement_applied: false,
            confidence: 0.5,
            available: true,
            error: None,
            input_tokens: 0,
            output_tokens: 0,
            elapsed_ms: 0,
        }];
        let synthesis = orch.synthesize("q", &analyses, &[]).await.unwrap();
        assert_eq!(synthesis.text, SYNTHESIS);
        let calls = client.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tier, ModelTier::Deep);
        assert!((calls[0].temperature - 0.8).abs() < 1e-6);
    }
}
