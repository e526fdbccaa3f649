use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::citations;
use crate::council::prompts;
use crate::council::sheet::AnalysisRecord;
use crate::facts::FactMap;
use crate::llm::{complete_with_retry, CompletionClient, CompletionRequest, Message, RetryPolicy};
use crate::personas::Persona;
use crate::quality::{reinforcer, validate, ValidationReport};

/// Confidence used in place of the validator blend when validation is off.
const UNVALIDATED_CONFIDENCE: f64 = 0.5;
const CITATION_BONUS: f64 = 0.05;
const MAX_CITATION_BONUS: f64 = 0.2;
/// Multiplier when nothing in the answer is grounded.
const NO_DATA_PENALTY: f64 = 0.8;
const MIN_AVAILABLE_CONFIDENCE: f64 = 0.1;

/// Knobs a specialist needs from the pipeline configuration.
#[derive(Debug, Clone)]
pub struct SpecialistSettings {
    pub retry: RetryPolicy,
    /// Zero disables reinforcement.
    pub max_reinforcement_retries: u32,
    pub enable_validation: bool,
    pub context_char_budget: usize,
}

/// One domain expert, parameterised entirely by its persona.
pub struct SpecialistAgent {
    persona: Persona,
    client: Arc<dyn CompletionClient>,
    settings: SpecialistSettings,
}

impl SpecialistAgent {
    pub fn new(persona: Persona, client: Arc<dyn CompletionClient>, settings: SpecialistSettings) -> Self {
        Self {
            persona,
            client,
            settings,
        }
    }

    pub fn persona(&self) -> &Persona {
        &self.persona
    }

    /// Never fails: provider errors become an unavailable record.
    pub async fn analyze(&self, query: &str, context: &str, facts: &FactMap) -> AnalysisRecord {
        let started = Instant::now();
        let name = self.persona.name.as_str();
        let prompt = prompts::specialist_prompt(
            &self.persona,
            query,
            context,
            facts,
            self.settings.context_char_budget,
        );

        let mut messages = vec![Message::user(prompt)];
        let mut input_tokens = 0u32;
        let mut output_tokens = 0u32;

        let first = match complete_with_retry(
            self.client.as_ref(),
            &self.request(messages.clone()),
            self.settings.retry,
        )
        .await
        {
            Ok(c) => c,
            Err(e) => {
                warn!(agent = %name, error = %e, "specialist unavailable");
                return AnalysisRecord::unavailable(
                    name,
                    &self.persona.domain,
                    e.to_string(),
                    started.elapsed().as_millis() as u64,
                );
            }
        };
        input_tokens += first.input_tokens;
        output_tokens += first.output_tokens;
        let mut text = first.text;

        let mut retries = 0u32;
        while retries < self.settings.max_reinforcement_retries {
            let Some(addendum) = reinforcer::reinforcement_for(&text, &self.persona) else {
                break;
            };
            info!(agent = %name, attempt = retries + 1, "reinforcing specialist response");
            messages.push(Message::assistant(text.clone()));
            messages.push(Message::user(addendum));

            match complete_with_retry(
                self.client.as_ref(),
                &self.request(messages.clone()),
                self.settings.retry,
            )
            .await
            {
                Ok(c) => {
                    input_tokens += c.input_tokens;
                    output_tokens += c.output_tokens;
                    text = c.text;
                    retries += 1;
                }
                Err(e) => {
                    // The earlier answer still stands; the failed attempt is not a retry.
                    warn!(agent = %name, error = %e, "reinforced call failed; keeping previous answer");
                    break;
                }
            }
        }

        let validation = if self.settings.enable_validation {
            validate(&text)
        } else {
            ValidationReport::not_evaluated()
        };
        let confidence = specialist_confidence(&validation, &text, facts);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        info!(
            agent = %name,
            score = validation.overall_score,
            retries,
            confidence,
            elapsed_ms,
            "specialist done"
        );
        debug!(agent = %name, text = %text.chars().take(200).collect::<String>(), "specialist output");

        AnalysisRecord {
            agent_name: name.to_string(),
            domain: self.persona.domain.clone(),
            raw_text: text,
            retries,
            validation,
            reinforcement_applied: retries > 0,
            confidence,
            available: true,
            error: None,
            input_tokens,
            output_tokens,
            elapsed_ms,
        }
    }

    fn request(&self, messages: Vec<Message>) -> CompletionRequest {
        CompletionRequest {
            label: self.persona.name.clone(),
            messages,
            tier: self.persona.tier,
            temperature: self.persona.temperature,
            max_tokens: self.persona.max_tokens,
        }
    }
}

/// Validator blend, raised by grounded citations and lowered when nothing is grounded.
pub fn specialist_confidence(validation: &ValidationReport, text: &str, facts: &FactMap) -> f64 {
    let base = if validation.evaluated {
        validation.confidence()
    } else {
        UNVALIDATED_CONFIDENCE
    };
    let grounded = citations::count_grounded_citations(text, facts);
    let mut confidence = base + (CITATION_BONUS * grounded as f64).min(MAX_CITATION_BONUS);
    if facts.is_empty() || (grounded == 0 && !citations::has_citation_marker(text)) {
        confidence *= NO_DATA_PENALTY;
    }
    confidence.clamp(MIN_AVAILABLE_CONFIDENCE, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::ExtractedFact;
    use crate::llm::testing::ScriptedCompletionClient;
    use crate::llm::CompletionError;
    use crate::personas::PersonaCatalog;
    use std::time::Duration;

    const BOILERPLATE: &str =
        "Based on comprehensive analysis, it is recommended that further research be conducted.";

    fn settings(max_retries: u32) -> SpecialistSettings {
        SpecialistSettings {
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            max_reinforcement_retries: max_retries,
            enable_validation: true,
            context_char_budget: 2500,
        }
    }

    fn agent(client: Arc<ScriptedCompletionClient>, max_retries: u32) -> SpecialistAgent {
        let persona = PersonaCatalog::builtin()
            .unwrap()
            .get("real_estate_expert")
            .unwrap()
            .clone();
        SpecialistAgent::new(persona, client, settings(max_retries))
    }

    #[tokio::test]
    async fn test_good_answer_not_reinforced() {
        let catalog = PersonaCatalog::builtin().unwrap();
        let exemplar = catalog.get("real_estate_expert").unwrap().exemplar.clone();
        let client = Arc::new(ScriptedCompletionClient::new("").reply("real_estate_expert", &exemplar));
        let record = agent(client.clone(), 1).analyze("q", "", &FactMap::new()).await;
        assert!(record.available);
        assert_eq!(record.retries, 0);
        assert!(!record.reinforcement_applied);
        assert_eq!(client.calls().len(), 1);
        assert!(record.confidence > 0.0 && record.confidence <= 1.0);
    }

    #[tokio::test]
    async fn test_boilerplate_reinforced_once() {
        let catalog = PersonaCatalog::builtin().unwrap();
        let exemplar = catalog.get("real_estate_expert").unwrap().exemplar.clone();
        let client = Arc::new(
            ScriptedCompletionClient::new("")
                .reply("real_estate_expert", BOILERPLATE)
                .reply("real_estate_expert", &exemplar),
        );
        let record = agent(client.clone(), 1).analyze("q", "", &FactMap::new()).await;
        assert_eq!(record.retries, 1);
        assert!(record.reinforcement_applied);
        assert_eq!(record.raw_text, exemplar);

        let calls = client.calls_for("real_estate_expert");
        assert_eq!(calls.len(), 2);
        let follow_up = &calls[1].messages;
        assert_eq!(follow_up.len(), 3);
        assert_eq!(follow_up[0], calls[0].messages[0]);
        assert_eq!(follow_up[1].role, "assistant");
        assert_eq!(follow_up[1].content, BOILERPLATE);
        assert_eq!(follow_up[2].role, "user");
        assert!(follow_up[2].content.contains("comprehensive"));
    }

    #[tokio::test]
    async fn test_retry_cap_respected() {
        let client = Arc::new(ScriptedCompletionClient::new("").reply("real_estate_expert", BOILERPLATE));
        let record = agent(client.clone(), 1).analyze("q", "", &FactMap::new()).await;
        assert_eq!(record.retries, 1);
        assert_eq!(client.calls().len(), 2);
        assert!(record.validation.overall_score < 10);
    }

    #[tokio::test]
    async fn test_failed_reinforced_call_keeps_first_answer() {
        let client = Arc::new(
            ScriptedCompletionClient::new("")
                .reply("real_estate_expert", BOILERPLATE)
                .fail(
                    "real_estate_expert",
                    CompletionError::InvalidRequest("content policy".into()),
                ),
        );
        let record = agent(client.clone(), 1).analyze("q", "", &FactMap::new()).await;
        assert!(record.available);
        assert_eq!(record.raw_text, BOILERPLATE);
        assert_eq!(record.retries, 0);
        assert!(!record.reinforcement_applied);
        assert_eq!(client.calls_for("real_estate_expert").len(), 2);
    }

    #[tokio::test]
    async fn test_reinforcement_disabled() {
        let client = Arc::new(ScriptedCompletionClient::new("").reply("real_estate_expert", BOILERPLATE));
        let record = agent(client.clone(), 0).analyze("q", "", &FactMap::new()).await;
        assert_eq!(record.retries, 0);
        assert_eq!(client.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_provider_failure_is_unavailable() {
        let client = Arc::new(ScriptedCompletionClient::new("").fail(
            "real_estate_expert",
            CompletionError::InvalidRequest("content policy".into()),
        ));
        let record = agent(client, 1).analyze("q", "", &FactMap::new()).await;
        assert!(!record.available);
        assert_eq!(record.raw_text, "<unavailable>");
        assert_eq!(record.confidence, 0.0);
        assert!(record.error.as_deref().unwrap_or("").contains("content policy"));
    }

    #[tokio::test]
    async fn test_rate_limit_exhaustion_is_unavailable() {
        let client = Arc::new(ScriptedCompletionClient::new("").fail(
            "real_estate_expert",
            CompletionError::RateLimited { retry_after: None },
        ));
        let record = agent(client.clone(), 1).analyze("q", "", &FactMap::new()).await;
        assert!(!record.available);
        assert_eq!(client.calls().len(), 3);
    }

    #[test]
    fn test_confidence_rewards_grounded_citations() {
        let mut facts = FactMap::new();
        facts.insert(
            "q2_2025_revenue".to_string(),
            ExtractedFact {
                value: 412.5,
                unit: "QR million".to_string(),
                fiscal_period: Some("Q2 2025".to_string()),
                quote: "Q2 2025 revenue was QR 412.5 million".to_string(),
                confidence: 0.9,
            },
        );
        let cited = "Revenue [Per extraction: \"Q2 2025 revenue was QR 412.5 million\"]";
        let report = validate(cited);
        let with = specialist_confidence(&report, cited, &facts);
        let without = specialist_confidence(&report, cited, &FactMap::new());
        assert!(with > without);
        assert!(without >= MIN_AVAILABLE_CONFIDENCE);
    }
}
