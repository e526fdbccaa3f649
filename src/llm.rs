use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Capability tier requested from the provider. Mapped to concrete model ids by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Fast,
    Standard,
    Deep,
}

impl ModelTier {
    /// Per-call wall-clock budget.
    pub fn timeout(&self) -> Duration {
        match self {
            ModelTier::Deep => Duration::from_secs(600),
            ModelTier::Fast | ModelTier::Standard => Duration::from_secs(60),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Fast => "fast",
            ModelTier::Standard => "standard",
            ModelTier::Deep => "deep",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    /// Caller tag (persona name or stage), used for logging and by test doubles.
    pub label: String,
    pub messages: Vec<Message>,
    pub tier: ModelTier,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl CompletionRequest {
    /// Single-turn request built from one user prompt.
    pub fn prompt(
        label: &str,
        prompt: impl Into<String>,
        tier: ModelTier,
        temperature: f32,
        max_tokens: u32,
    ) -> Self {
        Self {
            label: label.to_string(),
            messages: vec![Message::user(prompt)],
            tier,
            temperature,
            max_tokens,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, Error)]
pub enum CompletionError {
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("completion timed out after {0:?}")]
    Timeout(Duration),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<CompletionError>,
    },
}

impl CompletionError {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CompletionError::ProviderUnavailable(_)
                | CompletionError::RateLimited { .. }
                | CompletionError::Timeout(_)
        )
    }
}

/// The only seam between the pipeline and an LLM provider.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, CompletionError>;
}

/// Bounded exponential backoff for transient provider errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32, err: &CompletionError) -> Duration {
        if let CompletionError::RateLimited {
            retry_after: Some(after),
        } = err
        {
            return (*after).min(self.max_delay);
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Issue a completion, retrying transient failures per `policy`.
/// Fatal errors return immediately; exhausted retries surface as `Exhausted`.
pub async fn complete_with_retry(
    client: &dyn CompletionClient,
    request: &CompletionRequest,
    policy: RetryPolicy,
) -> Result<Completion, CompletionError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let budget = request.tier.timeout();
        let outcome = match tokio::time::timeout(budget, client.complete(request)).await {
            Ok(result) => result,
            Err(_) => Err(CompletionError::Timeout(budget)),
        };

        match outcome {
            Ok(completion) => {
                debug!(
                    label = %request.label,
                    tier = request.tier.as_str(),
                    attempt,
                    input_tokens = completion.input_tokens,
                    output_tokens = completion.output_tokens,
                    "completion ok"
                );
                return Ok(completion);
            }
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt, &err);
                warn!(
                    label = %request.label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient completion failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) if err.is_transient() => {
                return Err(CompletionError::Exhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }
            Err(err) => return Err(err),
        }
    }
}

/// Tier → provider model id mapping.
#[derive(Debug, Clone)]
pub struct ModelMap {
    pub fast: String,
    pub standard: String,
    pub deep: String,
}

impl ModelMap {
    pub fn resolve(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Fast => &self.fast,
            ModelTier::Standard => &self.standard,
            ModelTier::Deep => &self.deep,
        }
    }
}

/// OpenAI-compatible chat-completions client.
pub struct HttpCompletionClient {
    client: reqwest::Client,
    base_url: String,
    models: ModelMap,
    api_key: String,
}

impl HttpCompletionClient {
    pub fn new(base_url: &str, api_key: &str, models: ModelMap) -> Result<Self> {
        if api_key.trim().is_empty() {
            anyhow::bail!("completion provider API key is empty");
        }
        // Per-request timeouts are applied by tier; this is only the connect budget.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.to_string(),
            models,
            api_key: api_key.to_string(),
        })
    }

    /// Resolve the chat completions endpoint from the base URL.
    fn endpoint(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else if base.ends_with("/v1") {
            format!("{}/chat/completions", base)
        } else {
            format!("{}/v1/chat/completions", base)
        }
    }
}

fn classify_status(status: reqwest::StatusCode, retry_after: Option<Duration>, body: &str) -> CompletionError {
    let snippet: String = body.chars().take(300).collect();
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        CompletionError::RateLimited { retry_after }
    } else if status == reqwest::StatusCode::REQUEST_TIMEOUT || status.is_server_error() {
        CompletionError::ProviderUnavailable(format!("HTTP {}: {}", status.as_u16(), snippet))
    } else {
        CompletionError::InvalidRequest(format!("HTTP {}: {}", status.as_u16(), snippet))
    }
}

fn parse_completion(json: &serde_json::Value) -> Completion {
    // choices[0].message.content may be null
    let text = json["choices"]
        .get(0)
        .and_then(|c| c["message"]["content"].as_str())
        .unwrap_or("")
        .to_string();
    let input_tokens = json["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32;
    let output_tokens = json["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32;
    Completion {
        text,
        input_tokens,
        output_tokens,
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, CompletionError> {
        let model = self.models.resolve(request.tier);
        let body = serde_json::json!({
            "model": model,
            "messages": request.messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });

        let resp = self
            .client
            .post(self.endpoint())
            .timeout(request.tier.timeout())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CompletionError::Timeout(request.tier.timeout())
                } else {
                    CompletionError::ProviderUnavailable(e.to_string())
                }
            })?;

        let status = resp.status();
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = resp
            .text()
            .await
            .map_err(|e| CompletionError::ProviderUnavailable(format!("reading body: {}", e)))?;

        if !status.is_success() {
            return Err(classify_status(status, retry_after, &text));
        }

        let json: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| CompletionError::ProviderUnavailable(format!("malformed JSON: {}", e)))?;
        Ok(parse_completion(&json))
    }
}

/// Deterministic completion client for tests and offline replays.
pub mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{Completion, CompletionClient, CompletionError, CompletionRequest};

    #[derive(Debug, Clone)]
    struct Script {
        replies: Vec<Result<String, CompletionError>>,
        delay: Option<Duration>,
    }

    /// Replies keyed by request label. Each label walks its reply list and then
    /// repeats the last entry; unknown labels get the fallback reply.
    pub struct ScriptedCompletionClient {
        scripts: HashMap<String, Script>,
        fallback: String,
        calls: Mutex<Vec<CompletionRequest>>,
        served: Mutex<HashMap<String, usize>>,
    }

    impl ScriptedCompletionClient {
        pub fn new(fallback: &str) -> Self {
            Self {
                scripts: HashMap::new(),
                fallback: fallback.to_string(),
                calls: Mutex::new(Vec::new()),
                served: Mutex::new(HashMap::new()),
            }
        }

        pub fn reply(mut self, label: &str, text: &str) -> Self {
            self.script_mut(label).replies.push(Ok(text.to_string()));
            self
        }

        pub fn fail(mut self, label: &str, err: CompletionError) -> Self {
            self.script_mut(label).replies.push(Err(err));
            self
        }

        pub fn delay(mut self, label: &str, delay: Duration) -> Self {
            self.script_mut(label).delay = Some(delay);
            self
        }

        fn script_mut(&mut self, label: &str) -> &mut Script {
            self.scripts.entry(label.to_string()).or_insert(Script {
                replies: Vec::new(),
                delay: None,
            })
        }

        /// Every request received so far, in arrival order.
        pub fn calls(&self) -> Vec<CompletionRequest> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }

        pub fn calls_for(&self, label: &str) -> Vec<CompletionRequest> {
            self.calls()
                .into_iter()
                .filter(|c| c.label == label)
                .collect()
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedCompletionClient {
        async fn complete(
            &self,
            request: &CompletionRequest,
        ) -> Result<Completion, CompletionError> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(request.clone());
            }

            let script = self.scripts.get(&request.label);
            if let Some(delay) = script.and_then(|s| s.delay) {
                tokio::time::sleep(delay).await;
            }

            let reply = match script {
                Some(s) if !s.replies.is_empty() => {
                    let index = {
                        let mut served = self
                            .served
                            .lock()
                            .map_err(|_| CompletionError::ProviderUnavailable("poisoned".into()))?;
                        let n = served.entry(request.label.clone()).or_insert(0);
                        let i = (*n).min(s.replies.len() - 1);
                        *n += 1;
                        i
                    };
                    s.replies[index].clone()
                }
                _ => Ok(self.fallback.clone()),
            };

            reply.map(|text| Completion {
                input_tokens: request
                    .messages
                    .iter()
                    .map(|m| m.content.split_whitespace().count() as u32)
                    .sum(),
                output_tokens: text.split_whitespace().count() as u32,
                text,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedCompletionClient;
    use super::*;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_tier_timeouts() {
        assert_eq!(ModelTier::Deep.timeout(), Duration::from_secs(600));
        assert_eq!(ModelTier::Fast.timeout(), Duration::from_secs(60));
        assert_eq!(ModelTier::Standard.timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_transient_classification() {
        assert!(CompletionError::RateLimited { retry_after: None }.is_transient());
        assert!(CompletionError::ProviderUnavailable("503".into()).is_transient());
        assert!(!CompletionError::InvalidRequest("bad".into()).is_transient());
    }

    #[test]
    fn test_status_mapping() {
        let err = classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, None, "");
        assert!(matches!(err, CompletionError::RateLimited { .. }));
        let err = classify_status(reqwest::StatusCode::BAD_GATEWAY, None, "");
        assert!(matches!(err, CompletionError::ProviderUnavailable(_)));
        let err = classify_status(reqwest::StatusCode::BAD_REQUEST, None, "nope");
        assert!(matches!(err, CompletionError::InvalidRequest(_)));
    }

    #[test]
    fn test_parse_completion_usage() {
        let json = serde_json::json!({
            "choices": [{"message": {"content": "hello"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3}
        });
        let c = parse_completion(&json);
        assert_eq!(c.text, "hello");
        assert_eq!(c.input_tokens, 12);
        assert_eq!(c.output_tokens, 3);
    }

    #[test]
    fn test_parse_completion_null_content() {
        let json = serde_json::json!({"choices": [{"message": {"content": null}}]});
        assert_eq!(parse_completion(&json).text, "");
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        let err = CompletionError::ProviderUnavailable("x".into());
        assert_eq!(policy.delay_for(1, &err), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2, &err), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(10, &err), Duration::from_secs(8));
        let limited = CompletionError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(policy.delay_for(1, &limited), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_retry_recovers_from_rate_limit() {
        let client = ScriptedCompletionClient::new("fallback")
            .fail("a", CompletionError::RateLimited { retry_after: None })
            .reply("a", "ok now");
        let req = CompletionRequest::prompt("a", "hi", ModelTier::Fast, 0.2, 10);
        let out = complete_with_retry(&client, &req, fast_policy()).await.unwrap();
        assert_eq!(out.text, "ok now");
        assert_eq!(client.calls_for("a").len(), 2);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_three_attempts() {
        let client = ScriptedCompletionClient::new("fallback")
            .fail("a", CompletionError::RateLimited { retry_after: None });
        let req = CompletionRequest::prompt("a", "hi", ModelTier::Fast, 0.2, 10);
        let err = complete_with_retry(&client, &req, fast_policy())
            .await
            .unwrap_err();
        assert!(matches!(err, CompletionError::Exhausted { attempts: 3, .. }));
        assert_eq!(client.calls_for("a").len(), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let client = ScriptedCompletionClient::new("fallback")
            .fail("a", CompletionError::InvalidRequest("policy".into()));
        let req = CompletionRequest::prompt("a", "hi", ModelTier::Standard, 0.2, 10);
        let err = complete_with_retry(&client, &req, fast_policy())
            .await
            .unwrap_err();
        assert!(matches!(err, CompletionError::InvalidRequest(_)));
        assert_eq!(client.calls_for("a").len(), 1);
    }

    #[test]
    fn test_http_client_requires_key() {
        let models = ModelMap {
            fast: "f".into(),
            standard: "s".into(),
            deep: "d".into(),
        };
        assert!(HttpCompletionClient::new("http://localhost:1234/v1", "", models).is_err());
    }
}
