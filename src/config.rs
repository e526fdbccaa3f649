use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::Level;

use crate::llm::{ModelMap, RetryPolicy};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_EMBEDDING_MODEL: &str = "local-hash-v1";

/// Hard wall-clock budget per pipeline stage.
#[derive(Debug, Clone, Copy)]
pub struct StageTimeouts {
    pub retrieve: Duration,
    pub extract: Duration,
    pub analyze: Duration,
    pub synthesize: Duration,
    pub verify: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            retrieve: Duration::from_secs(10),
            extract: Duration::from_secs(60),
            analyze: Duration::from_secs(600),
            synthesize: Duration::from_secs(600),
            verify: Duration::from_secs(30),
        }
    }
}

/// Provider connection settings. Only consulted when building the HTTP client.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub models: ModelMap,
}

/// Tunables for one pipeline instance.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub provider: ProviderConfig,
    pub embedding_model: String,
    pub kb_dir: PathBuf,
    pub enable_reinforcement: bool,
    pub enable_validation: bool,
    /// Upper bound on reinforced retries per specialist.
    pub max_reinforcement_retries: u32,
    pub retrieval_top_k: usize,
    pub context_char_budget: usize,
    pub retry: RetryPolicy,
    pub timeouts: StageTimeouts,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig {
                base_url: DEFAULT_BASE_URL.to_string(),
                api_key: None,
                models: ModelMap {
                    fast: "gpt-4o-mini".to_string(),
                    standard: "gpt-4o".to_string(),
                    deep: "o1".to_string(),
                },
            },
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            kb_dir: PathBuf::from("./data/kb"),
            enable_reinforcement: true,
            enable_validation: true,
            max_reinforcement_retries: 1,
            retrieval_top_k: 8,
            context_char_budget: 2500,
            retry: RetryPolicy::default(),
            timeouts: StageTimeouts::default(),
        }
    }
}

fn env_flag(name: &str, default: bool) -> Result<bool> {
    match dotenv::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => anyhow::bail!("{} must be a boolean, got '{}'", name, other),
        },
        Err(_) => Ok(default),
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match dotenv::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{}: {}", name, e)),
        Err(_) => Ok(default),
    }
}

impl PipelineConfig {
    /// Load from the process environment (and `.env` if present).
    pub fn from_env() -> Result<Self> {
        let _ = dotenv::dotenv();
        let defaults = Self::default();

        let standard = dotenv::var("LLM_MODEL_STANDARD")
            .or_else(|_| dotenv::var("LLM_MODEL"))
            .unwrap_or(defaults.provider.models.standard);
        let fast = dotenv::var("LLM_MODEL_FAST").unwrap_or(defaults.provider.models.fast);
        let deep = dotenv::var("LLM_MODEL_DEEP").unwrap_or(defaults.provider.models.deep);

        let provider = ProviderConfig {
            base_url: dotenv::var("LLM_BASE_URL").unwrap_or(defaults.provider.base_url),
            api_key: dotenv::var("LLM_API_KEY").ok().filter(|k| !k.is_empty()),
            models: ModelMap {
                fast,
                standard,
                deep,
            },
        };

        Ok(Self {
            provider,
            embedding_model: dotenv::var("EMBEDDING_MODEL")
                .ok()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or(defaults.embedding_model),
            kb_dir: dotenv::var("KB_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.kb_dir),
            enable_reinforcement: env_flag("ENABLE_REINFORCEMENT", true)?,
            enable_validation: env_flag("ENABLE_VALIDATION", true)?,
            max_reinforcement_retries: env_parse("MAX_REINFORCEMENT_RETRIES", 1u32)?,
            retrieval_top_k: env_parse("RETRIEVAL_TOP_K", defaults.retrieval_top_k)?,
            context_char_budget: env_parse("CONTEXT_CHAR_BUDGET", defaults.context_char_budget)?,
            retry: defaults.retry,
            timeouts: defaults.timeouts,
        })
    }

    /// API key or a startup error; a missing key is a programmer error, not a degradation.
    pub fn require_api_key(&self) -> Result<&str> {
        self.provider
            .api_key
            .as_deref()
            .context("LLM_API_KEY required")
    }
}

/// Install the fmt subscriber. Level from `LOG_LEVEL` (default info).
pub fn init_logging() {
    let level = dotenv::var("LOG_LEVEL")
        .ok()
        .and_then(|l| l.parse::<Level>().ok())
        .unwrap_or(Level::INFO);
    let _ = tracing_subscriber::fmt().with_max_level(level).try_init();
}
