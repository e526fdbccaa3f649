//! Expert personas are configuration: loaded once from a static JSON catalog
//! and identical across requests.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::llm::ModelTier;

const BUILTIN_CATALOG: &str = include_str!("catalog.json");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    /// Stable identifier, also used as the completion label.
    pub name: String,
    pub title: String,
    pub domain: String,
    /// First-person voice, embedded verbatim in prompts.
    pub identity: String,
    pub reasoning_scaffold_text: String,
    pub required_moves: Vec<String>,
    pub tone_forbidden_phrases: Vec<String>,
    pub tone_required_phrases: Vec<String>,
    /// Short sample of the expected register, reused by reinforcement.
    pub exemplar: String,
    pub tier: ModelTier,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaCatalog {
    specialists: Vec<Persona>,
    orchestrator: Persona,
}

impl PersonaCatalog {
    /// The catalog compiled into the crate.
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN_CATALOG).context("builtin persona catalog")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading persona catalog {:?}", path))?;
        Self::from_json(&raw).with_context(|| format!("parsing persona catalog {:?}", path))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let catalog: Self = serde_json::from_str(raw).context("persona catalog JSON")?;
        catalog.validate()?;
        Ok(catalog)
    }

    fn validate(&self) -> Result<()> {
        if self.specialists.is_empty() {
            anyhow::bail!("persona catalog has no specialists");
        }
        let mut names = HashSet::new();
        for p in self.specialists.iter().chain(std::iter::once(&self.orchestrator)) {
            if p.name.trim().is_empty() {
                anyhow::bail!("persona with empty name");
            }
            if !names.insert(p.name.as_str()) {
                anyhow::bail!("duplicate persona name '{}'", p.name);
            }
            if !(0.0..=2.0).contains(&p.temperature) {
                anyhow::bail!("persona '{}' temperature {} out of range", p.name, p.temperature);
            }
            if p.max_tokens == 0 {
                anyhow::bail!("persona '{}' has max_tokens 0", p.name);
            }
            if p.required_moves.is_empty() {
                anyhow::bail!("persona '{}' lists no required thinking moves", p.name);
            }
        }
        Ok(())
    }

    pub fn specialists(&self) -> &[Persona] {
        &self.specialists
    }

    pub fn orchestrator(&self) -> &Persona {
        &self.orchestrator
    }

    pub fn get(&self, name: &str) -> Option<&Persona> {
        self.specialists
            .iter()
            .chain(std::iter::once(&self.orchestrator))
            .find(|p| p.name == name)
    }
}
