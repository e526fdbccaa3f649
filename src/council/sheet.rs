use serde::{Deserialize, Serialize};

use crate::council::debate::DebateRecord;
use crate::facts::FactMap;
use crate::llm::ModelTier;
use crate::quality::{QualityStats, ValidationReport};
use crate::verify::FabricationFinding;

/// Text carried by an analysis whose specialist failed.
pub const UNAVAILABLE: &str = "<unavailable>";

/// Output of one specialist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    #[serde(rename = "agent")]
    pub agent_name: String,
    pub domain: String,
    #[serde(rename = "analysis")]
    pub raw_text: String,
    pub retries: u32,
    pub validation: ValidationReport,
    pub reinforcement_applied: bool,
    pub confidence: f64,
    /// False when the specialist failed; the orchestrator never sees these.
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub elapsed_ms: u64,
}

impl AnalysisRecord {
    pub fn unavailable(agent_name: &str, domain: &str, error: String, elapsed_ms: u64) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            domain: domain.to_string(),
            raw_text: UNAVAILABLE.to_string(),
            retries: 0,
            validation: ValidationReport::not_evaluated(),
            reinforcement_applied: false,
            confidence: 0.0,
            available: false,
            error: Some(error),
            input_tokens: 0,
            output_tokens: 0,
            elapsed_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SheetStatus {
    Ok,
    Degraded,
    Cancelled,
}

/// Timed pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Retrieve,
    Extract,
    AnalyzeParallel,
    DetectDebates,
    Synthesize,
    Verify,
    Assemble,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Retrieve => "retrieve",
            Stage::Extract => "extract",
            Stage::AnalyzeParallel => "analyze_parallel",
            Stage::DetectDebates => "detect_debates",
            Stage::Synthesize => "synthesize",
            Stage::Verify => "verify",
            Stage::Assemble => "assemble",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageMetrics {
    pub stage: Stage,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<ModelTier>,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
    /// Mean validator score over available specialists.
    pub average_score: f64,
    pub expert_level_count: usize,
    pub specialists_available: usize,
    pub specialists_total: usize,
    pub tracker: QualityStats,
    /// Validator report for the synthesis text, when one was produced and validation is on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<ValidationReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetMetadata {
    pub request_id: String,
    /// RFC 3339.
    pub started_at: String,
    pub status: SheetStatus,
    pub total_elapsed_ms: u64,
    pub stages: Vec<StageMetrics>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub retrieved_citations: Vec<String>,
    pub extracted_facts: FactMap,
    pub fabrication_findings: Vec<FabricationFinding>,
    pub retrieval_confidence: f64,
    pub validation_confidence: f64,
    /// `None` when the verifier could not run to completion.
    pub verification_confidence: Option<f64>,
    pub overall_confidence: f64,
    pub degraded_specialists: Vec<String>,
    pub degraded_stages: Vec<String>,
    pub errors: Vec<String>,
}

/// The pipeline's final artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionSheet {
    pub query: String,
    pub executive_summary: String,
    pub expert_analyses: Vec<AnalysisRecord>,
    pub quality_assessment: QualityAssessment,
    pub expert_debates: Vec<DebateRecord>,
    pub final_recommendation: String,
    pub metadata: SheetMetadata,
}

impl DecisionSheet {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn analysis(&self, agent: &str) -> Option<&AnalysisRecord> {
        self.expert_analyses.iter().find(|a| a.agent_name == agent)
    }
}
