pub mod debate;
pub mod orchestrator;
pub mod prompts;
pub mod sheet;
pub mod specialist;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::facts::{self, FactExtractor, FactMap, HeuristicFactExtractor};
use crate::kb::embed::HashEmbedder;
use crate::kb::types::{RetrievalResult, SearchFilters};
use crate::kb::KnowledgeBase;
use crate::llm::{CompletionClient, HttpCompletionClient, ModelTier};
use crate::personas::PersonaCatalog;
use crate::quality::{validate, QualityTracker, ValidationReport};
use crate::verify::{NumericVerifier, VerificationReport, Verifier};

use debate::{detect_debates, DebateRecord};
use orchestrator::{Orchestrator, Synthesis};
use sheet::{
    AnalysisRecord, DecisionSheet, QualityAssessment, SheetMetadata, SheetStatus, Stage,
    StageMetrics,
};
use specialist::{SpecialistAgent, SpecialistSettings};

/// Final recommendation text when no synthesis could be produced.
pub const SYNTHESIS_UNAVAILABLE: &str = "<synthesis unavailable>";
/// Each confidence factor is floored here before the geometric mean.
const CONFIDENCE_FLOOR: f64 = 0.05;
const MAX_OVERALL_CONFIDENCE: f64 = 0.95;

/// Request-level cancellation shared between the caller and the pipeline.
#[derive(Clone)]
pub struct CancelSignal {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn cancel(&self) {
        let _ = self.sender.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once `cancel` has been called on any clone.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        while !*receiver.borrow_and_update() {
            if receiver.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// The expert-council pipeline (one instance serves many requests).
pub struct Pipeline {
    config: PipelineConfig,
    client: Arc<dyn CompletionClient>,
    kb: Option<Arc<KnowledgeBase>>,
    catalog: PersonaCatalog,
    extractor: Arc<dyn FactExtractor>,
    verifier: Arc<dyn Verifier>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        client: Arc<dyn CompletionClient>,
        kb: Option<Arc<KnowledgeBase>>,
        catalog: PersonaCatalog,
        extractor: Arc<dyn FactExtractor>,
    ) -> Self {
        Self {
            config,
            client,
            kb,
            catalog,
            extractor,
            verifier: Arc::new(NumericVerifier),
        }
    }

    /// Replace the numeric verifier.
    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// HTTP provider, on-disk knowledge base, builtin personas and the heuristic extractor.
    pub async fn from_config(config: PipelineConfig) -> Result<Self> {
        let api_key = config.require_api_key()?;
        let client = HttpCompletionClient::new(
            &config.provider.base_url,
            api_key,
            config.provider.models.clone(),
        )?;
        let embedder = Arc::new(HashEmbedder::new(&config.embedding_model));
        let kb = KnowledgeBase::open(&config.kb_dir, embedder)
            .await
            .with_context(|| format!("opening knowledge base at {:?}", config.kb_dir))?;
        let catalog = PersonaCatalog::builtin()?;
        info!(
            specialists = catalog.specialists().len(),
            kb_dir = ?config.kb_dir,
            "pipeline ready"
        );
        Ok(Self::new(
            config,
            Arc::new(client),
            Some(Arc::new(kb)),
            catalog,
            Arc::new(HeuristicFactExtractor),
        ))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &PersonaCatalog {
        &self.catalog
    }

    /// Run the whole council on `query`. `data_context` replaces retrieval when given.
    ///
    /// Only a blank query is an error; every component failure is folded into
    /// the returned sheet's metadata.
    pub async fn analyze(&self, query: &str, data_context: Option<&str>) -> Result<DecisionSheet> {
        self.analyze_with_cancel(query, data_context, CancelSignal::new())
            .await
    }

    pub async fn analyze_with_cancel(
        &self,
        query: &str,
        data_context: Option<&str>,
        cancel: CancelSignal,
    ) -> Result<DecisionSheet> {
        if query.trim().is_empty() {
            anyhow::bail!("query must not be empty");
        }
        let request_id = Uuid::new_v4().to_string();
        let span = info_span!("analyze", request_id = %request_id);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(request_id = %request_id, "request cancelled; dropping partial results");
                Ok(Run::new(query, request_id).cancelled())
            }
            sheet = self.run(query, data_context, request_id.clone()).instrument(span) => Ok(sheet),
        }
    }

    async fn run(&self, query: &str, data_context: Option<&str>, request_id: String) -> DecisionSheet {
        let mut run = Run::new(query, request_id);
        info!(query = %query, "pipeline started");

        // RETRIEVE
        let t = Instant::now();
        let (context, sources) = match data_context {
            Some(ctx) => {
                run.retrieval_confidence = 1.0;
                (ctx.to_string(), vec![ctx.to_string()])
            }
            None => match self.retrieve(query).await {
                Ok(results) => {
                    run.retrieval_confidence = if results.is_empty() {
                        0.0
                    } else {
                        results.iter().map(|r| r.relevance_score).sum::<f64>()
                            / results.len() as f64
                            / 100.0
                    };
                    run.citations = results.iter().map(|r| r.citation.clone()).collect();
                    (render_context(&results), results.into_iter().map(|r| r.chunk.text).collect())
                }
                Err(e) => {
                    run.record(Stage::Retrieve, t, None, 0, 0);
                    run.degrade(Stage::Retrieve, format!("retrieval failed: {:#}", e));
                    return run.finish(self.catalog.specialists().len());
                }
            },
        };
        run.record(Stage::Retrieve, t, None, 0, 0);
        info!(chunks = run.citations.len(), "retrieved");

        // EXTRACT
        let t = Instant::now();
        let extracted = self.extract(query, &sources).await;
        run.facts = match extracted {
            Ok(found) => facts::retain_grounded(found, &sources),
            Err(e) => {
                run.degrade(Stage::Extract, format!("extraction failed: {:#}", e));
                FactMap::new()
            }
        };
        run.record(Stage::Extract, t, None, 0, 0);
        info!(facts = run.facts.len(), "facts extracted");

        // ANALYZE_PARALLEL
        let t = Instant::now();
        let analyses = self.analyze_parallel(query, &context, &run.facts).await;
        let (input, output) = analyses
            .iter()
            .fold((0, 0), |(i, o), a| (i + a.input_tokens, o + a.output_tokens));
        let tier = self.catalog.specialists().first().map(|p| p.tier);
        run.record(Stage::AnalyzeParallel, t, tier, input, output);
        for analysis in &analyses {
            if analysis.available {
                if analysis.validation.evaluated {
                    run.tracker.record(
                        &analysis.agent_name,
                        analysis.validation.overall_score,
                        analysis.reinforcement_applied,
                    );
                }
            } else {
                run.degraded_specialists.push(analysis.agent_name.clone());
                if let Some(err) = &analysis.error {
                    run.errors.push(format!("{}: {}", analysis.agent_name, err));
                }
            }
        }
        run.analyses = analyses;
        let available = run.available();
        if available == 0 {
            run.degrade(Stage::AnalyzeParallel, "all specialists unavailable");
        }
        info!(
            available,
            total = run.analyses.len(),
            "specialists finished"
        );

        // DETECT_DEBATES
        let t = Instant::now();
        run.debates = detect_debates(&run.analyses);
        run.record(Stage::DetectDebates, t, None, 0, 0);
        if !run.debates.is_empty() {
            info!(debates = run.debates.len(), "specialists disagree");
        }

        // SYNTHESIZE
        let t = Instant::now();
        let orchestrator = self.catalog.orchestrator();
        if available == 0 {
            run.degrade(Stage::Synthesize, "no specialist analysis to synthesize");
        } else {
            let orch = Orchestrator::new(orchestrator.clone(), self.client.clone(), self.config.retry);
            let budget = self.config.timeouts.synthesize;
            match tokio::time::timeout(budget, orch.synthesize(query, &run.analyses, &run.debates)).await {
                Ok(Ok(synthesis)) => {
                    if self.config.enable_validation {
                        run.synthesis_validation = Some(validate(&synthesis.text));
                    }
                    run.synthesis = Some(synthesis);
                }
                Ok(Err(e)) => run.degrade(Stage::Synthesize, format!("synthesis failed: {}", e)),
                Err(_) => run.degrade(
                    Stage::Synthesize,
                    format!("synthesis timed out after {:?}", budget),
                ),
            }
        }
        let (input, output) = run
            .synthesis
            .as_ref()
            .map(|s| (s.input_tokens, s.output_tokens))
            .unwrap_or((0, 0));
        run.record(Stage::Synthesize, t, Some(orchestrator.tier), input, output);

        // VERIFY
        let t = Instant::now();
        let mut texts: Vec<(String, String)> = run
            .analyses
            .iter()
            .filter(|a| a.available)
            .map(|a| (a.agent_name.clone(), a.raw_text.clone()))
            .collect();
        if let Some(synthesis) = &run.synthesis {
            texts.push((orchestrator.name.clone(), synthesis.text.clone()));
        }
        match self.verify(texts, run.facts.clone()).await {
            Ok(report) => {
                info!(
                    findings = report.findings.len(),
                    confidence = report.confidence,
                    "verification done"
                );
                run.verification = Some(report);
            }
            Err(e) => {
                error!(error = %e, "verifier failed; verification confidence unknown");
                run.degrade(Stage::Verify, format!("verification failed: {:#}", e));
            }
        }
        run.record(Stage::Verify, t, None, 0, 0);

        // ASSEMBLE
        run.finish(self.catalog.specialists().len())
    }

    async fn retrieve(&self, query: &str) -> Result<Vec<RetrievalResult>> {
        let Some(kb) = &self.kb else {
            warn!("no knowledge base configured; continuing without documents");
            return Ok(Vec::new());
        };
        let budget = self.config.timeouts.retrieve;
        let results = tokio::time::timeout(
            budget,
            kb.search(query, self.config.retrieval_top_k, &SearchFilters::default()),
        )
        .await
        .map_err(|_| anyhow!("retrieval timed out after {:?}", budget))??;
        Ok(results)
    }

    async fn extract(&self, query: &str, sources: &[String]) -> Result<FactMap> {
        let extractor = self.extractor.clone();
        let query = query.to_string();
        let sources = sources.to_vec();
        let budget = self.config.timeouts.extract;
        let handle = tokio::task::spawn_blocking(move || extractor.extract(&query, &sources));
        tokio::time::timeout(budget, handle)
            .await
            .map_err(|_| anyhow!("extraction timed out after {:?}", budget))?
            .context("extraction task panicked")?
    }

    /// All specialists concurrently; each gets the full stage budget and a slow
    /// one never holds up its peers' results.
    async fn analyze_parallel(&self, query: &str, context: &str, facts: &FactMap) -> Vec<AnalysisRecord> {
        let settings = SpecialistSettings {
            retry: self.config.retry,
            max_reinforcement_retries: if self.config.enable_reinforcement {
                self.config.max_reinforcement_retries
            } else {
                0
            },
            enable_validation: self.config.enable_validation,
            context_char_budget: self.config.context_char_budget,
        };
        let agents: Vec<SpecialistAgent> = self
            .catalog
            .specialists()
            .iter()
            .map(|p| SpecialistAgent::new(p.clone(), self.client.clone(), settings.clone()))
            .collect();

        let budget = self.config.timeouts.analyze;
        let tasks = agents.iter().map(|agent| async move {
            let started = Instant::now();
            match tokio::time::timeout(budget, agent.analyze(query, context, facts)).await {
                Ok(record) => record,
                Err(_) => {
                    let persona = agent.persona();
                    warn!(agent = %persona.name, "specialist timed out");
                    AnalysisRecord::unavailable(
                        &persona.name,
                        &persona.domain,
                        format!("timed out after {:?}", budget),
                        started.elapsed().as_millis() as u64,
                    )
                }
            }
        });
        join_all(tasks).await
    }

    async fn verify(&self, texts: Vec<(String, String)>, facts: FactMap) -> Result<VerificationReport> {
        let budget = self.config.timeouts.verify;
        let verifier = self.verifier.clone();
        let handle = tokio::task::spawn_blocking(move || verifier.verify(&texts, &facts));
        tokio::time::timeout(budget, handle)
            .await
            .map_err(|_| anyhow!("verification timed out after {:?}", budget))?
            .context("verifier panicked")
    }
}

fn render_context(results: &[RetrievalResult]) -> String {
    results
        .iter()
        .map(|r| format!("[{}] (relevance {:.1})\n{}", r.citation, r.relevance_score, r.chunk.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Geometric mean of the factors, each floored, then capped.
pub fn overall_confidence(factors: &[f64]) -> f64 {
    if factors.is_empty() {
        return 0.0;
    }
    let log_sum: f64 = factors.iter().map(|f| f.max(CONFIDENCE_FLOOR).ln()).sum();
    (log_sum / factors.len() as f64)
        .exp()
        .clamp(0.0, MAX_OVERALL_CONFIDENCE)
}

/// Everything one request has produced so far.
struct Run {
    request_id: String,
    started_at: String,
    started: Instant,
    query: String,
    stages: Vec<StageMetrics>,
    errors: Vec<String>,
    degraded_stages: Vec<String>,
    degraded_specialists: Vec<String>,
    citations: Vec<String>,
    retrieval_confidence: f64,
    facts: FactMap,
    analyses: Vec<AnalysisRecord>,
    tracker: QualityTracker,
    debates: Vec<DebateRecord>,
    synthesis: Option<Synthesis>,
    synthesis_validation: Option<ValidationReport>,
    verification: Option<VerificationReport>,
}

impl Run {
    fn new(query: &str, request_id: String) -> Self {
        Self {
            request_id,
            started_at: chrono::Utc::now().to_rfc3339(),
            started: Instant::now(),
            query: query.to_string(),
            stages: Vec::new(),
            errors: Vec::new(),
            degraded_stages: Vec::new(),
            degraded_specialists: Vec::new(),
            citations: Vec::new(),
            retrieval_confidence: 0.0,
            facts: FactMap::new(),
            analyses: Vec::new(),
            tracker: QualityTracker::new(),
            debates: Vec::new(),
            synthesis: None,
            synthesis_validation: None,
            verification: None,
        }
    }

    fn record(&mut self, stage: Stage, started: Instant, tier: Option<ModelTier>, input: u32, output: u32) {
        self.stages.push(StageMetrics {
            stage,
            elapsed_ms: started.elapsed().as_millis() as u64,
            tier,
            input_tokens: input,
            output_tokens: output,
        });
    }

    fn degrade(&mut self, stage: Stage, message: impl Into<String>) {
        let message = message.into();
        warn!(stage = stage.as_str(), error = %message, "stage degraded");
        if !self.degraded_stages.iter().any(|s| s == stage.as_str()) {
            self.degraded_stages.push(stage.as_str().to_string());
        }
        self.errors.push(message);
    }

    fn available(&self) -> usize {
        self.analyses.iter().filter(|a| a.available).count()
    }

    fn executive_summary(&self, specialists_total: usize) -> String {
        if let Some(synthesis) = &self.synthesis {
            if !synthesis.executive_summary.is_empty() {
                return synthesis.executive_summary.clone();
            }
            return synthesis.text.chars().take(400).collect();
        }
        if self.degraded_stages.iter().any(|s| s == Stage::Retrieve.as_str()) {
            return format!(
                "Retrieval failed, so no analysis was performed. {}",
                self.errors.join("; ")
            );
        }
        let available = self.available();
        if available == 0 {
            return format!(
                "No specialist analysis was available: all {} specialists failed, so no recommendation can be made.",
                specialists_total
            );
        }
        format!(
            "Synthesis unavailable. {} of {} specialist analyses are included below for direct review.",
            available, specialists_total
        )
    }

    fn finish(mut self, specialists_total: usize) -> DecisionSheet {
        let t = Instant::now();
        let available: Vec<&AnalysisRecord> = self.analyses.iter().filter(|a| a.available).collect();
        let scored: Vec<u32> = available
            .iter()
            .filter(|a| a.validation.evaluated)
            .map(|a| a.validation.overall_score)
            .collect();
        let average_score = if scored.is_empty() {
            0.0
        } else {
            scored.iter().map(|s| f64::from(*s)).sum::<f64>() / scored.len() as f64
        };
        let validation_confidence = if available.is_empty() {
            0.0
        } else {
            available.iter().map(|a| a.confidence).sum::<f64>() / available.len() as f64
        };
        let quality_assessment = QualityAssessment {
            average_score,
            expert_level_count: available.iter().filter(|a| a.validation.expert_level).count(),
            specialists_available: available.len(),
            specialists_total,
            tracker: self.tracker.stats(),
            synthesis: self.synthesis_validation.take(),
        };

        let verification_confidence = self.verification.as_ref().map(|v| v.confidence);
        let mut factors = vec![self.retrieval_confidence, validation_confidence];
        factors.extend(verification_confidence);
        let overall = overall_confidence(&factors);

        let executive_summary = self.executive_summary(specialists_total);
        let final_recommendation = self
            .synthesis
            .as_ref()
            .map(|s| s.text.clone())
            .unwrap_or_else(|| SYNTHESIS_UNAVAILABLE.to_string());
        let status = if self.degraded_stages.is_empty() && !available.is_empty() {
            SheetStatus::Ok
        } else {
            SheetStatus::Degraded
        };

        self.record(Stage::Assemble, t, None, 0, 0);
        let input_tokens = self.stages.iter().map(|s| s.input_tokens).sum();
        let output_tokens = self.stages.iter().map(|s| s.output_tokens).sum();
        let fabrication_findings = self
            .verification
            .map(|v| v.findings)
            .unwrap_or_default();

        info!(
            status = ?status,
            overall_confidence = overall,
            fabrications = fabrication_findings.len(),
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "decision sheet assembled"
        );

        DecisionSheet {
            query: self.query,
            executive_summary,
            expert_analyses: self.analyses,
            quality_assessment,
            expert_debates: self.debates,
            final_recommendation,
            metadata: SheetMetadata {
                request_id: self.request_id,
                started_at: self.started_at,
                status,
                total_elapsed_ms: self.started.elapsed().as_millis() as u64,
                stages: self.stages,
                input_tokens,
                output_tokens,
                retrieved_citations: self.citations,
                extracted_facts: self.facts,
                fabrication_findings,
                retrieval_confidence: self.retrieval_confidence,
                validation_confidence,
                verification_confidence,
                overall_confidence: overall,
                degraded_specialists: self.degraded_specialists,
                degraded_stages: self.degraded_stages,
                errors: self.errors,
            },
        }
    }

    /// Minimal sheet for a request the caller abandoned.
    fn cancelled(self) -> DecisionSheet {
        let mut sheet = self.finish(0);
        sheet.executive_summary = "Request cancelled before completion.".to_string();
        sheet.metadata.status = SheetStatus::Cancelled;
        sheet.metadata.overall_confidence = 0.0;
        sheet
    }
}
