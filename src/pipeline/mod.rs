//! Pipeline Orchestrator
//!
//! Sequences understanding, retrieval, generation, merge, refinement,
//! execution, grouping and selection, with a bounded exploration loop that
//! re-enters retrieval. Every component failure is absorbed here; `run`
//! always returns a structured answer.

pub mod context;

pub use context::{BestSelection, RunContext};

use crate::config::{PipelineConfig, SelectorMode};
use crate::execution::{ExecutionEngine, ExecutionSandbox};
use crate::exploration::ExplorationController;
use crate::generation::{CandidateGenerator, GenerationRequest};
use crate::grouping::ResultGrouper;
use crate::llm::{LanguageModel, RetryPolicy};
use crate::merge::CandidateMerger;
use crate::model::{
    Candidate, CellHit, ExecutionRecord, ExplorationTrigger, FinalAnswer, PipelineStage, QueryRequest, Question,
    RetrievalContext, Warning,
};
use crate::observability::{NullTelemetrySink, PipelineMetrics, TelemetrySink};
use crate::refinement::RefinementEngine;
use crate::retrieval::{RetrievalCoordinator, SimilarityStore};
use crate::schema::SchemaCatalog;
use crate::selection::Selector;
use crate::understanding::TaskUnderstanding;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Process-wide collaborators, shared read-only by every request
#[derive(Clone)]
pub struct PipelineResources {
    pub catalog: Arc<SchemaCatalog>,
    pub cells: Arc<dyn SimilarityStore>,
    pub examples: Arc<dyn SimilarityStore>,
    pub llm: Arc<dyn LanguageModel>,
    pub sandbox: Arc<dyn ExecutionSandbox>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub metrics: Arc<PipelineMetrics>,
}

impl PipelineResources {
    pub fn new(
        catalog: SchemaCatalog,
        cells: Arc<dyn SimilarityStore>,
        examples: Arc<dyn SimilarityStore>,
        llm: Arc<dyn LanguageModel>,
        sandbox: Arc<dyn ExecutionSandbox>,
    ) -> Self {
        Self {
            catalog: Arc::new(catalog),
            cells,
            examples,
            llm,
            sandbox,
            telemetry: Arc::new(NullTelemetrySink),
            metrics: Arc::new(PipelineMetrics::new()),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Flush the telemetry sink
    pub async fn shutdown(&self) {
        if let Err(e) = self.telemetry.flush().await {
            warn!("Telemetry flush failed on shutdown: {}", e);
        }
        info!("Pipeline resources released");
    }
}

pub struct Orchestrator {
    resources: PipelineResources,
    config: PipelineConfig,
    understanding: TaskUnderstanding,
    retrieval: RetrievalCoordinator,
    generator: CandidateGenerator,
    merger: CandidateMerger,
    refinement: RefinementEngine,
    execution: ExecutionEngine,
    grouper: ResultGrouper,
    exploration: ExplorationController,
    heuristic: Selector,
    learned: Selector,
    policy: Selector,
}

/// What one pass from retrieval to selection left behind
struct RoundOutcome {
    candidates: Vec<Candidate>,
    trigger: Option<ExplorationTrigger>,
}

impl Orchestrator {
    pub fn new(resources: PipelineResources, config: PipelineConfig) -> Self {
        let generator = CandidateGenerator::from_config(resources.llm.clone(), &config.generation);
        Self::with_generator(resources, config, generator)
    }

    /// Use a custom generator set instead of the configured LM variants
    pub fn with_generator(resources: PipelineResources, config: PipelineConfig, generator: CandidateGenerator) -> Self {
        let retry = RetryPolicy::new(
            config.generation.max_retries,
            Duration::from_millis(config.generation.initial_backoff_ms),
            Duration::from_millis(config.generation.max_backoff_ms),
            config.generation.backoff_multiplier,
        );
        Self {
            understanding: TaskUnderstanding::new(&resources.catalog),
            retrieval: RetrievalCoordinator::new(
                resources.cells.clone(),
                resources.examples.clone(),
                config.retrieval.clone(),
            ),
            generator,
            merger: CandidateMerger::new(Some(resources.sandbox.clone()), config.merge.clone()),
            refinement: RefinementEngine::new(
                resources.llm.clone(),
                resources.catalog.clone(),
                config.refinement.clone(),
                retry,
            ),
            execution: ExecutionEngine::new(resources.sandbox.clone(), config.execution.clone()),
            grouper: ResultGrouper::new(),
            exploration: ExplorationController::new(
                resources.sandbox.clone(),
                resources.catalog.clone(),
                config.exploration.clone(),
            ),
            heuristic: Selector::for_mode(SelectorMode::Heuristic, config.selection.clone()),
            learned: Selector::for_mode(SelectorMode::Learned, config.selection.clone()),
            policy: Selector::for_mode(SelectorMode::Rl, config.selection.clone()),
            resources,
            config,
        }
    }

    pub fn resources(&self) -> &PipelineResources {
        &self.resources
    }

    fn selector(&self, mode: SelectorMode) -> &Selector {
        match mode {
            SelectorMode::Heuristic => &self.heuristic,
            SelectorMode::Learned => &self.learned,
            SelectorMode::Rl => &self.policy,
        }
    }

    /// Answer one question. Never fails: component errors degrade the answer.
    pub async fn run(&self, request: QueryRequest) -> FinalAnswer {
        let mut ctx = RunContext::new(&request, &self.config);
        info!(request_id = %ctx.run_id(), "Answering: {}", request.question);

        ctx.transition(PipelineStage::Understanding);
        let question = self.understanding.understand(&request.question);
        let low_understanding = question.confidence_score < self.config.understanding_confidence_threshold;
        if low_understanding {
            info!(
                "Understanding confidence {:.2} below {:.2}, widening retrieval",
                question.confidence_score, self.config.understanding_confidence_threshold
            );
        }
        ctx.run.question = Some(question.clone());

        loop {
            let outcome = self.run_round(&mut ctx, &question, low_understanding).await;
            ctx.run.candidates.extend(outcome.candidates.iter().cloned());

            let Some(trigger) = outcome.trigger else {
                break;
            };
            if ctx.partial || ctx.budget_exhausted() {
                break;
            }
            if ctx.round >= self.exploration.max_rounds() {
                info!("Exploration cap of {} rounds reached ({})", self.exploration.max_rounds(), trigger);
                ctx.exploration_exhausted = true;
                break;
            }

            ctx.transition(PipelineStage::Exploring);
            self.resources.metrics.record_exploration(&trigger.to_string());
            let exploring = self.exploration.explore(ctx.round + 1, trigger, &question, &outcome.candidates);
            match tokio::time::timeout_at(ctx.deadline, exploring).await {
                Ok(explored) => {
                    ctx.hints.extend(explored.hints);
                    ctx.probe_cells.extend(explored.round.samples.iter().cloned());
                    ctx.run.explorations.push(explored.round);
                }
                Err(_) => {
                    ctx.mark_partial("exploration");
                    break;
                }
            }
            ctx.round += 1;
        }

        let answer = self.finish(&mut ctx);
        self.emit_telemetry(&mut ctx, &answer).await;
        answer
    }

    /// Retrieval through selection for the current round
    async fn run_round(&self, ctx: &mut RunContext, question: &Question, low_understanding: bool) -> RoundOutcome {
        let mut outcome = RoundOutcome {
            candidates: Vec::new(),
            trigger: None,
        };

        ctx.transition(PipelineStage::Retrieving);
        let retrieving = self.retrieval.retrieve(question, &ctx.hints, low_understanding, ctx.round);
        let mut snapshot = match tokio::time::timeout_at(ctx.deadline, retrieving).await {
            Ok(snapshot) => snapshot,
            Err(_) => {
                ctx.mark_partial("retrieval");
                return outcome;
            }
        };
        for channel in &snapshot.degraded_channels {
            self.resources.metrics.record_error("retrieval");
            ctx.run.note("retrieval", format!("{} channel degraded in round {}", channel, ctx.round));
        }
        append_probe_samples(&mut snapshot, &ctx.probe_cells);
        ctx.run.retrievals.push(snapshot);
        let context = RetrievalContext::union(ctx.run.retrievals.iter());

        if ctx.budget_exhausted() {
            return outcome;
        }
        ctx.transition(PipelineStage::Generating);
        let request = GenerationRequest {
            question,
            context: &context,
            catalog: &self.resources.catalog,
            round: ctx.round,
        };
        let generated = self
            .generator
            .generate(&request, ctx.candidate_cap, ctx.reasoning_enabled, Some(ctx.deadline))
            .await;
        for (generator, error) in &generated.failures {
            self.resources.metrics.record_error("generation");
            ctx.run.note("generation", format!("{}: {}", generator, error));
        }

        ctx.transition(PipelineStage::Merging);
        let merged = self.merger.merge(generated.candidates, Some(ctx.deadline)).await;
        ctx.run.merge_discards.extend(merged.discards);
        let mut candidates = merged.candidates;
        ctx.last_candidate_count = candidates.len();

        if candidates.is_empty() {
            warn!(request_id = %ctx.run_id(), "Round {} produced no candidates", ctx.round);
            outcome.trigger = Some(ExplorationTrigger::StillInvalid);
            return outcome;
        }

        if ctx.budget_exhausted() {
            outcome.candidates = candidates;
            return outcome;
        }
        ctx.transition(PipelineStage::Refining);
        let refining = self.refinement.refine_all(&mut candidates, question, &context.cells);
        let summary = match tokio::time::timeout_at(ctx.deadline, refining).await {
            Ok(summary) => summary,
            Err(_) => {
                ctx.mark_partial("refinement");
                outcome.candidates = candidates;
                return outcome;
            }
        };
        if summary.all_invalid {
            info!(request_id = %ctx.run_id(), "All {} candidates invalid after refinement", candidates.len());
            outcome.trigger = Some(ExplorationTrigger::StillInvalid);
            outcome.candidates = candidates;
            return outcome;
        }

        ctx.transition(PipelineStage::Executing);
        let records = self.execute(ctx, &mut candidates, question, &context.cells).await;

        ctx.transition(PipelineStage::Grouping);
        let clusters = self.grouper.group(&records);
        ctx.run.clusters.extend(clusters.iter().cloned());

        ctx.transition(PipelineStage::Selecting);
        let cell_values: BTreeSet<String> = context.cells.iter().map(|c| c.value.to_lowercase()).collect();
        let selector = self.selector(ctx.selector_mode);
        let Some(selected) = selector.select(ctx.run_id(), &candidates, &records, &clusters, &cell_values) else {
            outcome.candidates = candidates;
            return outcome;
        };
        ctx.run.features.extend(selected.feature_records);
        let selection = selected.selection;

        let winner_record = records
            .iter()
            .find(|r| r.candidate_id == selection.winning_candidate_id)
            .cloned();
        let winner_sql = candidates
            .iter()
            .find(|c| c.id == selection.winning_candidate_id)
            .map(|c| c.sql_text.clone());
        if let (Some(record), Some(sql)) = (winner_record, winner_sql) {
            ctx.offer(BestSelection {
                selection: selection.clone(),
                sql,
                record,
                round: ctx.round,
                candidate_count: candidates.len(),
            });
        }

        outcome.trigger = if ctx.round == 0 && low_understanding {
            Some(ExplorationTrigger::LowUnderstandingConfidence)
        } else if ctx.round == 0 && question.ambiguous {
            Some(ExplorationTrigger::AmbiguousQuestion)
        } else if selection.tie {
            Some(ExplorationTrigger::SelectionTie)
        } else if selection.confidence < selector.confidence_threshold() {
            Some(ExplorationTrigger::LowSelectionConfidence)
        } else {
            None
        };
        ctx.run.round_selections.push(selection);
        outcome.candidates = candidates;
        outcome
    }

    /// Execute every executable candidate, revise failures once and re-run
    /// the revised ones. Returns the latest record per candidate, always for
    /// the candidate's current version; every executed version is kept on
    /// the run.
    async fn execute(
        &self,
        ctx: &mut RunContext,
        candidates: &mut [Candidate],
        question: &Question,
        cells: &[CellHit],
    ) -> Vec<ExecutionRecord> {
        let executable: Vec<&Candidate> = candidates.iter().filter(|c| c.is_executable()).collect();
        let mut records = self.execution.execute_all(&executable, Some(ctx.deadline)).await;
        ctx.run.executions.extend(records.iter().cloned());

        let failed: BTreeMap<String, String> = records
            .iter()
            .filter(|r| !r.success)
            .map(|r| (r.candidate_id.clone(), r.error.clone().unwrap_or_default()))
            .collect();
        for (candidate_id, error) in &failed {
            self.resources.metrics.record_error("execution");
            ctx.run.note("execution", format!("{}: {}", candidate_id, error));
        }
        if failed.is_empty() || self.config.refinement.max_semantic_revisions == 0 || ctx.budget_exhausted() {
            return records;
        }

        let revising = join_all(
            candidates
                .iter_mut()
                .filter_map(|c| failed.get(&c.id).map(|error| (c, error)))
                .map(|(candidate, error)| {
                    self.refinement
                        .revise_after_execution(candidate, error, question, cells)
                }),
        );
        let finished = tokio::time::timeout_at(ctx.deadline, revising).await.is_ok();

        let stale: HashSet<String> = records
            .iter()
            .filter(|r| {
                candidates
                    .iter()
                    .any(|c| c.id == r.candidate_id && c.version != r.candidate_version)
            })
            .map(|r| r.candidate_id.clone())
            .collect();
        if !finished {
            ctx.mark_partial("execution-guided revision");
        }
        if stale.is_empty() {
            return records;
        }
        records.retain(|r| !stale.contains(&r.candidate_id));
        if !finished || ctx.budget_exhausted() {
            warn!(request_id = %ctx.run_id(), "Dropping {} revised candidates that were never executed", stale.len());
            return records;
        }

        info!("Re-executing {} revised candidates", stale.len());
        let rerun: Vec<&Candidate> = candidates.iter().filter(|c| stale.contains(&c.id)).collect();
        let rerecords = self.execution.execute_all(&rerun, Some(ctx.deadline)).await;
        ctx.run.executions.extend(rerecords.iter().cloned());
        records.extend(rerecords);
        records
    }

    fn finish(&self, ctx: &mut RunContext) -> FinalAnswer {
        let threshold = self.selector(ctx.selector_mode).confidence_threshold();
        let mut warnings: BTreeSet<Warning> = BTreeSet::new();
        if ctx.partial {
            warnings.insert(Warning::Partial);
        }

        // a winner whose execution failed is no valid candidate
        let best = ctx.best.clone().filter(|b| b.record.success);
        ctx.run.selection = best.as_ref().map(|b| b.selection.clone());

        let answer = match best {
            Some(best) => {
                ctx.transition(PipelineStage::Done);
                if ctx.exploration_exhausted || best.selection.tie || best.selection.confidence < threshold {
                    warnings.insert(Warning::LowConfidence);
                }
                FinalAnswer {
                    request_id: ctx.run_id().to_string(),
                    final_sql: best.sql,
                    execution_success: best.record.success,
                    rows_returned: best.record.rows_returned,
                    sample_rows: best.record.sample_rows,
                    warnings: warnings.into_iter().collect(),
                    confidence: best.selection.confidence,
                    candidate_count: best.candidate_count,
                    exploration_rounds_used: ctx.run.explorations.len(),
                    total_latency_ms: ctx.elapsed_ms(),
                }
            }
            None => {
                ctx.transition(PipelineStage::Failed);
                warnings.insert(Warning::NoValidCandidate);
                warn!(request_id = %ctx.run_id(), "No valid candidate after {} exploration rounds", ctx.run.explorations.len());
                FinalAnswer {
                    request_id: ctx.run_id().to_string(),
                    final_sql: String::new(),
                    execution_success: false,
                    rows_returned: 0,
                    sample_rows: Vec::new(),
                    warnings: warnings.into_iter().collect(),
                    confidence: 0.0,
                    candidate_count: ctx.last_candidate_count,
                    exploration_rounds_used: ctx.run.explorations.len(),
                    total_latency_ms: ctx.elapsed_ms(),
                }
            }
        };

        let outcome = if answer.has_warning(Warning::NoValidCandidate) {
            "failed"
        } else if answer.has_warning(Warning::Partial) {
            "partial"
        } else if answer.has_warning(Warning::LowConfidence) {
            "low_confidence"
        } else {
            "ok"
        };
        self.resources.metrics.record_run(outcome, answer.total_latency_ms);
        info!(
            request_id = %answer.request_id,
            "Finished ({}): confidence {:.2}, {} exploration rounds, {} ms",
            outcome, answer.confidence, answer.exploration_rounds_used, answer.total_latency_ms
        );
        answer
    }

    /// Best effort, bounded by the telemetry grace period
    async fn emit_telemetry(&self, ctx: &mut RunContext, answer: &FinalAnswer) {
        ctx.run.answer = Some(answer.clone());
        let grace = Duration::from_millis(self.config.telemetry.grace_ms);
        match tokio::time::timeout(grace, self.resources.telemetry.append(&ctx.run)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.resources.metrics.record_error("telemetry");
                warn!(request_id = %answer.request_id, "Telemetry append failed: {}", e);
            }
            Err(_) => {
                self.resources.metrics.record_error("telemetry");
                warn!(request_id = %answer.request_id, "Telemetry append exceeded {:?}", grace);
            }
        }
    }
}

/// Exploration samples join the cell hits of the new snapshot
fn append_probe_samples(snapshot: &mut RetrievalContext, samples: &[CellHit]) {
    for sample in samples {
        if !snapshot
            .cells
            .iter()
            .any(|c| c.column == sample.column && c.value == sample.value)
        {
            snapshot.cells.push(sample.clone());
        }
    }
}
