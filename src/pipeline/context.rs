//! Run Context
//!
//! Per-request state threaded through every stage: the run record, the
//! latency deadline, the exploration round counter and the best selection
//! seen so far.

use crate::config::{PipelineConfig, SelectorMode};
use crate::model::{CellHit, ExecutionRecord, PipelineRun, PipelineStage, QueryRequest, SelectionResult, StageTransition};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Winning selection of one round with what the answer needs from it
#[derive(Debug, Clone)]
pub struct BestSelection {
    pub selection: SelectionResult,
    pub sql: String,
    pub record: ExecutionRecord,
    pub round: usize,
    /// Size of that round's candidate set
    pub candidate_count: usize,
}

impl BestSelection {
    /// Successful winners beat failed ones, then confidence decides. Equal
    /// confidence goes to the later round.
    pub fn improves_on(&self, other: &BestSelection) -> bool {
        match (self.record.success, other.record.success) {
            (true, false) => true,
            (false, true) => false,
            _ => self.selection.confidence >= other.selection.confidence,
        }
    }
}

pub struct RunContext {
    pub run: PipelineRun,
    pub started: Instant,
    pub deadline: Instant,
    pub round: usize,
    pub candidate_cap: usize,
    pub selector_mode: SelectorMode,
    pub reasoning_enabled: bool,
    /// Exploration evidence carried into later retrievals
    pub hints: Vec<String>,
    pub probe_cells: Vec<CellHit>,
    pub best: Option<BestSelection>,
    /// Size of the latest round's candidate set
    pub last_candidate_count: usize,
    pub partial: bool,
    /// Round cap reached while a trigger was still firing
    pub exploration_exhausted: bool,
}

impl RunContext {
    pub fn new(request: &QueryRequest, config: &PipelineConfig) -> Self {
        let run_id = request
            .request_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let budget = request.latency_budget_ms.unwrap_or(config.latency_budget_ms);
        let started = Instant::now();
        Self {
            run: PipelineRun::new(run_id),
            started,
            deadline: started + Duration::from_millis(budget),
            round: 0,
            candidate_cap: request.candidate_cap.unwrap_or(config.candidate_cap).max(1),
            selector_mode: request.selector_mode.unwrap_or(config.selector_mode),
            reasoning_enabled: request
                .reasoning_generator_enabled
                .unwrap_or(config.reasoning_generator_enabled),
            hints: Vec::new(),
            probe_cells: Vec::new(),
            best: None,
            last_candidate_count: 0,
            partial: false,
            exploration_exhausted: false,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run.run_id
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn transition(&mut self, stage: PipelineStage) {
        info!(request_id = %self.run.run_id, round = self.round, "Stage {:?}", stage);
        let at_ms = self.elapsed_ms();
        self.run.transitions.push(StageTransition {
            round: self.round,
            stage,
            at_ms,
        });
    }

    /// True once the latency budget is spent; marks the run partial
    pub fn budget_exhausted(&mut self) -> bool {
        if Instant::now() < self.deadline {
            return false;
        }
        if !self.partial {
            warn!(request_id = %self.run.run_id, "Latency budget exhausted in round {}", self.round);
            self.partial = true;
        }
        true
    }

    pub fn mark_partial(&mut self, stage: &str) {
        warn!(request_id = %self.run.run_id, "{} cut short by the latency budget", stage);
        self.partial = true;
        self.run.note("budget", format!("{} cut short in round {}", stage, self.round));
    }

    pub fn offer(&mut self, candidate: BestSelection) {
        let better = match self.best {
            Some(ref best) => candidate.improves_on(best),
            None => true,
        };
        if better {
            self.best = Some(candidate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FeatureVector, Rationale};

    fn best(success: bool, confidence: f64, round: usize) -> BestSelection {
        BestSelection {
            selection: SelectionResult {
                winning_candidate_id: format!("r{}", round),
                winning_cluster_id: None,
                confidence,
                score: 1.0,
                features: FeatureVector::default(),
                rationale: Rationale::GroupSize,
                tie: false,
                strategy: SelectorMode::Heuristic,
            },
            sql: "SELECT 1".to_string(),
            record: ExecutionRecord {
                candidate_id: format!("r{}", round),
                candidate_version: 0,
                success,
                error: None,
                rows_returned: 1,
                elapsed_ms: 1,
                result_hash: String::new(),
                sample_rows: vec![],
                plan_cost_estimate: None,
            },
            round,
            candidate_count: 3,
        }
    }

    #[test]
    fn test_request_overrides_config() {
        let request = QueryRequest {
            request_id: Some("req-1".into()),
            question: "q".into(),
            candidate_cap: Some(6),
            latency_budget_ms: None,
            selector_mode: Some(SelectorMode::Learned),
            reasoning_generator_enabled: Some(true),
        };
        let ctx = RunContext::new(&request, &PipelineConfig::default());
        assert_eq!(ctx.run_id(), "req-1");
        assert_eq!(ctx.candidate_cap, 6);
        assert_eq!(ctx.selector_mode, SelectorMode::Learned);
        assert!(ctx.reasoning_enabled);
    }

    #[test]
    fn test_best_selection_prefers_success_then_confidence() {
        let mut ctx = RunContext::new(&QueryRequest::new("q"), &PipelineConfig::default());
        ctx.offer(best(true, 0.3, 0));
        ctx.offer(best(false, 0.9, 1));
        assert_eq!(ctx.best.as_ref().unwrap().round, 0);
        ctx.offer(best(true, 0.3, 2));
        assert_eq!(ctx.best.as_ref().unwrap().round, 2);
        ctx.offer(best(true, 0.1, 3));
        assert_eq!(ctx.best.as_ref().unwrap().round, 2);
    }

    #[tokio::test]
    async fn test_zero_budget_is_exhausted() {
        let request = QueryRequest {
            latency_budget_ms: Some(0),
            ..QueryRequest::new("q")
        };
        let mut ctx = RunContext::new(&request, &PipelineConfig::default());
        assert!(ctx.budget_exhausted());
        assert!(ctx.partial);
    }
}
