//! Pipeline Data Model
//!
//! Entities created and consumed by the stages of one pipeline run.

use crate::config::SelectorMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Normalized question. Immutable after task understanding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub raw: String,
    pub normalized: String,
    pub skeleton: String,
    pub keywords: Vec<String>,
    /// Tables whose name or columns matched question keywords
    pub matched_tables: Vec<String>,
    /// Fraction of keywords matching schema identifiers
    pub confidence_score: f64,
    /// A keyword grounds to columns of several unrelated tables
    pub ambiguous: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CellHit {
    pub column: String,
    pub value: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExampleHit {
    pub question: String,
    pub sql: String,
    pub score: f32,
}

/// One retrieval snapshot; every retrieval call appends a new one to the run
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RetrievalContext {
    pub round: usize,
    pub cells: Vec<CellHit>,
    pub examples: Vec<ExampleHit>,
    /// Channels that degraded to empty results
    pub degraded_channels: Vec<String>,
}

impl RetrievalContext {
    /// Union of several snapshots, keeping the best score per distinct entry.
    /// Later snapshots only add entries, order is first-seen.
    pub fn union<'a>(snapshots: impl IntoIterator<Item = &'a RetrievalContext>) -> RetrievalContext {
        let mut merged = RetrievalContext::default();
        for snapshot in snapshots {
            merged.round = merged.round.max(snapshot.round);
            for cell in &snapshot.cells {
                match merged
                    .cells
                    .iter_mut()
                    .find(|c| c.column == cell.column && c.value == cell.value)
                {
                    Some(existing) => existing.score = existing.score.max(cell.score),
                    None => merged.cells.push(cell.clone()),
                }
            }
            for example in &snapshot.examples {
                match merged.examples.iter_mut().find(|e| e.sql == example.sql) {
                    Some(existing) => existing.score = existing.score.max(example.score),
                    None => merged.examples.push(example.clone()),
                }
            }
        }
        merged
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty() && self.examples.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    Raw,
    Fixed,
    Invalid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub sql_text: String,
    pub canonical_form: String,
    /// Generator that produced it
    pub source: String,
    pub status: CandidateStatus,
    /// Bumped on every refinement rewrite
    pub version: u32,
    pub refinement_iterations: usize,
    /// Most recent parse/validation/execution error
    pub last_error: Option<String>,
    pub round: usize,
}

impl Candidate {
    pub fn new(id: String, sql_text: String, source: &str, round: usize) -> Self {
        let canonical_form = crate::sql::canonicalize(&sql_text);
        Self {
            id,
            sql_text,
            canonical_form,
            source: source.to_string(),
            status: CandidateStatus::Raw,
            version: 0,
            refinement_iterations: 0,
            last_error: None,
            round,
        }
    }

    /// Rewrite during refinement; id is preserved
    pub fn rewrite(&mut self, sql_text: String) {
        self.canonical_form = crate::sql::canonicalize(&sql_text);
        self.sql_text = sql_text;
        self.version += 1;
    }

    pub fn is_executable(&self) -> bool {
        self.status != CandidateStatus::Invalid
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub candidate_id: String,
    pub candidate_version: u32,
    pub success: bool,
    pub error: Option<String>,
    pub rows_returned: u64,
    pub elapsed_ms: u64,
    pub result_hash: String,
    /// At most five rows
    pub sample_rows: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    pub plan_cost_estimate: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultCluster {
    pub cluster_id: usize,
    pub result_hash: String,
    pub members: Vec<String>,
    pub size: usize,
}

/// Which rule or tie-break decided the winner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rationale {
    SingleCandidate,
    StrategyScore,
    ExecutionSuccess,
    GroupSize,
    LowerComplexity,
    WhereValuesMatch,
    ShorterSql,
    CandidateOrder,
}

impl fmt::Display for Rationale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Rationale::SingleCandidate => "single_candidate",
            Rationale::StrategyScore => "strategy_score",
            Rationale::ExecutionSuccess => "execution_success",
            Rationale::GroupSize => "group_size",
            Rationale::LowerComplexity => "lower_complexity",
            Rationale::WhereValuesMatch => "where_values_match",
            Rationale::ShorterSql => "shorter_sql",
            Rationale::CandidateOrder => "candidate_order",
        };
        write!(f, "{}", tag)
    }
}

/// Selector feature record. Also exported for offline training.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FeatureVector {
    pub execution_success: bool,
    pub rows_returned: u64,
    pub group_size: usize,
    pub where_values_match_ratio: f64,
    pub num_joins: usize,
    pub num_aggregates: usize,
    pub sql_length: usize,
    pub execution_time_ms: u64,
    pub parse_error_flag: bool,
    pub plan_cost_estimate: Option<f64>,
    pub self_consistency_score: usize,
}

impl FeatureVector {
    pub fn complexity(&self) -> usize {
        self.num_joins + self.num_aggregates
    }
}

/// Exported training row; `correct` is never read at inference time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub run_id: String,
    pub candidate_id: String,
    pub features: FeatureVector,
    #[serde(default)]
    pub correct: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionResult {
    pub winning_candidate_id: String,
    pub winning_cluster_id: Option<usize>,
    pub confidence: f64,
    pub score: f64,
    pub features: FeatureVector,
    pub rationale: Rationale,
    /// Top two clusters scored equal
    pub tie: bool,
    pub strategy: SelectorMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ExplorationTrigger {
    LowUnderstandingConfidence,
    SelectionTie,
    LowSelectionConfidence,
    StillInvalid,
    AmbiguousQuestion,
}

impl fmt::Display for ExplorationTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            ExplorationTrigger::LowUnderstandingConfidence => "low_understanding_confidence",
            ExplorationTrigger::SelectionTie => "selection_tie",
            ExplorationTrigger::LowSelectionConfidence => "low_selection_confidence",
            ExplorationTrigger::StillInvalid => "still_invalid",
            ExplorationTrigger::AmbiguousQuestion => "ambiguous_question",
        };
        write!(f, "{}", tag)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Probe {
    pub table: String,
    pub column: String,
    pub sql: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplorationRound {
    pub round: usize,
    pub trigger: ExplorationTrigger,
    /// At most eight
    pub probes: Vec<Probe>,
    pub samples: Vec<CellHit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Understanding,
    Retrieving,
    Generating,
    Merging,
    Refining,
    Executing,
    Grouping,
    Selecting,
    Exploring,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Warning {
    LowConfidence,
    Partial,
    NoValidCandidate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeDiscard {
    pub discarded_id: String,
    pub kept_id: String,
    /// "canonical" or "sampled_execution"
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTransition {
    pub round: usize,
    pub stage: PipelineStage,
    pub at_ms: u64,
}

/// Request input
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueryRequest {
    pub request_id: Option<String>,
    pub question: String,
    pub candidate_cap: Option<usize>,
    pub latency_budget_ms: Option<u64>,
    pub selector_mode: Option<SelectorMode>,
    pub reasoning_generator_enabled: Option<bool>,
}

impl QueryRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Default::default()
        }
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

/// Final answer contract
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalAnswer {
    pub request_id: String,
    pub final_sql: String,
    pub execution_success: bool,
    pub rows_returned: u64,
    pub sample_rows: Vec<Vec<serde_json::Value>>,
    pub warnings: Vec<Warning>,
    pub confidence: f64,
    pub candidate_count: usize,
    pub exploration_rounds_used: usize,
    pub total_latency_ms: u64,
}

impl FinalAnswer {
    pub fn has_warning(&self, warning: Warning) -> bool {
        self.warnings.contains(&warning)
    }
}

/// Aggregate of everything a run produced, handed to the telemetry sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub question: Option<Question>,
    pub retrievals: Vec<RetrievalContext>,
    pub candidates: Vec<Candidate>,
    pub merge_discards: Vec<MergeDiscard>,
    pub executions: Vec<ExecutionRecord>,
    pub clusters: Vec<ResultCluster>,
    pub features: Vec<FeatureRecord>,
    /// Selection the answer was built from; `None` when the run failed
    pub selection: Option<SelectionResult>,
    /// Every round's selection, in round order
    #[serde(default)]
    pub round_selections: Vec<SelectionResult>,
    pub explorations: Vec<ExplorationRound>,
    pub transitions: Vec<StageTransition>,
    /// Absorbed component failures, by kind
    pub component_warnings: BTreeMap<String, Vec<String>>,
    pub answer: Option<FinalAnswer>,
}

impl PipelineRun {
    pub fn new(run_id: String) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            question: None,
            retrievals: Vec::new(),
            candidates: Vec::new(),
            merge_discards: Vec::new(),
            executions: Vec::new(),
            clusters: Vec::new(),
            features: Vec::new(),
            selection: None,
            round_selections: Vec::new(),
            explorations: Vec::new(),
            transitions: Vec::new(),
            component_warnings: BTreeMap::new(),
            answer: None,
        }
    }

    pub fn note(&mut self, kind: &str, message: impl Into<String>) {
        self.component_warnings
            .entry(kind.to_string())
            .or_default()
            .push(message.into());
    }

    pub fn candidate(&self, id: &str) -> Option<&Candidate> {
        self.candidates.iter().find(|c| c.id == id)
    }
}
