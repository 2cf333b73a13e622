//! Selector
//!
//! Scores executed candidates with a pluggable strategy, picks the winning
//! cluster and candidate, and derives confidence from the score gap between
//! the top two clusters. Residual ties follow a fixed chain: execution
//! success, group size, lower complexity, WHERE value grounding, shorter SQL,
//! candidate id.

pub mod heuristic;
pub mod learned;
pub mod policy;

pub use heuristic::HeuristicStrategy;
pub use learned::{LearnedStrategy, LinearModel};
pub use policy::PolicyStrategy;

use crate::config::{SelectionConfig, SelectorMode};
use crate::model::{Candidate, ExecutionRecord, FeatureRecord, FeatureVector, Rationale, ResultCluster, SelectionResult};
use crate::sql;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use tracing::{debug, warn};

/// Scores within this distance are treated as equal
const SCORE_EPSILON: f64 = 1e-9;

pub trait ScoringStrategy: Send + Sync {
    fn mode(&self) -> SelectorMode;

    fn score(&self, candidate: &Candidate, features: &FeatureVector) -> (f64, Rationale);
}

/// Build the strategy for `mode`. Learned and rl modes read weights from
/// `model_path`, falling back to built-in weights when absent or unreadable.
pub fn strategy_for(mode: SelectorMode, model_path: Option<&Path>) -> Box<dyn ScoringStrategy> {
    let model = || match model_path {
        Some(path) => LinearModel::from_json_file(path).unwrap_or_else(|e| {
            warn!("Cannot load selector weights from {}: {}, using built-in weights", path.display(), e);
            LinearModel::builtin()
        }),
        None => LinearModel::builtin(),
    };
    match mode {
        SelectorMode::Heuristic => Box::new(HeuristicStrategy),
        SelectorMode::Learned => Box::new(LearnedStrategy::new(model())),
        SelectorMode::Rl => Box::new(PolicyStrategy::new(model())),
    }
}

/// Feature vector for one executed candidate
pub fn build_features(
    candidate: &Candidate,
    record: &ExecutionRecord,
    clusters: &[ResultCluster],
    cell_values: &BTreeSet<String>,
) -> FeatureVector {
    let group_size = if record.success {
        clusters
            .iter()
            .find(|c| c.members.contains(&candidate.id))
            .map(|c| c.size)
            .unwrap_or(1)
    } else {
        0
    };
    FeatureVector {
        execution_success: record.success,
        rows_returned: record.rows_returned,
        group_size,
        where_values_match_ratio: sql::where_values_match_ratio(&candidate.sql_text, cell_values),
        num_joins: sql::count_joins(&candidate.sql_text),
        num_aggregates: sql::count_aggregates(&candidate.sql_text),
        sql_length: candidate.sql_text.len(),
        execution_time_ms: record.elapsed_ms,
        parse_error_flag: sql::check_syntax(&candidate.sql_text).is_err(),
        plan_cost_estimate: record.plan_cost_estimate,
        self_consistency_score: group_size.saturating_sub(1),
    }
}

/// One scored candidate
struct Scored<'a> {
    candidate: &'a Candidate,
    features: FeatureVector,
    score: f64,
}

/// Selection plus the feature rows for export
#[derive(Debug, Clone)]
pub struct SelectionOutcome {
    pub selection: SelectionResult,
    pub feature_records: Vec<FeatureRecord>,
}

pub struct Selector {
    strategy: Box<dyn ScoringStrategy>,
    config: SelectionConfig,
}

impl Selector {
    pub fn new(strategy: Box<dyn ScoringStrategy>, config: SelectionConfig) -> Self {
        Self { strategy, config }
    }

    pub fn for_mode(mode: SelectorMode, config: SelectionConfig) -> Self {
        let strategy = strategy_for(mode, config.model_path.as_deref());
        Self::new(strategy, config)
    }

    pub fn confidence_threshold(&self) -> f64 {
        self.config.confidence_threshold
    }

    /// Select among candidates that have an execution record. `None` when
    /// nothing was executed.
    pub fn select(
        &self,
        run_id: &str,
        candidates: &[Candidate],
        records: &[ExecutionRecord],
        clusters: &[ResultCluster],
        cell_values: &BTreeSet<String>,
    ) -> Option<SelectionOutcome> {
        let by_id: HashMap<&str, &ExecutionRecord> = records.iter().map(|r| (r.candidate_id.as_str(), r)).collect();

        let mut pool: Vec<Scored> = candidates
            .iter()
            .filter_map(|candidate| {
                let record = by_id.get(candidate.id.as_str())?;
                let features = build_features(candidate, record, clusters, cell_values);
                let (score, _) = self.strategy.score(candidate, &features);
                Some(Scored { candidate, features, score })
            })
            .collect();
        if pool.is_empty() {
            return None;
        }
        pool.sort_by(compare);

        let feature_records: Vec<FeatureRecord> = pool
            .iter()
            .map(|s| FeatureRecord {
                run_id: run_id.to_string(),
                candidate_id: s.candidate.id.clone(),
                features: s.features.clone(),
                correct: None,
            })
            .collect();

        // cluster score = best member score; clusters ranked by score, then by their best member
        let mut ranked: Vec<(&ResultCluster, usize)> = clusters
            .iter()
            .filter_map(|cluster| {
                pool.iter()
                    .position(|s| cluster.members.contains(&s.candidate.id))
                    .map(|best| (cluster, best))
            })
            .collect();
        ranked.sort_by(|a, b| compare(&pool[a.1], &pool[b.1]));

        let (winner_index, winning_cluster) = match ranked.first() {
            Some((cluster, best)) => (*best, Some(*cluster)),
            None => (0, None),
        };
        let winner = &pool[winner_index];

        let s1 = ranked.first().map(|(_, i)| pool[*i].score).unwrap_or(0.0);
        let s2 = ranked.get(1).map(|(_, i)| pool[*i].score).unwrap_or(0.0);
        let tie = ranked.len() >= 2 && (s1 - s2).abs() <= SCORE_EPSILON;
        let gap = if s1 > SCORE_EPSILON { ((s1 - s2) / s1).clamp(0.0, 1.0) } else { 0.0 };
        let support = winning_cluster
            .map(|c| c.size as f64 / pool.len() as f64)
            .unwrap_or(0.0);
        let confidence = (gap * support).clamp(0.0, 1.0);

        // runner-up: best candidate outside the winning cluster, else the next best overall
        let outside = |s: &Scored| winning_cluster.map_or(true, |c| !c.members.contains(&s.candidate.id));
        let runner_up = pool
            .iter()
            .enumerate()
            .find(|(i, s)| *i != winner_index && outside(*s))
            .or_else(|| pool.iter().enumerate().find(|(i, _)| *i != winner_index))
            .map(|(_, s)| s);
        let rationale = match runner_up {
            None => Rationale::SingleCandidate,
            Some(runner_up) => self.rationale(winner, runner_up),
        };

        debug!(
            "Selected {} (cluster {:?}, score {:.3}, confidence {:.3}, tie {}, rationale {})",
            winner.candidate.id,
            winning_cluster.map(|c| c.cluster_id),
            winner.score,
            confidence,
            tie,
            rationale
        );

        Some(SelectionOutcome {
            selection: SelectionResult {
                winning_candidate_id: winner.candidate.id.clone(),
                winning_cluster_id: winning_cluster.map(|c| c.cluster_id),
                confidence,
                score: winner.score,
                features: winner.features.clone(),
                rationale,
                tie,
                strategy: self.strategy.mode(),
            },
            feature_records,
        })
    }

    /// First rule separating the winner from the runner-up
    fn rationale(&self, winner: &Scored, runner_up: &Scored) -> Rationale {
        let (w, r) = (&winner.features, &runner_up.features);
        if w.execution_success != r.execution_success {
            return Rationale::ExecutionSuccess;
        }
        if (winner.score - runner_up.score).abs() > SCORE_EPSILON {
            return match self.strategy.mode() {
                SelectorMode::Heuristic => Rationale::GroupSize,
                _ => Rationale::StrategyScore,
            };
        }
        if w.group_size != r.group_size {
            return Rationale::GroupSize;
        }
        if w.complexity() != r.complexity() {
            return Rationale::LowerComplexity;
        }
        if (w.where_values_match_ratio - r.where_values_match_ratio).abs() > SCORE_EPSILON {
            return Rationale::WhereValuesMatch;
        }
        if w.sql_length != r.sql_length {
            return Rationale::ShorterSql;
        }
        Rationale::CandidateOrder
    }
}

/// Best first: score, then the tie-break chain
fn compare(a: &Scored, b: &Scored) -> Ordering {
    let by_score = if (a.score - b.score).abs() <= SCORE_EPSILON {
        Ordering::Equal
    } else {
        b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal)
    };
    by_score
        .then_with(|| b.features.execution_success.cmp(&a.features.execution_success))
        .then_with(|| b.features.group_size.cmp(&a.features.group_size))
        .then_with(|| a.features.complexity().cmp(&b.features.complexity()))
        .then_with(|| {
            b.features
                .where_values_match_ratio
                .partial_cmp(&a.features.where_values_match_ratio)
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| a.features.sql_length.cmp(&b.features.sql_length))
        .then_with(|| a.candidate.id.cmp(&b.candidate.id))
}
