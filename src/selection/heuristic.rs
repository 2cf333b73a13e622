//! Heuristic Strategy
//!
//! Successful execution first, then cluster size. Remaining ties go through
//! the selector's tie-break chain.

use super::ScoringStrategy;
use crate::config::SelectorMode;
use crate::model::{Candidate, FeatureVector, Rationale};

pub struct HeuristicStrategy;

impl ScoringStrategy for HeuristicStrategy {
    fn mode(&self) -> SelectorMode {
        SelectorMode::Heuristic
    }

    fn score(&self, _candidate: &Candidate, features: &FeatureVector) -> (f64, Rationale) {
        if features.execution_success {
            (features.group_size as f64, Rationale::GroupSize)
        } else {
            (0.0, Rationale::ExecutionSuccess)
        }
    }
}
