//! Policy Strategy
//!
//! Softmax policy over candidates trained against execution-correctness
//! reward. At inference the score is the unnormalized softmax weight, so the
//! argmax matches the policy's greedy action.

use super::learned::LinearModel;
use super::ScoringStrategy;
use crate::config::SelectorMode;
use crate::model::{Candidate, FeatureVector, Rationale};

/// Exponent ceiling keeping scores finite
const MAX_EXPONENT: f64 = 50.0;

pub struct PolicyStrategy {
    model: LinearModel,
}

impl PolicyStrategy {
    pub fn new(model: LinearModel) -> Self {
        Self { model }
    }
}

impl ScoringStrategy for PolicyStrategy {
    fn mode(&self) -> SelectorMode {
        SelectorMode::Rl
    }

    fn score(&self, _candidate: &Candidate, features: &FeatureVector) -> (f64, Rationale) {
        let temperature = if self.model.temperature > 0.0 { self.model.temperature } else { 1.0 };
        let exponent = (self.model.logit(features) / temperature).min(MAX_EXPONENT);
        (exponent.exp(), Rationale::StrategyScore)
    }
}
