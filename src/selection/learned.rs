//! Learned Strategy
//!
//! Logistic ranker over the selector features. Weights are trained offline
//! from exported feature records and loaded from JSON.

use super::ScoringStrategy;
use crate::config::SelectorMode;
use crate::error::Result;
use crate::model::{Candidate, FeatureVector, Rationale};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Linear model over named features
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinearModel {
    #[serde(default)]
    pub bias: f64,
    pub weights: BTreeMap<String, f64>,
    /// Softmax temperature, used by the policy strategy
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

fn default_temperature() -> f64 {
    1.0
}

impl LinearModel {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn logit(&self, features: &FeatureVector) -> f64 {
        feature_values(features)
            .iter()
            .map(|(name, value)| self.weights.get(*name).copied().unwrap_or(0.0) * value)
            .sum::<f64>()
            + self.bias
    }

    /// Weights favouring agreement and successful, grounded queries
    pub fn builtin() -> Self {
        let weights = [
            ("execution_success", 3.0),
            ("group_size", 0.8),
            ("self_consistency_score", 0.4),
            ("where_values_match_ratio", 0.6),
            ("num_joins", -0.15),
            ("num_aggregates", -0.1),
            ("sql_length", -0.05),
            ("log_rows_returned", 0.1),
            ("parse_error_flag", -2.0),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        Self {
            bias: -2.0,
            weights,
            temperature: 1.0,
        }
    }
}

/// Named numeric view of a feature vector
pub fn feature_values(features: &FeatureVector) -> Vec<(&'static str, f64)> {
    vec![
        ("execution_success", if features.execution_success { 1.0 } else { 0.0 }),
        ("log_rows_returned", (features.rows_returned as f64 + 1.0).ln()),
        ("group_size", features.group_size as f64),
        ("where_values_match_ratio", features.where_values_match_ratio),
        ("num_joins", features.num_joins as f64),
        ("num_aggregates", features.num_aggregates as f64),
        ("sql_length", features.sql_length as f64 / 100.0),
        ("log_execution_time_ms", (features.execution_time_ms as f64 + 1.0).ln()),
        ("parse_error_flag", if features.parse_error_flag { 1.0 } else { 0.0 }),
        ("plan_cost_estimate", features.plan_cost_estimate.unwrap_or(0.0)),
        ("self_consistency_score", features.self_consistency_score as f64),
    ]
}

pub struct LearnedStrategy {
    model: LinearModel,
}

impl LearnedStrategy {
    pub fn new(model: LinearModel) -> Self {
        Self { model }
    }
}

impl ScoringStrategy for LearnedStrategy {
    fn mode(&self) -> SelectorMode {
        SelectorMode::Learned
    }

    fn score(&self, _candidate: &Candidate, features: &FeatureVector) -> (f64, Rationale) {
        let logit = self.model.logit(features);
        (1.0 / (1.0 + (-logit).exp()), Rationale::StrategyScore)
    }
}
