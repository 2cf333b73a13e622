//! Exploration Controller
//!
//! Issues a handful of bounded DISTINCT probes against columns the current
//! candidates touch (or the question's matched tables when none parse) and
//! turns the sampled values into grounding evidence for the next round.

use crate::config::{ExplorationConfig, MAX_PROBES_PER_ROUND};
use crate::execution::ExecutionSandbox;
use crate::model::{Candidate, CellHit, ExplorationRound, ExplorationTrigger, Probe, Question};
use crate::schema::SchemaCatalog;
use crate::sql;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ExplorationController {
    sandbox: Arc<dyn ExecutionSandbox>,
    catalog: Arc<SchemaCatalog>,
    config: ExplorationConfig,
}

/// Evidence gathered by one round
#[derive(Debug, Clone)]
pub struct ExplorationOutcome {
    pub round: ExplorationRound,
    /// `table.column: v1, v2` lines fed to the next retrieval
    pub hints: Vec<String>,
}

impl ExplorationController {
    pub fn new(sandbox: Arc<dyn ExecutionSandbox>, catalog: Arc<SchemaCatalog>, config: ExplorationConfig) -> Self {
        Self { sandbox, catalog, config }
    }

    pub fn max_rounds(&self) -> usize {
        self.config.max_rounds
    }

    fn probe_budget(&self) -> usize {
        self.config.max_probes.min(MAX_PROBES_PER_ROUND)
    }

    /// Probe targets, candidate columns first, then matched tables. Key
    /// columns are skipped since their values carry no grounding.
    pub fn build_probes(&self, question: &Question, candidates: &[Candidate]) -> Vec<Probe> {
        let mut targets: Vec<(String, String)> = Vec::new();
        for candidate in candidates {
            for (table, column) in sql::referenced_columns(&candidate.sql_text, &self.catalog) {
                push_target(&mut targets, table, column);
            }
        }
        for table in self.catalog.neighbourhood(&question.matched_tables) {
            for column in &table.columns {
                push_target(&mut targets, table.name.to_lowercase(), column.name.to_lowercase());
            }
        }

        targets
            .into_iter()
            .take(self.probe_budget())
            .map(|(table, column)| Probe {
                sql: format!(
                    "SELECT DISTINCT \"{col}\" FROM \"{table}\" WHERE \"{col}\" IS NOT NULL LIMIT {limit}",
                    col = column,
                    table = table,
                    limit = self.config.probe_row_limit
                ),
                table,
                column,
            })
            .collect()
    }

    /// Run one exploration round. Failed probes contribute no samples.
    pub async fn explore(
        &self,
        round: usize,
        trigger: ExplorationTrigger,
        question: &Question,
        candidates: &[Candidate],
    ) -> ExplorationOutcome {
        let probes = self.build_probes(question, candidates);
        info!("Exploration round {} ({}): {} probes", round, trigger, probes.len());

        let results = join_all(
            probes
                .iter()
                .map(|probe| self.sandbox.execute(&probe.sql, self.config.probe_timeout_ms)),
        )
        .await;

        let mut samples = Vec::new();
        let mut hints = Vec::new();
        for (probe, result) in probes.iter().zip(results) {
            let column = format!("{}.{}", probe.table, probe.column);
            let rows = match result {
                Ok(outcome) if outcome.success => outcome.sample_rows,
                Ok(outcome) => {
                    debug!("Probe on {} failed: {}", column, outcome.error.unwrap_or_default());
                    continue;
                }
                Err(e) => {
                    warn!("Probe on {} unavailable: {}", column, e);
                    continue;
                }
            };
            let values: Vec<String> = rows
                .iter()
                .filter_map(|row| row.first())
                .filter_map(value_text)
                .take(self.config.probe_row_limit)
                .collect();
            if values.is_empty() {
                continue;
            }
            hints.push(format!("{}: {}", column, values.join(", ")));
            samples.extend(values.into_iter().map(|value| CellHit {
                column: column.clone(),
                value,
                score: 1.0,
            }));
        }

        ExplorationOutcome {
            round: ExplorationRound { round, trigger, probes, samples },
            hints,
        }
    }
}

fn push_target(targets: &mut Vec<(String, String)>, table: String, column: String) {
    if column == "id" || column.ends_with("_id") {
        return;
    }
    if !targets.iter().any(|(t, c)| *t == table && *c == column) {
        targets.push((table, column));
    }
}

fn value_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PipelineError, Result};
    use crate::execution::SandboxOutcome;
    use crate::schema::sales_catalog;
    use async_trait::async_trait;
    use serde_json::json;

    /// Region probes return values, everything else is unavailable
    struct RegionSandbox;

    #[async_trait]
    impl ExecutionSandbox for RegionSandbox {
        async fn execute(&self, sql: &str, _timeout_ms: u64) -> Result<SandboxOutcome> {
            if sql.contains("\"region\"") {
                Ok(SandboxOutcome {
                    success: true,
                    rows_returned: 2,
                    sample_rows: vec![vec![json!("West")], vec![json!("East")]],
                    ..Default::default()
                })
            } else {
                Err(PipelineError::Sandbox("database is locked".to_string()))
            }
        }
    }

    fn question(matched: &[&str]) -> Question {
        Question {
            raw: "sales in the west".into(),
            normalized: "sales in the west".into(),
            skeleton: "<schema> in the west".into(),
            keywords: vec!["sales".into(), "west".into()],
            matched_tables: matched.iter().map(|s| s.to_string()).collect(),
            confidence_score: 0.5,
            ambiguous: false,
        }
    }

    fn controller(max_probes: usize) -> ExplorationController {
        let config = ExplorationConfig { max_probes, ..Default::default() };
        ExplorationController::new(Arc::new(RegionSandbox), Arc::new(sales_catalog()), config)
    }

    #[test]
    fn test_probes_prefer_candidate_columns_and_skip_keys() {
        let candidates = vec![Candidate::new(
            "a".into(),
            "SELECT SUM(s.amount) FROM sales s JOIN employees e ON s.employee_id = e.id WHERE e.region = 'west'".into(),
            "icl",
            0,
        )];
        let probes = controller(8).build_probes(&question(&["sales"]), &candidates);
        assert_eq!(probes[0].table, "employees");
        assert_eq!(probes[0].column, "region");
        assert!(probes.iter().all(|p| p.column != "id" && p.column != "employee_id"));
        assert!(probes[0].sql.ends_with("LIMIT 5"));
    }

    #[test]
    fn test_probe_count_is_bounded() {
        let probes = controller(2).build_probes(&question(&["sales", "employees", "customers"]), &[]);
        assert_eq!(probes.len(), 2);
        let probes = controller(8).build_probes(&question(&["sales", "employees", "customers"]), &[]);
        assert!(probes.len() <= MAX_PROBES_PER_ROUND);
    }

    #[tokio::test]
    async fn test_explore_collects_samples_and_hints() {
        let outcome = controller(8)
            .explore(1, ExplorationTrigger::SelectionTie, &question(&["employees"]), &[])
            .await;
        assert_eq!(outcome.round.round, 1);
        assert_eq!(outcome.round.trigger, ExplorationTrigger::SelectionTie);
        assert_eq!(outcome.round.samples.len(), 2);
        assert_eq!(outcome.round.samples[0].column, "employees.region");
        assert_eq!(outcome.hints, vec!["employees.region: West, East".to_string()]);
    }
}
