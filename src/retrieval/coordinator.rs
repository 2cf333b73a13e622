//! Retrieval Coordinator
//!
//! Queries the cell-value and example stores concurrently. A failing or slow
//! channel degrades to an empty result; retrieval itself never fails.

use super::{Collection, SimilarityStore, StoreHit};
use crate::config::RetrievalConfig;
use crate::model::{CellHit, ExampleHit, Question, RetrievalContext};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct RetrievalCoordinator {
    cells: Arc<dyn SimilarityStore>,
    examples: Arc<dyn SimilarityStore>,
    config: RetrievalConfig,
}

impl RetrievalCoordinator {
    pub fn new(
        cells: Arc<dyn SimilarityStore>,
        examples: Arc<dyn SimilarityStore>,
        config: RetrievalConfig,
    ) -> Self {
        Self { cells, examples, config }
    }

    /// One retrieval snapshot for `round`. `hints` are exploration samples
    /// appended to the cell query; `widen` multiplies both top-k values.
    pub async fn retrieve(
        &self,
        question: &Question,
        hints: &[String],
        widen: bool,
        round: usize,
    ) -> RetrievalContext {
        let factor = if widen { self.config.widen_factor.max(1) } else { 1 };
        let cell_k = self.config.cell_top_k * factor;
        let example_k = self.config.example_top_k * factor;

        let mut cell_text = question.normalized.clone();
        for hint in hints {
            cell_text.push(' ');
            cell_text.push_str(hint);
        }
        let example_text = if question.skeleton.is_empty() {
            question.normalized.clone()
        } else {
            question.skeleton.clone()
        };

        let (cell_hits, example_hits) = tokio::join!(
            self.lookup(&self.cells, &cell_text, cell_k, Collection::Cells),
            self.lookup(&self.examples, &example_text, example_k, Collection::Examples),
        );

        let mut context = RetrievalContext {
            round,
            ..Default::default()
        };

        match cell_hits {
            Some(hits) => {
                context.cells = hits
                    .into_iter()
                    .filter_map(|h| parse_cell(&h))
                    .filter(|c| c.score >= self.config.min_similarity)
                    .collect();
            }
            None => context.degraded_channels.push("cells".to_string()),
        }
        match example_hits {
            Some(hits) => {
                context.examples = hits
                    .into_iter()
                    .filter_map(|h| parse_example(&h))
                    .filter(|e| e.score >= self.config.min_similarity)
                    .collect();
            }
            None => context.degraded_channels.push("examples".to_string()),
        }

        debug!(
            "Retrieval round {}: {} cells, {} examples (widen={})",
            round,
            context.cells.len(),
            context.examples.len(),
            widen
        );
        context
    }

    async fn lookup(
        &self,
        store: &Arc<dyn SimilarityStore>,
        text: &str,
        top_k: usize,
        collection: Collection,
    ) -> Option<Vec<StoreHit>> {
        let timeout = Duration::from_millis(self.config.timeout_ms);
        match tokio::time::timeout(timeout, store.query(text, top_k, collection)).await {
            Ok(Ok(hits)) => Some(hits),
            Ok(Err(e)) => {
                warn!("{:?} retrieval failed, continuing without it: {}", collection, e);
                None
            }
            Err(_) => {
                warn!("{:?} retrieval timed out after {:?}", collection, timeout);
                None
            }
        }
    }
}

fn parse_cell(hit: &StoreHit) -> Option<CellHit> {
    let column = hit.payload.get("column")?.as_str()?;
    let value = match hit.payload.get("value")? {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Some(CellHit {
        column: column.to_string(),
        value,
        score: hit.score.clamp(0.0, 1.0),
    })
}

fn parse_example(hit: &StoreHit) -> Option<ExampleHit> {
    Some(ExampleHit {
        question: hit.payload.get("question")?.as_str()?.to_string(),
        sql: hit.payload.get("sql")?.as_str()?.to_string(),
        score: hit.score.clamp(0.0, 1.0),
    })
}
