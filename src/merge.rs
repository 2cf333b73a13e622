//! Merge / Dedup
//!
//! Drops candidates whose canonical form was already seen, then optionally
//! folds candidates whose bounded sample results are identical. The first
//! candidate of each class is kept. Running it twice is a no-op.

use crate::config::MergeConfig;
use crate::execution::ExecutionSandbox;
use crate::model::{Candidate, MergeDiscard};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const SAMPLE_CONCURRENCY: usize = 4;

#[derive(Debug, Default)]
pub struct MergeOutcome {
    pub candidates: Vec<Candidate>,
    pub discards: Vec<MergeDiscard>,
}

pub struct CandidateMerger {
    sandbox: Option<Arc<dyn ExecutionSandbox>>,
    config: MergeConfig,
}

impl CandidateMerger {
    pub fn new(sandbox: Option<Arc<dyn ExecutionSandbox>>, config: MergeConfig) -> Self {
        Self { sandbox, config }
    }

    /// Keep the first candidate per canonical form
    pub fn dedup_exact(&self, candidates: Vec<Candidate>) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        let mut seen: HashMap<String, String> = HashMap::new();
        for candidate in candidates {
            match seen.get(&candidate.canonical_form) {
                Some(kept_id) => {
                    debug!("{} duplicates {}: {}", candidate.id, kept_id, candidate.canonical_form);
                    outcome.discards.push(MergeDiscard {
                        discarded_id: candidate.id,
                        kept_id: kept_id.clone(),
                        reason: "canonical".to_string(),
                    });
                }
                None => {
                    seen.insert(candidate.canonical_form.clone(), candidate.id.clone());
                    outcome.candidates.push(candidate);
                }
            }
        }
        outcome
    }

    /// Exact dedup followed by sampled-execution equivalence when enabled.
    /// Sampling is skipped if it cannot finish before `deadline`.
    pub async fn merge(&self, candidates: Vec<Candidate>, deadline: Option<Instant>) -> MergeOutcome {
        let mut outcome = self.dedup_exact(candidates);
        let sandbox = match (&self.sandbox, self.config.sample_equivalence) {
            (Some(sandbox), true) if outcome.candidates.len() > 1 => sandbox.clone(),
            _ => return outcome,
        };

        let sampling = self.sample_hashes(&sandbox, &outcome.candidates);
        let hashes = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, sampling).await {
                Ok(hashes) => hashes,
                Err(_) => {
                    warn!("Skipping sampled equivalence: latency budget exhausted");
                    return outcome;
                }
            },
            None => sampling.await,
        };

        let mut representative: HashMap<String, String> = HashMap::new();
        let mut kept = Vec::with_capacity(outcome.candidates.len());
        for (candidate, hash) in outcome.candidates.into_iter().zip(hashes) {
            let Some(hash) = hash else {
                kept.push(candidate);
                continue;
            };
            match representative.get(&hash) {
                Some(kept_id) => {
                    debug!("{} is sample-equivalent to {}", candidate.id, kept_id);
                    outcome.discards.push(MergeDiscard {
                        discarded_id: candidate.id,
                        kept_id: kept_id.clone(),
                        reason: "sampled_execution".to_string(),
                    });
                }
                None => {
                    representative.insert(hash, candidate.id.clone());
                    kept.push(candidate);
                }
            }
        }
        outcome.candidates = kept;

        info!(
            "Merge kept {} candidates, discarded {}",
            outcome.candidates.len(),
            outcome.discards.len()
        );
        outcome
    }

    /// Sample hash per candidate, in input order. `None` when the sample
    /// failed, was empty, or hit the row limit (result may be truncated).
    async fn sample_hashes(&self, sandbox: &Arc<dyn ExecutionSandbox>, candidates: &[Candidate]) -> Vec<Option<String>> {
        let limit = self.config.sample_rows;
        let timeout_ms = self.config.sample_timeout_ms;
        let mut indexed: Vec<(usize, Option<String>)> = stream::iter(candidates.iter().enumerate())
            .map(|(i, candidate)| {
                let sql = sample_sql(&candidate.sql_text, limit);
                async move {
                    let hash = match sandbox.execute(&sql, timeout_ms).await {
                        Ok(outcome) if outcome.success && outcome.rows_returned >= 1 && (outcome.rows_returned as usize) < limit => {
                            Some(outcome.result_hash)
                        }
                        Ok(_) => None,
                        Err(e) => {
                            debug!("Sample execution unavailable: {}", e);
                            None
                        }
                    };
                    (i, hash)
                }
            })
            .buffer_unordered(SAMPLE_CONCURRENCY)
            .collect()
            .await;
        indexed.sort_by_key(|(i, _)| *i);
        indexed.into_iter().map(|(_, hash)| hash).collect()
    }
}

fn sample_sql(sql: &str, limit: usize) -> String {
    let body = sql.trim().trim_end_matches(';').trim();
    format!("SELECT * FROM ({}) AS dedup_sample LIMIT {}", body, limit)
}
