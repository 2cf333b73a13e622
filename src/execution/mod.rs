//! Candidate Execution
//!
//! Runs executable candidates against the read-only sandbox through a bounded
//! worker pool. Every failure ends up on the candidate's `ExecutionRecord`.

pub mod sqlite;

pub use sqlite::SqliteSandbox;

use crate::config::{ExecutionConfig, MAX_SAMPLE_ROWS};
use crate::error::Result;
use crate::model::{Candidate, ExecutionRecord};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What the sandbox reports for one statement
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SandboxOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub rows_returned: u64,
    pub elapsed_ms: u64,
    pub result_hash: String,
    pub sample_rows: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    pub plan_cost: Option<f64>,
}

impl SandboxOutcome {
    pub fn failure(error: String, elapsed_ms: u64) -> Self {
        Self {
            success: false,
            error: Some(error),
            elapsed_ms,
            ..Default::default()
        }
    }
}

/// Read-only query sandbox. Enforces read-only access and row/time limits.
#[async_trait]
pub trait ExecutionSandbox: Send + Sync {
    async fn execute(&self, sql: &str, timeout_ms: u64) -> Result<SandboxOutcome>;
}

pub struct ExecutionEngine {
    sandbox: Arc<dyn ExecutionSandbox>,
    config: ExecutionConfig,
}

impl ExecutionEngine {
    pub fn new(sandbox: Arc<dyn ExecutionSandbox>, config: ExecutionConfig) -> Self {
        Self { sandbox, config }
    }

    pub fn sandbox(&self) -> &Arc<dyn ExecutionSandbox> {
        &self.sandbox
    }

    /// Execute one candidate version; never fails
    pub async fn execute_one(&self, candidate: &Candidate) -> ExecutionRecord {
        let timeout_ms = self.config.timeout_ms;
        // the sandbox enforces the timeout itself; this guards against one that does not
        let guard = Duration::from_millis(timeout_ms + timeout_ms / 2 + 100);
        let outcome = match tokio::time::timeout(guard, self.sandbox.execute(&candidate.sql_text, timeout_ms)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!("Sandbox error for {}: {}", candidate.id, e);
                SandboxOutcome::failure(e.to_string(), 0)
            }
            Err(_) => SandboxOutcome::failure(format!("timeout after {} ms", timeout_ms), guard.as_millis() as u64),
        };
        record_from(candidate, outcome)
    }

    /// Execute candidates concurrently, at most `workers` at a time. Records
    /// come back in completion order. Candidates still running at `deadline`
    /// get a failed record.
    pub async fn execute_all(&self, candidates: &[&Candidate], deadline: Option<Instant>) -> Vec<ExecutionRecord> {
        let mut pending = stream::iter(candidates.iter().copied())
            .map(|c| self.execute_one(c))
            .buffer_unordered(self.config.workers.max(1));

        let mut records: Vec<ExecutionRecord> = Vec::with_capacity(candidates.len());
        loop {
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, pending.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!("Execution deadline reached, {} of {} finished", records.len(), candidates.len());
                        break;
                    }
                },
                None => pending.next().await,
            };
            match next {
                Some(record) => records.push(record),
                None => break,
            }
        }

        let finished: HashSet<String> = records.iter().map(|r| r.candidate_id.clone()).collect();
        for candidate in candidates.iter().filter(|c| !finished.contains(&c.id)) {
            records.push(record_from(
                candidate,
                SandboxOutcome::failure("cancelled: latency budget exhausted".to_string(), 0),
            ));
        }

        let succeeded = records.iter().filter(|r| r.success).count();
        info!("Executed {} candidates: {} succeeded", records.len(), succeeded);
        records
    }
}

fn record_from(candidate: &Candidate, mut outcome: SandboxOutcome) -> ExecutionRecord {
    outcome.sample_rows.truncate(MAX_SAMPLE_ROWS);
    debug!(
        "{} v{}: success={} rows={} {}ms",
        candidate.id, candidate.version, outcome.success, outcome.rows_returned, outcome.elapsed_ms
    );
    ExecutionRecord {
        candidate_id: candidate.id.clone(),
        candidate_version: candidate.version,
        success: outcome.success,
        error: outcome.error,
        rows_returned: outcome.rows_returned,
        elapsed_ms: outcome.elapsed_ms,
        result_hash: if outcome.success { outcome.result_hash } else { String::new() },
        sample_rows: outcome.sample_rows,
        plan_cost_estimate: outcome.plan_cost,
    }
}
