//! Pipeline Metrics
//!
//! Process-wide counters: runs by outcome, exploration triggers by kind,
//! absorbed component errors by kind.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub runs_by_outcome: HashMap<String, u64>,
    pub exploration_triggers: HashMap<String, u64>,
    pub error_counts: HashMap<String, u64>,
    pub avg_latency_ms: f64,
}

#[derive(Default)]
struct Counters {
    runs_by_outcome: HashMap<String, u64>,
    exploration_triggers: HashMap<String, u64>,
    error_counts: HashMap<String, u64>,
    total_runs: u64,
    total_latency_ms: u64,
}

pub struct PipelineMetrics {
    counters: Mutex<Counters>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
        }
    }

    fn with<F: FnOnce(&mut Counters)>(&self, f: F) {
        let mut counters = self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut counters);
    }

    /// Outcome is `ok`, `low_confidence`, `partial` or `failed`
    pub fn record_run(&self, outcome: &str, latency_ms: u64) {
        self.with(|c| {
            *c.runs_by_outcome.entry(outcome.to_string()).or_insert(0) += 1;
            c.total_runs += 1;
            c.total_latency_ms += latency_ms;
        });
    }

    pub fn record_exploration(&self, trigger: &str) {
        self.with(|c| *c.exploration_triggers.entry(trigger.to_string()).or_insert(0) += 1);
    }

    pub fn record_error(&self, kind: &str) {
        self.with(|c| *c.error_counts.entry(kind.to_string()).or_insert(0) += 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        MetricsSnapshot {
            runs_by_outcome: counters.runs_by_outcome.clone(),
            exploration_triggers: counters.exploration_triggers.clone(),
            error_counts: counters.error_counts.clone(),
            avg_latency_ms: if counters.total_runs == 0 {
                0.0
            } else {
                counters.total_latency_ms as f64 / counters.total_runs as f64
            },
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
