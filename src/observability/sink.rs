//! Telemetry Sinks
//!
//! JSON-lines file sink and a bounded in-memory ring.

use super::TelemetrySink;
use crate::error::{PipelineError, Result};
use crate::model::PipelineRun;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;

/// Appends one JSON object per run to a file
pub struct JsonlTelemetrySink {
    log_file: PathBuf,
    /// Serializes writers so lines never interleave
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlTelemetrySink {
    pub fn new(log_file: impl Into<PathBuf>) -> Self {
        Self {
            log_file: log_file.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl TelemetrySink for JsonlTelemetrySink {
    async fn append(&self, run: &PipelineRun) -> Result<()> {
        let mut line = serde_json::to_string(run)
            .map_err(|e| PipelineError::Telemetry(format!("Failed to serialize run: {}", e)))?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
            .await
            .map_err(|e| PipelineError::Telemetry(format!("Failed to open log file: {}", e)))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| PipelineError::Telemetry(format!("Failed to write log: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| PipelineError::Telemetry(format!("Failed to flush log: {}", e)))?;
        Ok(())
    }
}

/// Keeps the most recent runs in memory
pub struct InMemoryTelemetrySink {
    runs: Mutex<VecDeque<PipelineRun>>,
    max_in_memory_runs: usize,
}

impl InMemoryTelemetrySink {
    pub fn new(max_in_memory_runs: usize) -> Self {
        Self {
            runs: Mutex::new(VecDeque::new()),
            max_in_memory_runs: max_in_memory_runs.max(1),
        }
    }

    pub fn runs(&self) -> Vec<PipelineRun> {
        self.runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn last(&self) -> Option<PipelineRun> {
        self.runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .back()
            .cloned()
    }
}

impl Default for InMemoryTelemetrySink {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl TelemetrySink for InMemoryTelemetrySink {
    async fn append(&self, run: &PipelineRun) -> Result<()> {
        let mut runs = self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        runs.push_back(run.clone());
        while runs.len() > self.max_in_memory_runs {
            runs.pop_front();
        }
        Ok(())
    }
}

/// Discards everything
pub struct NullTelemetrySink;

#[async_trait]
impl TelemetrySink for NullTelemetrySink {
    async fn append(&self, _run: &PipelineRun) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_ring_is_bounded() {
        let sink = InMemoryTelemetrySink::new(2);
        for id in ["r1", "r2", "r3"] {
            sink.append(&PipelineRun::new(id.to_string())).await.unwrap();
        }
        let ids: Vec<String> = sink.runs().into_iter().map(|r| r.run_id).collect();
        assert_eq!(ids, vec!["r2".to_string(), "r3".to_string()]);
        assert_eq!(sink.last().unwrap().run_id, "r3");
    }

    #[tokio::test]
    async fn test_jsonl_appends_one_line_per_run() {
        let path = std::env::temp_dir().join(format!("runs-{}.jsonl", uuid::Uuid::new_v4()));
        let sink = JsonlTelemetrySink::new(&path);
        sink.append(&PipelineRun::new("a".to_string())).await.unwrap();
        sink.append(&PipelineRun::new("b".to_string())).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: PipelineRun = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.run_id, "b");
        let _ = std::fs::remove_file(&path);
    }
}
