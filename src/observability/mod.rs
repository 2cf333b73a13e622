//! Observability
//!
//! Telemetry sinks for finished pipeline runs and process-wide counters.

pub mod metrics;
pub mod sink;

pub use metrics::PipelineMetrics;
pub use sink::{InMemoryTelemetrySink, JsonlTelemetrySink, NullTelemetrySink};

use crate::error::Result;
use crate::model::PipelineRun;
use async_trait::async_trait;

/// Append-only destination for run records. Best effort: the orchestrator
/// bounds every append by a grace period and ignores failures.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn append(&self, run: &PipelineRun) -> Result<()>;

    /// Flush buffered records on shutdown
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
