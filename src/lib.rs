//! Natural-language to SQL query pipeline.
//!
//! A question goes through task understanding, retrieval of cell values and
//! example queries, concurrent multi-strategy generation, dedup, bounded
//! refinement, sandboxed execution, result clustering and selection, with a
//! bounded exploration loop when confidence is low.

pub mod config;
pub mod error;
pub mod execution;
pub mod exploration;
pub mod generation;
pub mod grouping;
pub mod llm;
pub mod merge;
pub mod model;
pub mod observability;
pub mod pipeline;
pub mod refinement;
pub mod retrieval;
pub mod schema;
pub mod selection;
pub mod sql;
pub mod understanding;

pub use config::{PipelineConfig, SelectorMode};
pub use error::{PipelineError, Result};
pub use execution::{ExecutionSandbox, SandboxOutcome, SqliteSandbox};
pub use generation::SqlGenerator;
pub use llm::{LanguageModel, LlmClient};
pub use model::{FinalAnswer, PipelineRun, QueryRequest, Warning};
pub use observability::{InMemoryTelemetrySink, JsonlTelemetrySink, TelemetrySink};
pub use pipeline::{Orchestrator, PipelineResources};
pub use retrieval::{InMemoryVectorStore, SimilarityStore};
pub use schema::SchemaCatalog;
