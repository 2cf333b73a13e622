//! Pipeline Configuration
//!
//! Tunable budgets, thresholds and strategy choices. Loaded from defaults,
//! a JSON file, or `T2SQL_*` environment variables.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Hard ceiling on probes per exploration round.
pub const MAX_PROBES_PER_ROUND: usize = 8;

/// Hard ceiling on sample rows carried by an execution record.
pub const MAX_SAMPLE_ROWS: usize = 5;

/// Selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectorMode {
    #[default]
    Heuristic,
    Learned,
    Rl,
}

impl FromStr for SelectorMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "heuristic" => Ok(SelectorMode::Heuristic),
            "learned" => Ok(SelectorMode::Learned),
            "rl" | "policy" => Ok(SelectorMode::Rl),
            other => Err(PipelineError::Config(format!("Unknown selector mode: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub cell_top_k: usize,
    pub example_top_k: usize,
    /// Top-k multiplier applied when task understanding reports low confidence
    pub widen_factor: usize,
    pub min_similarity: f32,
    pub timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            cell_top_k: 20,
            example_top_k: 6,
            widen_factor: 2,
            min_similarity: 0.0,
            timeout_ms: 2000,
        }
    }
}

/// One ICL sampling configuration (prompt style × temperature × few-shot slice)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IclVariantConfig {
    pub style: PromptStyle,
    pub temperature: f32,
    pub n: usize,
    /// Number of retrieved examples to include as few-shot context
    pub shots: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PromptStyle {
    /// Question + light schema + examples
    Basic,
    /// Adds retrieved cell values as grounding hints
    ValueGrounded,
    /// Examples first, question last, minimal schema
    ExampleFirst,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub icl_variants: Vec<IclVariantConfig>,
    pub reasoning_temperature: f32,
    pub max_retries: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Lower priority producers are truncated first when the cap is exceeded
    pub icl_priority: u8,
    pub reasoning_priority: u8,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            icl_variants: vec![
                IclVariantConfig { style: PromptStyle::Basic, temperature: 0.0, n: 1, shots: 4 },
                IclVariantConfig { style: PromptStyle::ValueGrounded, temperature: 0.4, n: 2, shots: 4 },
                IclVariantConfig { style: PromptStyle::ExampleFirst, temperature: 0.8, n: 2, shots: 6 },
            ],
            reasoning_temperature: 0.2,
            max_retries: 2,
            initial_backoff_ms: 100,
            max_backoff_ms: 2000,
            backoff_multiplier: 2.0,
            icl_priority: 1,
            reasoning_priority: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Fold candidates whose bounded samples hash equal. Folded candidates no
    /// longer count toward cluster size.
    pub sample_equivalence: bool,
    pub sample_rows: usize,
    pub sample_timeout_ms: u64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            sample_equivalence: false,
            sample_rows: 50,
            sample_timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinementConfig {
    pub max_syntax_fixes: usize,
    pub max_semantic_revisions: usize,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            max_syntax_fixes: 2,
            max_semantic_revisions: 1,
        }
    }
}

impl RefinementConfig {
    pub fn max_iterations(&self) -> usize {
        self.max_syntax_fixes + self.max_semantic_revisions
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub timeout_ms: u64,
    pub workers: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            workers: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub confidence_threshold: f64,
    /// JSON weights for the learned / rl strategies
    pub model_path: Option<PathBuf>,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            model_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplorationConfig {
    pub max_rounds: usize,
    pub max_probes: usize,
    pub probe_row_limit: usize,
    pub probe_timeout_ms: u64,
}

impl Default for ExplorationConfig {
    fn default() -> Self {
        Self {
            max_rounds: 2,
            max_probes: MAX_PROBES_PER_ROUND,
            probe_row_limit: MAX_SAMPLE_ROWS,
            probe_timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub grace_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { grace_ms: 250 }
    }
}

/// Complete pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub candidate_cap: usize,
    pub latency_budget_ms: u64,
    pub selector_mode: SelectorMode,
    pub reasoning_generator_enabled: bool,
    pub understanding_confidence_threshold: f64,
    pub retrieval: RetrievalConfig,
    pub generation: GenerationConfig,
    pub merge: MergeConfig,
    pub refinement: RefinementConfig,
    pub execution: ExecutionConfig,
    pub selection: SelectionConfig,
    pub exploration: ExplorationConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            candidate_cap: 8,
            latency_budget_ms: 30_000,
            selector_mode: SelectorMode::Heuristic,
            reasoning_generator_enabled: false,
            understanding_confidence_threshold: 0.5,
            retrieval: RetrievalConfig::default(),
            generation: GenerationConfig::default(),
            merge: MergeConfig::default(),
            refinement: RefinementConfig::default(),
            execution: ExecutionConfig::default(),
            selection: SelectionConfig::default(),
            exploration: ExplorationConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from a JSON file; missing keys fall back to defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: PipelineConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `T2SQL_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_parse::<usize>("T2SQL_CANDIDATE_CAP")? {
            self.candidate_cap = v;
        }
        if let Some(v) = env_parse::<u64>("T2SQL_LATENCY_BUDGET_MS")? {
            self.latency_budget_ms = v;
        }
        if let Some(v) = env_parse::<SelectorMode>("T2SQL_SELECTOR_MODE")? {
            self.selector_mode = v;
        }
        if let Some(v) = env_parse::<bool>("T2SQL_REASONING_ENABLED")? {
            self.reasoning_generator_enabled = v;
        }
        if let Some(v) = env_parse::<f64>("T2SQL_UNDERSTANDING_THRESHOLD")? {
            self.understanding_confidence_threshold = v;
        }
        if let Some(v) = env_parse::<usize>("T2SQL_CELL_TOP_K")? {
            self.retrieval.cell_top_k = v;
        }
        if let Some(v) = env_parse::<usize>("T2SQL_EXAMPLE_TOP_K")? {
            self.retrieval.example_top_k = v;
        }
        if let Some(v) = env_parse::<f32>("T2SQL_MIN_SIMILARITY")? {
            self.retrieval.min_similarity = v;
        }
        if let Some(v) = env_parse::<u64>("T2SQL_EXECUTION_TIMEOUT_MS")? {
            self.execution.timeout_ms = v;
        }
        if let Some(v) = env_parse::<usize>("T2SQL_EXECUTION_WORKERS")? {
            self.execution.workers = v;
        }
        if let Some(v) = env_parse::<f64>("T2SQL_CONFIDENCE_THRESHOLD")? {
            self.selection.confidence_threshold = v;
        }
        if let Ok(path) = env::var("T2SQL_SELECTOR_MODEL") {
            self.selection.model_path = Some(PathBuf::from(path));
        }
        if let Some(v) = env_parse::<usize>("T2SQL_MAX_EXPLORATION_ROUNDS")? {
            self.exploration.max_rounds = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.candidate_cap == 0 || self.candidate_cap > 32 {
            return Err(PipelineError::Config(format!(
                "candidate_cap must be in 1..=32, got {}",
                self.candidate_cap
            )));
        }
        if self.exploration.max_probes > MAX_PROBES_PER_ROUND {
            return Err(PipelineError::Config(format!(
                "exploration.max_probes must be <= {}, got {}",
                MAX_PROBES_PER_ROUND, self.exploration.max_probes
            )));
        }
        if self.execution.workers == 0 {
            return Err(PipelineError::Config("execution.workers must be > 0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.selection.confidence_threshold)
            || !(0.0..=1.0).contains(&self.understanding_confidence_threshold)
        {
            return Err(PipelineError::Config("confidence thresholds must be in [0, 1]".to_string()));
        }
        if self.generation.icl_variants.is_empty() {
            return Err(PipelineError::Config("at least one ICL variant is required".to_string()));
        }
        if self.selector_mode != SelectorMode::Heuristic && self.selection.model_path.is_none() {
            tracing::warn!(
                "Selector mode {:?} configured without model weights, built-in weights will be used",
                self.selector_mode
            );
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| PipelineError::Config(format!("Invalid {}='{}': {}", key, raw, e))),
        Err(_) => Ok(None),
    }
}
