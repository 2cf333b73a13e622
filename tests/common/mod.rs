#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use text2sql_pipeline::config::PipelineConfig;
use text2sql_pipeline::error::{PipelineError, Result};
use text2sql_pipeline::generation::{Activation, CandidateGenerator, GenerationRequest, SqlGenerator};
use text2sql_pipeline::retrieval::{Collection, SimilarityStore, StoreHit};
use text2sql_pipeline::schema::{ColumnSchema, JoinEdge, SchemaCatalog, TableSchema};
use text2sql_pipeline::{
    ExecutionSandbox, InMemoryTelemetrySink, LanguageModel, Orchestrator, PipelineResources, SandboxOutcome,
};

pub fn sales_catalog() -> SchemaCatalog {
    let column = |name: &str, ty: &str| ColumnSchema {
        name: name.to_string(),
        data_type: Some(ty.to_string()),
        description: None,
    };
    SchemaCatalog::new(
        vec![
            TableSchema {
                name: "employees".to_string(),
                description: None,
                columns: vec![column("id", "INTEGER"), column("name", "TEXT"), column("region", "TEXT")],
            },
            TableSchema {
                name: "sales".to_string(),
                description: None,
                columns: vec![
                    column("id", "INTEGER"),
                    column("employee_id", "INTEGER"),
                    column("amount", "REAL"),
                    column("sale_date", "TEXT"),
                ],
            },
        ],
        vec![JoinEdge {
            from_table: "sales".to_string(),
            from_column: "employee_id".to_string(),
            to_table: "employees".to_string(),
            to_column: "id".to_string(),
        }],
    )
}

/// Language model driven by a closure over the prompt
pub struct ScriptedModel {
    reply: Box<dyn Fn(&str) -> Result<Vec<String>> + Send + Sync>,
    pub calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new(reply: impl Fn(&str) -> Result<Vec<String>> + Send + Sync + 'static) -> Self {
        Self {
            reply: Box::new(reply),
            calls: AtomicUsize::new(0),
        }
    }

    /// Every call fails with a non-retryable error
    pub fn failing() -> Self {
        Self::new(|_| Err(PipelineError::Llm("LLM API error (400 Bad Request): rejected".to_string())))
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn generate(&self, prompt: &str, _temperature: f32, _n: usize) -> Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.reply)(prompt)
    }
}

/// Generator returning fixed SQL per round (the last entry repeats)
pub struct FixedGenerator {
    name: String,
    priority: u8,
    rounds: Vec<Vec<String>>,
    slow_from: Option<(usize, Duration)>,
    fail: bool,
    pub calls: AtomicUsize,
}

impl FixedGenerator {
    pub fn new(name: &str, priority: u8, sqls: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            priority,
            rounds: vec![sqls.iter().map(|s| s.to_string()).collect()],
            slow_from: None,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            fail: true,
            ..Self::new(name, 1, &[])
        }
    }

    pub fn then_round(mut self, sqls: &[&str]) -> Self {
        self.rounds.push(sqls.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn slow_from_round(mut self, round: usize, delay: Duration) -> Self {
        self.slow_from = Some((round, delay));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SqlGenerator for FixedGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some((round, delay)) = self.slow_from {
            if request.round >= round {
                tokio::time::sleep(delay).await;
            }
        }
        if self.fail {
            return Err(PipelineError::Generation("model unavailable".to_string()));
        }
        let index = request.round.min(self.rounds.len() - 1);
        Ok(self.rounds[index].clone())
    }
}

pub fn ok(hash: &str, rows: u64) -> SandboxOutcome {
    SandboxOutcome {
        success: true,
        rows_returned: rows,
        elapsed_ms: 1,
        result_hash: hash.to_string(),
        sample_rows: (0..rows.min(5)).map(|i| vec![json!(i)]).collect(),
        ..Default::default()
    }
}

pub fn err(message: &str) -> SandboxOutcome {
    SandboxOutcome::failure(message.to_string(), 1)
}

/// Sandbox answering from a table keyed by exact SQL. DISTINCT probes get
/// two region values; anything else gets `default`.
pub struct FakeSandbox {
    table: HashMap<String, SandboxOutcome>,
    default: SandboxOutcome,
    pub executed: Mutex<Vec<String>>,
}

impl FakeSandbox {
    pub fn new() -> Self {
        Self {
            table: HashMap::new(),
            default: err("no such table: unknown"),
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn on(mut self, sql: &str, outcome: SandboxOutcome) -> Self {
        self.table.insert(sql.to_string(), outcome);
        self
    }

    pub fn otherwise(mut self, outcome: SandboxOutcome) -> Self {
        self.default = outcome;
        self
    }

    pub fn probes(&self) -> usize {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .filter(|sql| sql.starts_with("SELECT DISTINCT"))
            .count()
    }
}

#[async_trait]
impl ExecutionSandbox for FakeSandbox {
    async fn execute(&self, sql: &str, _timeout_ms: u64) -> Result<SandboxOutcome> {
        self.executed.lock().unwrap().push(sql.to_string());
        if sql.starts_with("SELECT DISTINCT") {
            return Ok(SandboxOutcome {
                success: true,
                rows_returned: 2,
                sample_rows: vec![vec![json!("West")], vec![json!("East")]],
                ..Default::default()
            });
        }
        Ok(self.table.get(sql.trim()).cloned().unwrap_or_else(|| self.default.clone()))
    }
}

/// Store with nothing indexed
pub struct EmptyStore;

#[async_trait]
impl SimilarityStore for EmptyStore {
    async fn query(&self, _text: &str, _top_k: usize, _collection: Collection) -> Result<Vec<StoreHit>> {
        Ok(Vec::new())
    }
}

/// Store that is never reachable
pub struct DownStore;

#[async_trait]
impl SimilarityStore for DownStore {
    async fn query(&self, _text: &str, _top_k: usize, _collection: Collection) -> Result<Vec<StoreHit>> {
        Err(PipelineError::Retrieval("connection refused".to_string()))
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub sandbox: Arc<FakeSandbox>,
    pub llm: Arc<ScriptedModel>,
    pub telemetry: Arc<InMemoryTelemetrySink>,
}

pub fn harness(
    config: PipelineConfig,
    generators: Vec<Arc<dyn SqlGenerator>>,
    reasoning: Option<Arc<dyn SqlGenerator>>,
    sandbox: FakeSandbox,
) -> Harness {
    harness_with(config, generators, reasoning, sandbox, Arc::new(EmptyStore))
}

pub fn harness_with(
    config: PipelineConfig,
    generators: Vec<Arc<dyn SqlGenerator>>,
    reasoning: Option<Arc<dyn SqlGenerator>>,
    sandbox: FakeSandbox,
    store: Arc<dyn SimilarityStore>,
) -> Harness {
    build(config, generators, reasoning, sandbox, store, ScriptedModel::failing())
}

/// Harness whose repair calls are answered by `llm`
pub fn harness_with_model(
    config: PipelineConfig,
    generators: Vec<Arc<dyn SqlGenerator>>,
    sandbox: FakeSandbox,
    llm: ScriptedModel,
) -> Harness {
    build(config, generators, None, sandbox, Arc::new(EmptyStore), llm)
}

fn build(
    config: PipelineConfig,
    generators: Vec<Arc<dyn SqlGenerator>>,
    reasoning: Option<Arc<dyn SqlGenerator>>,
    sandbox: FakeSandbox,
    store: Arc<dyn SimilarityStore>,
    llm: ScriptedModel,
) -> Harness {
    let sandbox = Arc::new(sandbox);
    let llm = Arc::new(llm);
    let telemetry = Arc::new(InMemoryTelemetrySink::new(16));
    let resources = PipelineResources::new(sales_catalog(), store.clone(), store, llm.clone(), sandbox.clone())
        .with_telemetry(telemetry.clone());
    let generator = CandidateGenerator::new()
        .register_all(generators, Activation::Always)
        .register_all(reasoning, Activation::OnRequest);
    let orchestrator = Orchestrator::with_generator(resources, config, generator);
    Harness {
        orchestrator,
        sandbox,
        llm,
        telemetry,
    }
}
