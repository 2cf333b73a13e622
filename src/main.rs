use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use text2sql_pipeline::config::PipelineConfig;
use text2sql_pipeline::retrieval::{Embedder, HashingEmbedder, InMemoryVectorStore, OpenAiEmbedder};
use text2sql_pipeline::{
    JsonlTelemetrySink, LlmClient, Orchestrator, PipelineResources, QueryRequest, SchemaCatalog, SelectorMode,
    SqliteSandbox,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "text2sql")]
#[command(about = "Answer natural-language questions with verified SQL")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one question through the pipeline and print the answer as JSON
    Ask {
        /// The question in natural language
        question: String,

        /// SQLite database queried read-only
        #[arg(long)]
        db: PathBuf,

        /// Schema catalog JSON (default: introspect the database)
        #[arg(long)]
        catalog: Option<PathBuf>,

        /// Cell values JSON: [{"column": "table.col", "value": "..."}]
        #[arg(long)]
        cells: Option<PathBuf>,

        /// Example pairs JSON: [{"question": "...", "sql": "..."}]
        #[arg(long)]
        examples: Option<PathBuf>,

        /// Index up to N distinct values per text column of the database
        #[arg(long, default_value_t = 0)]
        index_values: usize,

        /// Pipeline configuration JSON (default: T2SQL_* environment)
        #[arg(long)]
        config: Option<PathBuf>,

        /// heuristic, learned or rl
        #[arg(long)]
        selector: Option<SelectorMode>,

        #[arg(long)]
        candidate_cap: Option<usize>,

        #[arg(long)]
        latency_budget_ms: Option<u64>,

        #[arg(long)]
        reasoning: bool,

        /// Append the run record to this JSON-lines file
        #[arg(long)]
        telemetry: Option<PathBuf>,

        /// Embed with the OpenAI embeddings API instead of local hashing
        #[arg(long)]
        openai_embeddings: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Ask {
            question,
            db,
            catalog,
            cells,
            examples,
            index_values,
            config,
            selector,
            candidate_cap,
            latency_budget_ms,
            reasoning,
            telemetry,
            openai_embeddings,
        } => {
            let config = match config {
                Some(path) => PipelineConfig::from_json_file(&path)
                    .with_context(|| format!("loading config {}", path.display()))?,
                None => PipelineConfig::from_env()?,
            };
            let catalog = match catalog {
                Some(path) => SchemaCatalog::from_json_file(&path)
                    .with_context(|| format!("loading catalog {}", path.display()))?,
                None => SchemaCatalog::from_sqlite(&db).with_context(|| format!("introspecting {}", db.display()))?,
            };
            info!("Catalog has {} tables", catalog.tables.len());

            let llm = Arc::new(LlmClient::from_env()?);
            let embedder: Arc<dyn Embedder> = if openai_embeddings {
                let api_key = std::env::var("OPENAI_API_KEY").context("OPENAI_API_KEY is not set")?;
                let base_url =
                    std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
                Arc::new(OpenAiEmbedder::new(api_key, base_url, "text-embedding-3-small".to_string(), 1536))
            } else {
                Arc::new(HashingEmbedder::new(256))
            };

            let mut store = InMemoryVectorStore::new(embedder);
            if let Some(path) = cells {
                store.load_cells_file(&path).await?;
            }
            if let Some(path) = examples {
                store.load_examples_file(&path).await?;
            }
            if index_values > 0 {
                store.index_sqlite_values(&db, &catalog, index_values).await?;
            }
            let store = Arc::new(store);

            let mut resources = PipelineResources::new(
                catalog,
                store.clone(),
                store,
                llm,
                Arc::new(SqliteSandbox::new(db)),
            );
            if let Some(path) = telemetry {
                resources = resources.with_telemetry(Arc::new(JsonlTelemetrySink::new(path)));
            }

            let orchestrator = Orchestrator::new(resources, config);
            let request = QueryRequest {
                candidate_cap,
                latency_budget_ms,
                selector_mode: selector,
                reasoning_generator_enabled: reasoning.then_some(true),
                ..QueryRequest::new(question)
            };
            let answer = orchestrator.run(request).await;
            println!("{}", serde_json::to_string_pretty(&answer)?);
            orchestrator.resources().shutdown().await;
        }
    }
    Ok(())
}
