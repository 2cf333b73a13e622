//! Vector Store
//!
//! In-memory similarity store over two collections (cell values and
//! question/SQL examples). Linear cosine search; embeddings are recomputed on load.

use super::embedder::{Embedder, Embedding};
use super::{Collection, SimilarityStore, StoreHit};
use crate::error::{PipelineError, Result};
use crate::schema::SchemaCatalog;
use async_trait::async_trait;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Document in the vector store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDocument {
    pub id: String,
    pub text: String,
    pub payload: serde_json::Value,
    // Embedding is not serialized (can be recomputed)
    #[serde(skip)]
    pub embedding: Option<Embedding>,
}

#[derive(Serialize, Deserialize)]
struct SavedStore {
    cells: Vec<StoredDocument>,
    examples: Vec<StoredDocument>,
}

#[derive(Deserialize)]
struct CellEntry {
    column: String,
    value: String,
}

#[derive(Deserialize)]
struct ExampleEntry {
    question: String,
    sql: String,
}

pub struct InMemoryVectorStore {
    embedder: Arc<dyn Embedder>,
    collections: HashMap<Collection, Vec<StoredDocument>>,
}

impl InMemoryVectorStore {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            collections: HashMap::new(),
        }
    }

    pub async fn add_document(
        &mut self,
        collection: Collection,
        text: String,
        payload: serde_json::Value,
    ) -> Result<()> {
        let embedding = self.embedder.embed(&text).await?;
        if embedding.len() != self.embedder.dimension() {
            return Err(PipelineError::Retrieval(format!(
                "Embedding dimension {} doesn't match store dimension {}",
                embedding.len(),
                self.embedder.dimension()
            )));
        }
        let docs = self.collections.entry(collection).or_default();
        let id = format!("{:?}-{}", collection, docs.len()).to_lowercase();
        docs.push(StoredDocument {
            id,
            text,
            payload,
            embedding: Some(embedding),
        });
        Ok(())
    }

    /// Index a distinct cell value of `table.column`
    pub async fn add_cell(&mut self, column: &str, value: &str) -> Result<()> {
        let text = format!("{} {}", column.replace(['.', '_'], " "), value);
        self.add_document(
            Collection::Cells,
            text,
            serde_json::json!({ "column": column, "value": value }),
        )
        .await
    }

    pub async fn add_example(&mut self, question: &str, sql: &str) -> Result<()> {
        self.add_document(
            Collection::Examples,
            question.to_string(),
            serde_json::json!({ "question": question, "sql": sql }),
        )
        .await
    }

    /// Load `[{"column": "t.c", "value": "..."}]`
    pub async fn load_cells_file(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let entries: Vec<CellEntry> = serde_json::from_str(&content)?;
        let count = entries.len();
        for entry in entries {
            self.add_cell(&entry.column, &entry.value).await?;
        }
        info!("Indexed {} cell values from {}", count, path.as_ref().display());
        Ok(count)
    }

    /// Load `[{"question": "...", "sql": "..."}]`
    pub async fn load_examples_file(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let entries: Vec<ExampleEntry> = serde_json::from_str(&content)?;
        let count = entries.len();
        for entry in entries {
            self.add_example(&entry.question, &entry.sql).await?;
        }
        info!("Indexed {} examples from {}", count, path.as_ref().display());
        Ok(count)
    }

    /// Index distinct text values of every text column in a SQLite database
    pub async fn index_sqlite_values(
        &mut self,
        path: impl AsRef<Path>,
        catalog: &SchemaCatalog,
        per_column: usize,
    ) -> Result<usize> {
        let mut values: Vec<(String, String)> = Vec::new();
        {
            let conn = Connection::open_with_flags(path.as_ref(), OpenFlags::SQLITE_OPEN_READ_ONLY)?;
            for table in &catalog.tables {
                for column in &table.columns {
                    let is_text = column
                        .data_type
                        .as_deref()
                        .map(|t| {
                            let t = t.to_uppercase();
                            t.contains("CHAR") || t.contains("TEXT") || t.contains("CLOB")
                        })
                        .unwrap_or(false);
                    if !is_text {
                        continue;
                    }
                    let sql = format!(
                        "SELECT DISTINCT \"{}\" FROM \"{}\" WHERE \"{}\" IS NOT NULL LIMIT {}",
                        column.name, table.name, column.name, per_column
                    );
                    let mut stmt = conn.prepare(&sql)?;
                    let mut rows = stmt.query([])?;
                    while let Some(row) = rows.next()? {
                        if let Ok(value) = row.get::<_, String>(0) {
                            values.push((format!("{}.{}", table.name, column.name), value));
                        }
                    }
                }
            }
        }

        let count = values.len();
        for (column, value) in values {
            self.add_cell(&column, &value).await?;
        }
        info!("Indexed {} cell values from {}", count, path.as_ref().display());
        Ok(count)
    }

    pub fn len(&self, collection: Collection) -> usize {
        self.collections.get(&collection).map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.collections.values().all(|d| d.is_empty())
    }

    pub fn search(&self, query_embedding: &Embedding, top_k: usize, collection: Collection) -> Result<Vec<StoreHit>> {
        let docs = match self.collections.get(&collection) {
            Some(docs) if !docs.is_empty() => docs,
            _ => return Ok(Vec::new()),
        };

        if query_embedding.len() != self.embedder.dimension() {
            return Err(PipelineError::Retrieval(format!(
                "Query embedding dimension {} doesn't match store dimension {}",
                query_embedding.len(),
                self.embedder.dimension()
            )));
        }

        let mut results: Vec<StoreHit> = docs
            .iter()
            .filter_map(|doc| {
                doc.embedding.as_ref().map(|embedding| StoreHit {
                    payload: doc.payload.clone(),
                    score: cosine_similarity(query_embedding, embedding).clamp(0.0, 1.0),
                })
            })
            .collect();

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(top_k);
        Ok(results)
    }

    /// Save documents without embeddings
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let saved = SavedStore {
            cells: self.collections.get(&Collection::Cells).cloned().unwrap_or_default(),
            examples: self.collections.get(&Collection::Examples).cloned().unwrap_or_default(),
        };
        std::fs::write(path.as_ref(), serde_json::to_string_pretty(&saved)?)?;
        Ok(())
    }

    /// Load a saved store, re-embedding every document
    pub async fn load(path: impl AsRef<Path>, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let encoded = std::fs::read_to_string(path.as_ref())?;
        let saved: SavedStore = serde_json::from_str(&encoded)?;
        let mut store = Self::new(embedder);
        for (collection, docs) in [(Collection::Cells, saved.cells), (Collection::Examples, saved.examples)] {
            for doc in docs {
                store.add_document(collection, doc.text, doc.payload).await?;
            }
        }
        debug!(
            "Loaded vector store: {} cells, {} examples",
            store.len(Collection::Cells),
            store.len(Collection::Examples)
        );
        Ok(store)
    }
}

#[async_trait]
impl SimilarityStore for InMemoryVectorStore {
    async fn query(&self, text: &str, top_k: usize, collection: Collection) -> Result<Vec<StoreHit>> {
        let embedding = self.embedder.embed(text).await?;
        self.search(&embedding, top_k, collection)
    }
}

/// Compute cosine similarity between two vectors
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}
