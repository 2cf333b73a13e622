//! Retrieval
//!
//! Similarity-store collaborator contract, an in-memory vector store, and the
//! coordinator that queries the cell-value and example stores concurrently.

pub mod coordinator;
pub mod embedder;
pub mod vector_store;

pub use coordinator::RetrievalCoordinator;
pub use embedder::{Embedder, HashingEmbedder, OpenAiEmbedder};
pub use vector_store::{InMemoryVectorStore, StoredDocument};

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Collection a similarity lookup targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Cells,
    Examples,
}

/// One ranked hit with similarity in [0, 1]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreHit {
    pub payload: serde_json::Value,
    pub score: f32,
}

/// Offline indexing service contract
#[async_trait]
pub trait SimilarityStore: Send + Sync {
    async fn query(&self, text: &str, top_k: usize, collection: Collection) -> Result<Vec<StoreHit>>;
}
