//! Text Embedders
//!
//! `HashingEmbedder` is a deterministic local embedder (feature hashing over
//! words and character trigrams). `OpenAiEmbedder` calls an embeddings API.

use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Vector embedding (simple f32 vector)
pub type Embedding = Vec<f32>;

#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Embedding>;
}

pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension: dimension.max(8) }
    }

    fn bucket(&self, feature: &str) -> (usize, f32) {
        let mut hasher = DefaultHasher::new();
        feature.hash(&mut hasher);
        let h = hasher.finish();
        let index = (h % self.dimension as u64) as usize;
        let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
        (index, sign)
    }

    pub fn embed_sync(&self, text: &str) -> Embedding {
        let mut vector = vec![0.0f32; self.dimension];
        let lowered = text.to_lowercase();
        for word in lowered
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|w| !w.is_empty())
        {
            let (i, s) = self.bucket(&format!("w:{}", word));
            vector[i] += 2.0 * s;

            let padded: Vec<char> = format!("#{}#", word).chars().collect();
            for gram in padded.windows(3) {
                let gram: String = gram.iter().collect();
                let (i, s) = self.bucket(&format!("g:{}", gram));
                vector[i] += s;
            }
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in vector.iter_mut() {
                *v /= norm;
            }
        }
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Embedding> {
        Ok(self.embed_sync(text))
    }
}

/// Embedding client using the OpenAI API
pub struct OpenAiEmbedder {
    api_key: String,
    base_url: String,
    model: String, // e.g., "text-embedding-3-small"
    dimension: usize,
    client: reqwest::Client,
}

impl OpenAiEmbedder {
    pub fn new(api_key: String, base_url: String, model: String, dimension: usize) -> Self {
        Self {
            api_key,
            base_url,
            model,
            dimension,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Embedding> {
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
        });

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::Retrieval(format!("Embedding API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(PipelineError::Retrieval(format!("Embedding API error ({}): {}", status, error_text)));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PipelineError::Retrieval(format!("Failed to parse embedding response: {}", e)))?;

        let embedding: Embedding = json["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| PipelineError::Retrieval("No embedding in response".to_string()))?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();

        if embedding.len() != self.dimension {
            return Err(PipelineError::Retrieval(format!(
                "Embedding dimension {} doesn't match expected {}",
                embedding.len(),
                self.dimension
            )));
        }
        Ok(embedding)
    }
}
