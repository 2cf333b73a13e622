//! Language Model Client
//!
//! `LanguageModel` is the generation collaborator contract. `LlmClient` talks
//! to an OpenAI-compatible chat completions endpoint. Transient failures are
//! retried with exponential backoff.

use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

lazy_static! {
    static ref SQL_FENCE: Regex = Regex::new(r"(?is)```(?:sql)?\s*(.*?)```").unwrap();
    static ref SQL_PREFIX: Regex = Regex::new(r"(?i)^\s*(?:sql\s*query|sql|query)\s*:\s*").unwrap();
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Up to `n` completions for one prompt
    async fn generate(&self, prompt: &str, temperature: f32, n: usize) -> Result<Vec<String>>;
}

pub struct LlmClient {
    api_key: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_key: String, base_url: String, model: String) -> Self {
        Self {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            client: reqwest::Client::new(),
        }
    }

    /// Configure from OPENAI_API_KEY, OPENAI_BASE_URL and OPENAI_MODEL
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| PipelineError::Config("OPENAI_API_KEY is not set".to_string()))?;
        let base_url =
            std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let model = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        Ok(Self::new(api_key, base_url, model))
    }
}

#[async_trait]
impl LanguageModel for LlmClient {
    async fn generate(&self, prompt: &str, temperature: f32, n: usize) -> Result<Vec<String>> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": "You are an expert SQL writer. Return only the SQL query, no explanation."},
                {"role": "user", "content": prompt}
            ],
            "temperature": temperature,
            "n": n.max(1),
            "max_tokens": 800
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::Llm(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(PipelineError::Llm(format!("LLM API error ({}): {}", status, error_text)));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PipelineError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        let contents: Vec<String> = response_json["choices"]
            .as_array()
            .map(|choices| {
                choices
                    .iter()
                    .filter_map(|c| c["message"]["content"].as_str())
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default();

        if contents.is_empty() {
            return Err(PipelineError::Llm("No content in LLM response".to_string()));
        }
        debug!("LLM returned {} completions", contents.len());
        Ok(contents)
    }
}

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: usize, initial_delay: Duration, max_delay: Duration, backoff_multiplier: f64) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    /// Calculate delay for retry attempt (exponential backoff)
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let delay_ms = (self.initial_delay.as_millis() as f64) * self.backoff_multiplier.powi(attempt as i32);
        let delay_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(delay_ms as u64)
    }

    /// Run `operation`, retrying transient errors. The last error is returned
    /// unchanged once retries are exhausted or the error is not transient.
    pub async fn retry<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!("Transient failure (attempt {}), retrying in {:?}: {}", attempt + 1, delay, e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Extract SQL from a model response: code fences, `SQL:` prefixes and
/// trailing semicolons are removed.
pub fn clean_sql_response(response: &str) -> String {
    let body = match SQL_FENCE.captures(response) {
        Some(caps) => caps.get(1).map(|m| m.as_str()).unwrap_or(response).to_string(),
        None => response.to_string(),
    };
    let body = SQL_PREFIX.replace(body.trim(), "").to_string();
    body.trim().trim_end_matches(';').trim().to_string()
}
