//! Reasoning Generator
//!
//! Decomposes the question step by step over the full schema view and emits
//! one candidate. Optional; enabled per request.

use super::prompt::reasoning_prompt;
use super::{GenerationRequest, SqlGenerator};
use crate::error::Result;
use crate::llm::{clean_sql_response, LanguageModel, RetryPolicy};
use async_trait::async_trait;
use std::sync::Arc;

pub struct ReasoningGenerator {
    llm: Arc<dyn LanguageModel>,
    temperature: f32,
    priority: u8,
    retry: RetryPolicy,
}

impl ReasoningGenerator {
    pub fn new(llm: Arc<dyn LanguageModel>, temperature: f32, priority: u8, retry: RetryPolicy) -> Self {
        Self {
            llm,
            temperature,
            priority,
            retry,
        }
    }
}

#[async_trait]
impl SqlGenerator for ReasoningGenerator {
    fn name(&self) -> &str {
        "reasoning"
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<Vec<String>> {
        let prompt = reasoning_prompt(request.question, request.context, request.catalog);
        let completions = self
            .retry
            .retry(|| self.llm.generate(&prompt, self.temperature, 1))
            .await?;
        Ok(completions
            .first()
            .map(|c| clean_sql_response(c))
            .filter(|sql| !sql.is_empty())
            .into_iter()
            .collect())
    }
}
