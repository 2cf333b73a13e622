//! ICL Generator
//!
//! Few-shot prompting with one sampling configuration (prompt style,
//! temperature, number of completions, few-shot slice).

use super::prompt::icl_prompt;
use super::{GenerationRequest, SqlGenerator};
use crate::config::{IclVariantConfig, PromptStyle};
use crate::error::Result;
use crate::llm::{clean_sql_response, LanguageModel, RetryPolicy};
use async_trait::async_trait;
use std::sync::Arc;

pub struct IclGenerator {
    name: String,
    llm: Arc<dyn LanguageModel>,
    variant: IclVariantConfig,
    priority: u8,
    retry: RetryPolicy,
}

impl IclGenerator {
    pub fn new(
        index: usize,
        llm: Arc<dyn LanguageModel>,
        variant: IclVariantConfig,
        priority: u8,
        retry: RetryPolicy,
    ) -> Self {
        let style = match variant.style {
            PromptStyle::Basic => "basic",
            PromptStyle::ValueGrounded => "grounded",
            PromptStyle::ExampleFirst => "example_first",
        };
        Self {
            name: format!("icl{}-{}", index, style),
            llm,
            variant,
            priority,
            retry,
        }
    }
}

#[async_trait]
impl SqlGenerator for IclGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<Vec<String>> {
        let prompt = icl_prompt(
            self.variant.style,
            request.question,
            request.context,
            request.catalog,
            self.variant.shots,
        );
        let completions = self
            .retry
            .retry(|| self.llm.generate(&prompt, self.variant.temperature, self.variant.n))
            .await?;
        Ok(completions
            .iter()
            .map(|c| clean_sql_response(c))
            .filter(|sql| !sql.is_empty())
            .take(self.variant.n.max(1))
            .collect())
    }
}
