//! Candidate Generation
//!
//! Runs every enabled generator concurrently, collects SQL in completion
//! order and enforces the candidate cap by truncating the lowest-priority
//! producers first. A failing generator only contributes a warning.

pub mod icl;
pub mod prompt;
pub mod reasoning;

pub use icl::IclGenerator;
pub use reasoning::ReasoningGenerator;

use crate::config::GenerationConfig;
use crate::error::Result;
use crate::llm::{LanguageModel, RetryPolicy};
use crate::model::{Candidate, Question, RetrievalContext};
use crate::schema::SchemaCatalog;
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Everything a generator sees for one round
pub struct GenerationRequest<'a> {
    pub question: &'a Question,
    pub context: &'a RetrievalContext,
    pub catalog: &'a SchemaCatalog,
    pub round: usize,
}

#[async_trait]
pub trait SqlGenerator: Send + Sync {
    fn name(&self) -> &str;

    /// Higher priority survives the candidate cap longer
    fn priority(&self) -> u8;

    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<Vec<String>>;
}

/// Result of one generation round
#[derive(Debug, Default)]
pub struct GenerationOutcome {
    pub candidates: Vec<Candidate>,
    /// (generator, error) for generators that failed or missed the deadline
    pub failures: Vec<(String, String)>,
    /// Candidates dropped by the cap
    pub truncated: usize,
}

/// When a registered generator takes part in a round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Always,
    /// Only for requests that enable the optional generators
    OnRequest,
}

struct Registered {
    generator: Arc<dyn SqlGenerator>,
    activation: Activation,
}

#[derive(Default)]
pub struct CandidateGenerator {
    generators: Vec<Registered>,
}

impl CandidateGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, generator: Arc<dyn SqlGenerator>, activation: Activation) -> Self {
        self.generators.push(Registered { generator, activation });
        self
    }

    pub fn register_all(
        self,
        generators: impl IntoIterator<Item = Arc<dyn SqlGenerator>>,
        activation: Activation,
    ) -> Self {
        generators
            .into_iter()
            .fold(self, |set, generator| set.register(generator, activation))
    }

    /// ICL variants from config run always; the reasoning generator runs on
    /// request. All share one model.
    pub fn from_config(llm: Arc<dyn LanguageModel>, config: &GenerationConfig) -> Self {
        let retry = RetryPolicy::new(
            config.max_retries,
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
            config.backoff_multiplier,
        );
        let icl: Vec<Arc<dyn SqlGenerator>> = config
            .icl_variants
            .iter()
            .enumerate()
            .map(|(i, variant)| {
                Arc::new(IclGenerator::new(
                    i,
                    llm.clone(),
                    variant.clone(),
                    config.icl_priority,
                    retry.clone(),
                )) as Arc<dyn SqlGenerator>
            })
            .collect();
        let reasoning = Arc::new(ReasoningGenerator::new(
            llm,
            config.reasoning_temperature,
            config.reasoning_priority,
            retry,
        ));
        Self::new()
            .register_all(icl, Activation::Always)
            .register(reasoning, Activation::OnRequest)
    }

    /// Generate up to `cap` candidates. Generators still running at `deadline`
    /// are abandoned and whatever already completed is kept.
    pub async fn generate(
        &self,
        request: &GenerationRequest<'_>,
        cap: usize,
        optional_enabled: bool,
        deadline: Option<Instant>,
    ) -> GenerationOutcome {
        let generators: Vec<&Arc<dyn SqlGenerator>> = self
            .generators
            .iter()
            .filter(|r| r.activation == Activation::Always || optional_enabled)
            .map(|r| &r.generator)
            .collect();

        let mut pending: FuturesUnordered<_> = generators
            .iter()
            .map(|g| async move { (g.name().to_string(), g.priority(), g.generate(request).await) })
            .collect();

        let mut outcome = GenerationOutcome::default();
        let mut produced: Vec<(String, u8, Vec<String>)> = Vec::new();

        loop {
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, pending.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!("Generation deadline reached with {} generators pending", pending.len());
                        outcome
                            .failures
                            .push(("generation".to_string(), format!("{} generators timed out", pending.len())));
                        break;
                    }
                },
                None => pending.next().await,
            };
            let Some((name, priority, result)) = next else {
                break;
            };
            match result {
                Ok(sqls) => {
                    debug!("Generator {} produced {} candidates", name, sqls.len());
                    produced.push((name, priority, sqls));
                }
                Err(e) => {
                    warn!("Generator {} failed: {}", name, e);
                    outcome.failures.push((name, e.to_string()));
                }
            }
        }

        outcome.truncated = enforce_cap(&mut produced, cap);

        for (name, _, sqls) in produced {
            for (i, sql) in sqls.into_iter().enumerate() {
                let id = format!("r{}-{}-{}", request.round, name, i);
                outcome.candidates.push(Candidate::new(id, sql, &name, request.round));
            }
        }

        info!(
            "Generated {} candidates in round {} ({} truncated, {} generator failures)",
            outcome.candidates.len(),
            request.round,
            outcome.truncated,
            outcome.failures.len()
        );
        outcome
    }
}

/// Drop candidates from the lowest-priority producers (latest finisher first)
/// until at most `cap` remain. Returns how many were dropped.
fn enforce_cap(produced: &mut [(String, u8, Vec<String>)], cap: usize) -> usize {
    let total: usize = produced.iter().map(|(_, _, s)| s.len()).sum();
    if total <= cap {
        return 0;
    }
    let mut excess = total - cap;
    let mut priorities: Vec<u8> = produced.iter().map(|(_, p, _)| *p).collect();
    priorities.sort_unstable();
    priorities.dedup();

    for priority in priorities {
        for (_, p, sqls) in produced.iter_mut().rev() {
            if *p != priority {
                continue;
            }
            while excess > 0 && sqls.pop().is_some() {
                excess -= 1;
            }
            if excess == 0 {
                return total - cap;
            }
        }
    }
    total - cap - excess
}
