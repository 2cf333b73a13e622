//! Refinement Engine
//!
//! Repairs candidates that fail to parse or validate: bounded syntax fixes
//! (local rewrite first, then the model), then an optional semantic revision
//! guided by the latest error. Also revises candidates whose execution failed.

pub mod classifier;
pub mod recovery;
pub mod validator;

pub use classifier::{ErrorClassifier, SqlErrorClass};
pub use recovery::{local_fix, ErrorRecovery};
pub use validator::SchemaValidator;

use crate::config::RefinementConfig;
use crate::generation::prompt::syntax_fix_prompt;
use crate::llm::{clean_sql_response, LanguageModel, RetryPolicy};
use crate::model::{Candidate, CandidateStatus, CellHit, Question};
use crate::schema::SchemaCatalog;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Temperature for repair prompts
const REPAIR_TEMPERATURE: f32 = 0.0;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RefinementSummary {
    pub fixed: usize,
    pub invalid: usize,
    pub untouched: usize,
    /// No executable candidate is left
    pub all_invalid: bool,
}

pub struct RefinementEngine {
    llm: Arc<dyn LanguageModel>,
    catalog: Arc<SchemaCatalog>,
    validator: SchemaValidator,
    classifier: ErrorClassifier,
    recovery: ErrorRecovery,
    retry: RetryPolicy,
    config: RefinementConfig,
}

impl RefinementEngine {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        catalog: Arc<SchemaCatalog>,
        config: RefinementConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            llm,
            validator: SchemaValidator::new(catalog.clone()),
            catalog,
            classifier: ErrorClassifier::new(),
            recovery: ErrorRecovery::new(),
            retry,
            config,
        }
    }

    pub fn max_iterations(&self) -> usize {
        self.config.max_iterations()
    }

    /// Refine every candidate that is not yet fixed, concurrently
    pub async fn refine_all(&self, candidates: &mut [Candidate], question: &Question, cells: &[CellHit]) -> RefinementSummary {
        let outcomes = join_all(
            candidates
                .iter_mut()
                .filter(|c| c.status != CandidateStatus::Fixed)
                .map(|c| self.refine(c, question, cells)),
        )
        .await;

        let mut summary = RefinementSummary::default();
        for touched in outcomes {
            if !touched {
                summary.untouched += 1;
            }
        }
        for candidate in candidates.iter() {
            match candidate.status {
                CandidateStatus::Fixed => summary.fixed += 1,
                CandidateStatus::Invalid => summary.invalid += 1,
                CandidateStatus::Raw => {}
            }
        }
        summary.all_invalid = !candidates.iter().any(|c| c.is_executable());
        info!(
            "Refinement: {} fixed, {} invalid, {} already valid",
            summary.fixed, summary.invalid, summary.untouched
        );
        summary
    }

    /// Returns whether the candidate needed repair
    pub async fn refine(&self, candidate: &mut Candidate, question: &Question, cells: &[CellHit]) -> bool {
        let mut error = match self.validator.validate(&candidate.sql_text) {
            Ok(()) => return false,
            Err(e) => e.to_string(),
        };
        candidate.last_error = Some(error.clone());

        for attempt in 0..self.config.max_syntax_fixes {
            if candidate.refinement_iterations >= self.max_iterations() {
                break;
            }
            let rewrite = match local_fix(&candidate.sql_text).filter(|_| attempt == 0) {
                Some(fixed) => Some(fixed),
                None => {
                    let prompt = syntax_fix_prompt(&candidate.sql_text, &error, &self.catalog, &question.matched_tables);
                    self.ask(&prompt).await
                }
            };
            candidate.refinement_iterations += 1;
            let Some(rewrite) = rewrite else {
                continue;
            };
            candidate.rewrite(rewrite);
            match self.validator.validate(&candidate.sql_text) {
                Ok(()) => {
                    debug!("{} fixed after {} attempts", candidate.id, attempt + 1);
                    candidate.status = CandidateStatus::Fixed;
                    candidate.last_error = None;
                    return true;
                }
                Err(e) => {
                    error = e.to_string();
                    candidate.last_error = Some(error.clone());
                }
            }
        }

        if self.config.max_semantic_revisions > 0 && self.revise(candidate, &error, question, cells).await {
            candidate.status = CandidateStatus::Fixed;
            return true;
        }

        warn!("{} invalid after refinement: {}", candidate.id, error);
        candidate.status = CandidateStatus::Invalid;
        true
    }

    /// One semantic revision guided by `error`. The rewrite is applied only
    /// when it validates; otherwise the candidate keeps its text and version.
    /// Respects the per-candidate iteration budget.
    pub async fn revise(&self, candidate: &mut Candidate, error: &str, question: &Question, cells: &[CellHit]) -> bool {
        if candidate.refinement_iterations >= self.max_iterations() {
            return false;
        }
        let class = self.classifier.classify(error);
        let prompt = self.recovery.build_recovery_prompt(
            &class,
            error,
            &candidate.sql_text,
            question,
            &self.catalog,
            cells,
            candidate.refinement_iterations + 1,
        );
        candidate.refinement_iterations += 1;

        let Some(rewrite) = self.ask(&prompt).await else {
            return false;
        };
        match self.validator.validate(&rewrite) {
            Ok(()) => {
                debug!("{} revised for {}", candidate.id, class);
                candidate.rewrite(rewrite);
                candidate.last_error = None;
                true
            }
            Err(e) => {
                debug!("{} revision rejected: {}", candidate.id, e);
                candidate.last_error = Some(e.to_string());
                false
            }
        }
    }

    /// Revise a candidate whose execution failed. The caller re-executes it
    /// when the version changed; a rejected revision leaves it untouched.
    pub async fn revise_after_execution(
        &self,
        candidate: &mut Candidate,
        execution_error: &str,
        question: &Question,
        cells: &[CellHit],
    ) -> bool {
        candidate.last_error = Some(execution_error.to_string());
        let revised = self.revise(candidate, execution_error, question, cells).await;
        if revised {
            candidate.status = CandidateStatus::Fixed;
        }
        revised
    }

    async fn ask(&self, prompt: &str) -> Option<String> {
        match self.retry.retry(|| self.llm.generate(prompt, REPAIR_TEMPERATURE, 1)).await {
            Ok(completions) => completions
                .first()
                .map(|c| clean_sql_response(c))
                .filter(|sql| !sql.is_empty()),
            Err(e) => {
                warn!("Repair call failed: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PipelineError, Result};
    use crate::schema::sales_catalog;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Returns scripted replies in order, then errors
    struct ScriptedModel(Mutex<Vec<String>>);

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn generate(&self, _prompt: &str, _temperature: f32, _n: usize) -> Result<Vec<String>> {
            let mut replies = self.0.lock().unwrap();
            if replies.is_empty() {
                return Err(PipelineError::Llm("LLM API error (400 Bad Request)".to_string()));
            }
            Ok(vec![replies.remove(0)])
        }
    }

    fn engine(replies: &[&str]) -> RefinementEngine {
        let model = ScriptedModel(Mutex::new(replies.iter().map(|s| s.to_string()).collect()));
        RefinementEngine::new(
            Arc::new(model),
            Arc::new(sales_catalog()),
            RefinementConfig::default(),
            RetryPolicy::default(),
        )
    }

    fn question() -> Question {
        Question {
            raw: "total sales".into(),
            normalized: "total sales".into(),
            skeleton: "total <schema>".into(),
            keywords: vec!["sales".into()],
            matched_tables: vec!["sales".into()],
            confidence_score: 1.0,
            ambiguous: false,
        }
    }

    #[tokio::test]
    async fn test_valid_candidate_untouched() {
        let engine = engine(&[]);
        let mut candidate = Candidate::new("a".into(), "SELECT SUM(amount) FROM sales".into(), "icl", 0);
        assert!(!engine.refine(&mut candidate, &question(), &[]).await);
        assert_eq!(candidate.status, CandidateStatus::Raw);
        assert_eq!(candidate.refinement_iterations, 0);
    }

    #[tokio::test]
    async fn test_local_fix_needs_no_model() {
        let engine = engine(&[]);
        let mut candidate = Candidate::new("a".into(), "```sql\nSELECT COUNT(*) FROM sales;\n```".into(), "icl", 0);
        assert!(engine.refine(&mut candidate, &question(), &[]).await);
        assert_eq!(candidate.status, CandidateStatus::Fixed);
        assert_eq!(candidate.sql_text, "SELECT COUNT(*) FROM sales");
        assert_eq!(candidate.refinement_iterations, 1);
        assert_eq!(candidate.id, "a");
    }

    #[tokio::test]
    async fn test_model_fix_after_failed_attempts() {
        let engine = engine(&["SELECT * FROM staff", "SELECT COUNT(*) FROM employees"]);
        let mut candidate = Candidate::new("a".into(), "SELECT COUNT(*) FROM staf".into(), "icl", 0);
        assert!(engine.refine(&mut candidate, &question(), &[]).await);
        assert_eq!(candidate.status, CandidateStatus::Fixed);
        assert_eq!(candidate.sql_text, "SELECT COUNT(*) FROM employees");
        assert!(candidate.refinement_iterations <= engine.max_iterations());
    }

    #[tokio::test]
    async fn test_rejected_revision_keeps_executed_text() {
        let engine = engine(&["SELECT * FROM staff"]);
        let mut candidate = Candidate::new("a".into(), "SELECT bonus FROM employees".into(), "icl", 0);
        let revised = engine
            .revise_after_execution(&mut candidate, "no such column: bonus", &question(), &[])
            .await;
        assert!(!revised);
        assert_eq!(candidate.sql_text, "SELECT bonus FROM employees");
        assert_eq!(candidate.version, 0);
        assert_eq!(candidate.status, CandidateStatus::Raw);
        assert!(candidate.last_error.as_deref().unwrap_or_default().contains("no such table: staff"));
        assert_eq!(candidate.refinement_iterations, 1);
    }

    #[tokio::test]
    async fn test_accepted_revision_bumps_version() {
        let engine = engine(&["SELECT name FROM employees"]);
        let mut candidate = Candidate::new("a".into(), "SELECT bonus FROM employees".into(), "icl", 0);
        assert!(
            engine
                .revise_after_execution(&mut candidate, "no such column: bonus", &question(), &[])
                .await
        );
        assert_eq!(candidate.sql_text, "SELECT name FROM employees");
        assert_eq!(candidate.version, 1);
        assert_eq!(candidate.status, CandidateStatus::Fixed);
        assert!(candidate.last_error.is_none());
    }

    #[tokio::test]
    async fn test_budget_exhausted_marks_invalid() {
        let engine = engine(&["SELECT * FROM nope1", "SELECT * FROM nope2", "SELECT * FROM nope3", "SELECT 1"]);
        let mut candidates = vec![Candidate::new("a".into(), "SELECT * FROM nope0".into(), "icl", 0)];
        let summary = engine.refine_all(&mut candidates, &question(), &[]).await;
        assert_eq!(candidates[0].status, CandidateStatus::Invalid);
        assert_eq!(candidates[0].refinement_iterations, engine.max_iterations());
        assert!(summary.all_invalid);
    }
}
