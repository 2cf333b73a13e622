mod common;

use common::{err, harness, harness_with, harness_with_model, ok, DownStore, FakeSandbox, FixedGenerator, ScriptedModel};
use std::sync::Arc;
use std::time::{Duration, Instant};
use text2sql_pipeline::config::PipelineConfig;
use text2sql_pipeline::generation::SqlGenerator;
use text2sql_pipeline::model::{CandidateStatus, ExplorationTrigger, PipelineStage, Rationale};
use text2sql_pipeline::{QueryRequest, SelectorMode, Warning};

const BY_EMPLOYEE_A: &str = "SELECT e.name, SUM(s.amount) FROM sales s JOIN employees e ON s.employee_id = e.id WHERE s.sale_date >= '2026-01-01' GROUP BY e.name";
const BY_EMPLOYEE_B: &str = "SELECT employees.name, SUM(sales.amount) AS total FROM employees JOIN sales ON sales.employee_id = employees.id WHERE sales.sale_date >= '2026-01-01' GROUP BY employees.name";
const BY_EMPLOYEE_C: &str = "SELECT name, TOTAL(amount) FROM sales JOIN employees ON employees.id = sales.employee_id WHERE sale_date LIKE '2026%' GROUP BY name";

const COUNT_JOINED: &str = "SELECT COUNT(*) FROM sales JOIN employees ON sales.employee_id = employees.id";
const COUNT_JOINED_IDS: &str = "SELECT COUNT(sales.id) FROM sales JOIN employees ON employees.id = sales.employee_id";
const COUNT_ALL: &str = "SELECT COUNT(*) FROM sales";
const COUNT_IDS: &str = "SELECT COUNT(id) FROM sales";

fn tied_sandbox() -> FakeSandbox {
    FakeSandbox::new()
        .on(COUNT_JOINED, ok("joined", 1))
        .on(COUNT_JOINED_IDS, ok("joined", 1))
        .on(COUNT_ALL, ok("all", 1))
        .on(COUNT_IDS, ok("all", 1))
}

fn tied_generator() -> Arc<FixedGenerator> {
    Arc::new(FixedGenerator::new("icl", 1, &[COUNT_JOINED, COUNT_JOINED_IDS, COUNT_ALL, COUNT_IDS]))
}

#[tokio::test]
async fn test_scenario_a_agreeing_candidates_need_no_exploration() {
    let generator = Arc::new(FixedGenerator::new("icl", 1, &[BY_EMPLOYEE_A, BY_EMPLOYEE_B, BY_EMPLOYEE_C]));
    let sandbox = FakeSandbox::new()
        .on(BY_EMPLOYEE_A, ok("h1", 3))
        .on(BY_EMPLOYEE_B, ok("h1", 3))
        .on(BY_EMPLOYEE_C, ok("h1", 3));
    let h = harness(PipelineConfig::default(), vec![generator.clone()], None, sandbox);

    let answer = h
        .orchestrator
        .run(QueryRequest::new("total sales by employee this year").with_request_id("scenario-a"))
        .await;

    assert_eq!(answer.request_id, "scenario-a");
    assert!(answer.execution_success);
    assert_eq!(answer.exploration_rounds_used, 0);
    assert_eq!(answer.confidence, 1.0);
    assert!(answer.warnings.is_empty());
    assert_eq!(answer.candidate_count, 3);
    assert_eq!(answer.rows_returned, 3);
    assert_eq!(answer.sample_rows.len(), 3);
    assert_eq!(generator.calls(), 1);

    let run = h.telemetry.last().unwrap();
    assert_eq!(run.clusters.len(), 1);
    assert_eq!(run.clusters[0].size, 3);
    assert_eq!(run.retrievals.len(), 1);
    assert_eq!(run.answer.as_ref().unwrap().final_sql, answer.final_sql);
}

fn scenario_b(threshold: f64) -> (common::Harness, Arc<FixedGenerator>) {
    let generator = Arc::new(FixedGenerator::new(
        "icl",
        1,
        &[
            "```sql\nSELECT COUNT(*) FROM sales;\n```",
            "Here is the query: SELECT SUM(amount) FROM sales",
            "SELEC name FROM employees",
            "SELEC COUNT(*) FROM sales",
            "SELECT name FROM staff",
        ],
    ));
    let sandbox = FakeSandbox::new()
        .on("SELECT COUNT(*) FROM sales", ok("count", 1))
        .on("SELECT SUM(amount) FROM sales", err("no such column: amount"));
    let mut config = PipelineConfig::default();
    config.selection.confidence_threshold = threshold;
    config.exploration.max_rounds = 1;
    (harness(config, vec![generator.clone()], None, sandbox), generator)
}

#[tokio::test]
async fn test_scenario_b_confident_single_success() {
    let (h, generator) = scenario_b(0.4);
    let answer = h.orchestrator.run(QueryRequest::new("how many sales")).await;

    assert!(answer.execution_success);
    assert_eq!(answer.final_sql, "SELECT COUNT(*) FROM sales");
    assert_eq!(answer.exploration_rounds_used, 0);
    assert!(answer.confidence >= 0.4);
    assert_eq!(generator.calls(), 1);

    let run = h.telemetry.last().unwrap();
    let fixed = run.candidates.iter().filter(|c| c.status == CandidateStatus::Fixed).count();
    let invalid = run.candidates.iter().filter(|c| c.status == CandidateStatus::Invalid).count();
    assert_eq!(fixed, 2);
    assert_eq!(invalid, 3);
    assert!(run.candidates.iter().all(|c| c.refinement_iterations <= 3));
}

#[tokio::test]
async fn test_scenario_b_low_confidence_explores_and_regenerates() {
    let (h, generator) = scenario_b(0.6);
    let answer = h.orchestrator.run(QueryRequest::new("how many sales")).await;

    assert!(answer.execution_success);
    assert_eq!(answer.exploration_rounds_used, 1);
    assert!(answer.has_warning(Warning::LowConfidence));
    assert_eq!(generator.calls(), 2);
    assert!(h.sandbox.probes() <= 8);

    let run = h.telemetry.last().unwrap();
    assert_eq!(run.explorations[0].trigger, ExplorationTrigger::LowSelectionConfidence);
    assert!(run.explorations[0].probes.len() <= 8);
    assert!(!run.explorations[0].samples.is_empty());
    assert_eq!(run.retrievals.len(), 2);
    assert!(run.retrievals[1].cells.iter().any(|c| c.value == "West"));
    assert!(run.candidates.iter().any(|c| c.id.starts_with("r1-")));
}

#[tokio::test]
async fn test_scenario_c_tie_explores_then_prefers_lower_complexity() {
    let mut config = PipelineConfig::default();
    config.exploration.max_rounds = 1;
    let h = harness(config, vec![tied_generator()], None, tied_sandbox());

    let answer = h.orchestrator.run(QueryRequest::new("how many sales")).await;

    assert!(answer.execution_success);
    assert_eq!(answer.exploration_rounds_used, 1);
    assert_eq!(answer.final_sql, COUNT_ALL);
    assert!(answer.has_warning(Warning::LowConfidence));

    let run = h.telemetry.last().unwrap();
    assert_eq!(run.explorations[0].trigger, ExplorationTrigger::SelectionTie);
    let selection = run.selection.unwrap();
    assert!(selection.tie);
    assert_eq!(selection.rationale, Rationale::LowerComplexity);
}

#[tokio::test]
async fn test_scenario_d_sandbox_rejection_is_recorded_not_fatal() {
    let bad = "SELECT bonus FROM employees";
    let generator = Arc::new(FixedGenerator::new("icl", 1, &[COUNT_ALL, COUNT_IDS, bad]));
    let sandbox = FakeSandbox::new()
        .on(COUNT_ALL, ok("all", 1))
        .on(COUNT_IDS, ok("all", 1))
        .on(bad, err("no such column: bonus"));
    let h = harness(PipelineConfig::default(), vec![generator], None, sandbox);

    let answer = h.orchestrator.run(QueryRequest::new("how many sales")).await;

    assert!(answer.execution_success);
    assert_eq!(answer.exploration_rounds_used, 0);
    assert!(answer.warnings.is_empty());

    let run = h.telemetry.last().unwrap();
    let failed = run.executions.iter().find(|r| r.candidate_id == "r0-icl-2").unwrap();
    assert!(!failed.success);
    assert_eq!(failed.error.as_deref(), Some("no such column: bonus"));
    assert!(run.clusters.iter().all(|c| !c.members.contains(&"r0-icl-2".to_string())));
    assert_eq!(run.clusters[0].size, 2);
}

#[tokio::test]
async fn test_candidate_cap_truncates_lowest_priority_first() {
    let icl_sqls: Vec<String> = (1..=8).map(|i| format!("SELECT {} FROM sales", i)).collect();
    let icl_refs: Vec<&str> = icl_sqls.iter().map(|s| s.as_str()).collect();
    let reasoning_sqls: Vec<String> = (1..=4).map(|i| format!("SELECT amount * {} FROM sales", i)).collect();
    let reasoning_refs: Vec<&str> = reasoning_sqls.iter().map(|s| s.as_str()).collect();

    let icl: Arc<dyn SqlGenerator> = Arc::new(FixedGenerator::new("icl", 1, &icl_refs));
    let reasoning: Arc<dyn SqlGenerator> = Arc::new(FixedGenerator::new("reasoning", 2, &reasoning_refs));
    let h = harness(
        PipelineConfig::default(),
        vec![icl],
        Some(reasoning),
        FakeSandbox::new().otherwise(ok("same", 1)),
    );

    let request = QueryRequest {
        candidate_cap: Some(6),
        reasoning_generator_enabled: Some(true),
        ..QueryRequest::new("how many sales")
    };
    let answer = h.orchestrator.run(request).await;
    assert!(answer.candidate_count <= 6);

    let run = h.telemetry.last().unwrap();
    let first_round: Vec<_> = run.candidates.iter().filter(|c| c.round == 0).collect();
    assert_eq!(first_round.len(), 6);
    assert_eq!(first_round.iter().filter(|c| c.source == "reasoning").count(), 4);
}

#[tokio::test]
async fn test_exploration_rounds_are_bounded() {
    let h = harness(PipelineConfig::default(), vec![tied_generator()], None, tied_sandbox());
    let answer = h.orchestrator.run(QueryRequest::new("how many sales")).await;

    assert_eq!(answer.exploration_rounds_used, 2);
    assert!(answer.has_warning(Warning::LowConfidence));
    let run = h.telemetry.last().unwrap();
    assert!(run.explorations.iter().all(|r| r.probes.len() <= 8));
    assert_eq!(run.explorations[0].round, 1);
    assert_eq!(run.explorations[1].round, 2);
    assert_eq!(run.transitions.last().unwrap().stage, PipelineStage::Done);
    assert_eq!(
        run.transitions.iter().filter(|t| t.stage == PipelineStage::Exploring).count(),
        2
    );
}

#[tokio::test]
async fn test_zero_valid_candidates_fails_with_empty_sql() {
    let generator = Arc::new(FixedGenerator::new("icl", 1, &["SELEC * FROM sales", "SELECT * FROM staff"]));
    let h = harness(PipelineConfig::default(), vec![generator.clone()], None, FakeSandbox::new());

    let answer = h.orchestrator.run(QueryRequest::new("how many sales")).await;

    assert!(!answer.execution_success);
    assert_eq!(answer.final_sql, "");
    assert_eq!(answer.warnings, vec![Warning::NoValidCandidate]);
    assert_eq!(answer.exploration_rounds_used, 2);
    assert_eq!(generator.calls(), 3);

    let run = h.telemetry.last().unwrap();
    assert!(run.explorations.iter().all(|r| r.trigger == ExplorationTrigger::StillInvalid));
    assert_eq!(run.transitions.last().unwrap().stage, PipelineStage::Failed);
    assert!(run.executions.is_empty());
}

#[tokio::test]
async fn test_store_outage_degrades_to_schema_only() {
    let h = harness_with(
        PipelineConfig::default(),
        vec![Arc::new(FixedGenerator::new("icl", 1, &[COUNT_ALL, COUNT_IDS]))],
        None,
        FakeSandbox::new().otherwise(ok("all", 1)),
        Arc::new(DownStore),
    );
    let answer = h.orchestrator.run(QueryRequest::new("how many sales")).await;

    assert!(answer.execution_success);
    let run = h.telemetry.last().unwrap();
    assert_eq!(run.retrievals[0].degraded_channels, vec!["cells".to_string(), "examples".to_string()]);
    assert!(run.component_warnings.contains_key("retrieval"));
    let snapshot = h.orchestrator.resources().metrics.snapshot();
    assert_eq!(snapshot.error_counts["retrieval"], 2);
}

#[tokio::test]
async fn test_failing_generator_contributes_nothing() {
    let h = harness(
        PipelineConfig::default(),
        vec![
            Arc::new(FixedGenerator::failing("icl-broken")),
            Arc::new(FixedGenerator::new("icl", 1, &[COUNT_ALL, COUNT_IDS])),
        ],
        None,
        FakeSandbox::new().otherwise(ok("all", 1)),
    );
    let answer = h.orchestrator.run(QueryRequest::new("how many sales")).await;

    assert!(answer.execution_success);
    assert_eq!(answer.candidate_count, 2);
    let run = h.telemetry.last().unwrap();
    assert!(run.component_warnings["generation"][0].starts_with("icl-broken"));
}

#[tokio::test]
async fn test_budget_expiry_falls_back_to_best_selection() {
    let generator = Arc::new(
        FixedGenerator::new("icl", 1, &[COUNT_JOINED, COUNT_JOINED_IDS, COUNT_ALL, COUNT_IDS])
            .slow_from_round(1, Duration::from_secs(5)),
    );
    let h = harness(PipelineConfig::default(), vec![generator], None, tied_sandbox());

    let started = Instant::now();
    let request = QueryRequest {
        latency_budget_ms: Some(300),
        ..QueryRequest::new("how many sales")
    };
    let answer = h.orchestrator.run(request).await;

    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(answer.has_warning(Warning::Partial));
    assert!(answer.execution_success);
    assert_eq!(answer.final_sql, COUNT_ALL);
}

#[tokio::test]
async fn test_selector_mode_is_a_request_option() {
    let h = harness(
        PipelineConfig::default(),
        vec![Arc::new(FixedGenerator::new("icl", 1, &[COUNT_ALL, COUNT_IDS]))],
        None,
        FakeSandbox::new().otherwise(ok("all", 1)),
    );
    let request = QueryRequest {
        selector_mode: Some(SelectorMode::Learned),
        ..QueryRequest::new("how many sales")
    };
    let answer = h.orchestrator.run(request).await;

    assert!(answer.execution_success);
    let run = h.telemetry.last().unwrap();
    assert_eq!(run.selection.unwrap().strategy, SelectorMode::Learned);
    assert_eq!(run.features.len(), 2);
}

#[tokio::test]
async fn test_identical_runs_select_identically() {
    let mut config = PipelineConfig::default();
    config.exploration.max_rounds = 0;
    let h = harness(config, vec![tied_generator()], None, tied_sandbox());

    let first = h.orchestrator.run(QueryRequest::new("how many sales")).await;
    let second = h.orchestrator.run(QueryRequest::new("how many sales")).await;
    assert_eq!(first.final_sql, second.final_sql);
    assert_eq!(first.confidence, second.confidence);
    assert_ne!(first.request_id, second.request_id);
}

const BONUS: &str = "SELECT bonus FROM employees";
const NAMES: &str = "SELECT name FROM employees";

#[tokio::test]
async fn test_failed_execution_is_revised_and_rerun() {
    let mut config = PipelineConfig::default();
    config.exploration.max_rounds = 0;
    let h = harness_with_model(
        config,
        vec![Arc::new(FixedGenerator::new("icl", 1, &[BONUS]))],
        FakeSandbox::new().on(BONUS, err("no such column: bonus")).on(NAMES, ok("names", 2)),
        ScriptedModel::new(|_| Ok(vec![NAMES.to_string()])),
    );

    let answer = h.orchestrator.run(QueryRequest::new("employee names")).await;

    assert!(answer.execution_success);
    assert_eq!(answer.final_sql, NAMES);
    assert_eq!(answer.rows_returned, 2);
    assert!(!answer.has_warning(Warning::NoValidCandidate));

    let run = h.telemetry.last().unwrap();
    let candidate = &run.candidates[0];
    assert_eq!(candidate.version, 1);
    assert_eq!(candidate.status, CandidateStatus::Fixed);
    assert_eq!(run.executions.len(), 2);
    assert!(!run.executions[0].success);
    assert_eq!(run.executions[0].candidate_version, 0);
    assert!(run.executions[1].success);
    assert_eq!(run.executions[1].candidate_version, candidate.version);
    assert_eq!(*h.sandbox.executed.lock().unwrap(), vec![BONUS.to_string(), NAMES.to_string()]);
}

#[tokio::test]
async fn test_rejected_revision_never_reaches_the_answer() {
    let mut config = PipelineConfig::default();
    config.exploration.max_rounds = 0;
    let h = harness_with_model(
        config,
        vec![Arc::new(FixedGenerator::new("icl", 1, &[BONUS]))],
        FakeSandbox::new().on(BONUS, err("no such column: bonus")),
        ScriptedModel::new(|_| Ok(vec!["SELECT * FROM staff".to_string()])),
    );

    let answer = h.orchestrator.run(QueryRequest::new("how many sales")).await;

    assert!(!answer.execution_success);
    assert_eq!(answer.final_sql, "");
    assert_eq!(answer.warnings, vec![Warning::NoValidCandidate]);
    assert_eq!(*h.sandbox.executed.lock().unwrap(), vec![BONUS.to_string()]);

    let run = h.telemetry.last().unwrap();
    assert_eq!(run.candidates[0].sql_text, BONUS);
    assert_eq!(run.candidates[0].version, 0);
    assert!(run.selection.is_none());
    assert_eq!(run.round_selections.len(), 1);
    assert_eq!(run.transitions.last().unwrap().stage, PipelineStage::Failed);
}

#[tokio::test]
async fn test_all_executions_failing_is_no_valid_candidate() {
    let mut config = PipelineConfig::default();
    config.exploration.max_rounds = 1;
    let generator = Arc::new(FixedGenerator::new("icl", 1, &[COUNT_ALL, BONUS]));
    let h = harness(
        config,
        vec![generator.clone()],
        None,
        FakeSandbox::new().otherwise(err("database disk image is malformed")),
    );

    let answer = h.orchestrator.run(QueryRequest::new("how many sales")).await;

    assert!(!answer.execution_success);
    assert_eq!(answer.final_sql, "");
    assert_eq!(answer.confidence, 0.0);
    assert_eq!(answer.warnings, vec![Warning::NoValidCandidate]);
    assert_eq!(answer.exploration_rounds_used, 1);
    assert_eq!(generator.calls(), 2);

    let run = h.telemetry.last().unwrap();
    assert_eq!(run.executions.len(), 4);
    assert!(run.executions.iter().all(|r| !r.success));
    assert!(run.selection.is_none());
    assert_eq!(run.round_selections.len(), 2);
    let snapshot = h.orchestrator.resources().metrics.snapshot();
    assert_eq!(snapshot.runs_by_outcome["failed"], 1);
}

#[tokio::test]
async fn test_recorded_selection_matches_the_answer() {
    let generator = Arc::new(
        FixedGenerator::new("icl", 1, &[COUNT_ALL, COUNT_IDS])
            .then_round(&[COUNT_JOINED, COUNT_JOINED_IDS, COUNT_ALL, COUNT_IDS]),
    );
    let h = harness(PipelineConfig::default(), vec![generator], None, tied_sandbox());

    // nothing in the question grounds, so a confident round 0 still explores
    let answer = h.orchestrator.run(QueryRequest::new("zorblax widgets tally")).await;

    assert!(answer.execution_success);
    assert_eq!(answer.confidence, 1.0);
    assert_eq!(answer.exploration_rounds_used, 2);

    let run = h.telemetry.last().unwrap();
    assert_eq!(run.explorations[0].trigger, ExplorationTrigger::LowUnderstandingConfidence);
    assert_eq!(run.explorations[1].trigger, ExplorationTrigger::SelectionTie);
    assert_eq!(run.round_selections.len(), 3);
    assert!(run.round_selections[1].tie);
    assert!(run.round_selections[2].tie);

    let selection = run.selection.as_ref().unwrap();
    assert!(selection.winning_candidate_id.starts_with("r0-"));
    assert_eq!(selection.confidence, answer.confidence);
    assert!(!selection.tie);
    let winner = run
        .candidates
        .iter()
        .find(|c| c.id == selection.winning_candidate_id)
        .unwrap();
    assert_eq!(winner.sql_text, answer.final_sql);
}
