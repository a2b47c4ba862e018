// Pipeline-level tests: the whole cycle driven by scripted completions.

use std::sync::Arc;

use async_trait::async_trait;
use llm_service::LlmError;
use mockall::mock;
use serde_json::json;

use crate::batch::AgentQciReport;
use crate::config::TrainerConfig;
use crate::error::FailureKind;
use crate::model::{AgentId, Call};
use crate::orchestrator::TrainingCycle;
use crate::pacing::CancelFlag;
use crate::patterns::MiningStatus;
use crate::recommendation::{ImprovementPlan, Timeline};
use crate::report::{PipelineStage, RunOutcome};
use crate::rewriter::OptimizationPackage;
use crate::source::{CallCatalog, CallSource, SourceError};
use crate::state::AgentStage;
use crate::store::{ArtifactKind, ArtifactStore, ArtifactStoreExt, MemoryArtifactStore};
use crate::test_support::{
    agent, call, call_with_prompt, score_reply_45, score_reply_85, structure_reply, ScriptedLlm,
};

const GOOD: &str = "AI: Hi, this is Anna from Acme.\nUser: ok";
const WEAK: &str = "AI: Let me tell you everything\nUser: ok";
const SCRIPT: &str = "# ROLE\nYou book meetings for Acme.\n\n# OPENING\nIntroduce yourself and the company.";

type Reply = Result<String, LlmError>;

fn config() -> TrainerConfig {
    TrainerConfig {
        call_pacing_ms: 0,
        stage_pacing_ms: 0,
        ..TrainerConfig::default()
    }
}

fn success_patterns_reply() -> Reply {
    Ok(json!({
        "opening_patterns": [{"pattern": "Name and company first", "frequency": "1/1", "example": "Hi, this is Anna from Acme."}],
        "recommended_phrases": [{"phrase": "from Acme", "context": "opening", "impact": "trust"}],
        "key_success_factors": ["Short opening"]
    })
    .to_string())
}

fn rewrite_reply() -> Reply {
    Ok(json!({
        "optimized_prompt": format!(
            "{}\n\n# SUCCESSFUL PATTERNS\n- Hi, this is Anna from Acme.\n\n# AVOID THESE MISTAKES\n- Monologues",
            SCRIPT
        ),
        "key_changes": ["Added proven opening"],
        "added_sections": [
            {"section": "SUCCESSFUL PATTERNS", "purpose": "reuse"},
            {"section": "AVOID THESE MISTAKES", "purpose": "avoid"}
        ],
        "expected_improvements": ["Higher meeting rate"]
    })
    .to_string())
}

fn ab_reply() -> Reply {
    Ok(json!({
        "variant_a": {"prompt": "A", "focus": "outcome-aggressive", "key_differences": []},
        "variant_b": {"prompt": "B", "focus": "consultative", "key_differences": []}
    })
    .to_string())
}

/// Replies for one full cycle of the three-call scenario.
fn scenario_routes(runs: usize) -> Arc<ScriptedLlm> {
    let repeat = |replies: fn() -> Vec<Reply>| (0..runs).flat_map(|_| replies()).collect::<Vec<_>>();
    ScriptedLlm::routed(vec![
        (
            "structure",
            repeat(|| {
                vec![
                    structure_reply("Hi, this is Anna from Acme.", 0.45, "meeting"),
                    structure_reply("Let me tell you everything", 0.8, "callback"),
                ]
            }),
        ),
        ("score", repeat(|| vec![score_reply_85(), score_reply_45()])),
        ("mine_success", repeat(|| vec![success_patterns_reply()])),
        ("rewrite", repeat(|| vec![rewrite_reply()])),
        ("ab_variants", repeat(|| vec![ab_reply()])),
    ])
}

fn scenario_calls() -> Vec<Call> {
    vec![
        call("c1", "agent-A", None),
        call_with_prompt("c2", "agent-A", GOOD, SCRIPT),
        call("c3", "agent-A", Some(WEAK)),
    ]
}

fn cycle(llm: Arc<ScriptedLlm>, store: Arc<MemoryArtifactStore>, catalog: CallCatalog) -> TrainingCycle {
    let catalog = Arc::new(catalog);
    TrainingCycle::new(llm, store, catalog.clone(), catalog, &config())
}

#[tokio::test]
async fn three_call_scenario_end_to_end() {
    let llm = scenario_routes(1);
    let store = Arc::new(MemoryArtifactStore::new());
    let cycle = cycle(llm.clone(), store.clone(), CallCatalog::from_calls(scenario_calls()));

    let report = cycle.run_all(&CancelFlag::new()).await;
    assert_eq!(report.outcome, RunOutcome::Completed);

    let qci: AgentQciReport = store
        .get_json(ArtifactKind::QciResults, "agent-A")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(qci.summary.successful, 2);
    assert_eq!(qci.summary.failed, 1);
    assert_eq!(qci.summary.mean_score, Some(65.0));
    let range = qci.summary.range.unwrap();
    assert_eq!((range.min, range.max), (45, 85));

    let failed: Vec<_> = qci.failed_calls().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].call_id.as_str(), "c1");
    assert_eq!(failed[0].score, 0);
    assert_eq!(failed[0].error.kind, FailureKind::ContentTooShort);
    for scored in qci.scored_calls() {
        assert_eq!(scored.result.subscore_sum(), u16::from(scored.result.score));
    }

    let plan: ImprovementPlan = store
        .get_json(ArtifactKind::ImprovementPlan, "agent-A")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(plan.recommendations.target_score, 80);
    assert_eq!(plan.recommendations.timeline, Timeline::OneMonth);
    assert_eq!(
        plan.recommendations.script_improvements.opening_examples,
        vec!["Hi, this is Anna from Acme."]
    );

    let package: OptimizationPackage = store
        .get_json(ArtifactKind::OptimizationPackage, "agent-A")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(package.original_script, SCRIPT);
    assert!(package.ab_variants.is_some());
    assert!(store
        .get_text(ArtifactKind::RolloutInstructions, "agent-A")
        .await
        .unwrap()
        .is_some());

    // 45 is "average": no failing calls, so failure mining never runs
    assert!(!llm.purposes().iter().any(|p| p == "mine_failures"));

    let summary = report.agent(&agent("agent-A")).unwrap();
    assert_eq!(summary.stage_reached, AgentStage::Optimized);
    assert_eq!(summary.completion_rate, 1.0);
    assert_eq!(report.overall.fully_optimized, 1);
    assert_eq!(report.artifacts.len(), 5);
    assert_eq!(store.keys(ArtifactKind::TrainingReport).await.unwrap(), vec![report.key()]);
}

#[tokio::test]
async fn rerun_replaces_agent_artifacts() {
    let llm = scenario_routes(2);
    let store = Arc::new(MemoryArtifactStore::new());
    let cycle = cycle(llm, store.clone(), CallCatalog::from_calls(scenario_calls()));

    let first = cycle.run_all(&CancelFlag::new()).await;
    let second = cycle.run_all(&CancelFlag::new()).await;
    assert_eq!(first.outcome, RunOutcome::Completed);
    assert_eq!(second.outcome, RunOutcome::Completed);

    for kind in [
        ArtifactKind::QciResults,
        ArtifactKind::ImprovementPlan,
        ArtifactKind::OptimizationPackage,
        ArtifactKind::RolloutInstructions,
    ] {
        assert_eq!(store.keys(kind).await.unwrap(), vec!["agent-A".to_string()]);
    }
    let qci: AgentQciReport = store
        .get_json(ArtifactKind::QciResults, "agent-A")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(qci.calls.len(), 3);
    assert_eq!(store.keys(ArtifactKind::TrainingReport).await.unwrap().len(), 2);
}

#[tokio::test]
async fn later_agent_failures_are_recorded_and_cycle_continues() {
    let llm = ScriptedLlm::routed(vec![
        ("structure", vec![structure_reply("Hi, this is Anna from Acme.", 0.45, "meeting")]),
        ("score", vec![score_reply_85()]),
        ("mine_success", vec![success_patterns_reply()]),
    ]);
    let store = Arc::new(MemoryArtifactStore::new());
    // "a" has no script anywhere; "b" has nothing long enough to score
    let catalog = CallCatalog::from_calls(vec![
        call("a1", "a", Some(GOOD)),
        call("b1", "b", Some("hi")),
        call("b2", "b", None),
    ]);
    let cycle = cycle(llm, store.clone(), catalog);

    let report = cycle.run_all(&CancelFlag::new()).await;
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.agents.len(), 2);

    let a = report.agent(&agent("a")).unwrap();
    assert!(a.failed);
    assert_eq!(a.stage_reached, AgentStage::Planned);
    assert_eq!(a.failures[0].stage, PipelineStage::PromptOptimization);
    assert_eq!(a.failures[0].error.kind, FailureKind::NoCurrentPrompt);

    let b = report.agent(&agent("b")).unwrap();
    assert_eq!(b.stage_reached, AgentStage::Pending);
    assert_eq!(b.failures[0].error.kind, FailureKind::ScoringUnavailable);
    assert!(store.get_text(ArtifactKind::ImprovementPlan, "b").await.unwrap().is_none());

    assert_eq!(report.overall.partially_processed, 1);
    assert_eq!(report.overall.failed, 1);
    assert_eq!(report.stages.qci_analysis.successful, 1);
    assert_eq!(report.stages.qci_analysis.failed, 1);
    assert!(report.next_steps.iter().any(|s| s.starts_with("2 agent(s) need rework")));
}

#[tokio::test]
async fn mining_failure_still_produces_plan_and_rewrite() {
    let llm = ScriptedLlm::routed(vec![
        (
            "structure",
            vec![
                structure_reply("Hi, this is Anna from Acme.", 0.45, "meeting"),
                structure_reply("Let me tell you everything", 0.8, "callback"),
            ],
        ),
        ("score", vec![score_reply_85(), score_reply_45()]),
        ("mine_success", vec![Err(LlmError::ServerError("503".into()))]),
        ("rewrite", vec![rewrite_reply()]),
        ("ab_variants", vec![ab_reply()]),
    ]);
    let store = Arc::new(MemoryArtifactStore::new());
    let cycle = cycle(llm, store.clone(), CallCatalog::from_calls(scenario_calls()));

    let report = cycle.run_all(&CancelFlag::new()).await;
    assert_eq!(report.outcome, RunOutcome::Completed);

    let plan: ImprovementPlan = store
        .get_json(ArtifactKind::ImprovementPlan, "agent-A")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(plan.recommendations.target_score, 80);
    assert_eq!(plan.recommendations.timeline, Timeline::OneMonth);
    assert_eq!(plan.success_patterns.status, MiningStatus::Failed);
    assert_eq!(
        plan.success_patterns.error.as_ref().map(|e| e.kind),
        Some(FailureKind::UpstreamUnavailable)
    );
    assert!(plan.recommendations.script_improvements.opening_examples.is_empty());
    assert!(store
        .get_text(ArtifactKind::OptimizationPackage, "agent-A")
        .await
        .unwrap()
        .is_some());

    let summary = report.agent(&agent("agent-A")).unwrap();
    assert_eq!(summary.stage_reached, AgentStage::Optimized);
    assert!(!summary.failed);
    assert_eq!(summary.completion_rate, 1.0);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].stage, PipelineStage::PatternAnalysis);
    assert_eq!(summary.failures[0].error.kind, FailureKind::UpstreamUnavailable);
}

#[tokio::test]
async fn unreachable_completion_service_on_first_agent_aborts() {
    let llm = ScriptedLlm::new(
        (0..4)
            .map(|_| Err(LlmError::NetworkError("connection refused".into())))
            .collect(),
    );
    let store = Arc::new(MemoryArtifactStore::new());
    let catalog = CallCatalog::from_calls(vec![
        call("a1", "a", Some(GOOD)),
        call("a2", "a", Some(WEAK)),
        call("b1", "b", Some(GOOD)),
    ]);
    let cycle = cycle(llm.clone(), store.clone(), catalog);

    let report = cycle.run_all(&CancelFlag::new()).await;
    assert_eq!(report.outcome, RunOutcome::Aborted);
    assert_eq!(report.agents.len(), 1);
    assert_eq!(report.abort_reason.as_ref().unwrap().kind, FailureKind::UpstreamUnavailable);
    // two calls, one retry each
    assert_eq!(llm.calls(), 4);
    assert_eq!(store.keys(ArtifactKind::TrainingReport).await.unwrap().len(), 1);
}

mock! {
    Calls {}

    #[async_trait]
    impl CallSource for Calls {
        async fn agents(&self) -> Result<Vec<AgentId>, SourceError>;
        async fn calls_for(&self, agent: &AgentId) -> Result<Vec<Call>, SourceError>;
    }
}

#[tokio::test]
async fn unavailable_call_source_on_first_agent_aborts_but_writes_report() {
    let mut calls = MockCalls::new();
    calls
        .expect_agents()
        .returning(|| Ok(vec![AgentId::new("a"), AgentId::new("b")]));
    calls
        .expect_calls_for()
        .times(1)
        .returning(|_| Err(SourceError::Unavailable("export missing".into())));

    let llm = ScriptedLlm::new(vec![]);
    let store = Arc::new(MemoryArtifactStore::new());
    let prompts = Arc::new(CallCatalog::default());
    let cycle = TrainingCycle::new(llm.clone(), store.clone(), Arc::new(calls), prompts, &config());

    let report = cycle.run_all(&CancelFlag::new()).await;
    assert_eq!(report.outcome, RunOutcome::Aborted);
    assert_eq!(report.agents.len(), 1);
    assert_eq!(report.agents[0].failures[0].error.kind, FailureKind::Source);
    assert_eq!(llm.calls(), 0);
    assert!(report.next_steps[0].starts_with("Run aborted"));

    let stored: Option<serde_json::Value> = store
        .get_json(ArtifactKind::TrainingReport, &report.key())
        .await
        .unwrap();
    assert_eq!(stored.unwrap()["outcome"], "aborted");
}

#[tokio::test]
async fn cancelled_before_start_processes_nothing() {
    let llm = scenario_routes(1);
    let store = Arc::new(MemoryArtifactStore::new());
    let cycle = cycle(llm.clone(), store.clone(), CallCatalog::from_calls(scenario_calls()));
    let cancel = CancelFlag::new();
    cancel.cancel();

    let report = cycle.run_all(&cancel).await;
    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert!(report.agents.is_empty());
    assert_eq!(llm.calls(), 0);
    assert!(store.keys(ArtifactKind::QciResults).await.unwrap().is_empty());
}
