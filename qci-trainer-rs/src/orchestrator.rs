// qci-trainer-rs/src/orchestrator.rs
// Training cycle: score -> categorize -> mine -> plan -> rewrite for every
// agent, one agent at a time.
//
// Failure policy:
// - per-call failures are absorbed by the batch runner;
// - per-agent failures at any stage are recorded and the cycle moves on;
// - a systemic failure on the first agent aborts the cycle (the report is
//   still written).

use std::sync::Arc;
use std::time::Duration;

use llm_service::CompletionService;
use metrics::increment_counter;
use tracing::instrument;

use crate::batch::{AgentQciReport, BatchRunner, BatchSettings, ScoredCall};
use crate::categorizer::TierGroups;
use crate::config::TrainerConfig;
use crate::error::PipelineError;
use crate::model::AgentId;
use crate::pacing::CancelFlag;
use crate::patterns::{MinedPatterns, PatternMiner};
use crate::recommendation::{synthesize, ImprovementPlan};
use crate::report::{AgentRunSummary, PipelineStage, RunOutcome, StageFailure, TrainingRunReport};
use crate::rewriter::{PromptRewriter, RewriteSettings};
use crate::scorer::QualityScorer;
use crate::source::{CallSource, PromptSource};
use crate::state::{AgentProgress, AgentStage};
use crate::store::{artifact_ref, ArtifactKind, ArtifactStore, ArtifactStoreExt};
use crate::structurer::TranscriptStructurer;

/// Stages counted in an agent's completion rate.
const AGENT_STAGES: f64 = 3.0;

enum Flow {
    Continue,
    Abort,
    Cancelled,
}

pub struct TrainingCycle {
    calls: Arc<dyn CallSource>,
    store: Arc<dyn ArtifactStore>,
    batch: BatchRunner,
    miner: PatternMiner,
    rewriter: PromptRewriter,
    stage_pacing: Duration,
}

impl TrainingCycle {
    pub fn new(
        llm: Arc<dyn CompletionService>,
        store: Arc<dyn ArtifactStore>,
        calls: Arc<dyn CallSource>,
        prompts: Arc<dyn PromptSource>,
        config: &TrainerConfig,
    ) -> Self {
        let structurer = TranscriptStructurer::new(llm.clone(), config.min_transcript_chars)
            .with_verbatim_check(config.require_verbatim_turns);
        let batch = BatchRunner::new(
            structurer,
            QualityScorer::new(llm.clone()),
            store.clone(),
            BatchSettings {
                max_calls: config.max_calls_per_agent,
                call_pacing: config.call_pacing(),
                stage_pacing: config.stage_pacing(),
                upstream_retries: config.upstream_retries,
            },
        );
        let rewriter = PromptRewriter::new(
            llm.clone(),
            prompts,
            store.clone(),
            RewriteSettings {
                stage_pacing: config.stage_pacing(),
                ab_variants: config.ab_variants,
            },
        );

        Self {
            calls,
            store,
            batch,
            miner: PatternMiner::new(llm),
            rewriter,
            stage_pacing: config.stage_pacing(),
        }
    }

    /// Run the cycle over every agent the call source knows about.
    pub async fn run_all(&self, cancel: &CancelFlag) -> TrainingRunReport {
        match self.calls.agents().await {
            Ok(agents) => self.run(&agents, cancel).await,
            Err(err) => {
                let err = PipelineError::from(err);
                tracing::error!(error = %err, "cannot list agents");
                let mut report = TrainingRunReport::start();
                report.abort(&err);
                self.finish(report).await
            }
        }
    }

    /// Run the cycle over `agents` in order. Always returns a report, which
    /// is also persisted under `training_reports/`.
    #[instrument(name = "training_cycle", skip(self, agents, cancel), fields(agents = agents.len()))]
    pub async fn run(&self, agents: &[AgentId], cancel: &CancelFlag) -> TrainingRunReport {
        let mut report = TrainingRunReport::start();
        tracing::info!(run_id = %report.run_id, "training cycle started");

        for (index, agent) in agents.iter().enumerate() {
            let flow = self.process_agent(agent, index == 0, &mut report, cancel).await;
            match flow {
                Flow::Continue => {}
                Flow::Abort => break,
                Flow::Cancelled => {
                    report.outcome = RunOutcome::Cancelled;
                    break;
                }
            }
        }

        self.finish(report).await
    }

    async fn finish(&self, mut report: TrainingRunReport) -> TrainingRunReport {
        report.finish();
        let key = report.key();
        report
            .artifacts
            .push(artifact_ref(ArtifactKind::TrainingReport, &key));

        if let Err(err) = self.store.put_json(ArtifactKind::TrainingReport, &key, &report).await {
            tracing::error!(error = %err, "failed to write run report");
            report.artifacts.pop();
            report.next_steps.push(format!("Run report could not be written: {}", err));
        }

        tracing::info!(
            run_id = %report.run_id,
            outcome = ?report.outcome,
            fully_optimized = report.overall.fully_optimized,
            duration_secs = report.duration_secs,
            "training cycle finished"
        );
        report
    }

    #[instrument(name = "agent_cycle", skip(self, report, cancel), fields(agent_id = %agent))]
    async fn process_agent(
        &self,
        agent: &AgentId,
        first: bool,
        report: &mut TrainingRunReport,
        cancel: &CancelFlag,
    ) -> Flow {
        if cancel.is_cancelled() {
            return Flow::Cancelled;
        }

        let mut summary = AgentRunSummary::new(agent.clone());
        let mut progress = AgentProgress::default();
        let key = agent.storage_key();

        let flow = 'agent: {
            // QCI analysis
            let qci = match self.score_agent(agent, cancel).await {
                Ok(qci) => qci,
                Err(PipelineError::Cancelled) => break 'agent Flow::Cancelled,
                Err(err) => {
                    let systemic = matches!(err, PipelineError::Source(_) | PipelineError::Store(_));
                    fail(report, &mut summary, &mut progress, PipelineStage::QciAnalysis, &err);
                    if first && systemic {
                        tracing::error!(error = %err, "first agent failed systemically, aborting run");
                        report.abort(&err);
                        break 'agent Flow::Abort;
                    }
                    break 'agent Flow::Continue;
                }
            };
            report.artifacts.push(artifact_ref(ArtifactKind::QciResults, &key));
            summary.calls_scored = qci.summary.successful;
            summary.calls_failed = qci.summary.failed;
            summary.mean_score = qci.summary.mean_score;

            if first && qci.all_upstream_failures() {
                let err = PipelineError::UpstreamUnavailable(format!(
                    "all {} calls of the first agent failed to reach the completion service",
                    qci.calls.len()
                ));
                tracing::error!(error = %err, "aborting run");
                fail(report, &mut summary, &mut progress, PipelineStage::QciAnalysis, &err);
                report.abort(&err);
                break 'agent Flow::Abort;
            }
            if qci.summary.successful == 0 {
                let err = PipelineError::ScoringUnavailable(format!(
                    "none of {} calls could be scored",
                    qci.calls.len()
                ));
                fail(report, &mut summary, &mut progress, PipelineStage::QciAnalysis, &err);
                break 'agent Flow::Continue;
            }
            complete(report, &mut summary, &mut progress, PipelineStage::QciAnalysis, AgentStage::Scored);

            // pattern analysis and planning
            if cancel.is_cancelled() {
                break 'agent Flow::Cancelled;
            }
            match self.plan_agent(agent, &qci, &mut summary, &mut progress).await {
                Ok(plan) => {
                    summary.target_score = Some(plan.recommendations.target_score);
                    report
                        .artifacts
                        .push(artifact_ref(ArtifactKind::ImprovementPlan, &key));
                    complete(report, &mut summary, &mut progress, PipelineStage::PatternAnalysis, AgentStage::Planned);
                }
                Err(err) => {
                    fail(report, &mut summary, &mut progress, PipelineStage::PatternAnalysis, &err);
                    break 'agent Flow::Continue;
                }
            }

            // prompt optimization
            if cancel.is_cancelled() {
                break 'agent Flow::Cancelled;
            }
            tokio::time::sleep(self.stage_pacing).await;
            match self.rewriter.optimize(agent).await {
                Ok(_) => {
                    report
                        .artifacts
                        .push(artifact_ref(ArtifactKind::OptimizationPackage, &key));
                    report
                        .artifacts
                        .push(artifact_ref(ArtifactKind::RolloutInstructions, &key));
                    complete(
                        report,
                        &mut summary,
                        &mut progress,
                        PipelineStage::PromptOptimization,
                        AgentStage::Optimized,
                    );
                }
                Err(err) => {
                    fail(report, &mut summary, &mut progress, PipelineStage::PromptOptimization, &err);
                }
            }
            Flow::Continue
        };

        summary.stage_reached = progress.reached();
        summary.failed = progress.stage() == AgentStage::Failed;
        increment_counter!(
            "qci_agents_processed_total",
            "stage" => stage_label(progress.stage())
        );
        tracing::info!(
            stage = ?progress.stage(),
            completion_rate = summary.completion_rate,
            "agent processed"
        );
        report.agents.push(summary);
        flow
    }

    async fn score_agent(&self, agent: &AgentId, cancel: &CancelFlag) -> Result<AgentQciReport, PipelineError> {
        let calls = self.calls.calls_for(agent).await?;
        self.batch.run(agent, &calls, cancel).await
    }

    async fn plan_agent(
        &self,
        agent: &AgentId,
        qci: &AgentQciReport,
        summary: &mut AgentRunSummary,
        progress: &mut AgentProgress,
    ) -> Result<ImprovementPlan, PipelineError> {
        let groups = TierGroups::categorize(qci.scored_calls());
        progress.advance(AgentStage::Categorized)?;

        let successful: Vec<&ScoredCall> = groups.successful().into_iter().copied().collect();
        let failing: Vec<&ScoredCall> = groups.failing().into_iter().copied().collect();
        tracing::info!(
            successful = successful.len(),
            failing = failing.len(),
            "calls categorized"
        );

        // Mining is best-effort: the target only depends on the QCI mean.
        let success = match self.miner.mine_success(agent, &successful).await {
            Ok(mined) => mined,
            Err(err) => {
                mining_degraded(summary, &err);
                MinedPatterns::failed(successful.len(), &err)
            }
        };
        if !successful.is_empty() && !failing.is_empty() {
            tokio::time::sleep(self.stage_pacing).await;
        }
        let failures = match self.miner.mine_failures(agent, &failing).await {
            Ok(mined) => mined,
            Err(err) => {
                mining_degraded(summary, &err);
                MinedPatterns::failed(failing.len(), &err)
            }
        };

        let plan = synthesize(agent, &qci.summary, groups.distribution(), success, failures)?;
        self.store
            .put_json(ArtifactKind::ImprovementPlan, &agent.storage_key(), &plan)
            .await?;
        tracing::info!(
            target_score = plan.recommendations.target_score,
            timeline = plan.recommendations.timeline.label(),
            "improvement plan written"
        );
        Ok(plan)
    }
}

fn complete(
    report: &mut TrainingRunReport,
    summary: &mut AgentRunSummary,
    progress: &mut AgentProgress,
    stage: PipelineStage,
    next: AgentStage,
) {
    if let Err(err) = progress.advance(next) {
        fail(report, summary, progress, stage, &err);
        return;
    }
    report.record_stage(stage, true);
    summary.stages_completed += 1;
    summary.completion_rate = summary.stages_completed as f64 / AGENT_STAGES;
}

fn fail(
    report: &mut TrainingRunReport,
    summary: &mut AgentRunSummary,
    progress: &mut AgentProgress,
    stage: PipelineStage,
    err: &PipelineError,
) {
    tracing::warn!(stage = ?stage, kind = err.kind().as_str(), error = %err, "agent stage failed");
    report.record_stage(stage, false);
    summary.failures.push(StageFailure {
        stage,
        error: err.to_record(),
    });
    progress.fail();
}

/// Record a mining failure without failing the stage.
fn mining_degraded(summary: &mut AgentRunSummary, err: &PipelineError) {
    tracing::warn!(kind = err.kind().as_str(), error = %err, "pattern mining failed, planning without it");
    summary.failures.push(StageFailure {
        stage: PipelineStage::PatternAnalysis,
        error: err.to_record(),
    });
}

fn stage_label(stage: AgentStage) -> &'static str {
    match stage {
        AgentStage::Pending => "pending",
        AgentStage::Scored => "scored",
        AgentStage::Categorized => "categorized",
        AgentStage::Planned => "planned",
        AgentStage::Optimized => "optimized",
        AgentStage::Failed => "failed",
    }
}
