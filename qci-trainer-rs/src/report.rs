// qci-trainer-rs/src/report.rs
// Training run report: what every stage did for every agent, and what to do
// next. Built incrementally by the orchestrator, persisted once per run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FailureRecord, PipelineError};
use crate::model::AgentId;
use crate::state::AgentStage;

/// Agents above this completion rate count as fully optimized.
const FULL_COMPLETION: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    /// Systemic failure on the first agent stopped the run
    Aborted,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    QciAnalysis,
    PatternAnalysis,
    PromptOptimization,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StageStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: f64,
}

impl StageStats {
    fn record(&mut self, ok: bool) {
        self.total += 1;
        if ok {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
        self.success_rate = self.successful as f64 / self.total as f64;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageBreakdown {
    pub qci_analysis: StageStats,
    pub pattern_analysis: StageStats,
    pub prompt_optimization: StageStats,
}

impl StageBreakdown {
    fn stats_mut(&mut self, stage: PipelineStage) -> &mut StageStats {
        match stage {
            PipelineStage::QciAnalysis => &mut self.qci_analysis,
            PipelineStage::PatternAnalysis => &mut self.pattern_analysis,
            PipelineStage::PromptOptimization => &mut self.prompt_optimization,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: PipelineStage,
    #[serde(flatten)]
    pub error: FailureRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRunSummary {
    pub agent_id: AgentId,
    /// Last stage completed
    pub stage_reached: AgentStage,
    pub failed: bool,
    pub stages_completed: usize,
    pub completion_rate: f64,
    pub calls_scored: usize,
    pub calls_failed: usize,
    pub mean_score: Option<f64>,
    pub target_score: Option<u8>,
    pub failures: Vec<StageFailure>,
}

impl AgentRunSummary {
    pub fn new(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            stage_reached: AgentStage::Pending,
            failed: false,
            stages_completed: 0,
            completion_rate: 0.0,
            calls_scored: 0,
            calls_failed: 0,
            mean_score: None,
            target_score: None,
            failures: Vec::new(),
        }
    }

    pub fn is_fully_optimized(&self) -> bool {
        self.completion_rate >= FULL_COMPLETION
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OverallStats {
    pub agents: usize,
    pub fully_optimized: usize,
    pub partially_processed: usize,
    pub failed: usize,
    pub average_completion_rate: f64,
}

/// Persisted document `training_run_report[timestamp]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub outcome: RunOutcome,
    /// Set when the run was aborted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<FailureRecord>,
    pub stages: StageBreakdown,
    pub agents: Vec<AgentRunSummary>,
    pub overall: OverallStats,
    pub next_steps: Vec<String>,
    pub artifacts: Vec<String>,
}

impl TrainingRunReport {
    pub fn start() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            duration_secs: 0.0,
            outcome: RunOutcome::Completed,
            abort_reason: None,
            stages: StageBreakdown::default(),
            agents: Vec::new(),
            overall: OverallStats::default(),
            next_steps: Vec::new(),
            artifacts: Vec::new(),
        }
    }

    /// Store key: `YYYYmmdd_HHMMSS_<run id>`, sortable by start time.
    pub fn key(&self) -> String {
        format!("{}_{}", self.started_at.format("%Y%m%d_%H%M%S"), self.run_id)
    }

    pub fn record_stage(&mut self, stage: PipelineStage, ok: bool) {
        self.stages.stats_mut(stage).record(ok);
    }

    pub fn abort(&mut self, err: &PipelineError) {
        self.outcome = RunOutcome::Aborted;
        self.abort_reason = Some(err.to_record());
    }

    pub fn agent(&self, agent: &AgentId) -> Option<&AgentRunSummary> {
        self.agents.iter().find(|a| &a.agent_id == agent)
    }

    /// Compute overall stats and next steps. Idempotent.
    pub fn finish(&mut self) {
        self.duration_secs = (Utc::now() - self.started_at).num_milliseconds().max(0) as f64 / 1000.0;

        let agents = self.agents.len();
        let fully_optimized = self.agents.iter().filter(|a| a.is_fully_optimized()).count();
        let failed = self.agents.iter().filter(|a| a.stages_completed == 0).count();
        let average_completion_rate = if agents == 0 {
            0.0
        } else {
            self.agents.iter().map(|a| a.completion_rate).sum::<f64>() / agents as f64
        };

        self.overall = OverallStats {
            agents,
            fully_optimized,
            partially_processed: agents - fully_optimized - failed,
            failed,
            average_completion_rate,
        };
        self.next_steps = next_steps(self);
    }
}

fn next_steps(report: &TrainingRunReport) -> Vec<String> {
    let overall = &report.overall;
    let mut steps = Vec::new();

    match report.outcome {
        RunOutcome::Aborted => {
            let reason = report
                .abort_reason
                .as_ref()
                .map(|r| r.message.as_str())
                .unwrap_or("unknown error");
            steps.push(format!("Run aborted on the first agent ({}); check configuration and retry", reason));
            return steps;
        }
        RunOutcome::Cancelled => {
            steps.push("Run cancelled; rerun to reprocess the remaining agents".to_string());
        }
        RunOutcome::Completed => {}
    }

    if overall.agents == 0 {
        steps.push("No agents were processed; check the call export".to_string());
        return steps;
    }
    if overall.fully_optimized > 0 {
        steps.push(format!(
            "{} agent(s) fully optimized: review the optimization packages and start the rollout",
            overall.fully_optimized
        ));
    }
    let rework = overall.partially_processed + overall.failed;
    if rework > 0 {
        steps.push(format!(
            "{} agent(s) need rework: see the failures listed per agent",
            rework
        ));
    }
    if report.stages.qci_analysis.failed > 0 {
        steps.push("Collect more calls with usable transcripts for agents that failed QCI analysis".to_string());
    }
    if overall.average_completion_rate < 0.5 {
        steps.push("Completion rate is below 50%; check completion service availability".to_string());
    }
    steps
}
