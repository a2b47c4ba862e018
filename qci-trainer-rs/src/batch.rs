// qci-trainer-rs/src/batch.rs
// Call batch runner: structure + score every call of one agent, isolate
// per-call failures, aggregate and persist the agent's QCI results.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::increment_counter;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::{FailureKind, FailureRecord, PipelineError};
use crate::model::{AgentId, Call, CallId, NormalizedConversation};
use crate::pacing::{CancelFlag, Pacer};
use crate::scorer::{QciResult, QualityScorer};
use crate::state::CallStage;
use crate::store::{ArtifactKind, ArtifactStore, ArtifactStoreExt};
use crate::structurer::TranscriptStructurer;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCall {
    pub call_id: CallId,
    pub conversation: NormalizedConversation,
    pub result: QciResult,
}

/// A call that produced no QCI result. Always counts as score 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedCall {
    pub call_id: CallId,
    pub score: u8,
    /// Last stage the call completed before failing
    pub stage_reached: CallStage,
    pub error: FailureRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallOutcome {
    Scored(ScoredCall),
    Failed(FailedCall),
}

impl CallOutcome {
    pub fn call_id(&self) -> &CallId {
        match self {
            CallOutcome::Scored(s) => &s.call_id,
            CallOutcome::Failed(f) => &f.call_id,
        }
    }

    pub fn score(&self) -> u8 {
        match self {
            CallOutcome::Scored(s) => s.result.score,
            CallOutcome::Failed(f) => f.score,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreRange {
    pub min: u8,
    pub max: u8,
}

/// Per-agent aggregate over one batch run. Order independent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentQciSummary {
    pub total_analyzed: usize,
    pub successful: usize,
    pub failed: usize,
    /// Mean over successfully scored calls; `None` when there are none
    pub mean_score: Option<f64>,
    pub range: Option<ScoreRange>,
}

impl AgentQciSummary {
    pub fn from_outcomes(outcomes: &[CallOutcome]) -> Self {
        let scores: Vec<u8> = outcomes
            .iter()
            .filter_map(|o| match o {
                CallOutcome::Scored(s) => Some(s.result.score),
                CallOutcome::Failed(_) => None,
            })
            .collect();

        let mean_score = (!scores.is_empty())
            .then(|| scores.iter().map(|s| f64::from(*s)).sum::<f64>() / scores.len() as f64);
        let range = match (scores.iter().min(), scores.iter().max()) {
            (Some(min), Some(max)) => Some(ScoreRange { min: *min, max: *max }),
            _ => None,
        };

        Self {
            total_analyzed: outcomes.len(),
            successful: scores.len(),
            failed: outcomes.len() - scores.len(),
            mean_score,
            range,
        }
    }
}

/// Persisted document `qci_results[agent_id]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentQciReport {
    pub agent_id: AgentId,
    pub analyzed_at: DateTime<Utc>,
    pub summary: AgentQciSummary,
    pub calls: Vec<CallOutcome>,
}

impl AgentQciReport {
    pub fn scored_calls(&self) -> impl Iterator<Item = &ScoredCall> {
        self.calls.iter().filter_map(|c| match c {
            CallOutcome::Scored(s) => Some(s),
            CallOutcome::Failed(_) => None,
        })
    }

    pub fn failed_calls(&self) -> impl Iterator<Item = &FailedCall> {
        self.calls.iter().filter_map(|c| match c {
            CallOutcome::Failed(f) => Some(f),
            CallOutcome::Scored(_) => None,
        })
    }

    /// Every attempted call failed because the completion service was
    /// unreachable. Points at misconfiguration rather than bad data.
    pub fn all_upstream_failures(&self) -> bool {
        !self.calls.is_empty()
            && self.summary.successful == 0
            && self
                .failed_calls()
                .all(|f| f.error.kind == FailureKind::UpstreamUnavailable)
    }
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub max_calls: usize,
    pub call_pacing: Duration,
    pub stage_pacing: Duration,
    pub upstream_retries: u32,
}

pub struct BatchRunner {
    structurer: TranscriptStructurer,
    scorer: QualityScorer,
    store: Arc<dyn ArtifactStore>,
    settings: BatchSettings,
}

impl BatchRunner {
    pub fn new(
        structurer: TranscriptStructurer,
        scorer: QualityScorer,
        store: Arc<dyn ArtifactStore>,
        settings: BatchSettings,
    ) -> Self {
        Self {
            structurer,
            scorer,
            store,
            settings,
        }
    }

    /// Score up to `max_calls` calls in input order and persist the result,
    /// replacing any previous run for this agent.
    ///
    /// Per-call failures never abort the batch. Only cancellation and a
    /// failed write return an error. A cancelled batch still persists the
    /// calls it finished.
    #[instrument(name = "qci_batch", skip(self, calls, cancel), fields(agent_id = %agent, calls = calls.len()))]
    pub async fn run(
        &self,
        agent: &AgentId,
        calls: &[Call],
        cancel: &CancelFlag,
    ) -> Result<AgentQciReport, PipelineError> {
        let mut pacer = Pacer::new(self.settings.call_pacing);
        let mut outcomes = Vec::with_capacity(calls.len().min(self.settings.max_calls));

        for call in calls.iter().take(self.settings.max_calls) {
            if cancel.is_cancelled() {
                tracing::warn!(processed = outcomes.len(), "batch cancelled between calls");
                if !outcomes.is_empty() {
                    self.persist(agent, outcomes).await?;
                }
                return Err(PipelineError::Cancelled);
            }

            let outcome = self.process_call(call, &mut pacer).await;
            match &outcome {
                CallOutcome::Scored(s) => {
                    increment_counter!("qci_calls_scored_total");
                    tracing::info!(call_id = %s.call_id, score = s.result.score, tier = s.result.tier.label(), "call scored");
                }
                CallOutcome::Failed(f) => {
                    increment_counter!("qci_calls_failed_total", "kind" => f.error.kind.as_str());
                    tracing::warn!(call_id = %f.call_id, kind = f.error.kind.as_str(), error = %f.error.message, "call failed");
                }
            }
            outcomes.push(outcome);
        }

        let report = self.persist(agent, outcomes).await?;
        tracing::info!(
            successful = report.summary.successful,
            failed = report.summary.failed,
            mean = report.summary.mean_score.unwrap_or(0.0),
            "batch complete"
        );
        Ok(report)
    }

    /// Write the outcomes gathered so far, replacing the agent's previous
    /// results.
    async fn persist(&self, agent: &AgentId, outcomes: Vec<CallOutcome>) -> Result<AgentQciReport, PipelineError> {
        let report = AgentQciReport {
            agent_id: agent.clone(),
            analyzed_at: Utc::now(),
            summary: AgentQciSummary::from_outcomes(&outcomes),
            calls: outcomes,
        };
        self.store
            .put_json(ArtifactKind::QciResults, &agent.storage_key(), &report)
            .await?;
        Ok(report)
    }

    async fn process_call(&self, call: &Call, pacer: &mut Pacer) -> CallOutcome {
        let transcript = call.transcript_text();
        let mut stage = CallStage::Unscored;

        let failed = |stage: CallStage, err: PipelineError| {
            CallOutcome::Failed(FailedCall {
                call_id: call.id.clone(),
                score: 0,
                stage_reached: stage,
                error: err.to_record(),
            })
        };

        if let Err(err) = self.structurer.check_content(transcript) {
            return failed(stage, err);
        }

        pacer.ready().await;

        let mut attempt = 0;
        let conversation = loop {
            match self.structurer.structure(&call.id, transcript).await {
                Err(PipelineError::UpstreamUnavailable(reason)) if attempt < self.settings.upstream_retries => {
                    attempt += 1;
                    tracing::warn!(call_id = %call.id, attempt, %reason, "structuring retry");
                    tokio::time::sleep(self.settings.stage_pacing).await;
                }
                other => break other,
            }
        };
        let conversation = match conversation {
            Ok(conversation) => conversation,
            Err(err) => return failed(stage, err),
        };
        stage = match stage.advance(CallStage::Structured) {
            Ok(next) => next,
            Err(err) => return failed(stage, err),
        };

        tokio::time::sleep(self.settings.stage_pacing).await;

        let mut attempt = 0;
        let result = loop {
            match self.scorer.score(&call.id, &conversation, transcript, call.duration_secs()).await {
                Err(PipelineError::UpstreamUnavailable(reason)) if attempt < self.settings.upstream_retries => {
                    attempt += 1;
                    tracing::warn!(call_id = %call.id, attempt, %reason, "scoring retry");
                    tokio::time::sleep(self.settings.stage_pacing).await;
                }
                other => break other,
            }
        };

        match result {
            Ok(result) => CallOutcome::Scored(ScoredCall {
                call_id: call.id.clone(),
                conversation,
                result,
            }),
            Err(err) => failed(stage, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryArtifactStore;
    use crate::test_support::{agent, call, score_reply_45, score_reply_85, structure_reply, ScriptedLlm};
    use async_trait::async_trait;
    use llm_service::{CompletionRequest, CompletionService, LlmError};

    fn runner(llm: Arc<dyn CompletionService>, store: Arc<dyn ArtifactStore>, max_calls: usize) -> BatchRunner {
        BatchRunner::new(
            TranscriptStructurer::new(llm.clone(), 10),
            QualityScorer::new(llm),
            store,
            BatchSettings {
                max_calls,
                call_pacing: Duration::ZERO,
                stage_pacing: Duration::ZERO,
                upstream_retries: 1,
            },
        )
    }

    const GOOD: &str = "AI: Hi, this is Anna from Acme.\nUser: ok";
    const WEAK: &str = "AI: Let me tell you everything\nUser: ok";

    #[test]
    fn summary_aggregates_only_scored_calls() {
        let outcomes = vec![
            CallOutcome::Failed(FailedCall {
                call_id: CallId::new("x"),
                score: 0,
                stage_reached: CallStage::Unscored,
                error: PipelineError::ContentTooShort { length: 0, minimum: 10 }.to_record(),
            }),
        ];
        let summary = AgentQciSummary::from_outcomes(&outcomes);
        assert_eq!(summary.total_analyzed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.mean_score, None);
        assert_eq!(summary.range, None);
    }

    #[tokio::test]
    async fn failures_are_isolated_per_call() {
        let llm = ScriptedLlm::routed(vec![
            (
                "structure",
                vec![
                    structure_reply("Hi, this is Anna from Acme.", 0.45, "meeting"),
                    Ok("not json at all".to_string()),
                    structure_reply("Let me tell you everything", 0.8, "callback"),
                ],
            ),
            ("score", vec![score_reply_85(), score_reply_45()]),
        ]);
        let store = Arc::new(MemoryArtifactStore::new());
        let runner = runner(llm.clone(), store.clone(), 15);

        let calls = vec![
            call("c1", "a", Some(GOOD)),
            call("c2", "a", Some("AI: garbled but long enough")),
            call("c3", "a", None),
            call("c4", "a", Some(WEAK)),
        ];
        let report = runner.run(&agent("a"), &calls, &CancelFlag::new()).await.unwrap();

        let ids: Vec<_> = report.calls.iter().map(|c| c.call_id().as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2", "c3", "c4"]);
        assert_eq!(report.summary.successful, 2);
        assert_eq!(report.summary.failed, 2);
        assert_eq!(report.summary.mean_score, Some(65.0));

        let kinds: Vec<_> = report.failed_calls().map(|f| f.error.kind).collect();
        assert_eq!(kinds, vec![FailureKind::MalformedOutput, FailureKind::ContentTooShort]);
        assert!(report.failed_calls().all(|f| f.score == 0));
        // the empty call never reached the service
        assert_eq!(llm.calls(), 5);
    }

    #[tokio::test]
    async fn respects_call_cap() {
        let llm = ScriptedLlm::routed(vec![
            ("structure", vec![structure_reply("Hi, this is Anna from Acme.", 0.45, "meeting")]),
            ("score", vec![score_reply_85()]),
        ]);
        let store = Arc::new(MemoryArtifactStore::new());
        let runner = runner(llm, store, 1);

        let calls = vec![call("c1", "a", Some(GOOD)), call("c2", "a", Some(GOOD))];
        let report = runner.run(&agent("a"), &calls, &CancelFlag::new()).await.unwrap();
        assert_eq!(report.summary.total_analyzed, 1);
    }

    #[tokio::test]
    async fn upstream_failure_is_retried_once_then_recorded() {
        let llm = ScriptedLlm::routed(vec![(
            "structure",
            vec![
                Err(LlmError::ServerError("503".into())),
                Err(LlmError::NetworkError("refused".into())),
            ],
        )]);
        let store = Arc::new(MemoryArtifactStore::new());
        let runner = runner(llm.clone(), store, 15);

        let report = runner
            .run(&agent("a"), &[call("c1", "a", Some(GOOD))], &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(llm.calls(), 2);
        assert!(report.all_upstream_failures());
    }

    #[tokio::test]
    async fn cancelled_batch_stops_before_next_call() {
        let llm = ScriptedLlm::new(vec![]);
        let store = Arc::new(MemoryArtifactStore::new());
        let runner = runner(llm.clone(), store.clone(), 15);
        let cancel = CancelFlag::new();
        cancel.cancel();

        let err = runner
            .run(&agent("a"), &[call("c1", "a", Some(GOOD))], &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(llm.calls(), 0);
        assert!(store.is_empty());
    }

    /// Sets the cancel flag once the first call has been scored.
    struct CancelAfterFirstScore {
        inner: Arc<ScriptedLlm>,
        cancel: CancelFlag,
    }

    #[async_trait]
    impl CompletionService for CancelAfterFirstScore {
        async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
            let reply = self.inner.complete(request).await;
            if request.purpose == "score" {
                self.cancel.cancel();
            }
            reply
        }
    }

    #[tokio::test]
    async fn cancel_between_calls_keeps_finished_calls() {
        let scripted = ScriptedLlm::routed(vec![
            (
                "structure",
                vec![
                    structure_reply("Hi, this is Anna from Acme.", 0.45, "meeting"),
                    structure_reply("Let me tell you everything", 0.8, "callback"),
                ],
            ),
            ("score", vec![score_reply_85(), score_reply_45()]),
        ]);
        let cancel = CancelFlag::new();
        let llm = Arc::new(CancelAfterFirstScore {
            inner: scripted.clone(),
            cancel: cancel.clone(),
        });
        let store = Arc::new(MemoryArtifactStore::new());
        let runner = runner(llm, store.clone(), 15);

        let calls = vec![call("c1", "a", Some(GOOD)), call("c2", "a", Some(WEAK))];
        let err = runner.run(&agent("a"), &calls, &cancel).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(scripted.calls(), 2);

        let stored: AgentQciReport = store
            .get_json(ArtifactKind::QciResults, "a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.calls.len(), 1);
        assert_eq!(stored.calls[0].call_id().as_str(), "c1");
        assert_eq!(stored.summary.mean_score, Some(85.0));
    }

    #[tokio::test(start_paused = true)]
    async fn calls_are_spaced_by_call_pacing() {
        let llm = ScriptedLlm::routed(vec![
            (
                "structure",
                (0..3)
                    .map(|_| structure_reply("Hi, this is Anna from Acme.", 0.45, "meeting"))
                    .collect(),
            ),
            ("score", vec![score_reply_85(), score_reply_85(), score_reply_85()]),
        ]);
        let store = Arc::new(MemoryArtifactStore::new());
        let runner = BatchRunner::new(
            TranscriptStructurer::new(llm.clone(), 10),
            QualityScorer::new(llm.clone()),
            store,
            BatchSettings {
                max_calls: 15,
                call_pacing: Duration::from_secs(2),
                stage_pacing: Duration::ZERO,
                upstream_retries: 0,
            },
        );

        let calls = vec![
            call("c1", "a", Some(GOOD)),
            call("c2", "a", Some(GOOD)),
            call("c3", "a", Some(GOOD)),
        ];
        let start = tokio::time::Instant::now();
        let report = runner.run(&agent("a"), &calls, &CancelFlag::new()).await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(report.summary.successful, 3);
        // the first call is immediate, each later one waits out the gap
        assert!(elapsed >= Duration::from_secs(4), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(5), "elapsed {:?}", elapsed);
    }
}
