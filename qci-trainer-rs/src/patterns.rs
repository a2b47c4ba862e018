// qci-trainer-rs/src/patterns.rs
// Pattern miner: aggregates evidence across a tier group and asks the
// completion service for recurring patterns.
//
// Mining is best-effort: an empty group yields an explicit empty result and
// never calls the service.

use std::collections::HashMap;
use std::sync::Arc;

use llm_service::{extract_json, CompletionService};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::batch::ScoredCall;
use crate::error::{FailureRecord, PipelineError, Stage};
use crate::model::AgentId;
use crate::prompts;
use crate::scorer::EvidenceKind;
use crate::wire::{lenient_f64, lenient_string, lenient_strings, null_as_default};

/// Upper bound on each aggregated evidence list.
pub const MAX_EVIDENCE_PER_LIST: usize = 25;

/// Distinct excerpt with the number of calls it appeared in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedQuote {
    pub text: String,
    pub count: usize,
}

/// Normalize, de-duplicate (case-insensitive) and rank quotes by frequency.
/// Ties keep first-seen order. The result is bounded.
pub fn rank_quotes<'a>(quotes: impl IntoIterator<Item = &'a str>) -> Vec<RankedQuote> {
    let mut ranked: Vec<RankedQuote> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for quote in quotes {
        let text = quote.split_whitespace().collect::<Vec<_>>().join(" ");
        if text.is_empty() {
            continue;
        }
        let key = text.to_lowercase();
        match index.get(&key) {
            Some(&i) => ranked[i].count += 1,
            None => {
                index.insert(key, ranked.len());
                ranked.push(RankedQuote { text, count: 1 });
            }
        }
    }

    // stable sort keeps first-seen order among equal counts
    ranked.sort_by(|a, b| b.count.cmp(&a.count));
    ranked.truncate(MAX_EVIDENCE_PER_LIST);
    ranked
}

/// Inputs for success mining.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SuccessEvidence {
    pub openings: Vec<RankedQuote>,
    pub value_propositions: Vec<RankedQuote>,
    pub objection_responses: Vec<RankedQuote>,
    pub closings: Vec<RankedQuote>,
    pub coaching_tips: Vec<RankedQuote>,
}

impl SuccessEvidence {
    pub fn collect(calls: &[&ScoredCall]) -> Self {
        let objection_responses = rank_quotes(
            calls
                .iter()
                .flat_map(|c| {
                    c.conversation
                        .key_moments
                        .objection_handling
                        .iter()
                        .map(String::as_str)
                        .chain(c.result.evidence_of(EvidenceKind::Success).map(|e| e.quote.as_str()))
                }),
        );

        Self {
            openings: rank_quotes(
                calls
                    .iter()
                    .filter_map(|c| c.conversation.key_moments.opening_line.as_deref()),
            ),
            value_propositions: rank_quotes(
                calls
                    .iter()
                    .filter_map(|c| c.conversation.key_moments.value_proposition.as_deref()),
            ),
            objection_responses,
            closings: rank_quotes(
                calls
                    .iter()
                    .filter_map(|c| c.conversation.key_moments.closing_attempt.as_deref()),
            ),
            coaching_tips: rank_quotes(
                calls
                    .iter()
                    .flat_map(|c| c.result.coaching_tips.iter().map(String::as_str)),
            ),
        }
    }
}

/// Inputs for failure mining.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FailureEvidence {
    pub openings: Vec<RankedQuote>,
    pub problem_quotes: Vec<RankedQuote>,
    pub unhandled_objections: Vec<RankedQuote>,
    pub coaching_tips: Vec<RankedQuote>,
}

impl FailureEvidence {
    pub fn collect(calls: &[&ScoredCall]) -> Self {
        Self {
            openings: rank_quotes(
                calls
                    .iter()
                    .filter_map(|c| c.conversation.key_moments.opening_line.as_deref()),
            ),
            problem_quotes: rank_quotes(calls.iter().flat_map(|c| {
                c.result
                    .evidence_of(EvidenceKind::Improvement)
                    .map(|e| e.quote.as_str())
            })),
            unhandled_objections: rank_quotes(
                calls
                    .iter()
                    .flat_map(|c| c.conversation.objections.iter().map(String::as_str)),
            ),
            coaching_tips: rank_quotes(
                calls
                    .iter()
                    .flat_map(|c| c.result.coaching_tips.iter().map(String::as_str)),
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpeningPattern {
    #[serde(deserialize_with = "lenient_string")]
    pub pattern: String,
    #[serde(deserialize_with = "lenient_string")]
    pub frequency: String,
    #[serde(deserialize_with = "lenient_string")]
    pub effectiveness: String,
    #[serde(deserialize_with = "lenient_string")]
    pub example: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValuePropositionPattern {
    #[serde(deserialize_with = "lenient_string")]
    pub pattern: String,
    #[serde(deserialize_with = "lenient_string")]
    pub frequency: String,
    #[serde(deserialize_with = "lenient_strings")]
    pub key_words: Vec<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub example: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectionPattern {
    #[serde(deserialize_with = "lenient_string")]
    pub pattern: String,
    #[serde(deserialize_with = "lenient_string")]
    pub situation: String,
    #[serde(deserialize_with = "lenient_string")]
    pub response: String,
    #[serde(deserialize_with = "lenient_string")]
    pub example: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClosingPattern {
    #[serde(deserialize_with = "lenient_string")]
    pub pattern: String,
    #[serde(deserialize_with = "lenient_string")]
    pub timing: String,
    #[serde(deserialize_with = "lenient_string")]
    pub example: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommendedPhrase {
    #[serde(deserialize_with = "lenient_string")]
    pub phrase: String,
    #[serde(deserialize_with = "lenient_string")]
    pub context: String,
    #[serde(deserialize_with = "lenient_string")]
    pub impact: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuccessPatterns {
    #[serde(deserialize_with = "null_as_default")]
    pub opening_patterns: Vec<OpeningPattern>,
    #[serde(deserialize_with = "null_as_default")]
    pub value_proposition_patterns: Vec<ValuePropositionPattern>,
    #[serde(deserialize_with = "null_as_default")]
    pub objection_handling_patterns: Vec<ObjectionPattern>,
    #[serde(deserialize_with = "null_as_default")]
    pub closing_patterns: Vec<ClosingPattern>,
    #[serde(deserialize_with = "lenient_strings")]
    pub key_success_factors: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub recommended_phrases: Vec<RecommendedPhrase>,
}

impl SuccessPatterns {
    pub fn is_empty(&self) -> bool {
        self.opening_patterns.is_empty()
            && self.value_proposition_patterns.is_empty()
            && self.objection_handling_patterns.is_empty()
            && self.closing_patterns.is_empty()
            && self.key_success_factors.is_empty()
            && self.recommended_phrases.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpeningProblem {
    #[serde(deserialize_with = "lenient_string")]
    pub problem: String,
    #[serde(deserialize_with = "lenient_string")]
    pub frequency: String,
    #[serde(deserialize_with = "lenient_string")]
    pub impact: String,
    #[serde(deserialize_with = "lenient_string")]
    pub solution: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectionProblem {
    #[serde(deserialize_with = "lenient_string")]
    pub problem: String,
    #[serde(deserialize_with = "lenient_string")]
    pub consequence: String,
    #[serde(deserialize_with = "lenient_string")]
    pub solution: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralIssue {
    #[serde(deserialize_with = "lenient_string")]
    pub issue: String,
    #[serde(deserialize_with = "lenient_strings")]
    pub examples: Vec<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub fix: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvoidPhrase {
    #[serde(deserialize_with = "lenient_string")]
    pub phrase: String,
    #[serde(deserialize_with = "lenient_string")]
    pub reason: String,
    #[serde(deserialize_with = "lenient_string")]
    pub alternative: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImprovementPriority {
    #[serde(deserialize_with = "lenient_f64")]
    pub priority: Option<f64>,
    #[serde(deserialize_with = "lenient_string")]
    pub area: String,
    #[serde(deserialize_with = "lenient_string")]
    pub action: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailurePatterns {
    #[serde(deserialize_with = "null_as_default")]
    pub opening_problems: Vec<OpeningProblem>,
    #[serde(deserialize_with = "null_as_default")]
    pub objection_handling_problems: Vec<ObjectionProblem>,
    #[serde(deserialize_with = "null_as_default")]
    pub general_issues: Vec<GeneralIssue>,
    #[serde(deserialize_with = "null_as_default")]
    pub avoid_phrases: Vec<AvoidPhrase>,
    #[serde(deserialize_with = "null_as_default")]
    pub improvement_priorities: Vec<ImprovementPriority>,
}

impl FailurePatterns {
    pub fn is_empty(&self) -> bool {
        self.opening_problems.is_empty()
            && self.objection_handling_problems.is_empty()
            && self.general_issues.is_empty()
            && self.avoid_phrases.is_empty()
            && self.improvement_priorities.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MiningStatus {
    Extracted,
    EmptyGroup,
    /// The service call failed; `patterns` is empty and `error` says why
    Failed,
}

/// Pattern set for one tier group, with how it was obtained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinedPatterns<T> {
    pub status: MiningStatus,
    pub source_calls: usize,
    pub patterns: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureRecord>,
}

impl<T: Default> MinedPatterns<T> {
    pub fn extracted(source_calls: usize, patterns: T) -> Self {
        Self {
            status: MiningStatus::Extracted,
            source_calls,
            patterns,
            error: None,
        }
    }

    pub fn empty() -> Self {
        Self {
            status: MiningStatus::EmptyGroup,
            source_calls: 0,
            patterns: T::default(),
            error: None,
        }
    }

    /// Placeholder for a group whose mining request failed. The plan is
    /// still built from the QCI summary alone.
    pub fn failed(source_calls: usize, err: &PipelineError) -> Self {
        Self {
            status: MiningStatus::Failed,
            source_calls,
            patterns: T::default(),
            error: Some(err.to_record()),
        }
    }
}

pub struct PatternMiner {
    llm: Arc<dyn CompletionService>,
}

impl PatternMiner {
    pub fn new(llm: Arc<dyn CompletionService>) -> Self {
        Self { llm }
    }

    #[instrument(name = "mine_success_patterns", skip(self, calls), fields(agent_id = %agent, calls = calls.len()))]
    pub async fn mine_success(
        &self,
        agent: &AgentId,
        calls: &[&ScoredCall],
    ) -> Result<MinedPatterns<SuccessPatterns>, PipelineError> {
        if calls.is_empty() {
            tracing::info!("no successful calls, skipping success mining");
            return Ok(MinedPatterns::empty());
        }

        let evidence = SuccessEvidence::collect(calls);
        let request = prompts::success_mining_request(&prompts::evidence_value(&evidence));
        let patterns = self.request(Stage::SuccessMining, request).await?;
        Ok(MinedPatterns::extracted(calls.len(), patterns))
    }

    #[instrument(name = "mine_failure_patterns", skip(self, calls), fields(agent_id = %agent, calls = calls.len()))]
    pub async fn mine_failures(
        &self,
        agent: &AgentId,
        calls: &[&ScoredCall],
    ) -> Result<MinedPatterns<FailurePatterns>, PipelineError> {
        if calls.is_empty() {
            tracing::info!("no failing calls, skipping failure mining");
            return Ok(MinedPatterns::empty());
        }

        let evidence = FailureEvidence::collect(calls);
        let request = prompts::failure_mining_request(&prompts::evidence_value(&evidence));
        let patterns = self.request(Stage::FailureMining, request).await?;
        Ok(MinedPatterns::extracted(calls.len(), patterns))
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        stage: Stage,
        request: llm_service::CompletionRequest,
    ) -> Result<T, PipelineError> {
        let raw = self
            .llm
            .complete(&request)
            .await
            .map_err(|e| PipelineError::from_llm(stage, e))?;
        extract_json(&raw).map_err(|e| PipelineError::malformed(stage, e, &raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::model::Outcome;
    use crate::rubric::{BrandScore, DynamicsScore, ObjectionsScore, OutcomeScore};
    use crate::scorer::{Evidence, QciResult};
    use crate::test_support::{agent, call_id, conversation, ScriptedLlm};
    use serde_json::json;

    fn scored(id: &str, opening: &str, success_quote: Option<&str>) -> ScoredCall {
        let evidence = success_quote
            .map(|q| {
                vec![Evidence {
                    quote: q.to_string(),
                    note: String::new(),
                    kind: EvidenceKind::Success,
                }]
            })
            .unwrap_or_default();
        ScoredCall {
            call_id: call_id(id),
            conversation: conversation(opening, 0.45),
            result: QciResult::new(
                call_id(id),
                DynamicsScore::new(8, 8, 8, 0),
                ObjectionsScore::new(6, 8, 6),
                BrandScore::new(8, 8, 4),
                OutcomeScore::new(Outcome::Meeting, 5, 10),
                vec!["Keep it short".to_string()],
                evidence,
            ),
        }
    }

    #[test]
    fn rank_quotes_dedupes_counts_and_bounds() {
        let ranked = rank_quotes(vec!["Hi there", "hi   THERE", "Other", "", "  ", "Other", "other", "Third"]);
        assert_eq!(
            ranked,
            vec![
                RankedQuote { text: "Other".into(), count: 3 },
                RankedQuote { text: "Hi there".into(), count: 2 },
                RankedQuote { text: "Third".into(), count: 1 },
            ]
        );

        let many: Vec<String> = (0..40).map(|i| format!("quote {}", i)).collect();
        assert_eq!(rank_quotes(many.iter().map(String::as_str)).len(), MAX_EVIDENCE_PER_LIST);
    }

    #[test]
    fn success_evidence_merges_objection_sources() {
        let a = scored("c1", "Hello from Acme", Some("I hear you, most clients said that too"));
        let b = scored("c2", "Hello from Acme", None);
        let evidence = SuccessEvidence::collect(&[&a, &b]);

        assert_eq!(evidence.openings, vec![RankedQuote { text: "Hello from Acme".into(), count: 2 }]);
        assert_eq!(evidence.objection_responses.len(), 1);
        assert_eq!(evidence.coaching_tips[0].count, 2);
    }

    #[tokio::test]
    async fn empty_group_returns_empty_patterns_without_calling_service() {
        let llm = ScriptedLlm::new(vec![]);
        let miner = PatternMiner::new(llm.clone());

        let success = miner.mine_success(&agent("a"), &[]).await.unwrap();
        assert_eq!(success.status, MiningStatus::EmptyGroup);
        assert_eq!(success.source_calls, 0);
        assert!(success.patterns.is_empty());

        let failures = miner.mine_failures(&agent("a"), &[]).await.unwrap();
        assert!(failures.patterns.is_empty());
        assert_eq!(llm.calls(), 0);

        let doc = serde_json::to_value(&success).unwrap();
        assert_eq!(doc["status"], "empty_group");
        assert_eq!(doc["patterns"]["opening_patterns"], json!([]));
    }

    #[tokio::test]
    async fn parses_partial_and_loosely_typed_patterns() {
        let reply = json!({
            "opening_patterns": [{"pattern": "Name + company first", "frequency": 4, "example": "Hi, Anna from Acme"}],
            "recommended_phrases": [{"phrase": "two hours a day", "impact": "high"}],
            "closing_patterns": null
        })
        .to_string();
        let llm = ScriptedLlm::new(vec![Ok(reply)]);
        let miner = PatternMiner::new(llm);
        let call = scored("c1", "Hi, Anna from Acme", None);

        let mined = miner.mine_success(&agent("a"), &[&call]).await.unwrap();
        assert_eq!(mined.status, MiningStatus::Extracted);
        assert_eq!(mined.source_calls, 1);
        assert_eq!(mined.patterns.opening_patterns[0].frequency, "4");
        assert_eq!(mined.patterns.recommended_phrases[0].context, "");
        assert!(mined.patterns.closing_patterns.is_empty());
    }

    #[tokio::test]
    async fn unparseable_mining_reply_is_malformed() {
        let llm = ScriptedLlm::new(vec![Ok("patterns: none".to_string())]);
        let miner = PatternMiner::new(llm);
        let call = scored("c1", "hello", None);

        let err = miner.mine_failures(&agent("a"), &[&call]).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::MalformedOutput);
    }

    #[test]
    fn failed_group_keeps_the_failure_record() {
        let err = PipelineError::UpstreamUnavailable("server error: 503".into());
        let mined: MinedPatterns<SuccessPatterns> = MinedPatterns::failed(2, &err);
        assert_eq!(mined.status, MiningStatus::Failed);
        assert!(mined.patterns.is_empty());

        let doc = serde_json::to_value(&mined).unwrap();
        assert_eq!(doc["status"], "failed");
        assert_eq!(doc["source_calls"], 2);
        assert_eq!(doc["error"]["kind"], "upstream_unavailable");

        let empty = serde_json::to_value(MinedPatterns::<FailurePatterns>::empty()).unwrap();
        assert!(empty.get("error").is_none());
    }
}
