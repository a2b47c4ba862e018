// qci-trainer-rs/src/scorer.rs
// Quality scorer: applies the QCI rubric to a structured conversation.
//
// The completion service reports per-component points and raw observations
// (dead-air gap count, outcome label). Talk-ratio points, dead-air penalty,
// outcome points and every total are computed locally, so the sub-scores
// always add up to the reported score.

use std::sync::Arc;

use llm_service::{extract_json, CompletionService};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::{PipelineError, Stage};
use crate::model::{CallId, NormalizedConversation, Outcome};
use crate::prompts;
use crate::rubric::{
    clamp_points, talk_ratio_points, BrandScore, DynamicsScore, ObjectionsScore, OutcomeScore, Tier,
    ALTERNATIVE_OFFERED_MAX, BRAND_CONSISTENCY_MAX, FIRST_BRAND_MENTION_MAX, FIRST_CTA_MAX,
    LANGUAGE_MATCH_MAX, REACTION_TIME_MAX, STOP_RECOGNITION_MAX, TIME_TO_VALUE_MAX,
    TOOL_HYGIENE_MAX, WRAP_UP_MAX,
};
use crate::wire::{lenient_f64, lenient_string, lenient_strings, null_as_default};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Success,
    Improvement,
}

/// Quoted excerpt supporting a score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub quote: String,
    pub note: String,
    pub kind: EvidenceKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QciResult {
    pub call_id: CallId,
    pub score: u8,
    pub tier: Tier,
    pub dynamics: DynamicsScore,
    pub objections: ObjectionsScore,
    pub brand: BrandScore,
    pub outcome: OutcomeScore,
    pub coaching_tips: Vec<String>,
    pub evidence: Vec<Evidence>,
}

impl QciResult {
    /// Assemble a result; score and tier are derived from the sub-scores.
    pub fn new(
        call_id: CallId,
        dynamics: DynamicsScore,
        objections: ObjectionsScore,
        brand: BrandScore,
        outcome: OutcomeScore,
        coaching_tips: Vec<String>,
        evidence: Vec<Evidence>,
    ) -> Self {
        let sum = u16::from(dynamics.total)
            + u16::from(objections.total)
            + u16::from(brand.total)
            + u16::from(outcome.total);
        let score = sum.min(100) as u8;
        Self {
            call_id,
            score,
            tier: Tier::for_score(f64::from(score)),
            dynamics,
            objections,
            brand,
            outcome,
            coaching_tips,
            evidence,
        }
    }

    pub fn subscore_sum(&self) -> u16 {
        u16::from(self.dynamics.total)
            + u16::from(self.objections.total)
            + u16::from(self.brand.total)
            + u16::from(self.outcome.total)
    }

    pub fn evidence_of(&self, kind: EvidenceKind) -> impl Iterator<Item = &Evidence> {
        self.evidence.iter().filter(move |e| e.kind == kind)
    }
}

#[derive(Debug, Deserialize)]
struct ScoreWire {
    #[serde(default, deserialize_with = "null_as_default")]
    breakdown: BreakdownWire,
    #[serde(default, deserialize_with = "lenient_strings")]
    coaching_tips: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    evidence: EvidenceWire,
    #[serde(default, deserialize_with = "lenient_f64")]
    qci_score: Option<f64>,
    #[serde(default)]
    call_classification: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BreakdownWire {
    #[serde(default)]
    dynamics: Option<DynamicsWire>,
    #[serde(default)]
    objections_compliance: Option<ObjectionsWire>,
    #[serde(default)]
    brand_language: Option<BrandWire>,
    #[serde(default)]
    outcome_hygiene: Option<OutcomeWire>,
}

#[derive(Debug, Deserialize)]
struct DynamicsWire {
    #[serde(default, deserialize_with = "lenient_f64")]
    time_to_value_score: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    first_cta_score: Option<f64>,
    #[serde(default, alias = "dead_air_events", deserialize_with = "lenient_f64")]
    dead_air_gaps: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ObjectionsWire {
    #[serde(default, deserialize_with = "lenient_f64")]
    recognition_score: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    compliance_time_score: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    alternative_offered_score: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct BrandWire {
    #[serde(default, deserialize_with = "lenient_f64")]
    brand_mention_score: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    brand_consistency_score: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    language_match_score: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OutcomeWire {
    #[serde(default)]
    outcome: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    wrap_up_score: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    tool_hygiene_score: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct EvidenceWire {
    #[serde(default, deserialize_with = "null_as_default")]
    successful_moments: Vec<MomentWire>,
    #[serde(default, deserialize_with = "null_as_default")]
    improvement_areas: Vec<MomentWire>,
}

#[derive(Debug, Deserialize)]
struct MomentWire {
    #[serde(default, deserialize_with = "lenient_string")]
    quote: String,
    #[serde(default, alias = "reason", alias = "issue", deserialize_with = "lenient_string")]
    note: String,
}

fn required(value: Option<f64>, component: &str) -> Result<f64, PipelineError> {
    value.ok_or_else(|| PipelineError::ScoringUnavailable(format!("missing component {}", component)))
}

fn section<T>(value: Option<T>, name: &str) -> Result<T, PipelineError> {
    value.ok_or_else(|| PipelineError::ScoringUnavailable(format!("missing breakdown section {}", name)))
}

pub struct QualityScorer {
    llm: Arc<dyn CompletionService>,
}

impl QualityScorer {
    pub fn new(llm: Arc<dyn CompletionService>) -> Self {
        Self { llm }
    }

    #[instrument(name = "score_call", skip(self, conversation, transcript), fields(call_id = %call_id))]
    pub async fn score(
        &self,
        call_id: &CallId,
        conversation: &NormalizedConversation,
        transcript: &str,
        duration_secs: f64,
    ) -> Result<QciResult, PipelineError> {
        let raw = self
            .llm
            .complete(&prompts::score_request(conversation, transcript, duration_secs))
            .await
            .map_err(|e| PipelineError::from_llm(Stage::Scoring, e))?;

        let wire: ScoreWire =
            extract_json(&raw).map_err(|e| PipelineError::malformed(Stage::Scoring, e, &raw))?;

        let result = build_result(call_id.clone(), conversation, wire)?;
        tracing::debug!(score = result.score, tier = result.tier.label(), "call scored");
        Ok(result)
    }
}

fn build_result(
    call_id: CallId,
    conversation: &NormalizedConversation,
    wire: ScoreWire,
) -> Result<QciResult, PipelineError> {
    let d = section(wire.breakdown.dynamics, "dynamics")?;
    let o = section(wire.breakdown.objections_compliance, "objections_compliance")?;
    let b = section(wire.breakdown.brand_language, "brand_language")?;
    let h = section(wire.breakdown.outcome_hygiene, "outcome_hygiene")?;

    let dead_air_gaps = d.dead_air_gaps.unwrap_or(0.0).max(0.0).round() as u32;
    let dynamics = DynamicsScore::new(
        talk_ratio_points(conversation.talk_ratio),
        clamp_points(required(d.time_to_value_score, "time_to_value_score")?, TIME_TO_VALUE_MAX),
        clamp_points(required(d.first_cta_score, "first_cta_score")?, FIRST_CTA_MAX),
        dead_air_gaps,
    );

    let objections = ObjectionsScore::new(
        clamp_points(required(o.recognition_score, "recognition_score")?, STOP_RECOGNITION_MAX),
        clamp_points(required(o.compliance_time_score, "compliance_time_score")?, REACTION_TIME_MAX),
        clamp_points(
            required(o.alternative_offered_score, "alternative_offered_score")?,
            ALTERNATIVE_OFFERED_MAX,
        ),
    );

    let brand = BrandScore::new(
        clamp_points(required(b.brand_mention_score, "brand_mention_score")?, FIRST_BRAND_MENTION_MAX),
        clamp_points(
            required(b.brand_consistency_score, "brand_consistency_score")?,
            BRAND_CONSISTENCY_MAX,
        ),
        clamp_points(required(b.language_match_score, "language_match_score")?, LANGUAGE_MATCH_MAX),
    );

    let outcome_label = match h.outcome.as_deref() {
        Some(label) => Outcome::parse(label).unwrap_or_else(|| {
            tracing::warn!(label, "unknown outcome label, using structured outcome");
            conversation.outcome
        }),
        None => conversation.outcome,
    };
    let outcome = OutcomeScore::new(
        outcome_label,
        clamp_points(required(h.wrap_up_score, "wrap_up_score")?, WRAP_UP_MAX),
        clamp_points(required(h.tool_hygiene_score, "tool_hygiene_score")?, TOOL_HYGIENE_MAX),
    );

    let evidence = wire
        .evidence
        .successful_moments
        .into_iter()
        .map(|m| (m, EvidenceKind::Success))
        .chain(
            wire.evidence
                .improvement_areas
                .into_iter()
                .map(|m| (m, EvidenceKind::Improvement)),
        )
        .filter(|(m, _)| !m.quote.trim().is_empty())
        .map(|(m, kind)| Evidence {
            quote: m.quote.trim().to_string(),
            note: m.note.trim().to_string(),
            kind,
        })
        .collect();

    let result = QciResult::new(
        call_id,
        dynamics,
        objections,
        brand,
        outcome,
        wire.coaching_tips,
        evidence,
    );

    if let Some(reported) = wire.qci_score {
        if (reported - f64::from(result.score)).abs() >= 1.0 {
            tracing::debug!(
                reported,
                computed = result.score,
                classification = wire.call_classification.as_deref().unwrap_or(""),
                "model total differs from rubric total"
            );
        }
    }

    Ok(result)
}
