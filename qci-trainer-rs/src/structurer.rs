// qci-trainer-rs/src/structurer.rs
// Transcript structurer: raw transcript -> NormalizedConversation.

use std::sync::Arc;

use llm_service::{extract_json, CompletionService};
use serde::Deserialize;
use tracing::instrument;

use crate::error::{PipelineError, Stage};
use crate::model::{CallId, KeyMoments, NormalizedConversation, Outcome, Speaker, Turn};
use crate::prompts;
use crate::wire::{lenient_f64, lenient_string, lenient_strings, null_as_default};

#[derive(Debug, Deserialize)]
struct StructuredWire {
    #[serde(default, deserialize_with = "null_as_default")]
    conversation_flow: Vec<TurnWire>,
    #[serde(default, deserialize_with = "null_as_default")]
    call_metadata: MetadataWire,
    #[serde(default, deserialize_with = "null_as_default")]
    key_moments: KeyMomentsWire,
}

#[derive(Debug, Deserialize)]
struct TurnWire {
    #[serde(default, deserialize_with = "lenient_string")]
    speaker: String,
    #[serde(default, alias = "text", alias = "content", deserialize_with = "lenient_string")]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct MetadataWire {
    #[serde(default, deserialize_with = "lenient_f64")]
    agent_talk_ratio: Option<f64>,
    #[serde(default)]
    call_outcome: Option<String>,
    #[serde(default, deserialize_with = "lenient_strings")]
    objections_raised: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct KeyMomentsWire {
    #[serde(default)]
    opening_line: Option<String>,
    #[serde(default)]
    value_proposition: Option<String>,
    #[serde(default)]
    closing_attempt: Option<String>,
    #[serde(default, deserialize_with = "lenient_strings")]
    objection_handling: Vec<String>,
}

/// Converts raw transcripts into turn-by-turn conversations through the
/// completion service.
pub struct TranscriptStructurer {
    llm: Arc<dyn CompletionService>,
    min_chars: usize,
    require_verbatim: bool,
}

impl TranscriptStructurer {
    pub fn new(llm: Arc<dyn CompletionService>, min_chars: usize) -> Self {
        Self {
            llm,
            min_chars,
            require_verbatim: true,
        }
    }

    pub fn with_verbatim_check(mut self, enabled: bool) -> Self {
        self.require_verbatim = enabled;
        self
    }

    /// Check the transcript length without calling the completion service.
    pub fn check_content(&self, transcript: &str) -> Result<(), PipelineError> {
        let length = transcript.trim().chars().count();
        if length < self.min_chars {
            return Err(PipelineError::ContentTooShort {
                length,
                minimum: self.min_chars,
            });
        }
        Ok(())
    }

    #[instrument(name = "structure_transcript", skip(self, transcript), fields(call_id = %call_id))]
    pub async fn structure(
        &self,
        call_id: &CallId,
        transcript: &str,
    ) -> Result<NormalizedConversation, PipelineError> {
        self.check_content(transcript)?;

        let raw = self
            .llm
            .complete(&prompts::structure_request(transcript))
            .await
            .map_err(|e| PipelineError::from_llm(Stage::Structuring, e))?;

        let wire: StructuredWire =
            extract_json(&raw).map_err(|e| PipelineError::malformed(Stage::Structuring, e, &raw))?;

        let conversation = self.normalize(wire, transcript, &raw)?;
        tracing::debug!(
            turns = conversation.turns.len(),
            talk_ratio = conversation.talk_ratio,
            "transcript structured"
        );
        Ok(conversation)
    }

    fn normalize(
        &self,
        wire: StructuredWire,
        transcript: &str,
        raw: &str,
    ) -> Result<NormalizedConversation, PipelineError> {
        let haystack = self.require_verbatim.then(|| fold_text(transcript));

        let mut turns = Vec::with_capacity(wire.conversation_flow.len());
        for turn in wire.conversation_flow {
            let text = turn.message.trim();
            if text.is_empty() {
                continue;
            }

            let speaker = Speaker::parse(&turn.speaker).ok_or_else(|| {
                PipelineError::malformed(
                    Stage::Structuring,
                    format!("unknown speaker {:?}", turn.speaker),
                    raw,
                )
            })?;

            if let Some(haystack) = &haystack {
                if !haystack.contains(&fold_text(text)) {
                    return Err(PipelineError::malformed(
                        Stage::Structuring,
                        format!("turn {} is not a verbatim excerpt of the transcript", turns.len()),
                        raw,
                    ));
                }
            }

            turns.push(Turn {
                index: turns.len(),
                speaker,
                text: text.to_string(),
            });
        }

        if turns.is_empty() {
            return Err(PipelineError::malformed(
                Stage::Structuring,
                "conversation_flow contains no turns",
                raw,
            ));
        }

        let talk_ratio = match wire.call_metadata.agent_talk_ratio {
            Some(ratio) if ratio > 1.0 => (ratio / 100.0).clamp(0.0, 1.0),
            Some(ratio) => ratio.max(0.0),
            None => derived_talk_ratio(&turns),
        };

        let outcome = wire
            .call_metadata
            .call_outcome
            .as_deref()
            .and_then(Outcome::parse)
            .unwrap_or(Outcome::NoOutcome);

        let mut key_moments = KeyMoments {
            opening_line: non_blank(wire.key_moments.opening_line),
            value_proposition: non_blank(wire.key_moments.value_proposition),
            closing_attempt: non_blank(wire.key_moments.closing_attempt),
            objection_handling: wire.key_moments.objection_handling,
        };
        if key_moments.opening_line.is_none() {
            key_moments.opening_line = turns
                .iter()
                .find(|t| t.speaker == Speaker::Agent)
                .map(|t| t.text.clone());
        }

        Ok(NormalizedConversation {
            turns,
            talk_ratio,
            outcome,
            objections: wire.call_metadata.objections_raised,
            key_moments,
        })
    }
}

/// Agent share of spoken characters.
fn derived_talk_ratio(turns: &[Turn]) -> f64 {
    let (agent, total) = turns.iter().fold((0usize, 0usize), |(agent, total), t| {
        let len = t.text.chars().count();
        match t.speaker {
            Speaker::Agent => (agent + len, total + len),
            Speaker::Customer => (agent, total + len),
        }
    });
    if total == 0 {
        0.0
    } else {
        agent as f64 / total as f64
    }
}

/// Lowercase and collapse whitespace so line wrapping and casing in the
/// model output do not defeat the verbatim check.
fn fold_text(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
