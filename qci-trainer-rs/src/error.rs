// qci-trainer-rs/src/error.rs
// Error taxonomy shared by every pipeline stage.

use std::fmt;

use llm_service::LlmError;
use serde::{Deserialize, Serialize};

use crate::model::AgentId;
use crate::source::SourceError;
use crate::store::StoreError;

/// Pipeline step that talks to the completion service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Structuring,
    Scoring,
    SuccessMining,
    FailureMining,
    Rewrite,
    AbVariants,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Structuring => "structuring",
            Stage::Scoring => "scoring",
            Stage::SuccessMining => "success mining",
            Stage::FailureMining => "failure mining",
            Stage::Rewrite => "rewrite",
            Stage::AbVariants => "A/B variants",
        };
        f.write_str(name)
    }
}

/// Serializable discriminant of [`PipelineError`], used in persisted
/// failure records and report counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ContentTooShort,
    MalformedOutput,
    ScoringUnavailable,
    NoCurrentPrompt,
    NoImprovementPlan,
    UpstreamUnavailable,
    NoHeadroom,
    Store,
    Source,
    Cancelled,
    InvalidTransition,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::ContentTooShort => "content_too_short",
            FailureKind::MalformedOutput => "malformed_output",
            FailureKind::ScoringUnavailable => "scoring_unavailable",
            FailureKind::NoCurrentPrompt => "no_current_prompt",
            FailureKind::NoImprovementPlan => "no_improvement_plan",
            FailureKind::UpstreamUnavailable => "upstream_unavailable",
            FailureKind::NoHeadroom => "no_headroom",
            FailureKind::Store => "store",
            FailureKind::Source => "source",
            FailureKind::Cancelled => "cancelled",
            FailureKind::InvalidTransition => "invalid_transition",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("transcript too short: {length} chars (minimum {minimum})")]
    ContentTooShort { length: usize, minimum: usize },

    #[error("malformed {stage} output: {detail}")]
    MalformedOutput {
        stage: Stage,
        detail: String,
        raw: String,
    },

    #[error("scoring unavailable: {0}")]
    ScoringUnavailable(String),

    #[error("no current prompt found for agent {0}")]
    NoCurrentPrompt(AgentId),

    #[error("no improvement plan found for agent {0}")]
    NoImprovementPlan(AgentId),

    #[error("completion service unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("mean score {mean:.1} leaves no room for a higher target")]
    NoHeadroom { mean: f64 },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("call source error: {0}")]
    Source(#[from] SourceError),

    #[error("run cancelled")]
    Cancelled,

    #[error("invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },
}

impl PipelineError {
    /// Map a completion-service error raised while running `stage`.
    ///
    /// An undecodable provider envelope is treated like any other unparseable
    /// model output; everything else means the service is unavailable.
    pub fn from_llm(stage: Stage, err: LlmError) -> Self {
        match err {
            LlmError::ParseError(detail) => PipelineError::MalformedOutput {
                stage,
                detail,
                raw: String::new(),
            },
            other => PipelineError::UpstreamUnavailable(other.to_string()),
        }
    }

    pub fn malformed(stage: Stage, detail: impl fmt::Display, raw: &str) -> Self {
        PipelineError::MalformedOutput {
            stage,
            detail: detail.to_string(),
            raw: raw.to_string(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            PipelineError::ContentTooShort { .. } => FailureKind::ContentTooShort,
            PipelineError::MalformedOutput { .. } => FailureKind::MalformedOutput,
            PipelineError::ScoringUnavailable(_) => FailureKind::ScoringUnavailable,
            PipelineError::NoCurrentPrompt(_) => FailureKind::NoCurrentPrompt,
            PipelineError::NoImprovementPlan(_) => FailureKind::NoImprovementPlan,
            PipelineError::UpstreamUnavailable(_) => FailureKind::UpstreamUnavailable,
            PipelineError::NoHeadroom { .. } => FailureKind::NoHeadroom,
            PipelineError::Store(_) => FailureKind::Store,
            PipelineError::Source(_) => FailureKind::Source,
            PipelineError::Cancelled => FailureKind::Cancelled,
            PipelineError::InvalidTransition { .. } => FailureKind::InvalidTransition,
        }
    }

    /// Snapshot suitable for persisting next to the work item that failed.
    pub fn to_record(&self) -> FailureRecord {
        let raw_output = match self {
            PipelineError::MalformedOutput { raw, .. } if !raw.is_empty() => Some(raw.clone()),
            _ => None,
        };
        FailureRecord {
            kind: self.kind(),
            message: self.to_string(),
            raw_output,
        }
    }
}

/// Persisted form of a failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub message: String,
    /// Unparseable model output, kept for diagnostics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
}
