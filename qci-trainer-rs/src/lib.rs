// qci-trainer-rs/src/lib.rs
// Library interface for the QCI trainer.
//
// Scores recorded sales calls against the fixed QCI rubric, groups them by
// tier, mines what the best and worst calls have in common and turns that
// into an improvement plan and a rewritten agent script.
//
// Design notes:
// - Every generative step goes through `llm_service::CompletionService`, so
//   tests drive the whole pipeline with scripted replies.
// - Stages hand explicit result values to each other; nothing is shared
//   through globals. Derived artifacts live in an `ArtifactStore` keyed by the
//   full agent identifier and are replaced on every run.
// - Requests are strictly sequential and paced.

pub mod batch;
pub mod categorizer;
pub mod config;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod pacing;
pub mod patterns;
pub mod recommendation;
pub mod report;
pub mod rewriter;
pub mod rollout;
pub mod rubric;
pub mod scorer;
pub mod source;
pub mod state;
pub mod store;
pub mod structurer;

mod prompts;
mod wire;

#[cfg(test)]
mod test_support;

#[cfg(test)]
mod tests;

pub use crate::batch::{AgentQciReport, AgentQciSummary, BatchRunner, CallOutcome};
pub use crate::config::TrainerConfig;
pub use crate::error::{FailureKind, PipelineError};
pub use crate::model::{AgentId, Call, CallId};
pub use crate::orchestrator::TrainingCycle;
pub use crate::pacing::CancelFlag;
pub use crate::report::{RunOutcome, TrainingRunReport};
pub use crate::source::{CallCatalog, CallSource, PromptSource};
pub use crate::store::{ArtifactStore, FileArtifactStore, MemoryArtifactStore};
