// qci-trainer-rs/src/state.rs
// Explicit per-call and per-agent pipeline states.

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStage {
    Unscored,
    Structured,
    Scored,
    Failed,
}

impl CallStage {
    pub fn can_advance_to(self, next: CallStage) -> bool {
        use CallStage::*;
        matches!(
            (self, next),
            (Unscored, Structured) | (Structured, Scored) | (Unscored, Failed) | (Structured, Failed)
        )
    }

    pub fn advance(self, next: CallStage) -> Result<CallStage, PipelineError> {
        if self.can_advance_to(next) {
            Ok(next)
        } else {
            Err(PipelineError::InvalidTransition {
                entity: "call",
                from: format!("{:?}", self),
                to: format!("{:?}", next),
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStage {
    Pending,
    Scored,
    Categorized,
    Planned,
    Optimized,
    Failed,
}

impl AgentStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, AgentStage::Optimized | AgentStage::Failed)
    }

    pub fn can_advance_to(self, next: AgentStage) -> bool {
        use AgentStage::*;
        match (self, next) {
            (Pending, Scored) | (Scored, Categorized) | (Categorized, Planned) | (Planned, Optimized) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn advance(self, next: AgentStage) -> Result<AgentStage, PipelineError> {
        if self.can_advance_to(next) {
            Ok(next)
        } else {
            Err(PipelineError::InvalidTransition {
                entity: "agent",
                from: format!("{:?}", self),
                to: format!("{:?}", next),
            })
        }
    }
}

/// Tracks one agent's progress and the last successful stage reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentProgress {
    stage: AgentStage,
    reached: AgentStage,
}

impl Default for AgentProgress {
    fn default() -> Self {
        Self {
            stage: AgentStage::Pending,
            reached: AgentStage::Pending,
        }
    }
}

impl AgentProgress {
    pub fn stage(&self) -> AgentStage {
        self.stage
    }

    /// Last non-failed stage, kept after a failure for reporting.
    pub fn reached(&self) -> AgentStage {
        self.reached
    }

    pub fn advance(&mut self, next: AgentStage) -> Result<(), PipelineError> {
        self.stage = self.stage.advance(next)?;
        if next != AgentStage::Failed {
            self.reached = next;
        }
        Ok(())
    }

    pub fn fail(&mut self) {
        if !self.stage.is_terminal() {
            self.stage = AgentStage::Failed;
        }
    }
}
