// qci-trainer-rs/src/source.rs
// Inbound collaborators: where calls and current agent scripts come from.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;

use crate::model::{AgentId, Call};

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid call export {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("call source unavailable: {0}")]
    Unavailable(String),
}

/// Supplies the calls to analyze, grouped by owning agent.
#[async_trait]
pub trait CallSource: Send + Sync {
    async fn agents(&self) -> Result<Vec<AgentId>, SourceError>;

    async fn calls_for(&self, agent: &AgentId) -> Result<Vec<Call>, SourceError>;
}

/// Supplies an agent's current instruction script.
#[async_trait]
pub trait PromptSource: Send + Sync {
    async fn current_prompt(&self, agent: &AgentId) -> Result<Option<String>, SourceError>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CallExport {
    Bare(Vec<Call>),
    Wrapped { calls: Vec<Call> },
}

/// Calls loaded from a platform export, kept in export order.
#[derive(Debug, Default)]
pub struct CallCatalog {
    order: Vec<AgentId>,
    calls: HashMap<AgentId, Vec<Call>>,
    prompts_dir: Option<PathBuf>,
}

impl CallCatalog {
    pub fn from_calls(calls: impl IntoIterator<Item = Call>) -> Self {
        let mut catalog = Self::default();
        for call in calls {
            if !catalog.calls.contains_key(&call.assistant_id) {
                catalog.order.push(call.assistant_id.clone());
            }
            catalog
                .calls
                .entry(call.assistant_id.clone())
                .or_default()
                .push(call);
        }
        catalog
    }

    /// Load a JSON export: either a bare array of calls or `{"calls": [...]}`.
    pub async fn load(path: &Path) -> Result<Self, SourceError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| SourceError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let export: CallExport = serde_json::from_str(&raw).map_err(|source| SourceError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let calls = match export {
            CallExport::Bare(calls) | CallExport::Wrapped { calls } => calls,
        };

        tracing::info!(path = %path.display(), calls = calls.len(), "call export loaded");
        Ok(Self::from_calls(calls))
    }

    /// Scripts in `<dir>/<agent storage key>.txt` take precedence over
    /// scripts found in call records.
    pub fn with_prompts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.prompts_dir = Some(dir.into());
        self
    }

    pub fn agent_count(&self) -> usize {
        self.order.len()
    }

    async fn prompt_from_dir(&self, agent: &AgentId) -> Result<Option<String>, SourceError> {
        let Some(dir) = &self.prompts_dir else {
            return Ok(None);
        };
        let path = dir.join(format!("{}.txt", agent.storage_key()));
        match tokio::fs::read_to_string(&path).await {
            Ok(text) if !text.trim().is_empty() => Ok(Some(text)),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(SourceError::Io { path, source }),
        }
    }
}

#[async_trait]
impl CallSource for CallCatalog {
    async fn agents(&self) -> Result<Vec<AgentId>, SourceError> {
        Ok(self.order.clone())
    }

    async fn calls_for(&self, agent: &AgentId) -> Result<Vec<Call>, SourceError> {
        Ok(self.calls.get(agent).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl PromptSource for CallCatalog {
    async fn current_prompt(&self, agent: &AgentId) -> Result<Option<String>, SourceError> {
        if let Some(script) = self.prompt_from_dir(agent).await? {
            return Ok(Some(script));
        }
        Ok(self
            .calls
            .get(agent)
            .and_then(|calls| calls.iter().find_map(|c| c.system_prompt()))
            .map(str::to_string))
    }
}
