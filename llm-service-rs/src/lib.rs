// llm-service-rs/src/lib.rs
//
// Completion service seam used by the QCI pipeline.
//
// Every pipeline stage talks to the language model through the
// `CompletionService` trait, so tests can substitute a scripted fake while
// production uses `LlmClient` against an OpenAI-compatible endpoint.

use async_trait::async_trait;

pub mod json;
pub mod llm_client;


pub use json::{extract_json, json_slice};
pub use llm_client::{LlmClient, LlmConfig, LlmError};

/// A single request-response exchange with the completion service.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    /// Short label used in logs ("structure", "score", "mine_success", ...)
    pub purpose: String,
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Ask the provider for a JSON object response
    pub json_mode: bool,
}

impl CompletionRequest {
    /// Request that demands a strict JSON object back.
    pub fn json(purpose: impl Into<String>, system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            purpose: purpose.into(),
            system: system.into(),
            user: user.into(),
            temperature: 0.3,
            max_tokens: 2000,
            json_mode: true,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Anything that can answer a completion request with raw text.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError>;
}
