// llm-service-rs/src/llm_client.rs
//
// HTTP client for an OpenAI-compatible chat-completions endpoint.
//
// This module provides:
// - Real HTTP calls to the provider via reqwest
// - Exponential backoff retry for transient failures
// - Classification of retryable vs. non-retryable errors
// - Configuration via environment variables
//
// Configuration (.env file):
// - LLM_API_KEY: API key for the provider (required)
// - LLM_API_URL: endpoint URL (defaults to the OpenAI chat-completions endpoint)
// - LLM_MODEL: model to use (default: gpt-4)
// - LLM_MAX_RETRIES: maximum number of retry attempts (default: 3)
// - LLM_INITIAL_RETRY_DELAY_MS: initial delay between retries in ms (default: 1000)
// - LLM_MAX_RETRY_DELAY_MS: maximum delay between retries in ms (default: 30000)
// - LLM_TIMEOUT_SECS: per-request timeout (default: 60)

use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::{CompletionRequest, CompletionService};

pub const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "gpt-4";

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct Usage {
    total_tokens: u32,
}

/// Errors from the completion service, split by whether a retry can help.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LlmError {
    /// Missing API key or unusable client settings
    #[error("LLM client is not configured: {0}")]
    NotConfigured(String),

    // Non-retryable: 400, 401, 403, 404
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // 429, retried with backoff to let the provider cool down
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    // 500, 502, 503, 504
    #[error("Server error: {0}")]
    ServerError(String),

    // Timeouts, refused connections
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The provider answered but the envelope could not be decoded
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Unknown error: {0}")]
    UnknownError(String),
}

impl LlmError {
    /// Whether the retry loop should try the request again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::ServerError(_) | LlmError::NetworkError(_) | LlmError::RateLimitExceeded(_)
        )
    }
}

/// Connection and retry settings for [`LlmClient`].
#[derive(Clone)]
pub struct LlmConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_retries: u32,
    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub timeout: Duration,
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmConfig")
            .field("api_url", &self.api_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("max_retries", &self.max_retries)
            .field("initial_retry_delay", &self.initial_retry_delay)
            .field("max_retry_delay", &self.max_retry_delay)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            max_retries: 3,
            initial_retry_delay: Duration::from_millis(1000),
            max_retry_delay: Duration::from_millis(30000),
            timeout: Duration::from_secs(60),
        }
    }
}

impl LlmConfig {
    /// Reads the `LLM_*` variables, falling back to defaults on missing or
    /// invalid values.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_url: config_rs::env_non_empty("LLM_API_URL").unwrap_or(defaults.api_url),
            api_key: config_rs::env_non_empty("LLM_API_KEY"),
            model: config_rs::env_non_empty("LLM_MODEL").unwrap_or(defaults.model),
            max_retries: config_rs::env_or("LLM_MAX_RETRIES", defaults.max_retries),
            initial_retry_delay: config_rs::env_duration_ms("LLM_INITIAL_RETRY_DELAY_MS", 1000),
            max_retry_delay: config_rs::env_duration_ms("LLM_MAX_RETRY_DELAY_MS", 30000),
            timeout: Duration::from_secs(config_rs::env_or("LLM_TIMEOUT_SECS", 60u64)),
        }
    }

    /// Config pointing at an explicit endpoint, mostly for tests and local
    /// providers.
    pub fn for_endpoint(api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            api_key: Some(api_key.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub struct LlmClient {
    client: Client,
    api_key: String,
    config: LlmConfig,
}

impl LlmClient {
    /// Builds the HTTP client. Fails when no API key is configured.
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| LlmError::NotConfigured("LLM_API_KEY is not set".to_string()))?;

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::NotConfigured(format!("Failed to build HTTP client: {}", e)))?;

        log::info!(
            "LLM client initialized for {} (model: {})",
            config.api_url,
            config.model
        );

        Ok(Self {
            client,
            api_key,
            config,
        })
    }

    /// Exponential backoff with jitter: the delay doubles after each
    /// attempt, is capped at `max_retry_delay`, and the whole retry window is
    /// capped at two minutes.
    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.initial_retry_delay)
            .with_max_interval(self.config.max_retry_delay)
            .with_multiplier(2.0)
            .with_max_elapsed_time(Some(Duration::from_secs(120)))
            .with_randomization_factor(0.5)
            .build()
    }

    fn build_body(&self, request: &CompletionRequest) -> ChatCompletionRequest {
        let mut messages = Vec::with_capacity(2);
        if !request.system.is_empty() {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: request.system.clone(),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: request.user.clone(),
        });

        ChatCompletionRequest {
            model: self.config.model.clone(),
            messages,
            temperature: Some(request.temperature),
            max_tokens: Some(request.max_tokens),
            response_format: request
                .json_mode
                .then_some(ResponseFormat { kind: "json_object" }),
        }
    }

    /// Send a completion request, retrying transient failures.
    pub async fn generate(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let mut backoff = self.create_backoff();
        let mut attempt = 0;
        let body = self.build_body(request);

        log::info!(
            "Preparing LLM request '{}' to {} (model: {})",
            request.purpose,
            self.config.api_url,
            self.config.model
        );

        loop {
            attempt += 1;

            if attempt > 1 {
                log::info!("Retry attempt {} for LLM request '{}'", attempt, request.purpose);
            }

            match self.execute_request(&body).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    if !err.is_retryable() || attempt > self.config.max_retries {
                        log::error!("LLM request failed after {} attempts: {}", attempt, err);
                        return Err(err);
                    }

                    match backoff.next_backoff() {
                        Some(delay) => {
                            let jitter = rand::thread_rng().gen_range(0..=200);
                            let delay = delay + Duration::from_millis(jitter);
                            log::warn!("Retryable error: {}. Retrying in {:?}", err, delay);
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            log::error!("Exceeded maximum backoff time: {}", err);
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    // Execute a single request attempt
    async fn execute_request(&self, body: &ChatCompletionRequest) -> Result<String, LlmError> {
        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    LlmError::NetworkError(format!("Request timed out: {}", err))
                } else if err.is_connect() {
                    LlmError::NetworkError(format!("Connection failed: {}", err))
                } else {
                    LlmError::NetworkError(format!("Network error: {}", err))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), text));
        }

        let data: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|err| LlmError::ParseError(format!("Failed to parse response: {}", err)))?;

        if let Some(usage) = &data.usage {
            log::debug!("LLM request completed. Used {} tokens", usage.total_tokens);
        }

        data.choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| LlmError::ParseError("No choices returned in response".to_string()))
    }
}

fn classify_status(status: u16, text: String) -> LlmError {
    match status {
        400 => LlmError::InvalidRequest(format!("Bad request: {}", text)),
        401 => LlmError::InvalidRequest(format!("Unauthorized: {}", text)),
        403 => LlmError::InvalidRequest(format!("Forbidden: {}", text)),
        404 => LlmError::InvalidRequest(format!("Not found: {}", text)),
        429 => LlmError::RateLimitExceeded(text),
        500 | 502 | 503 | 504 => LlmError::ServerError(format!("({}) {}", status, text)),
        _ => LlmError::UnknownError(format!("({}) {}", status, text)),
    }
}

#[async_trait]
impl CompletionService for LlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        self.generate(request).await
    }
}
