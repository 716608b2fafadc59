//! Completion Client — single-turn requests to an OpenAI-compatible chat
//! completions endpoint.
//!
//! Each call is stateless: one user message in, the first choice's text out.

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::CompletionConfig;
use crate::error::CompletionError;

/// Longest error body kept in `CompletionError::Status`.
const MAX_ERROR_BODY: usize = 512;

/// Something that turns a prompt into reply text.
#[async_trait]
pub trait CompletionService: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(&self, prompt: &str) -> Result<String, CompletionError>;
}

/// One entry of the `messages` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Request body: `{model, messages: [{role: "user", content}]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

impl ChatRequest {
    pub fn single_turn(model: &str, prompt: &str) -> Self {
        Self {
            model: model.to_string(),
            messages: vec![ChatMessage::user(prompt)],
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

/// Extract the first choice's content from a response body.
pub fn parse_response(body: &str) -> Result<String, CompletionError> {
    let response: ChatResponse = serde_json::from_str(body)
        .map_err(|e| CompletionError::InvalidResponse(e.to_string()))?;
    response
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message.content)
        .ok_or(CompletionError::EmptyChoices)
}

/// HTTP client for the Completion Service.
pub struct ChatCompletionClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: SecretString,
    model: String,
}

impl ChatCompletionClient {
    pub fn new(config: &CompletionConfig) -> Result<Self, CompletionError> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl CompletionService for ChatCompletionClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<String, CompletionError> {
        let request = ChatRequest::single_turn(&self.model, prompt);
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if status != StatusCode::OK {
            let body: String = body.chars().take(MAX_ERROR_BODY).collect();
            return Err(CompletionError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let content = parse_response(&body)?;
        debug!(model = %self.model, chars = content.len(), "Completion received");
        Ok(content)
    }
}
