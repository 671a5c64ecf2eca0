pub mod gateway;

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub elapsed: Duration,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP {status}")]
    Http { status: u16, body: String },

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("backend returned no choices")]
    EmptyResponse,
}

#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Ranked list of free-tier model ids.
    async fn free_models(&self) -> Result<Vec<String>, LlmError>;

    /// Run a chat completion with the given conversation.
    async fn complete(&self, model: &str, messages: &[ChatMessage])
    -> Result<Completion, LlmError>;
}
