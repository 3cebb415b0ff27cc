//! Remote completion API contract

use crate::conversation::Role;
use crate::limiter::Retryable;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Remote API errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Timeouts and throttling; worth retrying
    #[error("Transient remote failure: {0}")]
    Transient(String),

    /// Request rejected as invalid; retrying will not help
    #[error("Request rejected: {0}")]
    BadInput(String),

    #[error("Remote failure: {0}")]
    Other(String),
}

impl RemoteError {
    pub fn kind(&self) -> &'static str {
        match self {
            RemoteError::Transient(_) => "transient",
            RemoteError::BadInput(_) => "bad_input",
            RemoteError::Other(_) => "other",
        }
    }
}

impl Retryable for RemoteError {
    fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

/// Message as sent to the remote API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Chat completion request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
}

/// Chat completion result with token usage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl CompletionResponse {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

/// Image generation result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageResponse {
    pub revised_prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Metered completion service
#[async_trait]
pub trait RemoteCompletionApi: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, RemoteError>;

    async fn generate_image(&self, prompt: &str) -> Result<ImageResponse, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_tokens_saturates() {
        let response = CompletionResponse {
            content: String::new(),
            prompt_tokens: u64::MAX,
            completion_tokens: 10,
        };
        assert_eq!(response.total_tokens(), u64::MAX);
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(RemoteError::Transient("503".to_string()).is_transient());
        assert!(!RemoteError::BadInput("400".to_string()).is_transient());
    }
}
