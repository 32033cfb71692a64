//! Chat-completion client seam.
//!
//! Every language-model call in the system (planner, LLM-backed agents)
//! goes through this one interface; provider clients live outside the
//! core.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// A single chat exchange: system framing plus ordered user/assistant
/// turns.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    /// Single-turn request.
    pub fn new(system: impl Into<String>, user: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            messages: vec![ChatMessage::user(user)],
            model: model.into(),
            temperature: 0.2,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Append a follow-up turn.
    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }
}

/// One conversational turn.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

/// Chat errors, tagged by retryability so callers can apply their own
/// backoff policy.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Network trouble, timeout, rate limit, provider 5xx.
    #[error("transient chat error: {0}")]
    Transient(String),
    /// Auth failure, bad request, anything a retry will not fix.
    #[error("permanent chat error: {0}")]
    Permanent(String),
    /// The provider answered but the payload was unusable.
    #[error("malformed chat response: {0}")]
    Malformed(String),
}

impl ChatError {
    /// Classify an HTTP status per the retry taxonomy: 408/429/5xx are
    /// transient, every other 4xx is permanent.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        if status == 408 || status == 429 || status >= 500 {
            ChatError::Transient(format!("HTTP {status}: {body}"))
        } else {
            ChatError::Permanent(format!("HTTP {status}: {body}"))
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ChatError::Transient(_))
    }
}

/// ChatClient trait - the single LLM provider interface.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Run one chat completion and return the assistant text.
    async fn complete(&self, request: ChatRequest) -> Result<String, ChatError>;
}

#[async_trait]
impl ChatClient for Arc<dyn ChatClient> {
    async fn complete(&self, request: ChatRequest) -> Result<String, ChatError> {
        (**self).complete(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(ChatError::from_status(429, "slow down").is_transient());
        assert!(ChatError::from_status(503, "unavailable").is_transient());
        assert!(ChatError::from_status(408, "timeout").is_transient());
        assert!(!ChatError::from_status(401, "bad key").is_transient());
        assert!(!ChatError::from_status(400, "bad request").is_transient());
    }

    #[test]
    fn test_request_builder_appends_turns() {
        let mut request = ChatRequest::new("system", "first", "openai/gpt-4o");
        request.push(ChatMessage::assistant("draft"));
        request.push(ChatMessage::user("fix it"));
        assert_eq!(request.messages.len(), 3);
        assert_eq!(request.messages[1].role, ChatRole::Assistant);
        assert_eq!(request.messages[2].role.as_str(), "user");
    }
}
