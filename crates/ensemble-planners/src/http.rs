//! Chat-completion clients.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use ensemble_core::chat::{ChatClient, ChatError, ChatRequest};

/// HTTP client config (OpenAI-compatible)
#[derive(Debug, Clone)]
pub struct HttpChatClientConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl Default for HttpChatClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: None,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Chat client over any OpenAI-compatible completions endpoint.
pub struct HttpChatClient {
    client: reqwest::Client,
    config: HttpChatClientConfig,
}

impl HttpChatClient {
    pub fn new(config: HttpChatClientConfig) -> Result<Self, ChatError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ChatError::Permanent(e.to_string()))?;
        Ok(Self { client, config })
    }
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    content: Option<String>,
}

#[async_trait]
impl ChatClient for HttpChatClient {
    async fn complete(&self, request: ChatRequest) -> Result<String, ChatError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.config.api_key {
            let value = format!("Bearer {key}");
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&value).map_err(|e| ChatError::Permanent(e.to_string()))?,
            );
        }

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        messages.push(WireMessage {
            role: "system",
            content: request.system,
        });
        for message in request.messages {
            messages.push(WireMessage {
                role: message.role.as_str(),
                content: message.content,
            });
        }
        let body = WireRequest {
            model: strip_provider_prefix(&request.model).to_string(),
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .headers(headers)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    ChatError::Transient(e.to_string())
                } else {
                    ChatError::Permanent(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ChatError::from_status(status.as_u16(), text));
        }

        let text = response
            .text()
            .await
            .map_err(|e| ChatError::Transient(e.to_string()))?;
        let parsed: WireResponse =
            serde_json::from_str(&text).map_err(|e| ChatError::Malformed(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ChatError::Malformed("response has no choices".to_string()))
    }
}

/// Model ids travel as `provider/model-id`; the wire only wants the
/// model-id part.
fn strip_provider_prefix(model: &str) -> &str {
    model.split_once('/').map(|(_, m)| m).unwrap_or(model)
}

/// Scripted chat client for tests: returns queued responses in order,
/// repeating the last one when the queue runs dry.
pub struct MockChatClient {
    responses: Mutex<Vec<Result<String, String>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockChatClient {
    /// A client that always answers with `response`.
    pub fn always(response: impl Into<String>) -> Self {
        Self::with_responses(vec![Ok(response.into())])
    }

    /// A client that replays `responses` in order; `Err` entries become
    /// transient chat errors.
    pub fn with_responses(responses: Vec<Result<String, String>>) -> Self {
        Self {
            responses: Mutex::new(responses),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests observed so far.
    pub fn seen_requests(&self) -> Vec<ChatRequest> {
        match self.requests.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl ChatClient for MockChatClient {
    async fn complete(&self, request: ChatRequest) -> Result<String, ChatError> {
        match self.requests.lock() {
            Ok(mut guard) => guard.push(request),
            Err(poisoned) => poisoned.into_inner().push(request),
        }
        let mut responses = match self.responses.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = if responses.len() > 1 {
            responses.remove(0)
        } else {
            responses
                .first()
                .cloned()
                .unwrap_or_else(|| Err("mock exhausted".to_string()))
        };
        next.map_err(ChatError::Transient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_provider_prefix() {
        assert_eq!(strip_provider_prefix("openai/gpt-4o"), "gpt-4o");
        assert_eq!(
            strip_provider_prefix("anthropic/claude-sonnet-4-5"),
            "claude-sonnet-4-5"
        );
        assert_eq!(strip_provider_prefix("gpt-4o"), "gpt-4o");
    }

    #[test]
    fn test_mock_replays_responses_in_order() {
        tokio_test::block_on(async {
            let client = MockChatClient::with_responses(vec![
                Err("rate limited".to_string()),
                Ok("second".to_string()),
            ]);
            let request = ChatRequest::new("s", "u", "openai/gpt-4o");

            assert!(client.complete(request.clone()).await.is_err());
            let answer = client.complete(request.clone()).await.expect("answer");
            assert_eq!(answer, "second");
            // Last response repeats.
            let again = client.complete(request).await.expect("answer");
            assert_eq!(again, "second");
            assert_eq!(client.seen_requests().len(), 3);
        });
    }
}
