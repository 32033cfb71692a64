//! LLM-backed agent.
//!
//! All four builtin personas (general, report, data_retrieval,
//! spreadsheet) are this one agent with a different system prompt; the
//! interesting work happens in folding upstream outputs into the user
//! message and honouring cancellation around the provider call.

use std::sync::Arc;

use async_trait::async_trait;

use ensemble_core::agent::{Agent, AgentError, AgentOutput, AgentRequest};
use ensemble_core::chat::{ChatClient, ChatRequest};
use ensemble_core::types::LogLevel;

use crate::models::default_model_for;

/// Configuration for one LLM-backed persona.
#[derive(Debug, Clone)]
pub struct LlmAgentConfig {
    pub agent_type: String,
    pub description: String,
    pub system_prompt: String,
    pub temperature: f32,
}

impl LlmAgentConfig {
    pub fn new(
        agent_type: impl Into<String>,
        description: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            agent_type: agent_type.into(),
            description: description.into(),
            system_prompt: system_prompt.into(),
            temperature: 0.4,
        }
    }
}

/// Chat-completion-backed agent.
pub struct LlmAgent {
    client: Arc<dyn ChatClient>,
    config: LlmAgentConfig,
}

impl LlmAgent {
    pub fn new(client: Arc<dyn ChatClient>, config: LlmAgentConfig) -> Self {
        Self { client, config }
    }

    fn build_user_message(&self, request: &AgentRequest<'_>) -> String {
        if request.dependency_outputs.is_empty() {
            return request.prompt.to_string();
        }
        let mut user = String::new();
        user.push_str("Context from upstream tasks:\n\n");
        for dep in request.dependency_outputs {
            user.push_str(&format!("--- output of task {} ---\n{}\n\n", dep.task_id, dep.text));
        }
        user.push_str("Your task:\n");
        user.push_str(request.prompt);
        user
    }
}

#[async_trait]
impl Agent for LlmAgent {
    fn agent_type(&self) -> &str {
        &self.config.agent_type
    }

    fn description(&self) -> &str {
        &self.config.description
    }

    async fn run(&self, request: AgentRequest<'_>) -> Result<AgentOutput, AgentError> {
        if request.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        let model = request
            .model
            .map(str::to_string)
            .unwrap_or_else(|| default_model_for(&self.config.agent_type).to_string());

        request
            .logs
            .log(
                LogLevel::Info,
                &format!("[{}] calling {}", self.config.agent_type, model),
            )
            .await;

        let chat = ChatRequest::new(
            self.config.system_prompt.clone(),
            self.build_user_message(&request),
            model,
        )
        .with_temperature(self.config.temperature);

        let completion = tokio::select! {
            result = self.client.complete(chat) => result,
            _ = request.cancel.cancelled() => return Err(AgentError::Cancelled),
        };

        match completion {
            Ok(summary) => {
                request
                    .logs
                    .log(
                        LogLevel::Info,
                        &format!("[{}] produced {} chars", self.config.agent_type, summary.len()),
                    )
                    .await;
                Ok(AgentOutput::new(summary))
            }
            Err(error) => {
                request
                    .logs
                    .log(
                        LogLevel::Error,
                        &format!("[{}] provider error: {error}", self.config.agent_type),
                    )
                    .await;
                Err(error.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_core::agent::{DependencyOutput, NullLogSink};
    use ensemble_planners::MockChatClient;
    use tokio_util::sync::CancellationToken;

    fn agent(client: MockChatClient) -> LlmAgent {
        LlmAgent::new(
            Arc::new(client),
            LlmAgentConfig::new("general", "general assistant", "You are helpful."),
        )
    }

    #[test]
    fn test_run_returns_completion_as_summary() {
        tokio_test::block_on(async {
            let agent = agent(MockChatClient::always("the answer"));
            let cancel = CancellationToken::new();
            let sink = NullLogSink;
            let output = agent
                .run(AgentRequest {
                    task_id: "t1",
                    prompt: "answer the question",
                    model: None,
                    dependency_outputs: &[],
                    logs: &sink,
                    cancel: &cancel,
                })
                .await
                .expect("output");
            assert_eq!(output.summary, "the answer");
        });
    }

    #[test]
    fn test_upstream_outputs_are_folded_into_the_user_message() {
        tokio_test::block_on(async {
            let client = Arc::new(MockChatClient::always("ok"));
            let agent = LlmAgent::new(
                client.clone(),
                LlmAgentConfig::new("general", "general assistant", "You are helpful."),
            );
            let deps = vec![DependencyOutput {
                task_id: "dep-1".to_string(),
                text: "42 rows of weather data".to_string(),
            }];
            let cancel = CancellationToken::new();
            let sink = NullLogSink;

            agent
                .run(AgentRequest {
                    task_id: "t2",
                    prompt: "fit a sine",
                    model: None,
                    dependency_outputs: &deps,
                    logs: &sink,
                    cancel: &cancel,
                })
                .await
                .expect("output");

            let requests = client.seen_requests();
            assert_eq!(requests.len(), 1);
            let user = &requests[0].messages[0].content;
            assert!(user.contains("output of task dep-1"));
            assert!(user.contains("42 rows of weather data"));
            assert!(user.contains("fit a sine"));
        });
    }

    #[test]
    fn test_model_override_beats_default_routing() {
        tokio_test::block_on(async {
            let client = Arc::new(MockChatClient::always("ok"));
            let agent = LlmAgent::new(
                client.clone(),
                LlmAgentConfig::new("report", "writer", "Write."),
            );
            let cancel = CancellationToken::new();
            let sink = NullLogSink;
            agent
                .run(AgentRequest {
                    task_id: "t1",
                    prompt: "write",
                    model: Some("deepseek/deepseek-chat"),
                    dependency_outputs: &[],
                    logs: &sink,
                    cancel: &cancel,
                })
                .await
                .expect("output");

            let requests = client.seen_requests();
            assert_eq!(requests[0].model, "deepseek/deepseek-chat");
        });
    }

    #[test]
    fn test_pre_cancelled_request_short_circuits() {
        tokio_test::block_on(async {
            let agent = agent(MockChatClient::always("never"));
            let cancel = CancellationToken::new();
            cancel.cancel();
            let sink = NullLogSink;
            let err = agent
                .run(AgentRequest {
                    task_id: "t1",
                    prompt: "p",
                    model: None,
                    dependency_outputs: &[],
                    logs: &sink,
                    cancel: &cancel,
                })
                .await
                .expect_err("cancelled");
            assert!(matches!(err, AgentError::Cancelled));
        });
    }
}
