//! LLM-backed planner.
//!
//! Decomposes a root prompt into 2-8 concrete tasks via a structured
//! JSON completion. Invalid output gets a bounded number of corrective
//! follow-ups; after that the planner degrades to a single task
//! carrying the root prompt, so action creation never fails on a
//! misbehaving model.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use ensemble_core::chat::{ChatClient, ChatMessage, ChatRequest};
use ensemble_core::planner::{
    normalize_agent_types, validate_plan, PlanError, PlannedTask, Planner,
};
use ensemble_core::types::Task;

const MAX_OUTPUT_LOG_CHARS: usize = 4_000;

/// One registered agent as advertised to the model.
#[derive(Debug, Clone)]
pub struct AgentCatalogEntry {
    pub agent_type: String,
    pub description: String,
}

/// Planner configuration
#[derive(Debug, Clone)]
pub struct LlmPlannerConfig {
    /// Model used for planning
    pub model: String,
    /// Sampling temperature
    pub temperature: f32,
    /// Hard cap on generated graph size
    pub max_tasks: usize,
    /// Structured-output repair attempts after the first try
    pub max_retries: u32,
    /// Agent type used for downgrades and the fallback plan
    pub default_agent_type: String,
    /// Registered agents advertised in the system prompt
    pub catalog: Vec<AgentCatalogEntry>,
}

impl Default for LlmPlannerConfig {
    fn default() -> Self {
        Self {
            model: "openai/gpt-4o".to_string(),
            temperature: 0.2,
            max_tasks: 8,
            max_retries: 2,
            default_agent_type: "general".to_string(),
            catalog: Vec::new(),
        }
    }
}

/// LLM-backed planner
pub struct LlmPlanner {
    client: Arc<dyn ChatClient>,
    config: LlmPlannerConfig,
}

impl LlmPlanner {
    pub fn new(client: Arc<dyn ChatClient>, config: LlmPlannerConfig) -> Self {
        Self { client, config }
    }

    fn system_prompt(&self) -> String {
        let mut system = String::new();
        system.push_str(
            "You are a task planner for an agentic workflow system. Given a user's prompt, \
             decompose it into 2-8 concrete, actionable tasks that can be executed by \
             specialised agents.\n\n",
        );
        system.push_str("Each task must have:\n");
        system.push_str(
            "- prompt: a specific, concrete instruction (not vague like \"analyze data\")\n",
        );
        system.push_str("- agent_type: one of the types listed in the Agent Catalog\n");
        system.push_str(
            "- dependencies: array of 0-based indices of tasks this task depends on \
             (must only reference earlier tasks)\n\n",
        );
        system.push_str(
            "Maximize parallelism by minimizing dependencies. Only add a dependency when a \
             task genuinely needs the output of another task.\n\n",
        );
        system.push_str("Agent Catalog:\n");
        for entry in &self.config.catalog {
            system.push_str(&format!("- {}: {}\n", entry.agent_type, entry.description));
        }
        system.push_str(
            "\nRespond with ONE JSON object of the shape \
             {\"tasks\":[{\"prompt\":\"...\",\"agent_type\":\"...\",\"dependencies\":[0]}]}. \
             JSON only, no prose.",
        );
        system
    }

    fn user_prompt(&self, root_prompt: &str, existing_tasks: &[Task]) -> String {
        if existing_tasks.is_empty() {
            return root_prompt.to_string();
        }
        let mut user = String::new();
        user.push_str(root_prompt);
        user.push_str("\n\nExisting tasks (being replanned, keep what is still useful):\n");
        for task in existing_tasks {
            user.push_str(&format!("- [{}] {}\n", task.agent_type, task.prompt));
        }
        user
    }

    fn parse_and_validate(&self, raw: &str) -> Result<Vec<PlannedTask>, PlanError> {
        let json = extract_json(raw)
            .ok_or_else(|| PlanError::InvalidOutput("output contains no JSON object".to_string()))?;
        let wire: PlanWire = serde_json::from_str(&json)
            .map_err(|e| PlanError::InvalidOutput(format!("invalid plan JSON: {e}")))?;
        let mut tasks = wire.tasks;
        normalize_agent_types(
            &mut tasks,
            |agent_type| {
                self.config
                    .catalog
                    .iter()
                    .any(|entry| entry.agent_type == agent_type)
            },
            &self.config.default_agent_type,
        );
        validate_plan(&tasks, self.config.max_tasks)?;
        Ok(tasks)
    }

    fn fallback(&self, root_prompt: &str) -> Vec<PlannedTask> {
        warn!("planner exhausted retries, falling back to a single task");
        vec![PlannedTask {
            prompt: root_prompt.to_string(),
            agent_type: self.config.default_agent_type.clone(),
            dependencies: Vec::new(),
            model: None,
        }]
    }
}

#[derive(Debug, Deserialize)]
struct PlanWire {
    tasks: Vec<PlannedTask>,
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(
        &self,
        root_prompt: &str,
        existing_tasks: &[Task],
    ) -> Result<Vec<PlannedTask>, PlanError> {
        if root_prompt.trim().is_empty() {
            return Err(PlanError::InvalidOutput("root prompt is empty".to_string()));
        }

        let mut request = ChatRequest::new(
            self.system_prompt(),
            self.user_prompt(root_prompt, existing_tasks),
            self.config.model.clone(),
        )
        .with_temperature(self.config.temperature);

        let attempts = self.config.max_retries + 1;
        for attempt in 1..=attempts {
            let raw = match self.client.complete(request.clone()).await {
                Ok(raw) => raw,
                Err(error) => {
                    warn!(attempt, error = %error, "planner chat call failed");
                    continue;
                }
            };
            if tracing::enabled!(tracing::Level::DEBUG) {
                debug!(
                    attempt,
                    output = %truncate_for_log(&raw, MAX_OUTPUT_LOG_CHARS),
                    "planner raw output"
                );
            }

            match self.parse_and_validate(&raw) {
                Ok(tasks) => {
                    info!(
                        attempt,
                        task_count = tasks.len(),
                        "planner produced a valid DAG"
                    );
                    return Ok(tasks);
                }
                Err(error) => {
                    warn!(attempt, error = %error, "planner output invalid");
                    request.push(ChatMessage::assistant(raw));
                    request.push(ChatMessage::user(format!(
                        "That output was invalid: {error}. Output a valid acyclic DAG: one JSON \
                         object with a \"tasks\" array, each task's dependencies referencing \
                         only strictly earlier 0-based indices, at most {} tasks, no prose.",
                        self.config.max_tasks
                    )));
                }
            }
        }

        Ok(self.fallback(root_prompt))
    }

    async fn suggest_title(&self, root_prompt: &str) -> Option<String> {
        let request = ChatRequest::new(
            "Generate a short, descriptive title (3-8 words) for the following task prompt. \
             Return ONLY the title, no quotes, no punctuation at the end.",
            root_prompt,
            self.config.model.clone(),
        )
        .with_temperature(0.3)
        .with_max_tokens(30);

        match self.client.complete(request).await {
            Ok(raw) => {
                let title = raw.trim().trim_matches(['"', '\'', '.']).trim().to_string();
                if title.is_empty() {
                    None
                } else {
                    Some(title)
                }
            }
            Err(error) => {
                debug!(error = %error, "title generation failed, using prompt prefix");
                None
            }
        }
    }
}

/// Mine the first complete, parseable JSON object out of model output
/// that may wrap it in prose or fences.
pub fn extract_json(text: &str) -> Option<String> {
    for (start, ch) in text.char_indices() {
        if ch != '{' {
            continue;
        }
        if let Some(end) = find_object_end(text, start) {
            let candidate = &text[start..=end];
            if serde_json::from_str::<serde_json::Value>(candidate)
                .map(|v| v.is_object())
                .unwrap_or(false)
            {
                return Some(candidate.to_string());
            }
        }
    }
    None
}

fn find_object_end(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in text[start..].char_indices() {
        let abs = start + idx;
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(abs);
                }
            }
            _ => {}
        }
    }
    None
}

fn truncate_for_log(input: &str, max_chars: usize) -> String {
    let char_count = input.chars().count();
    if char_count <= max_chars {
        return input.to_string();
    }
    let mut preview: String = input.chars().take(max_chars).collect();
    preview.push_str(&format!("... [truncated, total_chars={char_count}]"));
    preview
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::MockChatClient;

    fn catalog() -> Vec<AgentCatalogEntry> {
        [
            ("data_retrieval", "Fetch data from external sources"),
            ("code_execution", "Write and run analysis code"),
            ("report", "Write a report from upstream outputs"),
            ("general", "General-purpose assistant"),
        ]
        .into_iter()
        .map(|(agent_type, description)| AgentCatalogEntry {
            agent_type: agent_type.to_string(),
            description: description.to_string(),
        })
        .collect()
    }

    fn planner_with(client: MockChatClient) -> LlmPlanner {
        LlmPlanner::new(
            Arc::new(client),
            LlmPlannerConfig {
                catalog: catalog(),
                ..LlmPlannerConfig::default()
            },
        )
    }

    #[test]
    fn test_plan_parses_valid_output() {
        tokio_test::block_on(async {
            let response = r#"{"tasks":[
                {"prompt":"fetch SF weather for 2024","agent_type":"data_retrieval","dependencies":[]},
                {"prompt":"fit a sine to the series","agent_type":"code_execution","dependencies":[0]}
            ]}"#;
            let planner = planner_with(MockChatClient::always(response));

            let plan = planner
                .plan("Fetch weather for SF 2024 then fit a sine", &[])
                .await
                .expect("plan");
            assert_eq!(plan.len(), 2);
            assert_eq!(plan[0].agent_type, "data_retrieval");
            assert_eq!(plan[1].dependencies, vec![0]);
        });
    }

    #[test]
    fn test_plan_accepts_json_wrapped_in_prose() {
        tokio_test::block_on(async {
            let response = r#"Here is the plan:
```json
{"tasks":[{"prompt":"do it","agent_type":"general","dependencies":[]}]}
```"#;
            let planner = planner_with(MockChatClient::always(response));
            let plan = planner.plan("do it", &[]).await.expect("plan");
            assert_eq!(plan.len(), 1);
        });
    }

    #[test]
    fn test_plan_downgrades_unknown_agent_types() {
        tokio_test::block_on(async {
            let response = r#"{"tasks":[{"prompt":"p","agent_type":"quantum","dependencies":[]}]}"#;
            let planner = planner_with(MockChatClient::always(response));
            let plan = planner.plan("p", &[]).await.expect("plan");
            assert_eq!(plan[0].agent_type, "general");
        });
    }

    #[test]
    fn test_plan_retries_with_corrective_message_then_succeeds() {
        tokio_test::block_on(async {
            let invalid =
                r#"{"tasks":[{"prompt":"a","agent_type":"general","dependencies":[1]},
                            {"prompt":"b","agent_type":"general","dependencies":[]}]}"#;
            let valid = r#"{"tasks":[{"prompt":"a","agent_type":"general","dependencies":[]},
                            {"prompt":"b","agent_type":"general","dependencies":[0]}]}"#;
            let client = MockChatClient::with_responses(vec![
                Ok(invalid.to_string()),
                Ok(valid.to_string()),
            ]);
            let planner = planner_with(client);

            let plan = planner.plan("two steps", &[]).await.expect("plan");
            assert_eq!(plan.len(), 2);
            assert_eq!(plan[1].dependencies, vec![0]);
        });
    }

    #[test]
    fn test_plan_falls_back_to_single_task_after_exhausted_retries() {
        tokio_test::block_on(async {
            // A cycle rendered as a forward reference: never valid.
            let cyclic =
                r#"{"tasks":[{"prompt":"t0","agent_type":"general","dependencies":[1]},
                            {"prompt":"t1","agent_type":"general","dependencies":[0]}]}"#;
            let planner = planner_with(MockChatClient::always(cyclic));

            let plan = planner.plan("impossible plan", &[]).await.expect("plan");
            assert_eq!(plan.len(), 1);
            assert_eq!(plan[0].prompt, "impossible plan");
            assert_eq!(plan[0].agent_type, "general");
            assert!(plan[0].dependencies.is_empty());
        });
    }

    #[test]
    fn test_plan_falls_back_when_provider_keeps_erroring() {
        tokio_test::block_on(async {
            let client = MockChatClient::with_responses(vec![Err("boom".to_string())]);
            let planner = planner_with(client);
            let plan = planner.plan("anything", &[]).await.expect("plan");
            assert_eq!(plan.len(), 1);
            assert_eq!(plan[0].prompt, "anything");
        });
    }

    #[test]
    fn test_plan_rejects_empty_root_prompt() {
        tokio_test::block_on(async {
            let planner = planner_with(MockChatClient::always("{}"));
            assert!(planner.plan("   ", &[]).await.is_err());
        });
    }

    #[test]
    fn test_suggest_title_trims_wrapping() {
        tokio_test::block_on(async {
            let planner = planner_with(MockChatClient::always("\"SF Weather Sine Fit.\"\n"));
            let title = planner.suggest_title("prompt").await;
            assert_eq!(title.as_deref(), Some("SF Weather Sine Fit"));
        });
    }

    #[test]
    fn test_suggest_title_none_on_provider_error() {
        tokio_test::block_on(async {
            let client = MockChatClient::with_responses(vec![Err("down".to_string())]);
            let planner = planner_with(client);
            assert!(planner.suggest_title("prompt").await.is_none());
        });
    }

    #[test]
    fn test_extract_json_ignores_non_json_braces() {
        let raw = r#"Preface {not json} -> {"tasks":[]} trailing"#;
        assert_eq!(extract_json(raw).as_deref(), Some(r#"{"tasks":[]}"#));
    }

    #[test]
    fn test_extract_json_handles_braces_inside_strings() {
        let raw = r#"noise {"prompt":"value with } brace"} end"#;
        assert_eq!(
            extract_json(raw).as_deref(),
            Some(r#"{"prompt":"value with } brace"}"#)
        );
    }

    #[test]
    fn test_system_prompt_lists_catalog() {
        let planner = planner_with(MockChatClient::always("{}"));
        let system = planner.system_prompt();
        assert!(system.contains("Agent Catalog"));
        assert!(system.contains("data_retrieval"));
        assert!(system.contains("only reference earlier tasks"));
    }
}
