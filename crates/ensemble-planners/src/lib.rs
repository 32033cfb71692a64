//! Planner implementations.
//!
//! - [`HttpChatClient`]: OpenAI-compatible chat-completion client, the
//!   one provider interface everything LLM-shaped goes through.
//! - [`LlmPlanner`]: decomposes a root prompt into a validated task
//!   DAG with structured-output repair and a single-task fallback.
//! - [`MockChatClient`]: scripted client for tests.

mod http;
mod llm;

pub use http::{HttpChatClient, HttpChatClientConfig, MockChatClient};
pub use llm::{extract_json, AgentCatalogEntry, LlmPlanner, LlmPlannerConfig};
