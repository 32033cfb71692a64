//! Builtin agents.
//!
//! Agents are statically compiled and wired through the registry; the
//! store records an agent type string and configuration, never code.
//! The LLM-backed builtins differ only in persona and default model.

mod factory;
mod llm;
mod mock;
mod models;

pub use factory::builtin_registry;
pub use llm::{LlmAgent, LlmAgentConfig};
pub use mock::MockAgent;
pub use models::default_model_for;
