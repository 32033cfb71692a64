//! Default agent registry assembly.

use std::sync::Arc;

use ensemble_core::agent::AgentRegistry;
use ensemble_core::chat::ChatClient;

use crate::llm::{LlmAgent, LlmAgentConfig};
use crate::mock::MockAgent;

/// Build the builtin registry: the four LLM-backed personas plus a mock
/// fallback that absorbs unknown agent types.
pub fn builtin_registry(client: Arc<dyn ChatClient>) -> AgentRegistry {
    let mut registry = AgentRegistry::new();

    registry.register(Arc::new(LlmAgent::new(
        client.clone(),
        LlmAgentConfig::new(
            "general",
            "General-purpose assistant for tasks without a better fit",
            "You are a capable general-purpose assistant. Complete the task thoroughly and \
             return a concise result.",
        ),
    )));
    registry.register(Arc::new(LlmAgent::new(
        client.clone(),
        LlmAgentConfig::new(
            "data_retrieval",
            "Fetches and summarises data from external sources",
            "You are a data retrieval specialist. Identify the data the task needs, describe \
             how to obtain it, and return the retrieved data or precise instructions in a \
             machine-usable form.",
        ),
    )));
    registry.register(Arc::new(LlmAgent::new(
        client.clone(),
        LlmAgentConfig::new(
            "spreadsheet",
            "Transforms tabular data and produces tables",
            "You are a spreadsheet specialist. Work with tabular data: clean, aggregate and \
             reshape it, and return the resulting table as markdown or CSV.",
        ),
    )));
    registry.register(Arc::new(LlmAgent::new(
        client,
        LlmAgentConfig::new(
            "report",
            "Writes reports from upstream task outputs",
            "You are a report writer. Synthesise the upstream outputs into a clear, well \
             structured markdown report.",
        ),
    )));

    registry.set_fallback(Arc::new(MockAgent::new("mock")));
    registry
}
