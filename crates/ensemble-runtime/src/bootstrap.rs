//! Bootstrap - assemble a full orchestrator from configuration.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use ensemble_agents::builtin_registry;
use ensemble_config::EnsembleConfig;
use ensemble_core::chat::{ChatClient, ChatError};
use ensemble_core::event::EventBus;
use ensemble_core::executor::{Executor, ExecutorConfig, InflightRegistry};
use ensemble_core::mutation::{MutationConfig, MutationEngine};
use ensemble_core::store::GraphStore;
use ensemble_planners::{
    AgentCatalogEntry, HttpChatClient, HttpChatClientConfig, LlmPlanner, LlmPlannerConfig,
};
use ensemble_stores::{InMemoryGraphStore, TopicEventBus};

use crate::orchestrator::{Orchestrator, OrchestratorConfig};

/// Bootstrap errors
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("chat client error: {0}")]
    Chat(#[from] ChatError),
}

/// Build an orchestrator over the in-memory store with the builtin
/// agent registry and the LLM planner. Deployments swapping in a
/// database-backed store wire the same pieces by hand.
pub fn bootstrap(config: &EnsembleConfig) -> Result<Arc<Orchestrator>, BootstrapError> {
    let chat: Arc<dyn ChatClient> = Arc::new(HttpChatClient::new(HttpChatClientConfig {
        endpoint: config.provider.endpoint.clone(),
        api_key: config.provider_api_key(),
        timeout: Duration::from_secs(config.provider.timeout_seconds),
    })?);

    let registry = Arc::new(builtin_registry(chat.clone()));
    let catalog: Vec<AgentCatalogEntry> = registry
        .agent_types()
        .into_iter()
        .filter_map(|agent_type| {
            registry.get(&agent_type).map(|agent| AgentCatalogEntry {
                agent_type,
                description: agent.description().to_string(),
            })
        })
        .collect();

    let planner = Arc::new(LlmPlanner::new(
        chat,
        LlmPlannerConfig {
            model: config.planner.model.clone(),
            max_tasks: config.planner.max_tasks,
            max_retries: config.planner.max_retries,
            catalog,
            ..LlmPlannerConfig::default()
        },
    ));

    let store: Arc<dyn GraphStore> = Arc::new(InMemoryGraphStore::with_log_retention(
        config.logs.retention_per_task,
    ));
    let bus: Arc<dyn EventBus> = Arc::new(TopicEventBus::new(config.events.queue_capacity));
    let inflight = Arc::new(InflightRegistry::new());

    let executor = Arc::new(Executor::new(
        store.clone(),
        bus.clone(),
        registry,
        inflight.clone(),
        ExecutorConfig {
            max_concurrent_tasks: config.executor.max_concurrent_tasks_per_action,
            retry_max_attempts: config.executor.task_retry_max_attempts,
            retry_base_backoff: Duration::from_millis(config.executor.task_retry_base_backoff_ms),
            task_timeout: Duration::from_secs(config.executor.task_timeout_seconds),
        },
    ));
    let mutations = Arc::new(MutationEngine::new(
        store.clone(),
        bus.clone(),
        inflight,
        MutationConfig {
            cancel_grace: Duration::from_secs(config.mutation.cancel_grace_seconds),
        },
    ));

    Ok(Arc::new(Orchestrator::new(
        store,
        bus,
        planner,
        executor,
        mutations,
        OrchestratorConfig {
            action_retry_max_attempts: config.action.retry_max_attempts,
            ping_interval: Duration::from_secs(config.events.ping_interval_seconds),
        },
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_from_default_config() {
        let config = EnsembleConfig::default();
        let orchestrator = bootstrap(&config).expect("bootstrap");
        assert!(!orchestrator.is_running("nothing"));
    }
}
