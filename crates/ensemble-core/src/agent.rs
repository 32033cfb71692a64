//! Agent contract.
//!
//! Agents are black boxes to the executor: they consume a task prompt
//! plus the outputs of completed dependencies and produce a summary and
//! artifacts. Failures come back tagged transient/permanent; the
//! executor owns the retry decision.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::types::{ArtifactDraft, LogLevel, TaskId};

/// Sink for agent log lines; the executor forwards them to the store
/// and the event bus.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn log(&self, level: LogLevel, message: &str);
}

/// Discards everything; for tests and direct invocations.
pub struct NullLogSink;

#[async_trait]
impl LogSink for NullLogSink {
    async fn log(&self, _level: LogLevel, _message: &str) {}
}

/// Output of a completed dependency, as handed to a downstream agent.
#[derive(Debug, Clone)]
pub struct DependencyOutput {
    /// The dependency task
    pub task_id: TaskId,
    /// Its textual output, including rendered artifact references
    pub text: String,
}

/// Everything an agent needs for one attempt.
pub struct AgentRequest<'a> {
    /// Task being executed
    pub task_id: &'a str,
    /// Instruction from the task
    pub prompt: &'a str,
    /// Model override from the task, if any
    pub model: Option<&'a str>,
    /// Outputs of completed dependencies, in dependency order
    pub dependency_outputs: &'a [DependencyOutput],
    /// Log line sink
    pub logs: &'a dyn LogSink,
    /// Cooperative cancellation signal; checked at suspension points
    pub cancel: &'a CancellationToken,
}

/// Successful agent result.
#[derive(Debug, Clone, Default)]
pub struct AgentOutput {
    /// Short textual summary of what was produced
    pub summary: String,
    /// Artifacts to persist alongside the summary
    pub artifacts: Vec<ArtifactDraft>,
}

impl AgentOutput {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            artifacts: Vec::new(),
        }
    }

    pub fn with_artifacts(mut self, artifacts: Vec<ArtifactDraft>) -> Self {
        self.artifacts = artifacts;
        self
    }
}

/// Agent failure, tagged for the executor's retry policy.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Worth retrying with backoff: network flakiness, rate limits,
    /// provider 5xx, timeouts.
    #[error("transient: {0}")]
    Transient(String),
    /// A retry will not help: bad input, auth failure, agent bug.
    #[error("permanent: {0}")]
    Permanent(String),
    /// The cancellation signal was observed; not a failure.
    #[error("cancelled")]
    Cancelled,
}

impl AgentError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::Transient(_))
    }

    /// The human-facing message, without the taxonomy prefix.
    pub fn message(&self) -> String {
        match self {
            AgentError::Transient(m) | AgentError::Permanent(m) => m.clone(),
            AgentError::Cancelled => "cancelled".to_string(),
        }
    }
}

impl From<crate::chat::ChatError> for AgentError {
    fn from(err: crate::chat::ChatError) -> Self {
        match err {
            crate::chat::ChatError::Transient(m) => AgentError::Transient(m),
            crate::chat::ChatError::Permanent(m) => AgentError::Permanent(m),
            crate::chat::ChatError::Malformed(m) => AgentError::Permanent(m),
        }
    }
}

/// Agent trait - the only surface the executor knows.
#[async_trait]
pub trait Agent: Send + Sync {
    /// The type string tasks use to select this agent.
    fn agent_type(&self) -> &str;

    /// Short description (also fed to the planner prompt).
    fn description(&self) -> &str;

    /// Execute one attempt. Must observe `request.cancel` at
    /// cooperative points and return [`AgentError::Cancelled`] promptly.
    async fn run(&self, request: AgentRequest<'_>) -> Result<AgentOutput, AgentError>;
}

/// Registry of statically compiled agents, keyed by type string.
///
/// Unknown types resolve to the fallback agent when one is set; the
/// planner relies on this to downgrade unrecognised agent types rather
/// than reject a plan.
#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
    fallback: Option<Arc<dyn Agent>>,
}

impl AgentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent under its own type string.
    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        self.agents.insert(agent.agent_type().to_string(), agent);
    }

    /// Set the fallback used for unknown types.
    pub fn set_fallback(&mut self, agent: Arc<dyn Agent>) {
        self.fallback = Some(agent);
    }

    /// Exact lookup.
    pub fn get(&self, agent_type: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(agent_type).cloned()
    }

    /// Lookup with fallback.
    pub fn resolve(&self, agent_type: &str) -> Option<Arc<dyn Agent>> {
        self.get(agent_type).or_else(|| self.fallback.clone())
    }

    /// Whether the type is registered (fallback not considered).
    pub fn contains(&self, agent_type: &str) -> bool {
        self.agents.contains_key(agent_type)
    }

    /// All registered type strings.
    pub fn agent_types(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubAgent {
        agent_type: String,
    }

    #[async_trait]
    impl Agent for StubAgent {
        fn agent_type(&self) -> &str {
            &self.agent_type
        }

        fn description(&self) -> &str {
            "stub"
        }

        async fn run(&self, _request: AgentRequest<'_>) -> Result<AgentOutput, AgentError> {
            Ok(AgentOutput::new("ok"))
        }
    }

    fn stub(agent_type: &str) -> Arc<dyn Agent> {
        Arc::new(StubAgent {
            agent_type: agent_type.to_string(),
        })
    }

    #[test]
    fn test_registry_resolves_fallback_for_unknown_types() {
        let mut registry = AgentRegistry::new();
        registry.register(stub("general"));
        registry.set_fallback(stub("mock"));

        assert!(registry.contains("general"));
        assert!(!registry.contains("quantum"));
        let resolved = registry.resolve("quantum").expect("fallback");
        assert_eq!(resolved.agent_type(), "mock");
    }

    #[test]
    fn test_registry_without_fallback_returns_none() {
        let registry = AgentRegistry::new();
        assert!(registry.resolve("anything").is_none());
    }

    #[test]
    fn test_agent_error_taxonomy() {
        assert!(AgentError::Transient("rate limit".to_string()).is_transient());
        assert!(!AgentError::Permanent("bad auth".to_string()).is_transient());
        assert!(!AgentError::Cancelled.is_transient());
        assert_eq!(
            AgentError::Transient("rate limit".to_string()).message(),
            "rate limit"
        );
    }
}
