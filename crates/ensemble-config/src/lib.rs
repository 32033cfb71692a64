//! Configuration loading and validation.
//!
//! Every field has a serde default, so an empty file (or no file) is a
//! complete configuration. `ENSEMBLE_*` environment variables override
//! the file; validation rejects zero bounds that would wedge the
//! engine.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Full configuration tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnsembleConfig {
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub planner: PlannerSection,
    #[serde(default)]
    pub events: EventsSection,
    #[serde(default)]
    pub logs: LogsSection,
    #[serde(default)]
    pub mutation: MutationSection,
    #[serde(default)]
    pub action: ActionSection,
    #[serde(default)]
    pub provider: ProviderSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutorSection {
    /// Admission bound per action
    #[serde(default = "defaults::max_concurrent_tasks")]
    pub max_concurrent_tasks_per_action: usize,
    /// Attempts per task, inclusive of the first try
    #[serde(default = "defaults::task_retry_max_attempts")]
    pub task_retry_max_attempts: u32,
    /// Exponential backoff base in milliseconds
    #[serde(default = "defaults::task_retry_base_backoff_ms")]
    pub task_retry_base_backoff_ms: u64,
    /// Per-attempt deadline in seconds
    #[serde(default = "defaults::task_timeout_seconds")]
    pub task_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlannerSection {
    /// Hard cap on generated graph size
    #[serde(default = "defaults::planner_max_tasks")]
    pub max_tasks: usize,
    /// Structured-output repair attempts
    #[serde(default = "defaults::planner_max_retries")]
    pub max_retries: u32,
    /// Planning model
    #[serde(default = "defaults::planner_model")]
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventsSection {
    /// Per-subscriber ring capacity
    #[serde(default = "defaults::event_queue_capacity")]
    pub queue_capacity: usize,
    /// Keepalive interval in seconds
    #[serde(default = "defaults::ping_interval_seconds")]
    pub ping_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogsSection {
    /// Max retained log rows per task
    #[serde(default = "defaults::log_retention_per_task")]
    pub retention_per_task: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MutationSection {
    /// How long an invalidation waits for cancelled agents to release
    #[serde(default = "defaults::cancel_grace_seconds")]
    pub cancel_grace_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionSection {
    /// Operator-initiated action replays allowed
    #[serde(default = "defaults::action_retry_max_attempts")]
    pub retry_max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderSection {
    /// OpenAI-compatible chat completions endpoint
    #[serde(default = "defaults::provider_endpoint")]
    pub endpoint: String,
    /// Environment variable holding the API key
    #[serde(default = "defaults::provider_api_key_env")]
    pub api_key_env: String,
    /// Request timeout in seconds
    #[serde(default = "defaults::provider_timeout_seconds")]
    pub timeout_seconds: u64,
}

mod defaults {
    pub fn max_concurrent_tasks() -> usize {
        8
    }
    pub fn task_retry_max_attempts() -> u32 {
        3
    }
    pub fn task_retry_base_backoff_ms() -> u64 {
        500
    }
    pub fn task_timeout_seconds() -> u64 {
        300
    }
    pub fn planner_max_tasks() -> usize {
        8
    }
    pub fn planner_max_retries() -> u32 {
        2
    }
    pub fn planner_model() -> String {
        "openai/gpt-4o".to_string()
    }
    pub fn event_queue_capacity() -> usize {
        256
    }
    pub fn ping_interval_seconds() -> u64 {
        15
    }
    pub fn log_retention_per_task() -> usize {
        1_000
    }
    pub fn cancel_grace_seconds() -> u64 {
        5
    }
    pub fn action_retry_max_attempts() -> u32 {
        3
    }
    pub fn provider_endpoint() -> String {
        "https://api.openai.com/v1/chat/completions".to_string()
    }
    pub fn provider_api_key_env() -> String {
        "OPENAI_API_KEY".to_string()
    }
    pub fn provider_timeout_seconds() -> u64 {
        60
    }
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            max_concurrent_tasks_per_action: defaults::max_concurrent_tasks(),
            task_retry_max_attempts: defaults::task_retry_max_attempts(),
            task_retry_base_backoff_ms: defaults::task_retry_base_backoff_ms(),
            task_timeout_seconds: defaults::task_timeout_seconds(),
        }
    }
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            max_tasks: defaults::planner_max_tasks(),
            max_retries: defaults::planner_max_retries(),
            model: defaults::planner_model(),
        }
    }
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            queue_capacity: defaults::event_queue_capacity(),
            ping_interval_seconds: defaults::ping_interval_seconds(),
        }
    }
}

impl Default for LogsSection {
    fn default() -> Self {
        Self {
            retention_per_task: defaults::log_retention_per_task(),
        }
    }
}

impl Default for MutationSection {
    fn default() -> Self {
        Self {
            cancel_grace_seconds: defaults::cancel_grace_seconds(),
        }
    }
}

impl Default for ActionSection {
    fn default() -> Self {
        Self {
            retry_max_attempts: defaults::action_retry_max_attempts(),
        }
    }
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            endpoint: defaults::provider_endpoint(),
            api_key_env: defaults::provider_api_key_env(),
            timeout_seconds: defaults::provider_timeout_seconds(),
        }
    }
}

impl EnsembleConfig {
    /// Load from a YAML file, apply env overrides, validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let mut config: EnsembleConfig = serde_yaml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus env overrides, for running without a config file.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = EnsembleConfig::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// The provider API key, read through `provider.api_key_env`.
    pub fn provider_api_key(&self) -> Option<String> {
        std::env::var(&self.provider.api_key_env)
            .ok()
            .filter(|key| !key.is_empty())
    }

    fn apply_env_overrides(&mut self) {
        override_usize(
            "ENSEMBLE_MAX_CONCURRENT_TASKS_PER_ACTION",
            &mut self.executor.max_concurrent_tasks_per_action,
        );
        override_u32(
            "ENSEMBLE_TASK_RETRY_MAX_ATTEMPTS",
            &mut self.executor.task_retry_max_attempts,
        );
        override_u64(
            "ENSEMBLE_TASK_RETRY_BASE_BACKOFF_MS",
            &mut self.executor.task_retry_base_backoff_ms,
        );
        override_u64(
            "ENSEMBLE_TASK_TIMEOUT_SECONDS",
            &mut self.executor.task_timeout_seconds,
        );
        override_usize("ENSEMBLE_PLANNER_MAX_TASKS", &mut self.planner.max_tasks);
        override_u32("ENSEMBLE_PLANNER_MAX_RETRIES", &mut self.planner.max_retries);
        override_string("ENSEMBLE_PLANNER_MODEL", &mut self.planner.model);
        override_usize(
            "ENSEMBLE_EVENT_QUEUE_CAPACITY",
            &mut self.events.queue_capacity,
        );
        override_u64(
            "ENSEMBLE_PING_INTERVAL_SECONDS",
            &mut self.events.ping_interval_seconds,
        );
        override_usize(
            "ENSEMBLE_LOG_RETENTION_PER_TASK",
            &mut self.logs.retention_per_task,
        );
        override_u64(
            "ENSEMBLE_CANCEL_GRACE_SECONDS",
            &mut self.mutation.cancel_grace_seconds,
        );
        override_u32(
            "ENSEMBLE_ACTION_RETRY_MAX_ATTEMPTS",
            &mut self.action.retry_max_attempts,
        );
        override_string("ENSEMBLE_PROVIDER_ENDPOINT", &mut self.provider.endpoint);
        override_string("ENSEMBLE_PROVIDER_API_KEY_ENV", &mut self.provider.api_key_env);
        override_u64(
            "ENSEMBLE_PROVIDER_TIMEOUT_SECONDS",
            &mut self.provider.timeout_seconds,
        );
    }

    fn validate(&self) -> Result<(), ConfigError> {
        ensure_nonzero(
            self.executor.max_concurrent_tasks_per_action,
            "executor.max_concurrent_tasks_per_action",
        )?;
        ensure_nonzero(
            self.executor.task_retry_max_attempts as usize,
            "executor.task_retry_max_attempts",
        )?;
        ensure_nonzero(
            self.executor.task_timeout_seconds as usize,
            "executor.task_timeout_seconds",
        )?;
        ensure_nonzero(self.planner.max_tasks, "planner.max_tasks")?;
        ensure_nonzero(self.events.queue_capacity, "events.queue_capacity")?;
        ensure_nonzero(
            self.events.ping_interval_seconds as usize,
            "events.ping_interval_seconds",
        )?;
        ensure_nonzero(self.logs.retention_per_task, "logs.retention_per_task")?;
        if self.planner.model.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "planner.model must not be empty".to_string(),
            ));
        }
        if self.provider.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "provider.endpoint must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn ensure_nonzero(value: usize, field: &str) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(format!("{field} must be > 0")));
    }
    Ok(())
}

fn override_string(var: &str, slot: &mut String) {
    if let Ok(value) = std::env::var(var) {
        if !value.is_empty() {
            *slot = value;
        }
    }
}

fn override_usize(var: &str, slot: &mut usize) {
    if let Ok(value) = std::env::var(var) {
        match value.parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => tracing::warn!(var, value, "ignoring unparseable env override"),
        }
    }
}

fn override_u32(var: &str, slot: &mut u32) {
    if let Ok(value) = std::env::var(var) {
        match value.parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => tracing::warn!(var, value, "ignoring unparseable env override"),
        }
    }
}

fn override_u64(var: &str, slot: &mut u64) {
    if let Ok(value) = std::env::var(var) {
        match value.parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => tracing::warn!(var, value, "ignoring unparseable env override"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = EnsembleConfig::default();
        assert_eq!(config.executor.max_concurrent_tasks_per_action, 8);
        assert_eq!(config.executor.task_retry_max_attempts, 3);
        assert_eq!(config.executor.task_retry_base_backoff_ms, 500);
        assert_eq!(config.executor.task_timeout_seconds, 300);
        assert_eq!(config.planner.max_tasks, 8);
        assert_eq!(config.planner.max_retries, 2);
        assert_eq!(config.events.queue_capacity, 256);
        assert_eq!(config.events.ping_interval_seconds, 15);
        assert_eq!(config.logs.retention_per_task, 1_000);
        assert_eq!(config.mutation.cancel_grace_seconds, 5);
        assert_eq!(config.action.retry_max_attempts, 3);
    }

    #[test]
    fn test_partial_yaml_fills_in_defaults() {
        let yaml = "executor:\n  max_concurrent_tasks_per_action: 2\nplanner:\n  max_tasks: 4\n";
        let config: EnsembleConfig = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(config.executor.max_concurrent_tasks_per_action, 2);
        assert_eq!(config.executor.task_retry_max_attempts, 3);
        assert_eq!(config.planner.max_tasks, 4);
        assert_eq!(config.events.queue_capacity, 256);
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let yaml = "executor:\n  max_inflight: 2\n";
        assert!(serde_yaml::from_str::<EnsembleConfig>(yaml).is_err());
    }

    #[test]
    fn test_validation_rejects_zero_bounds() {
        let mut config = EnsembleConfig::default();
        config.executor.max_concurrent_tasks_per_action = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = EnsembleConfig::default();
        config.events.queue_capacity = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = EnsembleConfig::default();
        config.planner.model = " ".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_env_override_wins_over_defaults() {
        // Env access is process-global; keep the variable unique to this
        // test to avoid cross-test interference.
        std::env::set_var("ENSEMBLE_PLANNER_MAX_TASKS", "5");
        let mut config = EnsembleConfig::default();
        config.apply_env_overrides();
        std::env::remove_var("ENSEMBLE_PLANNER_MAX_TASKS");
        assert_eq!(config.planner.max_tasks, 5);
    }
}
