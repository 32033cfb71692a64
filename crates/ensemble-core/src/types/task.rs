//! Task type definitions
//!
//! A Task is a node in an action's DAG: one unit of agent execution with
//! explicit dependencies on other tasks of the same action.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ActionId;

/// Type alias for Task ID
pub type TaskId = String;

/// Task lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dependencies or admission
    Pending,
    /// Claimed by the executor
    Running,
    /// Finished with an attached output
    Completed,
    /// Finished with a terminal error
    Failed,
}

impl TaskStatus {
    /// Check if the status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Task - one schedulable node of an action's DAG
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: TaskId,
    /// Owning action
    pub action_id: ActionId,
    /// Instruction handed to the agent
    pub prompt: String,
    /// Agent type resolved through the registry
    pub agent_type: String,
    /// Optional model override (`provider/model-id`)
    #[serde(default)]
    pub model: Option<String>,
    /// Current status
    pub status: TaskStatus,
    /// Tasks of the same action this task depends on
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// Short output or error summary of the latest terminal state
    #[serde(default)]
    pub output_summary: Option<String>,
    /// Per-attempt claim token; set while running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_token: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Materialise a task from a spec
    pub fn from_spec(action_id: impl Into<ActionId>, spec: TaskSpec) -> Self {
        let now = Utc::now();
        Self {
            id: spec.id,
            action_id: action_id.into(),
            prompt: spec.prompt,
            agent_type: spec.agent_type,
            model: spec.model,
            status: TaskStatus::Pending,
            dependencies: spec.dependencies,
            output_summary: None,
            claim_token: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Update the status, bumping `updated_at`
    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Specification for creating a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Pre-generated identifier, so callers can wire dependencies
    /// between tasks created in the same batch
    pub id: TaskId,
    /// Instruction for the agent
    pub prompt: String,
    /// Agent type
    pub agent_type: String,
    /// Optional model override
    #[serde(default)]
    pub model: Option<String>,
    /// Dependency task ids
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
}

impl TaskSpec {
    /// Create a spec with a fresh id and no dependencies
    pub fn new(prompt: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            agent_type: agent_type.into(),
            model: None,
            dependencies: Vec::new(),
        }
    }

    /// Set the model override
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the dependency list
    pub fn with_dependencies(mut self, dependencies: Vec<TaskId>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

/// Partial update applied to a task by the mutation engine.
///
/// `None` fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dependencies: Option<Vec<TaskId>>,
}

impl TaskPatch {
    /// Check whether the patch changes anything
    pub fn is_empty(&self) -> bool {
        self.prompt.is_none()
            && self.agent_type.is_none()
            && self.model.is_none()
            && self.dependencies.is_none()
    }

    /// Apply the patch to a task in place
    pub fn apply(&self, task: &mut Task) {
        if let Some(prompt) = &self.prompt {
            task.prompt = prompt.clone();
        }
        if let Some(agent_type) = &self.agent_type {
            task.agent_type = agent_type.clone();
        }
        if let Some(model) = &self.model {
            task.model = Some(model.clone());
        }
        if let Some(dependencies) = &self.dependencies {
            task.dependencies = dependencies.clone();
        }
        task.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_spec_starts_pending() {
        let spec = TaskSpec::new("fetch weather", "data_retrieval");
        let id = spec.id.clone();
        let task = Task::from_spec("action-1", spec);
        assert_eq!(task.id, id);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.dependencies.is_empty());
        assert!(task.output_summary.is_none());
        assert!(task.claim_token.is_none());
    }

    #[test]
    fn test_patch_applies_only_set_fields() {
        let task_spec = TaskSpec::new("original", "general").with_model("openai/gpt-4o");
        let mut task = Task::from_spec("action-1", task_spec);

        let patch = TaskPatch {
            prompt: Some("edited".to_string()),
            ..TaskPatch::default()
        };
        patch.apply(&mut task);

        assert_eq!(task.prompt, "edited");
        assert_eq!(task.agent_type, "general");
        assert_eq!(task.model.as_deref(), Some("openai/gpt-4o"));
    }

    #[test]
    fn test_empty_patch_reports_empty() {
        assert!(TaskPatch::default().is_empty());
        let patch = TaskPatch {
            dependencies: Some(vec!["t1".to_string()]),
            ..TaskPatch::default()
        };
        assert!(!patch.is_empty());
    }
}
