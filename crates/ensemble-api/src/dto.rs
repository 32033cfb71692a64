//! Request and response shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use ensemble_core::store::ActionSummary;
use ensemble_core::types::{
    Action, ActionStatus, Artifact, ArtifactKind, LogEntry, LogLevel, Task, TaskStatus,
};

/// Create action request body.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateActionRequest {
    pub root_prompt: String,
    #[serde(default)]
    pub title: Option<String>,
}

/// Patch action request body. A changed root prompt re-plans the graph.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateActionRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub root_prompt: Option<String>,
}

/// Add task request body.
#[derive(Debug, Clone, Deserialize)]
pub struct AddTaskRequest {
    pub prompt: String,
    #[serde(default = "default_agent_type")]
    pub agent_type: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

fn default_agent_type() -> String {
    "general".to_string()
}

/// Edit task request body; set fields are applied, the task and its
/// dependents are invalidated.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EditTaskRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dependencies: Option<Vec<String>>,
}

/// List query: optional status filter plus a row limit.
#[derive(Debug, Clone, Deserialize)]
pub struct ListActionsQuery {
    #[serde(default)]
    pub status: Option<ActionStatus>,
    #[serde(default = "default_list_limit")]
    pub limit: usize,
}

impl Default for ListActionsQuery {
    fn default() -> Self {
        Self {
            status: None,
            limit: default_list_limit(),
        }
    }
}

fn default_list_limit() -> usize {
    50
}

/// Action with its full task list.
#[derive(Debug, Clone, Serialize)]
pub struct ActionView {
    pub id: String,
    pub title: String,
    pub root_prompt: String,
    pub status: ActionStatus,
    pub tasks: Vec<TaskView>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ActionView {
    pub fn from_parts(action: Action, tasks: Vec<Task>) -> Self {
        Self {
            id: action.id,
            title: action.title,
            root_prompt: action.root_prompt,
            status: action.status,
            tasks: tasks.into_iter().map(TaskView::from).collect(),
            created_at: action.created_at,
            updated_at: action.updated_at,
        }
    }
}

/// Action row for listings.
#[derive(Debug, Clone, Serialize)]
pub struct ActionSummaryView {
    pub id: String,
    pub title: String,
    pub root_prompt: String,
    pub status: ActionStatus,
    pub task_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ActionSummary> for ActionSummaryView {
    fn from(summary: ActionSummary) -> Self {
        Self {
            id: summary.id,
            title: summary.title,
            root_prompt: summary.root_prompt,
            status: summary.status,
            task_count: summary.task_count,
            created_at: summary.created_at,
            updated_at: summary.updated_at,
        }
    }
}

/// Task as exposed to clients. Claim tokens stay internal.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub id: String,
    pub action_id: String,
    pub prompt: String,
    pub agent_type: String,
    pub model: Option<String>,
    pub status: TaskStatus,
    pub dependencies: Vec<String>,
    pub output_summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Task> for TaskView {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            action_id: task.action_id,
            prompt: task.prompt,
            agent_type: task.agent_type,
            model: task.model,
            status: task.status,
            dependencies: task.dependencies,
            output_summary: task.output_summary,
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}

/// Log row.
#[derive(Debug, Clone, Serialize)]
pub struct LogView {
    pub id: String,
    pub task_id: String,
    pub level: LogLevel,
    pub message: String,
    pub structured: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl From<LogEntry> for LogView {
    fn from(entry: LogEntry) -> Self {
        Self {
            id: entry.id,
            task_id: entry.task_id,
            level: entry.level,
            message: entry.message,
            structured: entry.structured,
            timestamp: entry.timestamp,
        }
    }
}

/// Artifact record; the blob itself is served out-of-band from
/// `storage_path`.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactView {
    pub id: String,
    pub task_id: String,
    pub action_id: String,
    pub kind: ArtifactKind,
    pub mime_type: Option<String>,
    pub storage_path: Option<String>,
    pub size_bytes: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl From<Artifact> for ArtifactView {
    fn from(artifact: Artifact) -> Self {
        Self {
            id: artifact.id,
            task_id: artifact.task_id,
            action_id: artifact.action_id,
            kind: artifact.kind,
            mime_type: artifact.mime_type,
            storage_path: artifact.storage_path,
            size_bytes: artifact.size_bytes,
            created_at: artifact.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_core::types::TaskSpec;

    #[test]
    fn test_task_view_hides_claim_token() {
        let mut task = Task::from_spec("a1", TaskSpec::new("p", "general"));
        task.claim_token = Some("secret".to_string());
        let json = serde_json::to_value(TaskView::from(task)).expect("serialize");
        assert!(json.get("claim_token").is_none());
        assert_eq!(json["agent_type"], "general");
    }

    #[test]
    fn test_add_task_request_defaults() {
        let request: AddTaskRequest =
            serde_json::from_str(r#"{"prompt":"do"}"#).expect("parse");
        assert_eq!(request.agent_type, "general");
        assert!(request.dependencies.is_empty());
        assert!(request.model.is_none());
    }

    #[test]
    fn test_list_query_defaults() {
        let query: ListActionsQuery = serde_json::from_str("{}").expect("parse");
        assert_eq!(query.limit, 50);
        assert!(query.status.is_none());
    }
}
