//! GraphStore - the persistence seam.
//!
//! The store is the sole writer of durable state. The executor and the
//! mutation engine go through its transactional operations; everything
//! here is atomic with respect to a single action. It also enforces the
//! task status transition table:
//!
//! pending -> running   (scheduler claim, dependencies completed)
//! running -> completed (agent success, claim token matches)
//! running -> failed    (terminal agent failure, claim token matches)
//! terminal -> pending  (invalidation / reset)

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::graph::{self, GraphError};
use crate::types::{
    Action, ActionId, ActionStatus, Artifact, ArtifactDraft, LogEntry, LogLevel, Task, TaskId,
    TaskOutput, TaskPatch, TaskSpec, TaskStatus,
};

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid transition: {from:?} -> {to:?}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
    #[error("stale claim for task '{0}'")]
    StaleClaim(TaskId),
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Per-attempt claim identifier; stale completions are detected by
/// comparing it against the token recorded on the running task.
pub type ClaimToken = String;

/// Filter for [`GraphStore::list_actions`]
#[derive(Debug, Clone, Default)]
pub struct ActionFilter {
    /// Restrict to a single status
    pub status: Option<ActionStatus>,
    /// Maximum rows returned (0 = unbounded)
    pub limit: usize,
}

/// Lightweight action row for listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSummary {
    pub id: ActionId,
    pub title: String,
    pub root_prompt: String,
    pub status: ActionStatus,
    pub task_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields updatable on an action
#[derive(Debug, Clone, Default)]
pub struct ActionPatch {
    pub title: Option<String>,
    pub root_prompt: Option<String>,
}

/// Successful task result as handed to [`GraphStore::complete_task`]
#[derive(Debug, Clone)]
pub struct TaskCompletion {
    /// Short textual summary
    pub summary: String,
    /// Artifacts produced during the attempt
    pub artifacts: Vec<ArtifactDraft>,
}

impl TaskCompletion {
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

/// GraphStore trait - async interface over the persistent graph.
#[async_trait]
pub trait GraphStore: Send + Sync {
    // -- actions ----------------------------------------------------------

    /// Create a draft action.
    async fn create_action(&self, title: &str, root_prompt: &str) -> Result<Action, StoreError>;

    /// Load an action by id.
    async fn get_action(&self, action_id: &str) -> Result<Option<Action>, StoreError>;

    /// List action summaries, most recently updated first.
    async fn list_actions(&self, filter: ActionFilter) -> Result<Vec<ActionSummary>, StoreError>;

    /// Patch title / root prompt.
    async fn update_action(&self, action_id: &str, patch: ActionPatch)
        -> Result<Action, StoreError>;

    /// Set the action status.
    async fn set_action_status(
        &self,
        action_id: &str,
        status: ActionStatus,
    ) -> Result<(), StoreError>;

    /// Delete the action and, by composition, its tasks, outputs,
    /// artifacts and logs. Returns false if it did not exist.
    async fn delete_action(&self, action_id: &str) -> Result<bool, StoreError>;

    // -- tasks ------------------------------------------------------------

    /// Create a batch of tasks atomically. Rejects the whole batch if the
    /// resulting graph would have a cycle or an unknown dependency.
    async fn create_tasks(
        &self,
        action_id: &str,
        specs: Vec<TaskSpec>,
    ) -> Result<Vec<Task>, StoreError>;

    /// Load a task by id.
    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError>;

    /// All tasks of an action in creation order.
    async fn list_tasks(&self, action_id: &str) -> Result<Vec<Task>, StoreError>;

    /// Apply a patch; the resulting graph is re-validated atomically.
    /// Does NOT reset status - that is the mutation engine's job.
    async fn update_task(&self, task_id: &str, patch: TaskPatch) -> Result<Task, StoreError>;

    /// Delete a single task. Rejected with [`StoreError::Conflict`] while
    /// other tasks depend on it.
    async fn delete_task(&self, task_id: &str) -> Result<bool, StoreError>;

    /// Atomic claim: pending -> running, returns a fresh claim token.
    /// Any other current status is an [`StoreError::InvalidTransition`].
    async fn claim_task(&self, task_id: &str) -> Result<ClaimToken, StoreError>;

    /// Commit a successful attempt: persists output + artifacts and moves
    /// running -> completed. Fails with [`StoreError::StaleClaim`] when the
    /// claim no longer matches (the task was invalidated mid-flight).
    async fn complete_task(
        &self,
        task_id: &str,
        token: &str,
        completion: TaskCompletion,
    ) -> Result<TaskOutput, StoreError>;

    /// Commit a terminal failure: running -> failed, summary = error.
    /// Claim-checked like [`GraphStore::complete_task`].
    async fn fail_task(&self, task_id: &str, token: &str, error: &str) -> Result<(), StoreError>;

    /// Cancellation path: release a still-held claim, running -> pending,
    /// discarding nothing but the claim itself. Stale claims are a no-op
    /// error so a raced invalidation wins quietly.
    async fn release_claim(&self, task_id: &str, token: &str) -> Result<(), StoreError>;

    /// Invalidation: set every listed task to pending, clear summaries and
    /// claims, detach (not delete) attached outputs. Atomic across the set.
    async fn reset_tasks(&self, task_ids: &[TaskId]) -> Result<(), StoreError>;

    /// Currently attached output of a task.
    async fn get_output(&self, task_id: &str) -> Result<Option<TaskOutput>, StoreError>;

    // -- logs & artifacts -------------------------------------------------

    /// Append a log entry, pruning beyond the retention bound.
    async fn append_log(
        &self,
        task_id: &str,
        level: LogLevel,
        message: &str,
        structured: Option<Value>,
    ) -> Result<LogEntry, StoreError>;

    /// Logs of a task in append order.
    async fn list_logs(&self, task_id: &str) -> Result<Vec<LogEntry>, StoreError>;

    /// Artifacts produced by a task.
    async fn list_artifacts(&self, task_id: &str) -> Result<Vec<Artifact>, StoreError>;

    /// Load an artifact record by id.
    async fn get_artifact(&self, artifact_id: &str) -> Result<Option<Artifact>, StoreError>;

    // -- graph queries ----------------------------------------------------

    /// Direct dependents of a task within its action.
    async fn dependents(&self, task_id: &str) -> Result<Vec<TaskId>, StoreError> {
        let task = self
            .get_task(task_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("task '{task_id}'")))?;
        let tasks = self.list_tasks(&task.action_id).await?;
        Ok(graph::dependents(&tasks, task_id))
    }

    /// Transitive dependents of a task within its action.
    async fn transitive_dependents(&self, task_id: &str) -> Result<HashSet<TaskId>, StoreError> {
        let task = self
            .get_task(task_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("task '{task_id}'")))?;
        let tasks = self.list_tasks(&task.action_id).await?;
        Ok(graph::transitive_dependents(&tasks, task_id))
    }

    /// Transitive ancestors of a task within its action.
    async fn ancestors(&self, task_id: &str) -> Result<HashSet<TaskId>, StoreError> {
        let task = self
            .get_task(task_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("task '{task_id}'")))?;
        let tasks = self.list_tasks(&task.action_id).await?;
        Ok(graph::ancestors(&tasks, task_id))
    }
}

/// Check a status transition against the table in the module docs.
pub fn transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    matches!(
        (from, to),
        (TaskStatus::Pending, TaskStatus::Running)
            | (TaskStatus::Running, TaskStatus::Completed)
            | (TaskStatus::Running, TaskStatus::Failed)
            | (TaskStatus::Completed, TaskStatus::Pending)
            | (TaskStatus::Failed, TaskStatus::Pending)
    )
}

/// Derive the action status from its tasks, per the model invariant:
/// completed iff all tasks completed; failed iff some task failed and
/// nothing is running or schedulable; running while progress is possible.
pub fn derive_action_status(tasks: &[Task]) -> ActionStatus {
    if tasks.is_empty() {
        return ActionStatus::Draft;
    }
    if tasks.iter().all(|t| t.status == TaskStatus::Completed) {
        return ActionStatus::Completed;
    }
    let any_running = tasks.iter().any(|t| t.status == TaskStatus::Running);
    let any_ready = !graph::ready_tasks(tasks).is_empty();
    if any_running || any_ready {
        return ActionStatus::Running;
    }
    if tasks.iter().any(|t| t.status == TaskStatus::Failed) {
        return ActionStatus::Failed;
    }
    // Pending tasks blocked behind nothing runnable: planner produced an
    // empty frontier, treat as draft so a future run can pick it up.
    ActionStatus::Draft
}
