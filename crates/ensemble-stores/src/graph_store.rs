//! In-memory GraphStore implementation.
//!
//! Every operation takes the single state lock, which makes each one
//! atomic with respect to the others - the same guarantee a database
//! transaction gives the production store.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

use ensemble_core::graph;
use ensemble_core::store::{
    transition_allowed, ActionFilter, ActionPatch, ActionSummary, ClaimToken, GraphStore,
    StoreError, TaskCompletion,
};
use ensemble_core::types::{
    Action, ActionId, ActionStatus, Artifact, LogEntry, LogLevel, Task, TaskId, TaskOutput,
    TaskPatch, TaskSpec, TaskStatus,
};

const DEFAULT_LOG_RETENTION: usize = 1_000;

#[derive(Default)]
struct State {
    actions: HashMap<ActionId, Action>,
    tasks: HashMap<TaskId, Task>,
    /// Task ids per action in creation order
    task_order: HashMap<ActionId, Vec<TaskId>>,
    /// Currently attached outputs
    outputs: HashMap<TaskId, TaskOutput>,
    /// Detached outputs, kept for audit
    detached_outputs: Vec<TaskOutput>,
    artifacts: HashMap<String, Artifact>,
    /// Artifact ids per task in creation order
    artifact_order: HashMap<TaskId, Vec<String>>,
    logs: HashMap<TaskId, VecDeque<LogEntry>>,
}

/// In-memory implementation for development and testing
pub struct InMemoryGraphStore {
    state: RwLock<State>,
    log_retention: usize,
}

impl InMemoryGraphStore {
    /// Create a store with the default log retention.
    pub fn new() -> Self {
        Self::with_log_retention(DEFAULT_LOG_RETENTION)
    }

    /// Create a store retaining at most `log_retention` log rows per task.
    pub fn with_log_retention(log_retention: usize) -> Self {
        Self {
            state: RwLock::new(State::default()),
            log_retention: log_retention.max(1),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))
    }
}

impl Default for InMemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    fn tasks_of(&self, action_id: &str) -> Vec<Task> {
        self.task_order
            .get(action_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.tasks.get(id))
            .cloned()
            .collect()
    }

    fn task_mut(&mut self, task_id: &str) -> Result<&mut Task, StoreError> {
        self.tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::NotFound(format!("task '{task_id}'")))
    }

    fn detach_output(&mut self, task_id: &str) {
        if let Some(output) = self.outputs.remove(task_id) {
            self.detached_outputs.push(output);
        }
    }

    fn purge_task_records(&mut self, task_id: &str) {
        self.detach_output(task_id);
        self.logs.remove(task_id);
        for artifact_id in self.artifact_order.remove(task_id).into_iter().flatten() {
            self.artifacts.remove(&artifact_id);
        }
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn create_action(&self, title: &str, root_prompt: &str) -> Result<Action, StoreError> {
        let action = Action::new(title, root_prompt);
        let mut state = self.write()?;
        state
            .task_order
            .insert(action.id.clone(), Vec::new());
        state.actions.insert(action.id.clone(), action.clone());
        Ok(action)
    }

    async fn get_action(&self, action_id: &str) -> Result<Option<Action>, StoreError> {
        Ok(self.read()?.actions.get(action_id).cloned())
    }

    async fn list_actions(&self, filter: ActionFilter) -> Result<Vec<ActionSummary>, StoreError> {
        let state = self.read()?;
        let mut rows: Vec<ActionSummary> = state
            .actions
            .values()
            .filter(|a| filter.status.map_or(true, |s| a.status == s))
            .map(|a| ActionSummary {
                id: a.id.clone(),
                title: a.title.clone(),
                root_prompt: a.root_prompt.clone(),
                status: a.status,
                task_count: state
                    .task_order
                    .get(&a.id)
                    .map(Vec::len)
                    .unwrap_or_default(),
                created_at: a.created_at,
                updated_at: a.updated_at,
            })
            .collect();
        rows.sort_by_key(|a| std::cmp::Reverse(a.updated_at));
        if filter.limit > 0 {
            rows.truncate(filter.limit);
        }
        Ok(rows)
    }

    async fn update_action(
        &self,
        action_id: &str,
        patch: ActionPatch,
    ) -> Result<Action, StoreError> {
        let mut state = self.write()?;
        let action = state
            .actions
            .get_mut(action_id)
            .ok_or_else(|| StoreError::NotFound(format!("action '{action_id}'")))?;
        if let Some(title) = patch.title {
            action.title = title;
        }
        if let Some(root_prompt) = patch.root_prompt {
            action.root_prompt = root_prompt;
        }
        action.updated_at = chrono::Utc::now();
        Ok(action.clone())
    }

    async fn set_action_status(
        &self,
        action_id: &str,
        status: ActionStatus,
    ) -> Result<(), StoreError> {
        let mut state = self.write()?;
        let action = state
            .actions
            .get_mut(action_id)
            .ok_or_else(|| StoreError::NotFound(format!("action '{action_id}'")))?;
        action.set_status(status);
        Ok(())
    }

    async fn delete_action(&self, action_id: &str) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        if state.actions.remove(action_id).is_none() {
            return Ok(false);
        }
        let task_ids = state.task_order.remove(action_id).unwrap_or_default();
        for task_id in task_ids {
            state.tasks.remove(&task_id);
            state.purge_task_records(&task_id);
        }
        Ok(true)
    }

    async fn create_tasks(
        &self,
        action_id: &str,
        specs: Vec<TaskSpec>,
    ) -> Result<Vec<Task>, StoreError> {
        let mut state = self.write()?;
        if !state.actions.contains_key(action_id) {
            return Err(StoreError::NotFound(format!("action '{action_id}'")));
        }

        let mut created = Vec::with_capacity(specs.len());
        for spec in specs {
            if state.tasks.contains_key(&spec.id) {
                return Err(StoreError::Conflict(format!(
                    "task id '{}' already exists",
                    spec.id
                )));
            }
            created.push(Task::from_spec(action_id, spec));
        }

        // Validate the combined graph before touching anything.
        let mut combined = state.tasks_of(action_id);
        combined.extend(created.iter().cloned());
        graph::validate(&combined)?;

        for task in &created {
            state.tasks.insert(task.id.clone(), task.clone());
            state
                .task_order
                .entry(action_id.to_string())
                .or_default()
                .push(task.id.clone());
        }
        Ok(created)
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.read()?.tasks.get(task_id).cloned())
    }

    async fn list_tasks(&self, action_id: &str) -> Result<Vec<Task>, StoreError> {
        Ok(self.read()?.tasks_of(action_id))
    }

    async fn update_task(&self, task_id: &str, patch: TaskPatch) -> Result<Task, StoreError> {
        let mut state = self.write()?;
        let task = state
            .tasks
            .get(task_id)
            .ok_or_else(|| StoreError::NotFound(format!("task '{task_id}'")))?;

        let mut patched = task.clone();
        patch.apply(&mut patched);

        // Re-validate the whole action graph with the patched node.
        let mut combined = state.tasks_of(&patched.action_id);
        if let Some(slot) = combined.iter_mut().find(|t| t.id == *task_id) {
            *slot = patched.clone();
        }
        graph::validate(&combined)?;

        state.tasks.insert(task_id.to_string(), patched.clone());
        Ok(patched)
    }

    async fn delete_task(&self, task_id: &str) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        let Some(task) = state.tasks.get(task_id).cloned() else {
            return Ok(false);
        };
        let tasks = state.tasks_of(&task.action_id);
        let dependents = graph::dependents(&tasks, task_id);
        if !dependents.is_empty() {
            return Err(StoreError::Conflict(format!(
                "task '{task_id}' still has dependents: {dependents:?}"
            )));
        }
        state.tasks.remove(task_id);
        if let Some(order) = state.task_order.get_mut(&task.action_id) {
            order.retain(|id| id != task_id);
        }
        state.purge_task_records(task_id);
        Ok(true)
    }

    async fn claim_task(&self, task_id: &str) -> Result<ClaimToken, StoreError> {
        let mut state = self.write()?;
        let tasks = state
            .tasks
            .get(task_id)
            .map(|t| state.tasks_of(&t.action_id))
            .ok_or_else(|| StoreError::NotFound(format!("task '{task_id}'")))?;

        let task = state.task_mut(task_id)?;
        if !transition_allowed(task.status, TaskStatus::Running) {
            return Err(StoreError::InvalidTransition {
                from: task.status,
                to: TaskStatus::Running,
            });
        }
        // A claim is only valid while every dependency is completed;
        // an invalidation racing the scheduler must win here.
        let completed: std::collections::HashSet<&str> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id.as_str())
            .collect();
        if !task
            .dependencies
            .iter()
            .all(|d| completed.contains(d.as_str()))
        {
            return Err(StoreError::InvalidTransition {
                from: task.status,
                to: TaskStatus::Running,
            });
        }

        let token = uuid::Uuid::new_v4().to_string();
        task.claim_token = Some(token.clone());
        task.set_status(TaskStatus::Running);
        Ok(token)
    }

    async fn complete_task(
        &self,
        task_id: &str,
        token: &str,
        completion: TaskCompletion,
    ) -> Result<TaskOutput, StoreError> {
        let mut state = self.write()?;
        let task = state.task_mut(task_id)?;
        if task.status != TaskStatus::Running || task.claim_token.as_deref() != Some(token) {
            return Err(StoreError::StaleClaim(task_id.to_string()));
        }
        let action_id = task.action_id.clone();
        task.set_status(TaskStatus::Completed);
        task.output_summary = Some(completion.summary.clone());
        task.claim_token = None;

        let mut artifact_ids = Vec::with_capacity(completion.artifacts.len());
        for draft in completion.artifacts {
            let artifact = draft.into_artifact(task_id, action_id.clone());
            artifact_ids.push(artifact.id.clone());
            state
                .artifact_order
                .entry(task_id.to_string())
                .or_default()
                .push(artifact.id.clone());
            state.artifacts.insert(artifact.id.clone(), artifact);
        }

        // Replace any previous output atomically with the transition.
        state.detach_output(task_id);
        let output =
            TaskOutput::new(task_id, completion.summary).with_artifact_ids(artifact_ids);
        state.outputs.insert(task_id.to_string(), output.clone());
        Ok(output)
    }

    async fn fail_task(&self, task_id: &str, token: &str, error: &str) -> Result<(), StoreError> {
        let mut state = self.write()?;
        let task = state.task_mut(task_id)?;
        if task.status != TaskStatus::Running || task.claim_token.as_deref() != Some(token) {
            return Err(StoreError::StaleClaim(task_id.to_string()));
        }
        task.set_status(TaskStatus::Failed);
        task.output_summary = Some(error.to_string());
        task.claim_token = None;
        Ok(())
    }

    async fn release_claim(&self, task_id: &str, token: &str) -> Result<(), StoreError> {
        let mut state = self.write()?;
        let task = state.task_mut(task_id)?;
        if task.status != TaskStatus::Running || task.claim_token.as_deref() != Some(token) {
            return Err(StoreError::StaleClaim(task_id.to_string()));
        }
        task.set_status(TaskStatus::Pending);
        task.claim_token = None;
        Ok(())
    }

    async fn reset_tasks(&self, task_ids: &[TaskId]) -> Result<(), StoreError> {
        let mut state = self.write()?;
        for task_id in task_ids {
            let Some(task) = state.tasks.get_mut(task_id) else {
                continue;
            };
            task.set_status(TaskStatus::Pending);
            task.output_summary = None;
            task.claim_token = None;
            state.detach_output(task_id);
        }
        Ok(())
    }

    async fn get_output(&self, task_id: &str) -> Result<Option<TaskOutput>, StoreError> {
        Ok(self.read()?.outputs.get(task_id).cloned())
    }

    async fn append_log(
        &self,
        task_id: &str,
        level: LogLevel,
        message: &str,
        structured: Option<Value>,
    ) -> Result<LogEntry, StoreError> {
        let mut state = self.write()?;
        if !state.tasks.contains_key(task_id) {
            return Err(StoreError::NotFound(format!("task '{task_id}'")));
        }
        let mut entry = LogEntry::new(task_id, level, message);
        if let Some(structured) = structured {
            entry = entry.with_structured(structured);
        }
        let retention = self.log_retention;
        let logs = state.logs.entry(task_id.to_string()).or_default();
        logs.push_back(entry.clone());
        while logs.len() > retention {
            logs.pop_front();
        }
        Ok(entry)
    }

    async fn list_logs(&self, task_id: &str) -> Result<Vec<LogEntry>, StoreError> {
        Ok(self
            .read()?
            .logs
            .get(task_id)
            .map(|logs| logs.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_artifacts(&self, task_id: &str) -> Result<Vec<Artifact>, StoreError> {
        let state = self.read()?;
        Ok(state
            .artifact_order
            .get(task_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.artifacts.get(id))
            .cloned()
            .collect())
    }

    async fn get_artifact(&self, artifact_id: &str) -> Result<Option<Artifact>, StoreError> {
        Ok(self.read()?.artifacts.get(artifact_id).cloned())
    }
}
