//! Orchestrator - create, run, mutate, observe.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;

use ensemble_core::event::{ActionEvent, EventBus, Subscription};
use ensemble_core::CancellationToken;
use ensemble_core::executor::{Executor, InflightRegistry};
use ensemble_core::graph;
use ensemble_core::mutation::{MutationEngine, MutationError};
use ensemble_core::planner::{specs_from_plan, PlanError, Planner};
use ensemble_core::store::{
    ActionFilter, ActionPatch, ActionSummary, GraphStore, StoreError,
};
use ensemble_core::types::{
    Action, ActionId, ActionStatus, Artifact, LogEntry, Task, TaskPatch, TaskSpec, TaskStatus,
};

const TITLE_FALLBACK_CHARS: usize = 80;

/// Orchestrator errors
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("planner error: {0}")]
    Plan(#[from] PlanError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("mutation error: {0}")]
    Mutation(#[from] MutationError),
    #[error("graph error: {0}")]
    Graph(#[from] graph::GraphError),
    #[error("action retries exhausted after {attempts} attempts")]
    RetryExhausted { attempts: u32 },
}

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Operator-initiated replays allowed per action
    pub action_retry_max_attempts: u32,
    /// Keepalive interval handed to subscriptions
    pub ping_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            action_retry_max_attempts: 3,
            ping_interval: Duration::from_secs(15),
        }
    }
}

struct RunHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// The orchestrator - wires planner, store, bus, executor and the
/// mutation engine behind one surface.
pub struct Orchestrator {
    store: Arc<dyn GraphStore>,
    bus: Arc<dyn EventBus>,
    planner: Arc<dyn Planner>,
    executor: Arc<Executor>,
    mutations: Arc<MutationEngine>,
    runs: Arc<StdMutex<HashMap<ActionId, RunHandle>>>,
    retry_attempts: StdMutex<HashMap<ActionId, u32>>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn GraphStore>,
        bus: Arc<dyn EventBus>,
        planner: Arc<dyn Planner>,
        executor: Arc<Executor>,
        mutations: Arc<MutationEngine>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            bus,
            planner,
            executor,
            mutations,
            runs: Arc::new(StdMutex::new(HashMap::new())),
            retry_attempts: StdMutex::new(HashMap::new()),
            config,
        }
    }

    /// Shared in-flight registry (exposed for diagnostics).
    pub fn inflight(&self) -> Arc<InflightRegistry> {
        self.executor.inflight()
    }

    // -- creation ---------------------------------------------------------

    /// Plan and persist a new action. The action starts as draft; a
    /// planner that cannot produce a DAG degrades to a single-task plan
    /// rather than failing creation.
    pub async fn create_action(
        &self,
        root_prompt: &str,
        title: Option<String>,
    ) -> Result<(Action, Vec<Task>), OrchestratorError> {
        if root_prompt.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "root_prompt must not be empty".to_string(),
            ));
        }

        let title = match title.filter(|t| !t.trim().is_empty()) {
            Some(title) => title,
            None => match self.planner.suggest_title(root_prompt).await {
                Some(title) => title,
                None => prompt_prefix(root_prompt),
            },
        };

        let planned = self.planner.plan(root_prompt, &[]).await?;
        let specs = specs_from_plan(planned);

        let action = self.store.create_action(&title, root_prompt).await?;
        let tasks = self.store.create_tasks(&action.id, specs).await?;
        tracing::info!(
            action_id = %action.id,
            title = %action.title,
            task_count = tasks.len(),
            "action created"
        );
        Ok((action, tasks))
    }

    /// Patch an action. A changed root prompt triggers a re-plan: the
    /// old graph is discarded and planned afresh.
    pub async fn update_action(
        &self,
        action_id: &str,
        title: Option<String>,
        root_prompt: Option<String>,
    ) -> Result<(Action, Vec<Task>), OrchestratorError> {
        let action = self.require_action(action_id).await?;
        let replan = root_prompt
            .as_deref()
            .is_some_and(|p| !p.trim().is_empty() && p != action.root_prompt);

        let action = self
            .store
            .update_action(
                action_id,
                ActionPatch {
                    title,
                    root_prompt: root_prompt.clone(),
                },
            )
            .await?;

        if replan {
            self.replan(&action).await?;
        }
        let tasks = self.store.list_tasks(action_id).await?;
        Ok((action, tasks))
    }

    async fn replan(&self, action: &Action) -> Result<(), OrchestratorError> {
        // A live run would race the teardown; stop it first.
        self.abort_action(&action.id).await;

        let existing = self.store.list_tasks(&action.id).await?;
        let order = graph::topological_order(&existing)?;
        for task_id in order.iter().rev() {
            self.store.delete_task(task_id).await?;
        }

        let planned = self.planner.plan(&action.root_prompt, &existing).await?;
        let specs = specs_from_plan(planned);
        self.store.create_tasks(&action.id, specs).await?;
        self.store
            .set_action_status(&action.id, ActionStatus::Draft)
            .await?;
        tracing::info!(action_id = %action.id, "action replanned");
        Ok(())
    }

    // -- reads ------------------------------------------------------------

    pub async fn get_action(
        &self,
        action_id: &str,
    ) -> Result<(Action, Vec<Task>), OrchestratorError> {
        let action = self.require_action(action_id).await?;
        let tasks = self.store.list_tasks(action_id).await?;
        Ok((action, tasks))
    }

    pub async fn list_actions(
        &self,
        filter: ActionFilter,
    ) -> Result<Vec<ActionSummary>, OrchestratorError> {
        Ok(self.store.list_actions(filter).await?)
    }

    pub async fn list_logs(&self, task_id: &str) -> Result<Vec<LogEntry>, OrchestratorError> {
        Ok(self.store.list_logs(task_id).await?)
    }

    pub async fn get_artifact(
        &self,
        artifact_id: &str,
    ) -> Result<Option<Artifact>, OrchestratorError> {
        Ok(self.store.get_artifact(artifact_id).await?)
    }

    // -- runs -------------------------------------------------------------

    /// Start (or resume) execution. Idempotent per action: a second call
    /// while a run is in progress returns `false` without starting
    /// another one - edits during a run go through the mutation
    /// protocol instead.
    pub async fn run_action(&self, action_id: &str) -> Result<bool, OrchestratorError> {
        self.require_action(action_id).await?;
        let tasks = self.store.list_tasks(action_id).await?;
        if !tasks.iter().any(|t| t.status == TaskStatus::Pending) {
            return Err(OrchestratorError::Validation(
                "no pending tasks to run".to_string(),
            ));
        }

        let mut runs = lock(&self.runs);
        if let Some(existing) = runs.get(action_id) {
            if !existing.handle.is_finished() {
                tracing::info!(action_id = %action_id, "run already in progress");
                return Ok(false);
            }
        }

        let cancel = CancellationToken::new();
        let executor = self.executor.clone();
        let runs_map = self.runs.clone();
        let id = action_id.to_string();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            match executor.run(&id, token).await {
                Ok(outcome) => {
                    tracing::debug!(action_id = %id, outcome = ?outcome, "run task finished")
                }
                Err(error) => {
                    tracing::error!(action_id = %id, error = %error, "run task errored")
                }
            }
            lock(&runs_map).remove(&id);
        });
        runs.insert(action_id.to_string(), RunHandle { cancel, handle });
        Ok(true)
    }

    /// Signal the active run (if any) to abort and wait for it to wind
    /// down. Returns whether a run was aborted.
    pub async fn abort_action(&self, action_id: &str) -> bool {
        let handle = {
            let mut runs = lock(&self.runs);
            runs.remove(action_id)
        };
        let Some(run) = handle else {
            return false;
        };
        run.cancel.cancel();
        if run.handle.await.is_err() {
            tracing::warn!(action_id = %action_id, "aborted run panicked");
        }
        true
    }

    /// Whether a run is currently active for the action.
    pub fn is_running(&self, action_id: &str) -> bool {
        lock(&self.runs)
            .get(action_id)
            .is_some_and(|run| !run.handle.is_finished())
    }

    /// Operator-initiated replay of a failed action: resets failed
    /// tasks and starts a new run, bounded by the retry budget.
    pub async fn retry_action(&self, action_id: &str) -> Result<u32, OrchestratorError> {
        let action = self.require_action(action_id).await?;
        if action.status != ActionStatus::Failed {
            return Err(OrchestratorError::Validation(format!(
                "action is {:?}, only failed actions can be retried",
                action.status
            )));
        }

        let attempt = {
            let mut attempts = lock(&self.retry_attempts);
            let entry = attempts.entry(action_id.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        if attempt > self.config.action_retry_max_attempts {
            return Err(OrchestratorError::RetryExhausted { attempts: attempt });
        }

        // The failed run's task may still be winding down; join it so
        // the new run is not mistaken for a duplicate.
        self.abort_action(action_id).await;

        let tasks = self.store.list_tasks(action_id).await?;
        let failed: Vec<_> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .map(|t| t.id.clone())
            .collect();
        self.store.reset_tasks(&failed).await?;

        self.bus
            .publish(
                action_id,
                ActionEvent::ActionRetrying {
                    action_id: action_id.to_string(),
                    attempt,
                },
            )
            .await;
        tracing::info!(action_id = %action_id, attempt, "action retrying");
        self.run_action(action_id).await?;
        Ok(attempt)
    }

    // -- mutations --------------------------------------------------------

    /// Edit a task; it and its transitive dependents are invalidated.
    pub async fn edit_task(
        &self,
        task_id: &str,
        patch: TaskPatch,
    ) -> Result<Task, OrchestratorError> {
        Ok(self.mutations.edit_task(task_id, patch).await?)
    }

    /// Add a task to an action.
    pub async fn add_task(
        &self,
        action_id: &str,
        spec: TaskSpec,
    ) -> Result<Task, OrchestratorError> {
        self.require_action(action_id).await?;
        Ok(self.mutations.add_task(action_id, spec).await?)
    }

    /// Delete a task nothing depends on.
    pub async fn delete_task(&self, task_id: &str) -> Result<(), OrchestratorError> {
        Ok(self.mutations.delete_task(task_id).await?)
    }

    /// Force a re-run of a task (identity edit).
    pub async fn reset_task(&self, task_id: &str) -> Result<Task, OrchestratorError> {
        Ok(self.mutations.reset_task(task_id).await?)
    }

    /// Delete an action and everything it owns.
    pub async fn delete_action(&self, action_id: &str) -> Result<bool, OrchestratorError> {
        self.abort_action(action_id).await;
        Ok(self.store.delete_action(action_id).await?)
    }

    // -- events -----------------------------------------------------------

    /// Subscribe to an action's event stream. The first delivery is a
    /// snapshot of the current action and task list.
    pub async fn subscribe(&self, action_id: &str) -> Result<Subscription, OrchestratorError> {
        let action = self.require_action(action_id).await?;
        let tasks = self.store.list_tasks(action_id).await?;
        let status = action.status;
        let snapshot = ActionEvent::Snapshot {
            action,
            tasks,
            status,
        };
        let rx = self.bus.subscribe(action_id);
        Ok(Subscription::with_ping_interval(
            snapshot,
            rx,
            self.config.ping_interval,
        ))
    }

    async fn require_action(&self, action_id: &str) -> Result<Action, OrchestratorError> {
        self.store
            .get_action(action_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("action '{action_id}'")))
    }
}

fn prompt_prefix(root_prompt: &str) -> String {
    root_prompt.chars().take(TITLE_FALLBACK_CHARS).collect()
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
