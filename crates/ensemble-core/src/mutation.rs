//! Mutation engine - live graph edits with surgical invalidation.
//!
//! Add, edit, delete and reset operate while a run may be in flight.
//! Every operation takes the action's mutation lock, so concurrent
//! edits serialise; an edit's invalidation set is the task plus its
//! transitive dependents, reset together after in-flight members have
//! been cancelled (bounded by a grace window).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::event::{ActionEvent, EventBus};
use crate::executor::InflightRegistry;
use crate::graph::{self, GraphError};
use crate::store::{GraphStore, StoreError};
use crate::types::{Task, TaskId, TaskPatch, TaskSpec, TaskStatus};

const RELEASE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Mutation errors
#[derive(Debug, Error)]
pub enum MutationError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("task '{task}' still has dependents: {dependents:?}")]
    HasDependents {
        task: TaskId,
        dependents: Vec<TaskId>,
    },
}

/// Mutation engine configuration
#[derive(Debug, Clone)]
pub struct MutationConfig {
    /// How long to wait for a cancelled agent to release its claim
    /// before force-releasing it.
    pub cancel_grace: Duration,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            cancel_grace: Duration::from_secs(5),
        }
    }
}

/// The mutation engine.
pub struct MutationEngine {
    store: Arc<dyn GraphStore>,
    bus: Arc<dyn EventBus>,
    inflight: Arc<InflightRegistry>,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    config: MutationConfig,
}

impl MutationEngine {
    pub fn new(
        store: Arc<dyn GraphStore>,
        bus: Arc<dyn EventBus>,
        inflight: Arc<InflightRegistry>,
        config: MutationConfig,
    ) -> Self {
        Self {
            store,
            bus,
            inflight,
            locks: StdMutex::new(HashMap::new()),
            config,
        }
    }

    /// Edit a task and invalidate it together with everything
    /// transitively downstream. Returns the task in its reset state.
    pub async fn edit_task(
        &self,
        task_id: &str,
        patch: TaskPatch,
    ) -> Result<Task, MutationError> {
        let task = self.load_task(task_id).await?;
        let action_id = task.action_id.clone();
        let lock = self.action_lock(&action_id);
        let _guard = lock.lock().await;

        // The store validates the patched graph atomically; an invalid
        // edit leaves everything untouched.
        self.store.update_task(task_id, patch).await?;
        self.invalidate(&action_id, task_id).await?;

        self.load_task(task_id).await.map_err(Into::into)
    }

    /// Add a task to the action. The new task starts pending, so no
    /// invalidation is needed.
    pub async fn add_task(
        &self,
        action_id: &str,
        spec: TaskSpec,
    ) -> Result<Task, MutationError> {
        let lock = self.action_lock(action_id);
        let _guard = lock.lock().await;

        let mut created = self.store.create_tasks(action_id, vec![spec]).await?;
        let task = created
            .pop()
            .ok_or_else(|| MutationError::NotFound("created task".to_string()))?;
        tracing::info!(action_id = %action_id, task_id = %task.id, "task added");
        self.inflight.nudge(action_id);
        Ok(task)
    }

    /// Delete a task. Only allowed while nothing depends on it; callers
    /// must first edit dependents away.
    pub async fn delete_task(&self, task_id: &str) -> Result<(), MutationError> {
        let task = self.load_task(task_id).await?;
        let action_id = task.action_id.clone();
        let lock = self.action_lock(&action_id);
        let _guard = lock.lock().await;

        let tasks = self.store.list_tasks(&action_id).await?;
        let dependents = graph::dependents(&tasks, task_id);
        if !dependents.is_empty() {
            return Err(MutationError::HasDependents {
                task: task_id.to_string(),
                dependents,
            });
        }

        if self.inflight.cancel(task_id) {
            let claim = tasks
                .iter()
                .find(|t| t.id == *task_id)
                .and_then(|t| t.claim_token.clone());
            self.await_release(&[(task_id.to_string(), claim)]).await;
        }
        self.store.delete_task(task_id).await?;
        tracing::info!(action_id = %action_id, task_id = %task_id, "task deleted");
        self.inflight.nudge(&action_id);
        Ok(())
    }

    /// Force a re-run of a task: identity edit, full invalidation.
    pub async fn reset_task(&self, task_id: &str) -> Result<Task, MutationError> {
        let task = self.load_task(task_id).await?;
        let action_id = task.action_id.clone();
        let lock = self.action_lock(&action_id);
        let _guard = lock.lock().await;

        self.invalidate(&action_id, task_id).await?;
        self.load_task(task_id).await.map_err(Into::into)
    }

    /// Reset the task and its transitive dependents to pending. Running
    /// members are cancelled first and announced via `task.recovered`.
    async fn invalidate(&self, action_id: &str, task_id: &str) -> Result<(), MutationError> {
        let tasks = self.store.list_tasks(action_id).await?;
        let mut set: HashSet<TaskId> = graph::transitive_dependents(&tasks, task_id);
        set.insert(task_id.to_string());

        let running: Vec<(TaskId, Option<String>)> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Running && set.contains(&t.id))
            .map(|t| (t.id.clone(), t.claim_token.clone()))
            .collect();
        for (id, _) in &running {
            self.inflight.cancel(id);
        }
        if !running.is_empty() {
            self.await_release(&running).await;
        }

        let ids: Vec<TaskId> = set.into_iter().collect();
        // Reset force-releases any claim the grace window left behind.
        self.store.reset_tasks(&ids).await?;
        tracing::info!(
            action_id = %action_id,
            task_id = %task_id,
            invalidated = ids.len(),
            cancelled = running.len(),
            "downstream invalidated"
        );

        for (id, _) in &running {
            self.bus
                .publish(action_id, ActionEvent::TaskRecovered { task_id: id.clone() })
                .await;
        }
        self.inflight.nudge(action_id);
        Ok(())
    }

    /// Wait for the cancelled attempts to release the claims observed
    /// at cancellation time, bounded by the grace window. A task
    /// re-claimed under a fresh token counts as released.
    async fn await_release(&self, claims: &[(TaskId, Option<String>)]) {
        let deadline = Instant::now() + self.config.cancel_grace;
        loop {
            let mut still_held = false;
            for (id, claim) in claims {
                match self.store.get_task(id).await {
                    Ok(Some(task))
                        if task.status == TaskStatus::Running
                            && task.claim_token == *claim =>
                    {
                        still_held = true;
                        break;
                    }
                    _ => {}
                }
            }
            if !still_held {
                return;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    grace = ?self.config.cancel_grace,
                    "cancel grace window elapsed, force-releasing claims"
                );
                return;
            }
            sleep(RELEASE_POLL_INTERVAL).await;
        }
    }

    async fn load_task(&self, task_id: &str) -> Result<Task, StoreError> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("task '{task_id}'")))
    }

    fn action_lock(&self, action_id: &str) -> Arc<Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(action_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
