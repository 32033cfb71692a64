//! Executor - per-action ready-set scheduler.
//!
//! Evented and cooperative: the loop claims ready tasks (pending with
//! every dependency completed), runs them concurrently up to the
//! admission bound, and reacts to completions. No thread-per-task, no
//! polling sleeps; the loop blocks only on attempt completions and
//! mutation nudges.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentError, AgentOutput, AgentRegistry, AgentRequest, DependencyOutput, LogSink};
use crate::event::{ActionEvent, EventBus};
use crate::store::{derive_action_status, ClaimToken, GraphStore, StoreError, TaskCompletion};
use crate::types::{ActionStatus, ArtifactKind, LogLevel, Task, TaskId};

const LOG_PERSIST_ATTEMPTS: u32 = 3;
const LOG_PERSIST_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Executor tuning knobs
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Admission bound per action
    pub max_concurrent_tasks: usize,
    /// Attempts per task, inclusive of the first try
    pub retry_max_attempts: u32,
    /// Exponential backoff base
    pub retry_base_backoff: Duration,
    /// Per-attempt deadline; a miss is a synthetic transient failure
    pub task_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 8,
            retry_max_attempts: 3,
            retry_base_backoff: Duration::from_millis(500),
            task_timeout: Duration::from_secs(300),
        }
    }
}

/// Executor errors
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("action not found: {0}")]
    ActionNotFound(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every task completed
    Completed,
    /// No further progress was possible and at least one task failed
    Failed,
    /// The run was aborted; the action went back to draft
    Cancelled,
}

/// Shared coordination between the executor and the mutation engine:
/// cancellation tokens of in-flight attempts, plus per-action wakeups
/// so a mutation can make a blocked scheduling loop re-evaluate.
#[derive(Default)]
pub struct InflightRegistry {
    tokens: Mutex<HashMap<TaskId, CancellationToken>>,
    notifiers: Mutex<HashMap<String, Arc<Notify>>>,
}

impl InflightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh cancellation token for an attempt.
    pub fn register(&self, task_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.lock_tokens().insert(task_id.to_string(), token.clone());
        token
    }

    /// Drop the attempt's token once it has committed or released.
    pub fn unregister(&self, task_id: &str) {
        self.lock_tokens().remove(task_id);
    }

    /// Cancel an in-flight attempt. Returns false when nothing was
    /// in flight for the task.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.lock_tokens().get(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether the task has an in-flight attempt.
    pub fn is_inflight(&self, task_id: &str) -> bool {
        self.lock_tokens().contains_key(task_id)
    }

    /// Per-action wakeup handle.
    pub fn notifier(&self, action_id: &str) -> Arc<Notify> {
        let mut notifiers = match self.notifiers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        notifiers
            .entry(action_id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Wake the action's scheduling loop, if one is waiting.
    pub fn nudge(&self, action_id: &str) {
        self.notifier(action_id).notify_one();
    }

    fn lock_tokens(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, CancellationToken>> {
        match self.tokens.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// The executor - owns the scheduling loop for action runs.
pub struct Executor {
    store: Arc<dyn GraphStore>,
    bus: Arc<dyn EventBus>,
    agents: Arc<AgentRegistry>,
    inflight: Arc<InflightRegistry>,
    config: ExecutorConfig,
}

enum AttemptOutcome {
    Success(AgentOutput),
    Failed { error: String, attempts: u32 },
    Cancelled,
}

struct AttemptEnd {
    task_id: TaskId,
    token: ClaimToken,
    outcome: AttemptOutcome,
}

impl Executor {
    pub fn new(
        store: Arc<dyn GraphStore>,
        bus: Arc<dyn EventBus>,
        agents: Arc<AgentRegistry>,
        inflight: Arc<InflightRegistry>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            bus,
            agents,
            inflight,
            config,
        }
    }

    /// Shared in-flight registry, for the mutation engine.
    pub fn inflight(&self) -> Arc<InflightRegistry> {
        self.inflight.clone()
    }

    /// Execute an action to quiescence.
    ///
    /// Drives the ready set until no task is running and nothing is
    /// schedulable, then derives the final action status. Cancelling
    /// `cancel` aborts in-flight work cooperatively and parks the
    /// action back in draft.
    pub async fn run(
        &self,
        action_id: &str,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, ExecError> {
        self.store
            .get_action(action_id)
            .await?
            .ok_or_else(|| ExecError::ActionNotFound(action_id.to_string()))?;

        self.store
            .set_action_status(action_id, ActionStatus::Running)
            .await?;
        self.bus
            .publish(
                action_id,
                ActionEvent::ActionStarted {
                    action_id: action_id.to_string(),
                },
            )
            .await;
        tracing::info!(action_id = %action_id, "action run started");

        let result = self.drive(action_id, &cancel).await;
        match &result {
            Ok(outcome) => {
                tracing::info!(action_id = %action_id, outcome = ?outcome, "action run finished")
            }
            Err(error) => {
                tracing::warn!(action_id = %action_id, error = %error, "action run errored");
                // Fatal path: stop scheduling and surface the reason.
                let _ = self
                    .store
                    .set_action_status(action_id, ActionStatus::Failed)
                    .await;
                self.bus
                    .publish(
                        action_id,
                        ActionEvent::ActionFailed {
                            action_id: action_id.to_string(),
                            reason: error.to_string(),
                        },
                    )
                    .await;
            }
        }
        result
    }

    async fn drive(
        &self,
        action_id: &str,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, ExecError> {
        let wakeup = self.inflight.notifier(action_id);
        let mut in_flight: FuturesUnordered<BoxFuture<'_, AttemptEnd>> = FuturesUnordered::new();
        let mut local: HashSet<TaskId> = HashSet::new();

        loop {
            if cancel.is_cancelled() {
                return self.wind_down(action_id, &mut in_flight, &mut local).await;
            }

            let tasks = self.store.list_tasks(action_id).await?;
            let ready: Vec<Task> = crate::graph::ready_tasks(&tasks)
                .into_iter()
                .filter(|t| !local.contains(&t.id))
                .cloned()
                .collect();

            for task in ready {
                if in_flight.len() >= self.config.max_concurrent_tasks {
                    break;
                }
                // Claim is a CAS; a loser means the graph moved under us
                // and the next iteration sees fresh state.
                let token = match self.store.claim_task(&task.id).await {
                    Ok(token) => token,
                    Err(StoreError::InvalidTransition { .. }) => continue,
                    Err(error) => return Err(error.into()),
                };
                self.bus
                    .publish(
                        action_id,
                        ActionEvent::TaskStarted {
                            task_id: task.id.clone(),
                            action_id: action_id.to_string(),
                        },
                    )
                    .await;
                tracing::info!(
                    action_id = %action_id,
                    task_id = %task.id,
                    agent_type = %task.agent_type,
                    "task claimed"
                );
                let attempt_cancel = self.inflight.register(&task.id);
                local.insert(task.id.clone());
                in_flight.push(self.run_attempts(task, token, attempt_cancel).boxed());
            }

            if in_flight.is_empty() {
                // Quiescent: nothing running, nothing ready. Re-check in
                // case a mutation re-opened the frontier mid-finalize.
                let tasks = self.store.list_tasks(action_id).await?;
                let status = derive_action_status(&tasks);
                if status == ActionStatus::Running {
                    continue;
                }
                return self.finalize(action_id, status).await;
            }

            tokio::select! {
                Some(end) = in_flight.next() => {
                    local.remove(&end.task_id);
                    self.commit(action_id, end).await?;
                }
                _ = cancel.cancelled() => {}
                _ = wakeup.notified() => {}
            }
        }
    }

    async fn wind_down(
        &self,
        action_id: &str,
        in_flight: &mut FuturesUnordered<BoxFuture<'_, AttemptEnd>>,
        local: &mut HashSet<TaskId>,
    ) -> Result<RunOutcome, ExecError> {
        tracing::info!(action_id = %action_id, in_flight = in_flight.len(), "run aborting");
        for task_id in local.iter() {
            self.inflight.cancel(task_id);
        }
        while let Some(end) = in_flight.next().await {
            local.remove(&end.task_id);
            self.commit(action_id, end).await?;
        }
        self.store
            .set_action_status(action_id, ActionStatus::Draft)
            .await?;
        Ok(RunOutcome::Cancelled)
    }

    async fn finalize(
        &self,
        action_id: &str,
        status: ActionStatus,
    ) -> Result<RunOutcome, ExecError> {
        self.store.set_action_status(action_id, status).await?;
        match status {
            ActionStatus::Completed => {
                self.bus
                    .publish(
                        action_id,
                        ActionEvent::ActionCompleted {
                            action_id: action_id.to_string(),
                        },
                    )
                    .await;
                Ok(RunOutcome::Completed)
            }
            ActionStatus::Failed => {
                self.bus
                    .publish(
                        action_id,
                        ActionEvent::ActionFailed {
                            action_id: action_id.to_string(),
                            reason: "one or more tasks failed".to_string(),
                        },
                    )
                    .await;
                Ok(RunOutcome::Failed)
            }
            // Every task was invalidated away mid-run; nothing ran to a
            // terminal state, so the action parks as draft.
            _ => Ok(RunOutcome::Cancelled),
        }
    }

    /// One task's full attempt cycle: gather inputs, invoke the agent
    /// under the deadline, retry transient failures with backoff.
    async fn run_attempts(
        &self,
        task: Task,
        token: ClaimToken,
        cancel: CancellationToken,
    ) -> AttemptEnd {
        let outcome = self.attempt_loop(&task, &cancel).await;
        AttemptEnd {
            task_id: task.id,
            token,
            outcome,
        }
    }

    async fn attempt_loop(&self, task: &Task, cancel: &CancellationToken) -> AttemptOutcome {
        let inputs = match self.gather_dependency_inputs(task).await {
            Ok(inputs) => inputs,
            Err(error) => {
                return AttemptOutcome::Failed {
                    error: format!("failed to load dependency outputs: {error}"),
                    attempts: 1,
                }
            }
        };
        let Some(agent) = self.agents.resolve(&task.agent_type) else {
            return AttemptOutcome::Failed {
                error: format!("no agent registered for type '{}'", task.agent_type),
                attempts: 1,
            };
        };
        let sink = TaskLogSink {
            store: self.store.clone(),
            bus: self.bus.clone(),
            action_id: task.action_id.clone(),
            task_id: task.id.clone(),
        };

        let max_attempts = self.config.retry_max_attempts.max(1);
        let mut attempt: u32 = 1;
        loop {
            if cancel.is_cancelled() {
                return AttemptOutcome::Cancelled;
            }
            let request = AgentRequest {
                task_id: &task.id,
                prompt: &task.prompt,
                model: task.model.as_deref(),
                dependency_outputs: &inputs,
                logs: &sink,
                cancel,
            };
            let result = match timeout(self.config.task_timeout, agent.run(request)).await {
                Ok(result) => result,
                Err(_) => Err(AgentError::Transient(format!(
                    "attempt timed out after {}s",
                    self.config.task_timeout.as_secs()
                ))),
            };

            let error = match result {
                Ok(output) => return AttemptOutcome::Success(output),
                Err(AgentError::Cancelled) => return AttemptOutcome::Cancelled,
                Err(error) => error,
            };

            if error.is_transient() && attempt < max_attempts {
                attempt += 1;
                tracing::info!(
                    task_id = %task.id,
                    attempt,
                    max_attempts,
                    error = %error,
                    "task retrying"
                );
                self.bus
                    .publish(
                        &task.action_id,
                        ActionEvent::TaskRetrying {
                            task_id: task.id.clone(),
                            attempt,
                            max_attempts,
                        },
                    )
                    .await;
                let delay = backoff_delay(self.config.retry_base_backoff, attempt - 1);
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = cancel.cancelled() => return AttemptOutcome::Cancelled,
                }
                continue;
            }

            return AttemptOutcome::Failed {
                error: error.message(),
                attempts: attempt,
            };
        }
    }

    /// Commit an attempt's end against the store, claim-token checked.
    /// A stale claim means an invalidation won the race: the result is
    /// dropped and clients are told to refetch.
    async fn commit(&self, action_id: &str, end: AttemptEnd) -> Result<(), ExecError> {
        self.inflight.unregister(&end.task_id);
        match end.outcome {
            AttemptOutcome::Success(output) => {
                let completion =
                    TaskCompletion::new(output.summary).with_artifacts(output.artifacts);
                match self
                    .store
                    .complete_task(&end.task_id, &end.token, completion)
                    .await
                {
                    Ok(task_output) => {
                        self.bus
                            .publish(
                                action_id,
                                ActionEvent::TaskCompleted {
                                    task_id: end.task_id.clone(),
                                    output_summary: task_output.text.clone(),
                                    artifact_ids: task_output.artifact_ids.clone(),
                                },
                            )
                            .await;
                        tracing::info!(task_id = %end.task_id, "task completed");
                        Ok(())
                    }
                    Err(StoreError::StaleClaim(_)) => {
                        self.emit_recovered(action_id, &end.task_id).await;
                        Ok(())
                    }
                    Err(error) => Err(error.into()),
                }
            }
            AttemptOutcome::Failed { error, attempts } => {
                match self
                    .store
                    .fail_task(&end.task_id, &end.token, &error)
                    .await
                {
                    Ok(()) => {
                        self.bus
                            .publish(
                                action_id,
                                ActionEvent::TaskFailed {
                                    task_id: end.task_id.clone(),
                                    error: error.clone(),
                                    retry_count: attempts.saturating_sub(1),
                                },
                            )
                            .await;
                        tracing::warn!(task_id = %end.task_id, error = %error, "task failed");
                        Ok(())
                    }
                    Err(StoreError::StaleClaim(_)) => {
                        self.emit_recovered(action_id, &end.task_id).await;
                        Ok(())
                    }
                    Err(error) => Err(error.into()),
                }
            }
            AttemptOutcome::Cancelled => {
                // Silent reset; the mutation engine announces recovery.
                match self.store.release_claim(&end.task_id, &end.token).await {
                    Ok(()) | Err(StoreError::StaleClaim(_)) | Err(StoreError::NotFound(_)) => {
                        Ok(())
                    }
                    Err(error) => Err(error.into()),
                }
            }
        }
    }

    async fn emit_recovered(&self, action_id: &str, task_id: &str) {
        tracing::info!(task_id = %task_id, "stale result dropped");
        self.bus
            .publish(
                action_id,
                ActionEvent::TaskRecovered {
                    task_id: task_id.to_string(),
                },
            )
            .await;
    }

    /// Collect outputs of completed dependencies, appending rendered
    /// artifact references so downstream agents can cite them.
    async fn gather_dependency_inputs(
        &self,
        task: &Task,
    ) -> Result<Vec<DependencyOutput>, StoreError> {
        let mut inputs = Vec::with_capacity(task.dependencies.len());
        for dep_id in &task.dependencies {
            let Some(output) = self.store.get_output(dep_id).await? else {
                continue;
            };
            let mut text = output.text.clone();
            if !output.artifact_ids.is_empty() {
                let artifacts = self.store.list_artifacts(dep_id).await?;
                let referenced: Vec<_> = artifacts
                    .iter()
                    .filter(|a| output.artifact_ids.contains(&a.id))
                    .collect();
                if !referenced.is_empty() {
                    text.push_str("\n\n**Artifacts from this task:**\n");
                    for artifact in referenced {
                        text.push_str(&render_artifact_reference(
                            &artifact.id,
                            artifact.kind,
                            artifact.mime_type.as_deref(),
                        ));
                    }
                }
            }
            inputs.push(DependencyOutput {
                task_id: dep_id.clone(),
                text,
            });
        }
        Ok(inputs)
    }
}

/// Exponential backoff with jitter above the base floor: the delay for
/// the n-th retry lands in `[base, base * 2^(n-1)]`.
fn backoff_delay(base: Duration, retry: u32) -> Duration {
    let ceiling = base.saturating_mul(1u32 << retry.clamp(1, 16).saturating_sub(1));
    let span = ceiling.saturating_sub(base);
    base + span.mul_f64(jitter_fraction())
}

/// Uniform fraction in [0, 1) derived from uuid randomness.
fn jitter_fraction() -> f64 {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    let raw = u16::from_be_bytes([bytes[0], bytes[1]]);
    f64::from(raw) / (f64::from(u16::MAX) + 1.0)
}

fn render_artifact_reference(id: &str, kind: ArtifactKind, mime_type: Option<&str>) -> String {
    let mime = mime_type.unwrap_or("application/octet-stream");
    if mime.starts_with("image/") {
        format!("![{}](artifact://{})\n", kind.as_str(), id)
    } else {
        format!("- [{}: {}](artifact://{})\n", kind.as_str(), mime, id)
    }
}

/// Log sink that persists entries (with bounded write retries) and
/// publishes `log.append` for live subscribers.
struct TaskLogSink {
    store: Arc<dyn GraphStore>,
    bus: Arc<dyn EventBus>,
    action_id: String,
    task_id: TaskId,
}

#[async_trait]
impl LogSink for TaskLogSink {
    async fn log(&self, level: LogLevel, message: &str) {
        for attempt in 0..LOG_PERSIST_ATTEMPTS {
            match self
                .store
                .append_log(&self.task_id, level, message, None)
                .await
            {
                Ok(_) => break,
                Err(_) if attempt + 1 < LOG_PERSIST_ATTEMPTS => {
                    sleep(LOG_PERSIST_RETRY_DELAY * (attempt + 1)).await;
                }
                Err(error) => {
                    tracing::warn!(
                        task_id = %self.task_id,
                        error = %error,
                        "failed to persist log entry"
                    );
                }
            }
        }
        self.bus
            .publish(
                &self.action_id,
                ActionEvent::LogAppend {
                    task_id: self.task_id.clone(),
                    level,
                    message: message.to_string(),
                },
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_first_retry_is_exactly_base() {
        let base = Duration::from_millis(500);
        let delay = backoff_delay(base, 1);
        assert_eq!(delay, base);
    }

    #[test]
    fn test_backoff_stays_within_exponential_envelope() {
        let base = Duration::from_millis(500);
        for retry in 2..6u32 {
            let ceiling = base * (1 << (retry - 1));
            for _ in 0..50 {
                let delay = backoff_delay(base, retry);
                assert!(delay >= base, "delay {delay:?} below base");
                assert!(delay <= ceiling, "delay {delay:?} above {ceiling:?}");
            }
        }
    }

    #[test]
    fn test_jitter_fraction_in_unit_interval() {
        for _ in 0..100 {
            let f = jitter_fraction();
            assert!((0.0..1.0).contains(&f));
        }
    }

    #[test]
    fn test_artifact_reference_rendering() {
        let image = render_artifact_reference("a1", ArtifactKind::Image, Some("image/png"));
        assert_eq!(image, "![image](artifact://a1)\n");

        let file = render_artifact_reference("a2", ArtifactKind::File, Some("text/csv"));
        assert_eq!(file, "- [file: text/csv](artifact://a2)\n");

        let unknown = render_artifact_reference("a3", ArtifactKind::File, None);
        assert!(unknown.contains("application/octet-stream"));
    }

    #[test]
    fn test_inflight_registry_cancel_and_unregister() {
        let registry = InflightRegistry::new();
        let token = registry.register("t1");
        assert!(registry.is_inflight("t1"));
        assert!(registry.cancel("t1"));
        assert!(token.is_cancelled());

        registry.unregister("t1");
        assert!(!registry.is_inflight("t1"));
        assert!(!registry.cancel("t1"));
    }

    #[test]
    fn test_config_defaults_match_documented_values() {
        let config = ExecutorConfig::default();
        assert_eq!(config.max_concurrent_tasks, 8);
        assert_eq!(config.retry_max_attempts, 3);
        assert_eq!(config.retry_base_backoff, Duration::from_millis(500));
        assert_eq!(config.task_timeout, Duration::from_secs(300));
    }
}
