//! ApiService - the operations a transport exposes.

use std::sync::Arc;

use async_trait::async_trait;

use ensemble_core::event::Subscription;
use ensemble_core::store::ActionFilter;
use ensemble_core::types::{TaskPatch, TaskSpec};
use ensemble_runtime::Orchestrator;

use crate::dto::{
    ActionSummaryView, ActionView, AddTaskRequest, ArtifactView, CreateActionRequest,
    EditTaskRequest, ListActionsQuery, LogView, TaskView, UpdateActionRequest,
};
use crate::error::ApiError;

/// ApiService trait - async interface for the transport layer.
#[async_trait]
pub trait ApiService: Send + Sync {
    /// Create an action with freshly planned tasks.
    async fn create_action(&self, request: CreateActionRequest) -> Result<ActionView, ApiError>;

    /// Load an action with its task list.
    async fn get_action(&self, action_id: &str) -> Result<ActionView, ApiError>;

    /// List action summaries.
    async fn list_actions(
        &self,
        query: ListActionsQuery,
    ) -> Result<Vec<ActionSummaryView>, ApiError>;

    /// Patch an action; a changed root prompt re-plans the graph.
    async fn update_action(
        &self,
        action_id: &str,
        request: UpdateActionRequest,
    ) -> Result<ActionView, ApiError>;

    /// Delete an action and everything it owns.
    async fn delete_action(&self, action_id: &str) -> Result<(), ApiError>;

    /// Add a task to an action.
    async fn add_task(
        &self,
        action_id: &str,
        request: AddTaskRequest,
    ) -> Result<TaskView, ApiError>;

    /// Edit a task; invalidates it and its transitive dependents.
    async fn edit_task(
        &self,
        action_id: &str,
        task_id: &str,
        request: EditTaskRequest,
    ) -> Result<TaskView, ApiError>;

    /// Delete a task nothing depends on.
    async fn delete_task(&self, action_id: &str, task_id: &str) -> Result<(), ApiError>;

    /// Force a re-run of a task.
    async fn reset_task(&self, action_id: &str, task_id: &str) -> Result<TaskView, ApiError>;

    /// Start execution; work happens asynchronously (202-style).
    /// Returns the action in its current state.
    async fn run_action(&self, action_id: &str) -> Result<ActionView, ApiError>;

    /// Operator-initiated replay of a failed action; returns the
    /// attempt number.
    async fn retry_action(&self, action_id: &str) -> Result<u32, ApiError>;

    /// Subscribe to the action's event stream (snapshot first).
    async fn subscribe(&self, action_id: &str) -> Result<Subscription, ApiError>;

    /// Ordered log entries of a task.
    async fn get_logs(&self, action_id: &str, task_id: &str) -> Result<Vec<LogView>, ApiError>;

    /// Artifact record by id.
    async fn get_artifact(&self, artifact_id: &str) -> Result<ArtifactView, ApiError>;
}

/// The orchestrator-backed service.
pub struct EnsembleApi {
    orchestrator: Arc<Orchestrator>,
}

impl EnsembleApi {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Check the task belongs to the action named in the route.
    async fn require_task_in_action(
        &self,
        action_id: &str,
        task_id: &str,
    ) -> Result<(), ApiError> {
        let (_, tasks) = self.orchestrator.get_action(action_id).await?;
        if tasks.iter().any(|t| t.id == task_id) {
            Ok(())
        } else {
            Err(ApiError::NotFound(format!(
                "task '{task_id}' in action '{action_id}'"
            )))
        }
    }
}

#[async_trait]
impl ApiService for EnsembleApi {
    async fn create_action(&self, request: CreateActionRequest) -> Result<ActionView, ApiError> {
        let (action, tasks) = self
            .orchestrator
            .create_action(&request.root_prompt, request.title)
            .await?;
        Ok(ActionView::from_parts(action, tasks))
    }

    async fn get_action(&self, action_id: &str) -> Result<ActionView, ApiError> {
        let (action, tasks) = self.orchestrator.get_action(action_id).await?;
        Ok(ActionView::from_parts(action, tasks))
    }

    async fn list_actions(
        &self,
        query: ListActionsQuery,
    ) -> Result<Vec<ActionSummaryView>, ApiError> {
        let rows = self
            .orchestrator
            .list_actions(ActionFilter {
                status: query.status,
                limit: query.limit,
            })
            .await?;
        Ok(rows.into_iter().map(ActionSummaryView::from).collect())
    }

    async fn update_action(
        &self,
        action_id: &str,
        request: UpdateActionRequest,
    ) -> Result<ActionView, ApiError> {
        let (action, tasks) = self
            .orchestrator
            .update_action(action_id, request.title, request.root_prompt)
            .await?;
        Ok(ActionView::from_parts(action, tasks))
    }

    async fn delete_action(&self, action_id: &str) -> Result<(), ApiError> {
        if self.orchestrator.delete_action(action_id).await? {
            Ok(())
        } else {
            Err(ApiError::NotFound(format!("action '{action_id}'")))
        }
    }

    async fn add_task(
        &self,
        action_id: &str,
        request: AddTaskRequest,
    ) -> Result<TaskView, ApiError> {
        if request.prompt.trim().is_empty() {
            return Err(ApiError::Invalid("prompt must not be empty".to_string()));
        }
        let mut spec = TaskSpec::new(request.prompt, request.agent_type)
            .with_dependencies(request.dependencies);
        spec.model = request.model;
        let task = self.orchestrator.add_task(action_id, spec).await?;
        Ok(TaskView::from(task))
    }

    async fn edit_task(
        &self,
        action_id: &str,
        task_id: &str,
        request: EditTaskRequest,
    ) -> Result<TaskView, ApiError> {
        self.require_task_in_action(action_id, task_id).await?;
        let patch = TaskPatch {
            prompt: request.prompt,
            agent_type: request.agent_type,
            model: request.model,
            dependencies: request.dependencies,
        };
        let task = self.orchestrator.edit_task(task_id, patch).await?;
        Ok(TaskView::from(task))
    }

    async fn delete_task(&self, action_id: &str, task_id: &str) -> Result<(), ApiError> {
        self.require_task_in_action(action_id, task_id).await?;
        Ok(self.orchestrator.delete_task(task_id).await?)
    }

    async fn reset_task(&self, action_id: &str, task_id: &str) -> Result<TaskView, ApiError> {
        self.require_task_in_action(action_id, task_id).await?;
        let task = self.orchestrator.reset_task(task_id).await?;
        Ok(TaskView::from(task))
    }

    async fn run_action(&self, action_id: &str) -> Result<ActionView, ApiError> {
        self.orchestrator.run_action(action_id).await?;
        self.get_action(action_id).await
    }

    async fn retry_action(&self, action_id: &str) -> Result<u32, ApiError> {
        Ok(self.orchestrator.retry_action(action_id).await?)
    }

    async fn subscribe(&self, action_id: &str) -> Result<Subscription, ApiError> {
        Ok(self.orchestrator.subscribe(action_id).await?)
    }

    async fn get_logs(&self, action_id: &str, task_id: &str) -> Result<Vec<LogView>, ApiError> {
        self.require_task_in_action(action_id, task_id).await?;
        let logs = self.orchestrator.list_logs(task_id).await?;
        Ok(logs.into_iter().map(LogView::from).collect())
    }

    async fn get_artifact(&self, artifact_id: &str) -> Result<ArtifactView, ApiError> {
        self.orchestrator
            .get_artifact(artifact_id)
            .await?
            .map(ArtifactView::from)
            .ok_or_else(|| ApiError::NotFound(format!("artifact '{artifact_id}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use ensemble_agents::MockAgent;
    use ensemble_core::agent::AgentRegistry;
    use ensemble_core::event::{ActionEvent, EventBus};
    use ensemble_core::executor::{Executor, ExecutorConfig, InflightRegistry};
    use ensemble_core::mutation::{MutationConfig, MutationEngine};
    use ensemble_core::planner::{PlanError, PlannedTask, Planner};
    use ensemble_core::store::GraphStore;
    use ensemble_core::types::{Task, TaskStatus};
    use ensemble_runtime::OrchestratorConfig;
    use ensemble_stores::{InMemoryGraphStore, TopicEventBus};

    struct SingleTaskPlanner;

    #[async_trait]
    impl Planner for SingleTaskPlanner {
        async fn plan(
            &self,
            root_prompt: &str,
            _existing_tasks: &[Task],
        ) -> Result<Vec<PlannedTask>, PlanError> {
            Ok(vec![PlannedTask {
                prompt: root_prompt.to_string(),
                agent_type: "general".to_string(),
                dependencies: Vec::new(),
                model: None,
            }])
        }
    }

    fn service() -> EnsembleApi {
        let store: Arc<dyn GraphStore> = Arc::new(InMemoryGraphStore::new());
        let bus: Arc<dyn EventBus> = Arc::new(TopicEventBus::new(32));
        let inflight = Arc::new(InflightRegistry::new());
        let mut registry = AgentRegistry::new();
        registry.register(Arc::new(
            MockAgent::new("general").with_delay(Duration::from_millis(5)),
        ));
        let executor = Arc::new(Executor::new(
            store.clone(),
            bus.clone(),
            Arc::new(registry),
            inflight.clone(),
            ExecutorConfig::default(),
        ));
        let mutations = Arc::new(MutationEngine::new(
            store.clone(),
            bus.clone(),
            inflight,
            MutationConfig::default(),
        ));
        EnsembleApi::new(Arc::new(Orchestrator::new(
            store,
            bus,
            Arc::new(SingleTaskPlanner),
            executor,
            mutations,
            OrchestratorConfig::default(),
        )))
    }

    #[test]
    fn test_create_run_and_stream_round_trip() {
        tokio_test::block_on(async {
            let api = service();
            let view = api
                .create_action(CreateActionRequest {
                    root_prompt: "summarise the weather".to_string(),
                    title: Some("Weather".to_string()),
                })
                .await
                .expect("create");
            assert_eq!(view.title, "Weather");
            assert_eq!(view.tasks.len(), 1);

            let mut sub = api.subscribe(&view.id).await.expect("subscribe");
            assert!(matches!(
                sub.next().await,
                Some(ActionEvent::Snapshot { .. })
            ));

            api.run_action(&view.id).await.expect("run");
            loop {
                match tokio::time::timeout(Duration::from_secs(10), sub.next())
                    .await
                    .expect("timeout")
                    .expect("closed")
                {
                    ActionEvent::ActionCompleted { .. } => break,
                    _ => continue,
                }
            }

            let task_id = view.tasks[0].id.clone();
            let logs = api.get_logs(&view.id, &task_id).await.expect("logs");
            assert!(!logs.is_empty());

            let reloaded = api.get_action(&view.id).await.expect("get");
            assert_eq!(reloaded.tasks[0].status, TaskStatus::Completed);
        });
    }

    #[test]
    fn test_task_routes_are_scoped_to_their_action() {
        tokio_test::block_on(async {
            let api = service();
            let first = api
                .create_action(CreateActionRequest {
                    root_prompt: "one".to_string(),
                    title: None,
                })
                .await
                .expect("create");
            let second = api
                .create_action(CreateActionRequest {
                    root_prompt: "two".to_string(),
                    title: None,
                })
                .await
                .expect("create");

            // A task reached through the wrong action is a 404.
            let result = api
                .edit_task(
                    &second.id,
                    &first.tasks[0].id,
                    EditTaskRequest::default(),
                )
                .await;
            assert!(matches!(result, Err(ApiError::NotFound(_))));
        });
    }

    #[test]
    fn test_add_task_rejects_empty_prompt() {
        tokio_test::block_on(async {
            let api = service();
            let view = api
                .create_action(CreateActionRequest {
                    root_prompt: "base".to_string(),
                    title: None,
                })
                .await
                .expect("create");
            let result = api
                .add_task(
                    &view.id,
                    AddTaskRequest {
                        prompt: "  ".to_string(),
                        agent_type: "general".to_string(),
                        model: None,
                        dependencies: Vec::new(),
                    },
                )
                .await;
            assert!(matches!(result, Err(ApiError::Invalid(_))));
        });
    }
}
