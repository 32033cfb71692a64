//! Planner abstraction.
//!
//! A planner turns a root prompt into an ordered list of task
//! specifications whose dependencies are indices into the list,
//! strictly smaller than the task's own index - which makes the output
//! acyclic by construction once validated.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Task, TaskId, TaskSpec};

/// One planned task; dependencies are 0-based indices of earlier tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedTask {
    pub prompt: String,
    pub agent_type: String,
    #[serde(default)]
    pub dependencies: Vec<usize>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Planner errors
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("planner produced no tasks")]
    EmptyPlan,
    #[error("task {index} has an empty prompt")]
    EmptyPrompt { index: usize },
    #[error("task {index} references dependency {dependency} at or after itself")]
    ForwardDependency { index: usize, dependency: usize },
    #[error("plan has {count} tasks, limit is {limit}")]
    TooManyTasks { count: usize, limit: usize },
    #[error("invalid planner output: {0}")]
    InvalidOutput(String),
    #[error("chat error: {0}")]
    Chat(String),
}

/// Validate a plan against the rules in order: non-empty list and
/// prompts, then no forward/self references, then the size cap.
pub fn validate_plan(tasks: &[PlannedTask], max_tasks: usize) -> Result<(), PlanError> {
    if tasks.is_empty() {
        return Err(PlanError::EmptyPlan);
    }
    for (index, task) in tasks.iter().enumerate() {
        if task.prompt.trim().is_empty() {
            return Err(PlanError::EmptyPrompt { index });
        }
        for &dependency in &task.dependencies {
            if dependency >= index {
                return Err(PlanError::ForwardDependency { index, dependency });
            }
        }
    }
    if tasks.len() > max_tasks {
        return Err(PlanError::TooManyTasks {
            count: tasks.len(),
            limit: max_tasks,
        });
    }
    Ok(())
}

/// Replace agent types the predicate rejects with the default type.
/// Unknown types are a downgrade, not an error.
pub fn normalize_agent_types<F>(tasks: &mut [PlannedTask], known: F, default_type: &str)
where
    F: Fn(&str) -> bool,
{
    for task in tasks {
        if !known(&task.agent_type) {
            tracing::debug!(
                agent_type = %task.agent_type,
                default = %default_type,
                "unknown agent type downgraded"
            );
            task.agent_type = default_type.to_string();
        }
    }
}

/// Convert a validated plan into task specs, mapping list indices to
/// freshly generated task ids.
pub fn specs_from_plan(tasks: Vec<PlannedTask>) -> Vec<TaskSpec> {
    let ids: Vec<TaskId> = tasks
        .iter()
        .map(|_| uuid::Uuid::new_v4().to_string())
        .collect();
    tasks
        .into_iter()
        .enumerate()
        .map(|(index, planned)| {
            let dependencies = planned
                .dependencies
                .iter()
                .filter_map(|&d| ids.get(d).cloned())
                .collect();
            let mut spec = TaskSpec::new(planned.prompt, planned.agent_type)
                .with_dependencies(dependencies);
            spec.id = ids[index].clone();
            spec.model = planned.model;
            spec
        })
        .collect()
}

/// Planner trait - prompt in, validated plan out.
#[async_trait]
pub trait Planner: Send + Sync {
    /// Plan a task DAG for the prompt. `existing_tasks` carries the
    /// current graph on re-plan so the planner can keep useful context.
    async fn plan(
        &self,
        root_prompt: &str,
        existing_tasks: &[Task],
    ) -> Result<Vec<PlannedTask>, PlanError>;

    /// Optionally produce a short title for the action. `None` lets the
    /// caller fall back to a prompt prefix.
    async fn suggest_title(&self, _root_prompt: &str) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planned(prompt: &str, agent_type: &str, deps: &[usize]) -> PlannedTask {
        PlannedTask {
            prompt: prompt.to_string(),
            agent_type: agent_type.to_string(),
            dependencies: deps.to_vec(),
            model: None,
        }
    }

    #[test]
    fn test_validate_accepts_chain() {
        let plan = vec![
            planned("fetch", "data_retrieval", &[]),
            planned("fit", "code_execution", &[0]),
        ];
        assert!(validate_plan(&plan, 8).is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_plan_and_prompts() {
        assert!(matches!(validate_plan(&[], 8), Err(PlanError::EmptyPlan)));
        let plan = vec![planned("  ", "general", &[])];
        assert!(matches!(
            validate_plan(&plan, 8),
            Err(PlanError::EmptyPrompt { index: 0 })
        ));
    }

    #[test]
    fn test_validate_rejects_forward_and_self_references() {
        let plan = vec![planned("a", "general", &[1]), planned("b", "general", &[])];
        assert!(matches!(
            validate_plan(&plan, 8),
            Err(PlanError::ForwardDependency {
                index: 0,
                dependency: 1
            })
        ));

        let plan = vec![planned("a", "general", &[0])];
        assert!(matches!(
            validate_plan(&plan, 8),
            Err(PlanError::ForwardDependency { .. })
        ));
    }

    #[test]
    fn test_validate_enforces_task_cap() {
        let plan: Vec<PlannedTask> = (0..4).map(|_| planned("p", "general", &[])).collect();
        assert!(matches!(
            validate_plan(&plan, 3),
            Err(PlanError::TooManyTasks { count: 4, limit: 3 })
        ));
    }

    #[test]
    fn test_normalize_downgrades_unknown_types() {
        let mut plan = vec![
            planned("a", "general", &[]),
            planned("b", "quantum_annealer", &[]),
        ];
        normalize_agent_types(&mut plan, |t| t == "general", "general");
        assert_eq!(plan[0].agent_type, "general");
        assert_eq!(plan[1].agent_type, "general");
    }

    #[test]
    fn test_specs_from_plan_maps_indices_to_ids() {
        let plan = vec![
            planned("root", "data_retrieval", &[]),
            planned("left", "code_execution", &[0]),
            planned("right", "code_execution", &[0]),
            planned("join", "report", &[1, 2]),
        ];
        let specs = specs_from_plan(plan);
        assert_eq!(specs.len(), 4);
        assert!(specs[0].dependencies.is_empty());
        assert_eq!(specs[1].dependencies, vec![specs[0].id.clone()]);
        assert_eq!(specs[2].dependencies, vec![specs[0].id.clone()]);
        assert_eq!(
            specs[3].dependencies,
            vec![specs[1].id.clone(), specs[2].id.clone()]
        );
    }
}
