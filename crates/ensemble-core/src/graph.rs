//! DAG validation and traversal helpers.
//!
//! Pure functions over task slices; the store calls these inside its
//! transactions and the mutation engine uses them to compute
//! invalidation sets.

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;

use crate::types::{Task, TaskId, TaskStatus};

/// Graph validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: TaskId, dependency: TaskId },
    #[error("task '{task}' depends on itself")]
    SelfDependency { task: TaskId },
    #[error("dependency cycle through task '{task}'")]
    Cycle { task: TaskId },
}

/// Validate that the task set forms a dependency-closed acyclic graph.
pub fn validate(tasks: &[Task]) -> Result<(), GraphError> {
    let known: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    for task in tasks {
        for dep in &task.dependencies {
            if dep == &task.id {
                return Err(GraphError::SelfDependency {
                    task: task.id.clone(),
                });
            }
            if !known.contains(dep.as_str()) {
                return Err(GraphError::UnknownDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    topological_order(tasks).map(|_| ())
}

/// Compute a topological order, stable by the input (creation) order.
///
/// Fails with [`GraphError::Cycle`] if the graph has one.
pub fn topological_order(tasks: &[Task]) -> Result<Vec<TaskId>, GraphError> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in tasks {
        in_degree.entry(task.id.as_str()).or_insert(0);
        for dep in &task.dependencies {
            *in_degree.entry(task.id.as_str()).or_insert(0) += 1;
            dependents.entry(dep.as_str()).or_default().push(&task.id);
        }
    }

    let mut queue: VecDeque<&str> = tasks
        .iter()
        .filter(|t| in_degree.get(t.id.as_str()).copied() == Some(0))
        .map(|t| t.id.as_str())
        .collect();
    let mut order = Vec::with_capacity(tasks.len());

    while let Some(id) = queue.pop_front() {
        order.push(id.to_string());
        for next in dependents.get(id).into_iter().flatten().copied() {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(next);
                }
            }
        }
    }

    if order.len() != tasks.len() {
        let ordered: HashSet<&str> = order.iter().map(String::as_str).collect();
        let stuck = tasks
            .iter()
            .find(|t| !ordered.contains(t.id.as_str()))
            .map(|t| t.id.clone())
            .unwrap_or_default();
        return Err(GraphError::Cycle { task: stuck });
    }
    Ok(order)
}

/// Tasks that directly depend on `task_id`, in input order.
pub fn dependents(tasks: &[Task], task_id: &str) -> Vec<TaskId> {
    tasks
        .iter()
        .filter(|t| t.dependencies.iter().any(|d| d == task_id))
        .map(|t| t.id.clone())
        .collect()
}

/// Every task transitively downstream of `task_id` (excluding it).
///
/// BFS over the reverse dependency map.
pub fn transitive_dependents(tasks: &[Task], task_id: &str) -> HashSet<TaskId> {
    let mut reverse: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in tasks {
        for dep in &task.dependencies {
            reverse.entry(dep.as_str()).or_default().push(&task.id);
        }
    }

    let mut visited: HashSet<TaskId> = HashSet::new();
    let mut queue: VecDeque<&str> = reverse
        .get(task_id)
        .into_iter()
        .flatten()
        .copied()
        .collect();
    while let Some(current) = queue.pop_front() {
        if !visited.insert(current.to_string()) {
            continue;
        }
        queue.extend(reverse.get(current).into_iter().flatten().copied());
    }
    visited
}

/// Every task transitively upstream of `task_id` (excluding it).
pub fn ancestors(tasks: &[Task], task_id: &str) -> HashSet<TaskId> {
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut visited: HashSet<TaskId> = HashSet::new();
    let mut queue: VecDeque<&str> = by_id
        .get(task_id)
        .into_iter()
        .flat_map(|t| t.dependencies.iter().map(String::as_str))
        .collect();
    while let Some(current) = queue.pop_front() {
        if !visited.insert(current.to_string()) {
            continue;
        }
        if let Some(task) = by_id.get(current) {
            queue.extend(task.dependencies.iter().map(String::as_str));
        }
    }
    visited
}

/// Ready tasks: pending and every dependency completed, in input order.
pub fn ready_tasks<'a>(tasks: &'a [Task]) -> Vec<&'a Task> {
    let completed: HashSet<&str> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .map(|t| t.id.as_str())
        .collect();
    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .filter(|t| t.dependencies.iter().all(|d| completed.contains(d.as_str())))
        .collect()
}
