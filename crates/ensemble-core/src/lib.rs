//! Ensemble core - the orchestration engine.
//!
//! An action is a natural-language goal decomposed into a DAG of tasks,
//! each executed by an agent. This crate holds the engine itself:
//! - types: actions, tasks, outputs, artifacts, logs
//! - graph: DAG validation and traversal helpers
//! - store: the persistent graph store abstraction
//! - event: per-action event fabric (publish/subscribe)
//! - agent: the contract every agent implements
//! - planner: prompt -> validated task DAG abstraction
//! - executor: ready-set scheduling with bounded concurrency
//! - mutation: live graph edits with downstream invalidation

pub mod agent;
pub mod chat;
pub mod event;
pub mod executor;
pub mod graph;
pub mod mutation;
pub mod planner;
pub mod store;
pub mod types;

// Re-export CancellationToken for convenience
pub use tokio_util::sync::CancellationToken;
