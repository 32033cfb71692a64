//! Per-action event fabric.
//!
//! One logical topic per action id. Publishers never wait on
//! subscribers; each subscriber owns a bounded ring and a subscriber
//! that falls behind sees a `lag` marker instead of blocking anyone.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{Action, ActionId, ActionStatus, LogLevel, Task, TaskId};

/// Default keepalive interval for subscriptions.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(15);

/// Events published on an action's topic.
///
/// Serialises to `{"event": "...", "data": {...}}` with the same names
/// and payload keys an SSE transport forwards verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ActionEvent {
    /// First delivery on every new subscription: current state in full.
    #[serde(rename = "snapshot")]
    Snapshot {
        action: Action,
        tasks: Vec<Task>,
        status: ActionStatus,
    },
    #[serde(rename = "action.started")]
    ActionStarted { action_id: ActionId },
    #[serde(rename = "action.retrying")]
    ActionRetrying { action_id: ActionId, attempt: u32 },
    #[serde(rename = "action.completed")]
    ActionCompleted { action_id: ActionId },
    #[serde(rename = "action.failed")]
    ActionFailed { action_id: ActionId, reason: String },
    #[serde(rename = "task.started")]
    TaskStarted { task_id: TaskId, action_id: ActionId },
    #[serde(rename = "task.completed")]
    TaskCompleted {
        task_id: TaskId,
        output_summary: String,
        artifact_ids: Vec<String>,
    },
    #[serde(rename = "task.failed")]
    TaskFailed {
        task_id: TaskId,
        error: String,
        retry_count: u32,
    },
    #[serde(rename = "task.retrying")]
    TaskRetrying {
        task_id: TaskId,
        attempt: u32,
        max_attempts: u32,
    },
    /// The task's in-flight result was discarded by an invalidation;
    /// clients should refetch.
    #[serde(rename = "task.recovered")]
    TaskRecovered { task_id: TaskId },
    #[serde(rename = "log.append")]
    LogAppend {
        task_id: TaskId,
        level: LogLevel,
        message: String,
    },
    /// Inserted in place of events dropped from a lagging subscriber.
    #[serde(rename = "lag")]
    Lag { missed: u64 },
    /// Keepalive for transport-layer streams.
    #[serde(rename = "ping")]
    Ping { ts: DateTime<Utc> },
}

impl ActionEvent {
    /// Wire name of the event, as used for SSE framing.
    pub fn name(&self) -> &'static str {
        match self {
            ActionEvent::Snapshot { .. } => "snapshot",
            ActionEvent::ActionStarted { .. } => "action.started",
            ActionEvent::ActionRetrying { .. } => "action.retrying",
            ActionEvent::ActionCompleted { .. } => "action.completed",
            ActionEvent::ActionFailed { .. } => "action.failed",
            ActionEvent::TaskStarted { .. } => "task.started",
            ActionEvent::TaskCompleted { .. } => "task.completed",
            ActionEvent::TaskFailed { .. } => "task.failed",
            ActionEvent::TaskRetrying { .. } => "task.retrying",
            ActionEvent::TaskRecovered { .. } => "task.recovered",
            ActionEvent::LogAppend { .. } => "log.append",
            ActionEvent::Lag { .. } => "lag",
            ActionEvent::Ping { .. } => "ping",
        }
    }

    /// Keepalive event stamped now.
    pub fn ping() -> Self {
        ActionEvent::Ping { ts: Utc::now() }
    }
}

/// EventBus trait - per-topic fan-out with non-blocking publishers.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event on an action's topic. Never blocks on
    /// subscribers; events for topics without subscribers are dropped.
    async fn publish(&self, action_id: &str, event: ActionEvent);

    /// Open a raw receiver for an action's topic. Callers normally wrap
    /// it in a [`Subscription`] together with a snapshot.
    fn subscribe(&self, action_id: &str) -> broadcast::Receiver<ActionEvent>;
}

/// A live, snapshot-first event subscription.
///
/// The first item is always the snapshot handed in at construction.
/// A lagging ring yields a [`ActionEvent::Lag`] marker and then resumes
/// with the retained tail; silence yields [`ActionEvent::Ping`] at the
/// keepalive interval.
pub struct Subscription {
    queued: VecDeque<ActionEvent>,
    rx: broadcast::Receiver<ActionEvent>,
    ping_interval: Duration,
}

impl Subscription {
    /// Wrap a raw receiver, priming the snapshot as the first delivery.
    pub fn new(snapshot: ActionEvent, rx: broadcast::Receiver<ActionEvent>) -> Self {
        Self::with_ping_interval(snapshot, rx, DEFAULT_PING_INTERVAL)
    }

    /// Same, with an explicit keepalive interval.
    pub fn with_ping_interval(
        snapshot: ActionEvent,
        rx: broadcast::Receiver<ActionEvent>,
        ping_interval: Duration,
    ) -> Self {
        let mut queued = VecDeque::new();
        queued.push_back(snapshot);
        Self {
            queued,
            rx,
            ping_interval,
        }
    }

    /// Next event. Returns `None` once the topic is closed and drained.
    pub async fn next(&mut self) -> Option<ActionEvent> {
        if let Some(event) = self.queued.pop_front() {
            return Some(event);
        }
        match tokio::time::timeout(self.ping_interval, self.rx.recv()).await {
            Ok(Ok(event)) => Some(event),
            Ok(Err(broadcast::error::RecvError::Lagged(missed))) => {
                Some(ActionEvent::Lag { missed })
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => None,
            Err(_) => Some(ActionEvent::ping()),
        }
    }
}
