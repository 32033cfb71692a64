//! Action type definitions
//!
//! An Action is a user-initiated workflow rooted in a prompt and
//! materialised as a task DAG.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Type alias for Action ID
pub type ActionId = String;

/// Action lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Planned but never run, or run was aborted
    Draft,
    /// At least one task is running or schedulable
    Running,
    /// Every task completed
    Completed,
    /// At least one task failed and no further progress is possible
    Failed,
}

impl ActionStatus {
    /// Check if the action is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionStatus::Completed | ActionStatus::Failed)
    }
}

/// Action - a task DAG rooted in a natural-language prompt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    /// Unique identifier
    pub id: ActionId,
    /// Short human title
    pub title: String,
    /// The prompt the DAG was planned from
    pub root_prompt: String,
    /// Current status
    pub status: ActionStatus,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Action {
    /// Create a new draft action
    pub fn new(title: impl Into<String>, root_prompt: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            root_prompt: root_prompt.into(),
            status: ActionStatus::Draft,
            created_at: now,
            updated_at: now,
        }
    }

    /// Update the status, bumping `updated_at`
    pub fn set_status(&mut self, status: ActionStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_action_starts_as_draft() {
        let action = Action::new("Weather report", "plot SF weather");
        assert_eq!(action.status, ActionStatus::Draft);
        assert_eq!(action.title, "Weather report");
        assert!(!action.id.is_empty());
    }

    #[test]
    fn test_terminal_classification() {
        assert!(ActionStatus::Completed.is_terminal());
        assert!(ActionStatus::Failed.is_terminal());
        assert!(!ActionStatus::Draft.is_terminal());
        assert!(!ActionStatus::Running.is_terminal());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&ActionStatus::Running).expect("serialize");
        assert_eq!(json, "\"running\"");
    }
}
