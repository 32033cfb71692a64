//! Output, artifact and log record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ActionId, TaskId};

/// Output attached to a task that reached `completed`.
///
/// At most one output is attached per task; invalidation detaches it
/// (the row survives for audit, the task no longer references it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutput {
    /// Unique identifier
    pub id: String,
    /// Producing task
    pub task_id: TaskId,
    /// Textual summary of the result
    pub text: String,
    /// Artifacts produced alongside the text
    #[serde(default)]
    pub artifact_ids: Vec<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl TaskOutput {
    /// Create a new output record
    pub fn new(task_id: impl Into<TaskId>, text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            text: text.into(),
            artifact_ids: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Attach artifact references
    pub fn with_artifact_ids(mut self, artifact_ids: Vec<String>) -> Self {
        self.artifact_ids = artifact_ids;
        self
    }
}

/// Artifact categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    File,
    Image,
    Markdown,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::File => "file",
            ArtifactKind::Image => "image",
            ArtifactKind::Markdown => "markdown",
        }
    }
}

/// Artifact - a blob stored out-of-band, referenced by id.
///
/// Lives as long as the most recent output referencing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// Unique identifier
    pub id: String,
    /// Producing task
    pub task_id: TaskId,
    /// Owning action
    pub action_id: ActionId,
    /// Category
    pub kind: ArtifactKind,
    /// MIME type, if known
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Location in out-of-band storage
    #[serde(default)]
    pub storage_path: Option<String>,
    /// Size in bytes, if known
    #[serde(default)]
    pub size_bytes: Option<u64>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// Artifact data as produced by an agent, before the store assigns
/// identity and ownership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactDraft {
    pub kind: ArtifactKind,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub storage_path: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

impl ArtifactDraft {
    pub fn new(kind: ArtifactKind) -> Self {
        Self {
            kind,
            mime_type: None,
            storage_path: None,
            size_bytes: None,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_storage_path(mut self, storage_path: impl Into<String>) -> Self {
        self.storage_path = Some(storage_path.into());
        self
    }

    pub fn with_size_bytes(mut self, size_bytes: u64) -> Self {
        self.size_bytes = Some(size_bytes);
        self
    }

    /// Materialise the draft into an owned artifact record
    pub fn into_artifact(self, task_id: impl Into<TaskId>, action_id: impl Into<ActionId>) -> Artifact {
        Artifact {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            action_id: action_id.into(),
            kind: self.kind,
            mime_type: self.mime_type,
            storage_path: self.storage_path,
            size_bytes: self.size_bytes,
            created_at: Utc::now(),
        }
    }
}

/// Log severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Append-only per-task log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Unique identifier
    pub id: String,
    /// Owning task
    pub task_id: TaskId,
    /// Severity
    pub level: LogLevel,
    /// Human-readable message
    pub message: String,
    /// Optional structured payload
    #[serde(default)]
    pub structured: Option<Value>,
    /// Append timestamp
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(task_id: impl Into<TaskId>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            level,
            message: message.into(),
            structured: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach a structured payload
    pub fn with_structured(mut self, structured: Value) -> Self {
        self.structured = Some(structured);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_draft_into_artifact_assigns_identity() {
        let draft = ArtifactDraft::new(ArtifactKind::Image)
            .with_mime_type("image/png")
            .with_storage_path("plots/temp.png")
            .with_size_bytes(1024);
        let artifact = draft.into_artifact("task-1", "action-1");

        assert!(!artifact.id.is_empty());
        assert_eq!(artifact.task_id, "task-1");
        assert_eq!(artifact.action_id, "action-1");
        assert_eq!(artifact.kind, ArtifactKind::Image);
        assert_eq!(artifact.size_bytes, Some(1024));
    }

    #[test]
    fn test_log_entry_with_structured_payload() {
        let entry = LogEntry::new("task-1", LogLevel::Warn, "rate limited")
            .with_structured(json!({"retry_after_ms": 500}));
        assert_eq!(entry.level, LogLevel::Warn);
        assert_eq!(entry.structured, Some(json!({"retry_after_ms": 500})));
    }

    #[test]
    fn test_kind_and_level_labels() {
        assert_eq!(ArtifactKind::Markdown.as_str(), "markdown");
        assert_eq!(LogLevel::Error.as_str(), "error");
    }
}
