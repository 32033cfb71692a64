//! Service surface for external transports.
//!
//! The HTTP/SSE layer lives outside this workspace; it binds to
//! [`ApiService`], serialises the DTO views, and forwards
//! [`sse::frame`]d events down an event-stream response.

mod dto;
mod error;
mod service;
pub mod sse;

pub use dto::{
    ActionSummaryView, ActionView, AddTaskRequest, ArtifactView, CreateActionRequest,
    EditTaskRequest, ListActionsQuery, LogView, TaskView, UpdateActionRequest,
};
pub use error::ApiError;
pub use service::{ApiService, EnsembleApi};
