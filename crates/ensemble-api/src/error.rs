//! API error mapping.

use thiserror::Error;

use ensemble_core::mutation::MutationError;
use ensemble_core::store::StoreError;
use ensemble_runtime::OrchestratorError;

/// Transport-facing errors. The HTTP layer maps these 1:1 onto status
/// codes (404 / 400 / 409 / 500).
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(m) => ApiError::NotFound(m),
            StoreError::Graph(e) => ApiError::Invalid(e.to_string()),
            StoreError::InvalidTransition { .. } | StoreError::StaleClaim(_) => {
                ApiError::Conflict(error.to_string())
            }
            StoreError::Conflict(m) => ApiError::Conflict(m),
            StoreError::Internal(m) => ApiError::Internal(m),
        }
    }
}

impl From<MutationError> for ApiError {
    fn from(error: MutationError) -> Self {
        match error {
            MutationError::NotFound(m) => ApiError::NotFound(m),
            MutationError::Graph(e) => ApiError::Invalid(e.to_string()),
            MutationError::HasDependents { .. } => ApiError::Conflict(error.to_string()),
            MutationError::Store(e) => e.into(),
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(error: OrchestratorError) -> Self {
        match error {
            OrchestratorError::NotFound(m) => ApiError::NotFound(m),
            OrchestratorError::Validation(m) => ApiError::Invalid(m),
            OrchestratorError::Plan(e) => ApiError::Invalid(e.to_string()),
            OrchestratorError::Store(e) => e.into(),
            OrchestratorError::Mutation(e) => e.into(),
            OrchestratorError::Graph(e) => ApiError::Invalid(e.to_string()),
            OrchestratorError::RetryExhausted { .. } => ApiError::Conflict(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_core::types::TaskStatus;

    #[test]
    fn test_store_error_mapping() {
        assert!(matches!(
            ApiError::from(StoreError::NotFound("task 'x'".to_string())),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            ApiError::from(StoreError::InvalidTransition {
                from: TaskStatus::Running,
                to: TaskStatus::Running,
            }),
            ApiError::Conflict(_)
        ));
    }

    #[test]
    fn test_orchestrator_error_mapping() {
        assert!(matches!(
            ApiError::from(OrchestratorError::Validation("empty".to_string())),
            ApiError::Invalid(_)
        ));
        assert!(matches!(
            ApiError::from(OrchestratorError::RetryExhausted { attempts: 4 }),
            ApiError::Conflict(_)
        ));
    }
}
