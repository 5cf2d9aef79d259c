//! # Error Types
//!
//! Typed failures for every component. `ValidationError` covers problems with
//! user-authored workflow definitions and concurrency expressions; they are never
//! retried. `TaskerError` is the crate-wide error returned by queue, repository and
//! engine operations.

use crate::state_machine::QueueItemStatus;
use thiserror::Error;
use uuid::Uuid;

/// Problems with a workflow definition or with evaluating one of its expressions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Workflow '{workflow}' has no steps")]
    EmptyWorkflow { workflow: String },

    #[error("Step has an empty or whitespace-only id")]
    EmptyStepId,

    #[error("Duplicate step id '{step_id}'")]
    DuplicateStep { step_id: String },

    #[error("Step '{step_id}' references unknown parent '{parent_id}'")]
    UnknownParent { step_id: String, parent_id: String },

    #[error("Workflow contains a dependency cycle involving steps {steps:?}")]
    Cycle { steps: Vec<String> },

    #[error("Concurrency expression '{expression}' could not be evaluated: {reason}")]
    ExpressionEval { expression: String, reason: String },

    #[error("Step '{step_id}' has invalid concurrency settings: {reason}")]
    InvalidConcurrency { step_id: String, reason: String },

    #[error("Invalid compute class: {reason}")]
    InvalidComputeClass { reason: String },

    #[error("Workflow definition {definition_id} is already registered")]
    DuplicateDefinition { definition_id: Uuid },
}

impl ValidationError {
    pub(crate) fn expression(expression: &str, reason: impl Into<String>) -> Self {
        Self::ExpressionEval {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskerError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A compare-and-swap or serialization race was lost. Callers treat this as
    /// "try another item", not as a failure.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The store is unavailable or timed out; safe to retry with backoff.
    #[error("Transient store error: {0}")]
    TransientStore(String),

    /// The store rejected the operation for a non-transient reason.
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Invalid transition for step run {step_run_uuid}: cannot apply '{event}' from '{from}'")]
    InvalidTransition {
        step_run_uuid: Uuid,
        from: QueueItemStatus,
        event: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl TaskerError {
    /// Whether the calling loop should retry the operation with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientStore(_) | Self::Timeout(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<serde_json::Error> for TaskerError {
    fn from(error: serde_json::Error) -> Self {
        TaskerError::Serialization(error.to_string())
    }
}

impl From<sqlx::Error> for TaskerError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => TaskerError::NotFound(err.to_string()),
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                // serialization_failure, deadlock_detected
                Some("40001") | Some("40P01") => TaskerError::Conflict(err.to_string()),
                // connection exceptions, admin shutdown, insufficient resources
                Some(code)
                    if code.starts_with("08") || code.starts_with("53") || code == "57P01" =>
                {
                    TaskerError::TransientStore(err.to_string())
                }
                _ => TaskerError::DatabaseError(err.to_string()),
            },
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::WorkerCrashed => TaskerError::TransientStore(err.to_string()),
            _ => TaskerError::DatabaseError(err.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for TaskerError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        TaskerError::Timeout(err.to_string())
    }
}

pub type TaskerResult<T> = std::result::Result<T, TaskerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(TaskerError::TransientStore("down".into()).is_retryable());
        assert!(TaskerError::Timeout("slow".into()).is_retryable());
        assert!(!TaskerError::Conflict("lost".into()).is_retryable());
        assert!(!TaskerError::Validation(ValidationError::EmptyStepId).is_retryable());
        assert!(!TaskerError::InvalidTransition {
            step_run_uuid: Uuid::nil(),
            from: QueueItemStatus::Succeeded,
            event: "complete".into(),
        }
        .is_retryable());
    }

    #[test]
    fn test_sqlx_error_mapping() {
        assert!(matches!(
            TaskerError::from(sqlx::Error::RowNotFound),
            TaskerError::NotFound(_)
        ));
        assert!(TaskerError::from(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(TaskerError::from(sqlx::Error::PoolClosed).is_retryable());
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::UnknownParent {
            step_id: "step-two".into(),
            parent_id: "step-zero".into(),
        };
        assert_eq!(
            err.to_string(),
            "Step 'step-two' references unknown parent 'step-zero'"
        );
        let wrapped: TaskerError = err.into();
        assert!(wrapped.to_string().starts_with("Validation error:"));
    }
}
