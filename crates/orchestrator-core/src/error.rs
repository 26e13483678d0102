//! The tagged error taxonomy shared by every repository trait and service.
//!
//! Every fallible operation in this crate returns `Result<T, OrchestratorError>`.
//! No panics or exceptions are expected to cross a public boundary; store
//! errors (sqlx, pool exhaustion, etc.) are converted to `PersistenceError`
//! at the repository layer.

use thiserror::Error;

/// The error taxonomy of the orchestrator core, used consistently at every
/// layer: persistence, shard manager, history service, matching service,
/// runtime, and dispatcher.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Malformed or missing required input.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Namespace/Workflow/Run/Queue/Lease absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Uniqueness violation on create (namespace, execution, task).
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Operation not valid for the current state (e.g. signal on terminal execution).
    #[error("invalid workflow state: {0}")]
    InvalidWorkflowState(String),

    /// Optimistic-concurrency mismatch on an execution update.
    #[error("concurrency conflict: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        /// Version the caller expected to be current.
        expected: i64,
        /// Version actually persisted.
        actual: i64,
    },

    /// Shard not owned by this process, or its lease has expired.
    #[error("shard {shard_id} unavailable: {reason}")]
    ShardUnavailable {
        /// The shard the caller attempted to operate on.
        shard_id: u32,
        /// Why the shard is unavailable (e.g. "owned by worker-7", "lease expired").
        reason: String,
    },

    /// Sequence gap, duplicate eventId, or non-contiguous batch.
    #[error("history event error: {0}")]
    HistoryEventError(String),

    /// Heartbeat/complete/fail issued against a lease that no longer exists.
    #[error("task lease expired or not found: {0}")]
    TaskLeaseExpired(String),

    /// Unexpected store error. Retryable with jitter by the caller.
    #[error("persistence error: {0}")]
    PersistenceError(String),

    /// Cooperative cancellation propagated from a caller's cancellation token.
    #[error("operation canceled")]
    Canceled,

    /// Dispatcher could not resolve `workflowType` in the registry.
    #[error("workflow type not registered: {0}")]
    WorkflowNotRegistered(String),

    /// A workflow invocation returned an application-level failure.
    #[error("workflow execution failed: {0}")]
    WorkflowExecutionFailed(String),
}

impl OrchestratorError {
    /// True for errors a caller may reasonably retry after a delay.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::PersistenceError(_)
                | OrchestratorError::ShardUnavailable { .. }
                | OrchestratorError::TaskLeaseExpired(_)
        )
    }
}

impl From<sqlx::Error> for OrchestratorError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => OrchestratorError::NotFound("row not found".to_string()),
            other => OrchestratorError::PersistenceError(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_conflict_is_not_retryable() {
        let err = OrchestratorError::ConcurrencyConflict {
            expected: 1,
            actual: 2,
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn persistence_error_is_retryable() {
        let err = OrchestratorError::PersistenceError("connection reset".to_string());
        assert!(err.is_retryable());
    }

    #[test]
    fn shard_unavailable_display() {
        let err = OrchestratorError::ShardUnavailable {
            shard_id: 3,
            reason: "lease expired".to_string(),
        };
        assert_eq!(err.to_string(), "shard 3 unavailable: lease expired");
    }
}
