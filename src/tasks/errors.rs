//! Task processing errors
//!
//! `TaskError` is the single error type executors report. The classifier
//! decides from its variant (and message) whether a failure is dropped,
//! retried or routed to the DLQ.

use std::fmt;

use thiserror::Error;

use crate::namespace::NamespaceError;
use crate::state::StateError;
use crate::versioning::VersioningError;

/// Result type for task execution
pub type TaskResult<T> = Result<T, TaskError>;

/// Why a resource was exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceExhaustedCause {
    /// Too many concurrent updates to one execution
    BusyWorkflow,
    ApsLimit,
    RpsLimit,
    ConcurrentLimit,
    PersistenceLimit,
    CircuitBreakerOpen,
    Unspecified,
}

impl ResourceExhaustedCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceExhaustedCause::BusyWorkflow => "BUSY_WORKFLOW",
            ResourceExhaustedCause::ApsLimit => "APS_LIMIT",
            ResourceExhaustedCause::RpsLimit => "RPS_LIMIT",
            ResourceExhaustedCause::ConcurrentLimit => "CONCURRENT_LIMIT",
            ResourceExhaustedCause::PersistenceLimit => "PERSISTENCE_LIMIT",
            ResourceExhaustedCause::CircuitBreakerOpen => "CIRCUIT_BREAKER_OPEN",
            ResourceExhaustedCause::Unspecified => "UNSPECIFIED",
        }
    }
}

impl fmt::Display for ResourceExhaustedCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("stale reference: {0}")]
    StaleReference(String),

    #[error("stale state: {0}")]
    StaleState(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("namespace deleted: {0}")]
    NamespaceDeleted(String),

    #[error("task discarded: {0}")]
    Discarded(String),

    #[error("task version mismatch: {0}")]
    VersionMismatch(String),

    #[error("resource exhausted ({cause}): {message}")]
    ResourceExhausted {
        cause: ResourceExhaustedCause,
        message: String,
    },

    #[error("namespace not active: {0}")]
    NamespaceNotActive(String),

    #[error("dependency not completed: {0}")]
    DependencyNotCompleted(String),

    #[error("standby task not ready: {0}")]
    StandbyRetry(String),

    #[error("namespace handover in progress: {0}")]
    NamespaceHandover(String),

    #[error("shard ownership lost: {0}")]
    ShardOwnershipLost(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("data loss: {0}")]
    DataLoss(String),

    #[error("non-retryable: {0}")]
    NonRetryable(String),

    /// The remote destination failed; reported to circuit breakers
    #[error("destination down: {0}")]
    DestinationDown(Box<TaskError>),

    /// Marked terminal; the next execution writes the task to the DLQ
    #[error("terminal failure: {0}")]
    TerminalFailure(Box<TaskError>),

    #[error("DLQ write failed: {0}")]
    DlqWrite(String),

    #[error("{0}")]
    Unexpected(String),
}

impl TaskError {
    pub fn resource_exhausted(cause: ResourceExhaustedCause, message: impl Into<String>) -> Self {
        TaskError::ResourceExhausted {
            cause,
            message: message.into(),
        }
    }

    pub fn destination_down(inner: TaskError) -> Self {
        TaskError::DestinationDown(Box::new(inner))
    }

    /// Strip destination-down wrappers.
    pub fn unwrap_destination_down(self) -> TaskError {
        match self {
            TaskError::DestinationDown(inner) => inner.unwrap_destination_down(),
            other => other,
        }
    }

    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, TaskError::ResourceExhausted { .. })
    }
}

impl From<StateError> for TaskError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::NotFound(m) => TaskError::NotFound(m),
            StateError::StaleReference(m) => TaskError::StaleReference(m),
            StateError::StaleState(m) => TaskError::StaleState(m),
            StateError::ChecksumMismatch { .. } => TaskError::DataLoss(err.to_string()),
            StateError::Namespace(ns) => ns.into(),
            StateError::Versioning(
                VersioningError::CorruptedHistory { .. } | VersioningError::VersionRegression { .. },
            ) => TaskError::DataLoss(err.to_string()),
            StateError::NoTransaction
            | StateError::TransactionOpen
            | StateError::InvalidState(_)
            | StateError::Serialization(_)
            | StateError::Versioning(_) => TaskError::Internal(err.to_string()),
            StateError::AlreadyExists(_)
            | StateError::ConditionFailed { .. }
            | StateError::SnapshotRequired(_)
            | StateError::EventGap { .. } => TaskError::Unexpected(err.to_string()),
        }
    }
}

impl From<NamespaceError> for TaskError {
    fn from(err: NamespaceError) -> Self {
        match err {
            NamespaceError::NotFound(id) => TaskError::NotFound(format!("namespace {}", id)),
        }
    }
}

/// Errors submitting to a scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("scheduler queue is full")]
    QueueFull,

    #[error("scheduler is stopped")]
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwrap_nested_destination_down() {
        let err = TaskError::destination_down(TaskError::destination_down(TaskError::Internal(
            "x".into(),
        )));
        assert_eq!(err.unwrap_destination_down(), TaskError::Internal("x".into()));
    }

    #[test]
    fn test_state_error_conversion() {
        assert_eq!(
            TaskError::from(StateError::StaleReference("r".into())),
            TaskError::StaleReference("r".into())
        );
        assert!(matches!(
            TaskError::from(StateError::ChecksumMismatch { stored: 1, computed: 2 }),
            TaskError::DataLoss(_)
        ));
        assert!(matches!(
            TaskError::from(StateError::ConditionFailed { expected: 1, actual: 2 }),
            TaskError::Unexpected(_)
        ));
    }

    #[test]
    fn test_display_includes_cause() {
        let err = TaskError::resource_exhausted(ResourceExhaustedCause::BusyWorkflow, "hot");
        assert_eq!(err.to_string(), "resource exhausted (BUSY_WORKFLOW): hot");
    }
}
