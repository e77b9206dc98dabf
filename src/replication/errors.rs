//! Replication Error Types
//!
//! Errors of the recovery path: gap detection, remote fetches, resend and
//! the DLQ protocol. Failures of applying a task to local state stay
//! `TaskError`s so the task engine can classify them.

use std::fmt;

use crate::tasks::TaskError;

/// Replication error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationError {
    /// Error kind
    pub kind: ReplicationErrorKind,
    /// Error message
    pub message: String,
    /// Missing range, for `RetryReplication`
    pub retry: Option<EventRange>,
}

/// Replication error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationErrorKind {
    /// Local history is behind; the missing range must be resent
    RetryReplication,

    /// Namespace unknown locally
    NamespaceNotFound,

    /// Execution or record not found
    NotFound,

    /// Remote fetch exceeded its deadline
    FetchTimeout,

    /// Applying resent events exceeded its deadline
    ApplyTimeout,

    /// Malformed request or response
    InvalidArgument,

    /// Remote cluster unreachable or unknown
    RemoteUnavailable,

    /// Local and remote history branches diverged
    HistoryDivergence,

    /// Incremental state cannot be applied; a full state sync is needed
    SyncStateRequired,

    /// Applying a task or batch to local state failed
    ApplyFailed,

    /// Configuration error
    ConfigurationError,
}

/// Range of events missing locally. Start and end are exclusive; a zero
/// start means "from the beginning", a zero end means "to the end".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRange {
    pub start_event_id: i64,
    pub start_event_version: i64,
    pub end_event_id: i64,
    pub end_event_version: i64,
}

impl ReplicationError {
    /// Create a new replication error.
    pub fn new(kind: ReplicationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry: None,
        }
    }

    /// Create a retry-replication error for the given missing range.
    pub fn retry_replication(message: impl Into<String>, range: EventRange) -> Self {
        Self {
            kind: ReplicationErrorKind::RetryReplication,
            message: message.into(),
            retry: Some(range),
        }
    }

    pub fn namespace_not_found(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::NamespaceNotFound, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::NotFound, message)
    }

    pub fn fetch_timeout(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::FetchTimeout, message)
    }

    pub fn apply_timeout(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::ApplyTimeout, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::InvalidArgument, message)
    }

    pub fn remote_unavailable(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::RemoteUnavailable, message)
    }

    pub fn history_divergence(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::HistoryDivergence, message)
    }

    pub fn sync_state_required(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::SyncStateRequired, message)
    }

    pub fn apply_failed(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::ApplyFailed, message)
    }

    pub fn configuration_error(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::ConfigurationError, message)
    }

    /// Check if the remote side is at fault (counts against circuit breakers).
    pub fn is_remote_failure(&self) -> bool {
        matches!(
            self.kind,
            ReplicationErrorKind::FetchTimeout | ReplicationErrorKind::RemoteUnavailable
        )
    }
}

impl fmt::Display for ReplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicationError({:?}): {}", self.kind, self.message)
    }
}

impl std::error::Error for ReplicationError {}

impl From<ReplicationError> for TaskError {
    fn from(err: ReplicationError) -> Self {
        let message = err.to_string();
        match err.kind {
            ReplicationErrorKind::NamespaceNotFound | ReplicationErrorKind::NotFound => {
                TaskError::NotFound(message)
            }
            ReplicationErrorKind::FetchTimeout | ReplicationErrorKind::RemoteUnavailable => {
                TaskError::destination_down(TaskError::Unexpected(message))
            }
            ReplicationErrorKind::InvalidArgument | ReplicationErrorKind::HistoryDivergence => {
                TaskError::NonRetryable(message)
            }
            ReplicationErrorKind::ApplyFailed | ReplicationErrorKind::ConfigurationError => {
                TaskError::Internal(message)
            }
            ReplicationErrorKind::RetryReplication
            | ReplicationErrorKind::ApplyTimeout
            | ReplicationErrorKind::SyncStateRequired => TaskError::Unexpected(message),
        }
    }
}

/// Result type for replication operations
pub type ReplicationResult<T> = Result<T, ReplicationError>;
