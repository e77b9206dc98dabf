//! Execution state errors

use thiserror::Error;

use crate::namespace::NamespaceError;
use crate::versioning::VersioningError;

/// Result type for execution state operations
pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("condition failed: expected db record version {expected}, found {actual}")]
    ConditionFailed { expected: i64, actual: i64 },

    #[error("stale reference: {0}")]
    StaleReference(String),

    #[error("stale state: {0}")]
    StaleState(String),

    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    /// The incoming change cannot be applied incrementally
    #[error("snapshot required: {0}")]
    SnapshotRequired(String),

    /// Replicated events do not continue local history
    #[error("event gap: next local event is {next_event_id}, replicated batch starts at {first_event_id}")]
    EventGap { next_event_id: i64, first_event_id: i64 },

    #[error("no open transaction")]
    NoTransaction,

    #[error("transaction already open")]
    TransactionOpen,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error(transparent)]
    Namespace(#[from] NamespaceError),

    #[error(transparent)]
    Versioning(VersioningError),
}

impl StateError {
    pub fn is_stale_state(&self) -> bool {
        matches!(self, StateError::StaleState(_))
    }

    /// Errors after which the cached copy may not match the store.
    pub fn is_cache_invalidating(&self) -> bool {
        matches!(
            self,
            StateError::ConditionFailed { .. }
                | StateError::ChecksumMismatch { .. }
                | StateError::StaleState(_)
                | StateError::InvalidState(_)
                | StateError::Versioning(_)
        )
    }
}

impl From<VersioningError> for StateError {
    fn from(err: VersioningError) -> Self {
        match err {
            VersioningError::StaleState { .. } => StateError::StaleState(err.to_string()),
            VersioningError::StaleReference { .. } => StateError::StaleReference(err.to_string()),
            other => StateError::Versioning(other),
        }
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::versioning::VersionedTransition;

    #[test]
    fn test_versioning_staleness_maps_to_state_axis() {
        let reference = VersionedTransition::new(2, 5);
        let err: StateError = VersioningError::StaleState {
            local: None,
            reference,
        }
        .into();
        assert!(err.is_stale_state());
        assert!(err.is_cache_invalidating());

        let err: StateError = VersioningError::StaleReference { reference }.into();
        assert!(matches!(err, StateError::StaleReference(_)));
        assert!(!err.is_cache_invalidating());
    }
}
