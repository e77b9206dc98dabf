//! Versioning errors

use thiserror::Error;

use super::transition::VersionedTransition;

/// Result type for versioning operations
pub type VersioningResult<T> = Result<T, VersioningError>;

/// Versioning errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersioningError {
    /// Failover version moved backwards
    #[error("failover version {attempted} is lower than current {current}")]
    VersionRegression { current: i64, attempted: i64 },

    /// Persisted history violates ordering
    #[error("transition history corrupted at entry {index}: {reason}")]
    CorruptedHistory { index: usize, reason: String },

    /// The reference is ahead of local state; local copy must be reloaded
    #[error("stale state: local {local:?} is behind reference {reference}")]
    StaleState {
        local: Option<VersionedTransition>,
        reference: VersionedTransition,
    },

    /// The reference names a transition local history never had
    #[error("stale reference: {reference} is not part of local history")]
    StaleReference { reference: VersionedTransition },

    /// Event-ID/version history is malformed or diverged
    #[error("version history: {0}")]
    VersionHistory(String),
}

impl VersioningError {
    /// Check whether a reload of local state could resolve this error.
    pub fn is_stale_state(&self) -> bool {
        matches!(self, Self::StaleState { .. })
    }
}
