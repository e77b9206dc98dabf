//! Observable events
//!
//! Every decision an operator may need to find during a replication incident
//! is named here. Terminal-path and reload-exhaustion events share the
//! `INCIDENT_` prefix so they can be grepped across all components.

use std::fmt;

/// Observable events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Configuration loaded and validated
    ConfigLoaded,

    // Transaction close
    /// Tombstone cap exceeded; tombstones dropped for the execution
    TombstonesDropped,
    /// Stored checksum predates the invalidation threshold and was discarded
    ChecksumInvalidated,
    /// Stored checksum does not match the loaded state
    ChecksumMismatch,
    /// Transition history tracking was switched on or off for an execution
    TransitionHistoryMigrated,

    // Execution cache
    /// Cached execution evicted after an error
    CacheEvicted,
    /// Reload-and-retry did not resolve a stale-state condition
    ReloadExhausted,

    // Task processing
    /// Task failed with an unexpected error and will be retried
    TaskUnexpectedError,
    /// Task keeps failing past the critical attempt count
    TaskCriticalRetry,
    /// Task matched an operator-configured DLQ pattern
    TaskPatternMatched,
    /// Task marked terminally failed
    TaskTerminal,
    /// Terminal task dropped because the DLQ is disabled
    TaskDropped,
    /// Terminal task written to the DLQ
    TaskDlqWrite,
    /// Executor panicked; converted to an internal error
    TaskPanic,
    /// Circuit breaker opened
    CircuitOpened,
    /// Circuit breaker closed again
    CircuitClosed,

    // Replication recovery
    /// Replication gap detected; resend requested
    ReplicationGap,
    /// Replicated sub-entry belongs to a history local state never had
    StaleReferenceSkipped,
    /// Resend flushed a batch to the apply function
    ResendFlush,
    /// Resend finished
    ResendComplete,
    /// Failed to advance a DLQ ack level after a purge
    DlqAckLevelUpdateFailed,
    /// DLQ merge aborted; range left intact
    DlqMergeAborted,
    /// DLQ range purged
    DlqPurged,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::ConfigLoaded => "CONFIG_LOADED",

            Event::TombstonesDropped => "TOMBSTONES_DROPPED",
            Event::ChecksumInvalidated => "CHECKSUM_INVALIDATED",
            Event::ChecksumMismatch => "CHECKSUM_MISMATCH",
            Event::TransitionHistoryMigrated => "TRANSITION_HISTORY_MIGRATED",

            Event::CacheEvicted => "EXECUTION_CACHE_EVICTED",
            Event::ReloadExhausted => "INCIDENT_RELOAD_EXHAUSTED",

            Event::TaskUnexpectedError => "TASK_UNEXPECTED_ERROR",
            Event::TaskCriticalRetry => "TASK_CRITICAL_RETRY",
            Event::TaskPatternMatched => "INCIDENT_TASK_PATTERN_MATCHED",
            Event::TaskTerminal => "INCIDENT_TASK_TERMINAL",
            Event::TaskDropped => "INCIDENT_TASK_DROPPED",
            Event::TaskDlqWrite => "INCIDENT_DLQ_WRITE",
            Event::TaskPanic => "TASK_PANIC",
            Event::CircuitOpened => "CIRCUIT_OPENED",
            Event::CircuitClosed => "CIRCUIT_CLOSED",

            Event::ReplicationGap => "REPLICATION_GAP",
            Event::StaleReferenceSkipped => "STALE_REFERENCE_SKIPPED",
            Event::ResendFlush => "RESEND_FLUSH",
            Event::ResendComplete => "RESEND_COMPLETE",
            Event::DlqAckLevelUpdateFailed => "DLQ_ACK_LEVEL_UPDATE_FAILED",
            Event::DlqMergeAborted => "INCIDENT_DLQ_MERGE_ABORTED",
            Event::DlqPurged => "DLQ_PURGED",
        }
    }

    /// Returns true for events operators page on.
    pub fn is_incident(&self) -> bool {
        self.as_str().starts_with("INCIDENT_")
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incident_prefix() {
        assert!(Event::TaskTerminal.is_incident());
        assert!(Event::ReloadExhausted.is_incident());
        assert!(Event::DlqMergeAborted.is_incident());
        assert!(!Event::ResendFlush.is_incident());
    }
}
