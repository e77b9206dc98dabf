//! Deletion tombstones
//!
//! Entries removed between two closes are remembered as tombstones tagged
//! with the transition that removed them, so an incremental replica learns
//! about deletions instead of silently keeping stale entries. The log is
//! capped; once a close would exceed the cap the execution stops tracking
//! tombstones and replicas catch up through snapshots.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::versioning::VersionedTransition;

/// Address of a sub-entry across all categories
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SubEntryKey {
    Activity(i64),
    Timer(String),
    ChildExecution(i64),
    RequestCancel(i64),
    SignalExternal(i64),
    SignalRequested(String),
    StateMachineNode(String),
}

impl fmt::Display for SubEntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubEntryKey::Activity(id) => write!(f, "activity:{}", id),
            SubEntryKey::Timer(id) => write!(f, "timer:{}", id),
            SubEntryKey::ChildExecution(id) => write!(f, "child:{}", id),
            SubEntryKey::RequestCancel(id) => write!(f, "request_cancel:{}", id),
            SubEntryKey::SignalExternal(id) => write!(f, "signal:{}", id),
            SubEntryKey::SignalRequested(id) => write!(f, "signal_requested:{}", id),
            SubEntryKey::StateMachineNode(path) => write!(f, "node:{}", path),
        }
    }
}

/// Tombstones produced by one close
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TombstoneBatch {
    pub versioned_transition: VersionedTransition,
    pub tombstones: Vec<SubEntryKey>,
}

/// Result of recording a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TombstoneOutcome {
    /// Nothing was deleted
    Empty,
    Recorded(TombstoneBatch),
    /// Log was already disabled; deletions are only visible through snapshots
    Untracked,
    /// The batch exceeded the cap; the log was cleared and disabled
    Dropped { count: usize },
}

/// Per-execution tombstone log
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TombstoneLog {
    batches: Vec<TombstoneBatch>,
    total: usize,
    disabled: bool,
}

impl TombstoneLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> &[TombstoneBatch] {
        &self.batches
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Record the deletions of one close, evicting the oldest batches to
    /// stay within `limit`.
    pub fn record(
        &mut self,
        transition: VersionedTransition,
        keys: Vec<SubEntryKey>,
        limit: usize,
    ) -> TombstoneOutcome {
        if keys.is_empty() {
            return TombstoneOutcome::Empty;
        }
        if self.disabled {
            return TombstoneOutcome::Untracked;
        }
        if keys.len() > limit {
            let count = keys.len();
            self.batches.clear();
            self.total = 0;
            self.disabled = true;
            return TombstoneOutcome::Dropped { count };
        }

        let batch = TombstoneBatch {
            versioned_transition: transition,
            tombstones: keys,
        };
        self.total += batch.tombstones.len();
        self.batches.push(batch.clone());
        while self.total > limit && !self.batches.is_empty() {
            let evicted = self.batches.remove(0);
            self.total -= evicted.tombstones.len();
        }
        TombstoneOutcome::Recorded(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: i64) -> Vec<SubEntryKey> {
        (0..n).map(SubEntryKey::Activity).collect()
    }

    #[test]
    fn test_record_within_cap() {
        let mut log = TombstoneLog::new();
        let vt = VersionedTransition::new(1, 2);
        match log.record(vt, keys(3), 16) {
            TombstoneOutcome::Recorded(batch) => {
                assert_eq!(batch.versioned_transition, vt);
                assert_eq!(batch.tombstones.len(), 3);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(log.total(), 3);
    }

    #[test]
    fn test_record_over_cap_drops_and_disables() {
        let mut log = TombstoneLog::new();
        log.record(VersionedTransition::new(1, 1), keys(2), 4);
        let outcome = log.record(VersionedTransition::new(1, 2), keys(5), 4);
        assert_eq!(outcome, TombstoneOutcome::Dropped { count: 5 });
        assert!(log.is_disabled());
        assert!(log.batches().is_empty());
        assert_eq!(
            log.record(VersionedTransition::new(1, 3), keys(1), 4),
            TombstoneOutcome::Untracked
        );
    }

    #[test]
    fn test_oldest_batches_evicted() {
        let mut log = TombstoneLog::new();
        log.record(VersionedTransition::new(1, 1), keys(3), 4);
        log.record(VersionedTransition::new(1, 2), keys(3), 4);
        assert_eq!(log.batches().len(), 1);
        assert_eq!(log.batches()[0].versioned_transition, VersionedTransition::new(1, 2));
        assert_eq!(log.total(), 3);
    }
}
