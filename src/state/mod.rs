//! Execution state
//!
//! The durable, event-sourced aggregate of one execution and the
//! close-transaction protocol that turns in-memory edits into a persistable
//! `Mutation` or `Snapshot`.

mod cache;
mod checksum;
mod errors;
mod events;
mod execution;
mod mutable_state;
mod store;
mod sub_state;
mod tombstone;

pub use cache::{CacheOutcome, ExecutionCache, LockedExecution};
pub use checksum::{Checksum, ChecksumFlavor};
pub use errors::{StateError, StateResult};
pub use events::{EventType, HistoryEvent};
pub use execution::{
    ActivityInfo, ChildExecutionInfo, ExecutionInfo, ExecutionKey, ExecutionStatus,
    RequestCancelInfo, SignalInfo, SignalRequestedInfo, StateMachineNode, StateMachineRef,
    TimerInfo,
};
pub use mutable_state::{ExecutionState, MutableState, Mutation, Snapshot, TransactionPolicy};
pub use store::{ExecutionStore, InMemoryExecutionStore};
pub use sub_state::{SubStateChanges, SubStateMap, VersionedEntry};
pub use tombstone::{SubEntryKey, TombstoneBatch, TombstoneLog, TombstoneOutcome};

/// Verify a state against a checksum; exposed for persistence drivers.
pub fn verify_checksum(state: &ExecutionState, stored: &Checksum) -> StateResult<()> {
    checksum::verify(state, stored)
}
