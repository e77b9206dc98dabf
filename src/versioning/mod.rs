//! Versioned state
//!
//! Append-only fingerprints that tell how stale a view of an execution is:
//! - `VersionedTransition` orders state transitions across failovers
//! - `TransitionHistory` records them run-length encoded by failover version
//! - `VersionHistory` records event-id/version segments of the event history

mod errors;
mod transition;
mod version_history;

pub use errors::{VersioningError, VersioningResult};
pub use transition::{compare_versioned_transition, TransitionHistory, VersionedTransition};
pub use version_history::{VersionHistory, VersionHistoryItem};
