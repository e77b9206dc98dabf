//! Execution aggregate types
//!
//! Identity, status and the pending-operation entries an execution carries.
//! Every entry records the versioned transition that last touched it so a
//! replica can tell which entries a given mutation supersedes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::versioning::VersionedTransition;

/// Identity of one execution
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionKey {
    pub namespace_id: String,
    pub workflow_id: String,
    pub run_id: String,
}

impl ExecutionKey {
    pub fn new(
        namespace_id: impl Into<String>,
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            namespace_id: namespace_id.into(),
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
        }
    }

    /// Key with a freshly generated run id.
    pub fn new_run(namespace_id: impl Into<String>, workflow_id: impl Into<String>) -> Self {
        Self::new(namespace_id, workflow_id, uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace_id, self.workflow_id, self.run_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Created,
    Running,
    Completed,
    Failed,
    Canceled,
    Terminated,
    TimedOut,
    ContinuedAsNew,
    /// Exists but must not make progress until a newer run is resolved
    Zombie,
}

impl ExecutionStatus {
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Canceled
                | ExecutionStatus::Terminated
                | ExecutionStatus::TimedOut
                | ExecutionStatus::ContinuedAsNew
        )
    }
}

/// Execution-level metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub key: ExecutionKey,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
    /// Id the next appended history event receives
    pub next_event_id: i64,
    /// Version of the last write to this execution
    pub last_write_version: i64,
}

impl ExecutionInfo {
    pub fn new(key: ExecutionKey, start_time: DateTime<Utc>) -> Self {
        Self {
            key,
            status: ExecutionStatus::Created,
            start_time,
            last_update_time: start_time,
            next_event_id: 1,
            last_write_version: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityInfo {
    pub scheduled_event_id: i64,
    pub activity_id: String,
    pub activity_type: String,
    pub attempt: i32,
    pub started_event_id: Option<i64>,
    pub last_update_versioned_transition: Option<VersionedTransition>,
}

impl ActivityInfo {
    pub fn new(scheduled_event_id: i64, activity_id: impl Into<String>, activity_type: impl Into<String>) -> Self {
        Self {
            scheduled_event_id,
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            attempt: 1,
            started_event_id: None,
            last_update_versioned_transition: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerInfo {
    pub timer_id: String,
    pub started_event_id: i64,
    pub expiry_time: DateTime<Utc>,
    pub last_update_versioned_transition: Option<VersionedTransition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildExecutionInfo {
    pub initiated_event_id: i64,
    pub workflow_id: String,
    pub run_id: Option<String>,
    pub last_update_versioned_transition: Option<VersionedTransition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestCancelInfo {
    pub initiated_event_id: i64,
    pub target_workflow_id: String,
    pub last_update_versioned_transition: Option<VersionedTransition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalInfo {
    pub initiated_event_id: i64,
    pub signal_name: String,
    pub target_workflow_id: String,
    pub last_update_versioned_transition: Option<VersionedTransition>,
}

/// Dedupe record of a received signal request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRequestedInfo {
    pub request_id: String,
    pub last_update_versioned_transition: Option<VersionedTransition>,
}

/// Node of the generic sub-state-machine tree, addressed by path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMachineNode {
    pub path: String,
    pub data: serde_json::Value,
    pub initial_versioned_transition: Option<VersionedTransition>,
    pub last_update_versioned_transition: Option<VersionedTransition>,
    /// Transitions this node went through
    pub transition_count: i64,
}

impl StateMachineNode {
    pub fn new(path: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            path: path.into(),
            data,
            initial_versioned_transition: None,
            last_update_versioned_transition: None,
            transition_count: 0,
        }
    }
}

/// What an operation believed about a state machine node when it was created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMachineRef {
    pub path: String,
    pub mutable_state_versioned_transition: VersionedTransition,
    pub machine_initial_versioned_transition: VersionedTransition,
    pub machine_last_update_versioned_transition: VersionedTransition,
    pub machine_transition_count: i64,
}
