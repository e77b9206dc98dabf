//! Inbound replication tasks and their DLQ projections
//!
//! A `ReplicationTask` is what a source cluster ships. The DLQ does not
//! store task bodies, only a `ReplicationTaskRecord` of coordinates; the
//! body is fetched back from the source cluster when an operator reads or
//! merges the DLQ.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{ActivityInfo, ExecutionKey, HistoryEvent, Mutation, Snapshot, StateMachineNode};
use crate::tasks::{TaskCategory, TaskDescriptor, TaskKey};
use crate::versioning::{VersionHistoryItem, VersionedTransition};

/// Full execution state shipped by a workflow-state sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateSync {
    Snapshot(Snapshot),
    Mutation(Mutation),
}

/// Replication task received from a source cluster.
///
/// The set of kinds is closed. Deserializing an unknown kind fails rather
/// than producing a task nobody knows how to apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationTask {
    SyncActivity {
        source_task_id: i64,
        visibility_time: DateTime<Utc>,
        execution: ExecutionKey,
        version: i64,
        activity: ActivityInfo,
        version_history_items: Vec<VersionHistoryItem>,
    },
    History {
        source_task_id: i64,
        visibility_time: DateTime<Utc>,
        execution: ExecutionKey,
        version: i64,
        events: Vec<HistoryEvent>,
        version_history_items: Vec<VersionHistoryItem>,
    },
    SyncWorkflowState {
        source_task_id: i64,
        visibility_time: DateTime<Utc>,
        execution: ExecutionKey,
        state: StateSync,
    },
    SyncHsm {
        source_task_id: i64,
        visibility_time: DateTime<Utc>,
        execution: ExecutionKey,
        versioned_transition: Option<VersionedTransition>,
        nodes: Vec<StateMachineNode>,
    },
}

impl ReplicationTask {
    pub fn source_task_id(&self) -> i64 {
        match self {
            ReplicationTask::SyncActivity { source_task_id, .. }
            | ReplicationTask::History { source_task_id, .. }
            | ReplicationTask::SyncWorkflowState { source_task_id, .. }
            | ReplicationTask::SyncHsm { source_task_id, .. } => *source_task_id,
        }
    }

    pub fn visibility_time(&self) -> DateTime<Utc> {
        match self {
            ReplicationTask::SyncActivity { visibility_time, .. }
            | ReplicationTask::History { visibility_time, .. }
            | ReplicationTask::SyncWorkflowState { visibility_time, .. }
            | ReplicationTask::SyncHsm { visibility_time, .. } => *visibility_time,
        }
    }

    pub fn execution(&self) -> &ExecutionKey {
        match self {
            ReplicationTask::SyncActivity { execution, .. }
            | ReplicationTask::History { execution, .. }
            | ReplicationTask::SyncWorkflowState { execution, .. }
            | ReplicationTask::SyncHsm { execution, .. } => execution,
        }
    }

    pub fn kind(&self) -> ReplicationTaskKind {
        match self {
            ReplicationTask::SyncActivity { .. } => ReplicationTaskKind::SyncActivity,
            ReplicationTask::History { .. } => ReplicationTaskKind::History,
            ReplicationTask::SyncWorkflowState { .. } => ReplicationTaskKind::SyncWorkflowState,
            ReplicationTask::SyncHsm { .. } => ReplicationTaskKind::SyncHsm,
        }
    }

    /// DLQ coordinates of this task.
    pub fn to_record(&self) -> ReplicationTaskRecord {
        let details = match self {
            ReplicationTask::SyncActivity {
                version, activity, ..
            } => RecordDetails::SyncActivity {
                scheduled_event_id: activity.scheduled_event_id,
                version: *version,
            },
            ReplicationTask::History {
                version, events, ..
            } => RecordDetails::History {
                first_event_id: events.first().map(|e| e.event_id).unwrap_or_default(),
                next_event_id: events.last().map(|e| e.event_id + 1).unwrap_or_default(),
                version: *version,
            },
            ReplicationTask::SyncWorkflowState { state, .. } => RecordDetails::SyncWorkflowState {
                versioned_transition: match state {
                    StateSync::Snapshot(snapshot) => snapshot.versioned_transition,
                    StateSync::Mutation(mutation) => mutation.versioned_transition,
                },
            },
            ReplicationTask::SyncHsm {
                versioned_transition,
                ..
            } => RecordDetails::SyncHsm {
                versioned_transition: *versioned_transition,
            },
        };
        ReplicationTaskRecord {
            task_id: self.source_task_id(),
            visibility_time: self.visibility_time(),
            execution: self.execution().clone(),
            details,
        }
    }
}

impl TaskDescriptor for ReplicationTask {
    fn key(&self) -> TaskKey {
        TaskKey::new(self.visibility_time(), self.source_task_id())
    }

    fn category(&self) -> TaskCategory {
        TaskCategory::Replication
    }

    fn namespace_id(&self) -> &str {
        &self.execution().namespace_id
    }

    fn kind_name(&self) -> &'static str {
        self.kind().as_str()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationTaskKind {
    SyncActivity,
    History,
    SyncWorkflowState,
    SyncHsm,
}

impl ReplicationTaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationTaskKind::SyncActivity => "sync_activity",
            ReplicationTaskKind::History => "history",
            ReplicationTaskKind::SyncWorkflowState => "sync_workflow_state",
            ReplicationTaskKind::SyncHsm => "sync_hsm",
        }
    }
}

impl fmt::Display for ReplicationTaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifying fields of a DLQ'd task, by kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordDetails {
    SyncActivity {
        scheduled_event_id: i64,
        version: i64,
    },
    History {
        first_event_id: i64,
        next_event_id: i64,
        version: i64,
    },
    SyncWorkflowState {
        versioned_transition: Option<VersionedTransition>,
    },
    SyncHsm {
        versioned_transition: Option<VersionedTransition>,
    },
}

/// What the DLQ stores for one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationTaskRecord {
    pub task_id: i64,
    pub visibility_time: DateTime<Utc>,
    pub execution: ExecutionKey,
    pub details: RecordDetails,
}

impl ReplicationTaskRecord {
    /// Project the record into the minimal info a source cluster needs to
    /// find the task body again.
    pub fn to_task_info(&self) -> ReplicationTaskInfo {
        let mut info = ReplicationTaskInfo {
            namespace_id: self.execution.namespace_id.clone(),
            workflow_id: self.execution.workflow_id.clone(),
            run_id: self.execution.run_id.clone(),
            task_id: self.task_id,
            task_kind: ReplicationTaskKind::History,
            visibility_time: self.visibility_time,
            version: 0,
            first_event_id: 0,
            next_event_id: 0,
            scheduled_event_id: 0,
            versioned_transition: None,
        };
        match &self.details {
            RecordDetails::SyncActivity {
                scheduled_event_id,
                version,
            } => {
                info.task_kind = ReplicationTaskKind::SyncActivity;
                info.scheduled_event_id = *scheduled_event_id;
                info.version = *version;
            }
            RecordDetails::History {
                first_event_id,
                next_event_id,
                version,
            } => {
                info.task_kind = ReplicationTaskKind::History;
                info.first_event_id = *first_event_id;
                info.next_event_id = *next_event_id;
                info.version = *version;
            }
            RecordDetails::SyncWorkflowState {
                versioned_transition,
            } => {
                info.task_kind = ReplicationTaskKind::SyncWorkflowState;
                info.versioned_transition = *versioned_transition;
            }
            RecordDetails::SyncHsm {
                versioned_transition,
            } => {
                info.task_kind = ReplicationTaskKind::SyncHsm;
                info.versioned_transition = *versioned_transition;
            }
        }
        info
    }
}

/// Minimal task info sent back to the source cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationTaskInfo {
    pub namespace_id: String,
    pub workflow_id: String,
    pub run_id: String,
    pub task_id: i64,
    pub task_kind: ReplicationTaskKind,
    pub visibility_time: DateTime<Utc>,
    pub version: i64,
    pub first_event_id: i64,
    pub next_event_id: i64,
    pub scheduled_event_id: i64,
    pub versioned_transition: Option<VersionedTransition>,
}
