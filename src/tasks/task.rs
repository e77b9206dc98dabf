//! Outbound tasks
//!
//! Tasks are produced by transaction closes and consumed by the queue
//! processors. Ids are assigned by the store when the close is persisted.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::ExecutionKey;

/// Queue position of a task. Immediate tasks use the close time as
/// `fire_time`; timer tasks use their deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    pub fire_time: DateTime<Utc>,
    pub task_id: i64,
}

impl TaskKey {
    pub fn new(fire_time: DateTime<Utc>, task_id: i64) -> Self {
        Self { fire_time, task_id }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.task_id, self.fire_time.to_rfc3339())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskCategory {
    Transfer,
    Timer,
    Visibility,
    Replication,
}

impl TaskCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskCategory::Transfer => "transfer",
            TaskCategory::Timer => "timer",
            TaskCategory::Visibility => "visibility",
            TaskCategory::Replication => "replication",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    ActivityDispatch { scheduled_event_id: i64 },
    UserTimer { timer_id: String },
    UpsertVisibility,
    CloseVisibility,
    DeleteVisibility,
    HistoryReplication { first_event_id: i64, next_event_id: i64 },
    SyncActivity { scheduled_event_id: i64 },
    SyncHsm,
    SyncWorkflowState,
}

impl TaskKind {
    pub fn category(&self) -> TaskCategory {
        match self {
            TaskKind::ActivityDispatch { .. } => TaskCategory::Transfer,
            TaskKind::UserTimer { .. } => TaskCategory::Timer,
            TaskKind::UpsertVisibility | TaskKind::CloseVisibility | TaskKind::DeleteVisibility => {
                TaskCategory::Visibility
            }
            TaskKind::HistoryReplication { .. }
            | TaskKind::SyncActivity { .. }
            | TaskKind::SyncHsm
            | TaskKind::SyncWorkflowState => TaskCategory::Replication,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::ActivityDispatch { .. } => "ActivityDispatch",
            TaskKind::UserTimer { .. } => "UserTimer",
            TaskKind::UpsertVisibility => "UpsertVisibility",
            TaskKind::CloseVisibility => "CloseVisibility",
            TaskKind::DeleteVisibility => "DeleteVisibility",
            TaskKind::HistoryReplication { .. } => "HistoryReplication",
            TaskKind::SyncActivity { .. } => "SyncActivity",
            TaskKind::SyncHsm => "SyncHsm",
            TaskKind::SyncWorkflowState => "SyncWorkflowState",
        }
    }
}

/// Task generated by an execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub key: TaskKey,
    pub execution: ExecutionKey,
    /// Failover version the task was generated under
    pub version: i64,
    pub kind: TaskKind,
}

impl Task {
    pub fn new(execution: ExecutionKey, version: i64, fire_time: DateTime<Utc>, kind: TaskKind) -> Self {
        Self {
            key: TaskKey::new(fire_time, 0),
            execution,
            version,
            kind,
        }
    }

    pub fn category(&self) -> TaskCategory {
        self.kind.category()
    }
}

/// What the task engine needs to know about a unit of work.
pub trait TaskDescriptor: fmt::Debug + Send + Sync + 'static {
    fn key(&self) -> TaskKey;

    fn category(&self) -> TaskCategory;

    fn namespace_id(&self) -> &str;

    fn kind_name(&self) -> &'static str;
}

impl TaskDescriptor for Task {
    fn key(&self) -> TaskKey {
        self.key
    }

    fn category(&self) -> TaskCategory {
        self.kind.category()
    }

    fn namespace_id(&self) -> &str {
        &self.execution.namespace_id
    }

    fn kind_name(&self) -> &'static str {
        self.kind.name()
    }
}

/// Collapse redundant visibility tasks: a run of upserts keeps only the
/// last one, and an upsert directly followed by a delete becomes the delete.
pub fn collapse_visibility_tasks(tasks: Vec<Task>) -> Vec<Task> {
    let mut out: Vec<Task> = Vec::with_capacity(tasks.len());
    let mut last_visibility: Option<usize> = None;
    for task in tasks {
        if task.category() != TaskCategory::Visibility {
            out.push(task);
            continue;
        }
        if let Some(idx) = last_visibility {
            let previous_is_upsert = out[idx].kind == TaskKind::UpsertVisibility;
            let current_replaces = matches!(
                task.kind,
                TaskKind::UpsertVisibility | TaskKind::DeleteVisibility
            );
            if previous_is_upsert && current_replaces {
                out[idx] = task;
                continue;
            }
        }
        last_visibility = Some(out.len());
        out.push(task);
    }
    out
}
