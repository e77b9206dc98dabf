//! History events
//!
//! Only the envelope matters here: id, version and type drive batching and
//! version-history bookkeeping. Payloads stay opaque JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    WorkflowExecutionStarted,
    WorkflowTaskScheduled,
    WorkflowTaskStarted,
    WorkflowTaskCompleted,
    ActivityTaskScheduled,
    ActivityTaskStarted,
    ActivityTaskCompleted,
    TimerStarted,
    TimerFired,
    SignalExternalWorkflowExecutionInitiated,
    RequestCancelExternalWorkflowExecutionInitiated,
    StartChildWorkflowExecutionInitiated,
    WorkflowExecutionSignaled,
    WorkflowExecutionCompleted,
    WorkflowExecutionFailed,
    WorkflowExecutionTerminated,
}

impl EventType {
    /// Events after which the execution is closed.
    pub fn closes_execution(&self) -> bool {
        matches!(
            self,
            EventType::WorkflowExecutionCompleted
                | EventType::WorkflowExecutionFailed
                | EventType::WorkflowExecutionTerminated
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub event_id: i64,
    pub version: i64,
    pub event_time: DateTime<Utc>,
    pub event_type: EventType,
    #[serde(default)]
    pub attributes: serde_json::Value,
}

impl HistoryEvent {
    pub fn new(event_id: i64, version: i64, event_type: EventType, event_time: DateTime<Utc>) -> Self {
        Self {
            event_id,
            version,
            event_time,
            event_type,
            attributes: serde_json::Value::Null,
        }
    }
}
