//! Mutable execution state and the close-transaction protocol
//!
//! A `MutableState` owns one execution's in-memory aggregate. Edits happen
//! between `start_transaction` and one of the close calls:
//!
//! - `close_transaction_as_mutation` exports only what changed since the
//!   previous close (plus new tombstones)
//! - `close_transaction_as_snapshot` exports the complete aggregate
//!
//! With the Active policy a close that changed anything advances the
//! transition history and stamps every modified entry with the new
//! transition. Passive closes never advance; the transition history of a
//! replica is whatever the source sent.
//!
//! `apply_mutation` / `apply_snapshot` are the replica-side inverse and are
//! idempotent: anything at or before the local transition is ignored.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::checksum::{self, Checksum};
use super::errors::{StateError, StateResult};
use super::events::{EventType, HistoryEvent};
use super::execution::{
    ActivityInfo, ChildExecutionInfo, ExecutionInfo, ExecutionKey, ExecutionStatus,
    RequestCancelInfo, SignalInfo, SignalRequestedInfo, StateMachineNode, StateMachineRef,
    TimerInfo,
};
use super::sub_state::{SubStateChanges, SubStateMap};
use super::tombstone::{SubEntryKey, TombstoneBatch, TombstoneLog, TombstoneOutcome};
use crate::config::TransactionConfig;
use crate::namespace::NamespaceEntry;
use crate::observability::{Event, Logger};
use crate::tasks::{collapse_visibility_tasks, Task, TaskKind};
use crate::versioning::{
    TransitionHistory, VersionHistory, VersionHistoryItem, VersionedTransition,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionPolicy {
    /// The current cluster owns the execution and originates transitions
    Active,
    /// The change came from another cluster
    Passive,
}

/// Persisted form of an execution aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub execution_info: ExecutionInfo,
    pub transition_history: TransitionHistory,
    /// History kept aside when tracking was switched off
    #[serde(default)]
    pub previous_transition_history: Option<TransitionHistory>,
    /// Whether transition history was tracked when this state was persisted
    pub transition_history_tracked: bool,
    pub version_history: VersionHistory,
    pub activities: SubStateMap<i64, ActivityInfo>,
    pub timers: SubStateMap<String, TimerInfo>,
    pub child_executions: SubStateMap<i64, ChildExecutionInfo>,
    pub request_cancels: SubStateMap<i64, RequestCancelInfo>,
    pub signal_externals: SubStateMap<i64, SignalInfo>,
    pub signal_requested: SubStateMap<String, SignalRequestedInfo>,
    pub state_machine_nodes: SubStateMap<String, StateMachineNode>,
    pub tombstones: TombstoneLog,
    pub checksum: Option<Checksum>,
    pub db_record_version: i64,
}

impl ExecutionState {
    pub fn new(execution_info: ExecutionInfo) -> Self {
        Self {
            execution_info,
            transition_history: TransitionHistory::new(),
            previous_transition_history: None,
            transition_history_tracked: false,
            version_history: VersionHistory::new(),
            activities: SubStateMap::new(),
            timers: SubStateMap::new(),
            child_executions: SubStateMap::new(),
            request_cancels: SubStateMap::new(),
            signal_externals: SubStateMap::new(),
            signal_requested: SubStateMap::new(),
            state_machine_nodes: SubStateMap::new(),
            tombstones: TombstoneLog::new(),
            checksum: None,
            db_record_version: 0,
        }
    }

    pub fn key(&self) -> &ExecutionKey {
        &self.execution_info.key
    }

    pub fn current_versioned_transition(&self) -> Option<VersionedTransition> {
        self.transition_history.last().copied()
    }

    fn has_entry_changes(&self) -> bool {
        self.activities.has_changes()
            || self.timers.has_changes()
            || self.child_executions.has_changes()
            || self.request_cancels.has_changes()
            || self.signal_externals.has_changes()
            || self.signal_requested.has_changes()
            || self.state_machine_nodes.has_changes()
    }

    fn deleted_keys(&self) -> Vec<SubEntryKey> {
        let mut keys = Vec::new();
        keys.extend(self.activities.deleted_keys().map(|k| SubEntryKey::Activity(*k)));
        keys.extend(self.timers.deleted_keys().map(|k| SubEntryKey::Timer(k.clone())));
        keys.extend(
            self.child_executions
                .deleted_keys()
                .map(|k| SubEntryKey::ChildExecution(*k)),
        );
        keys.extend(
            self.request_cancels
                .deleted_keys()
                .map(|k| SubEntryKey::RequestCancel(*k)),
        );
        keys.extend(
            self.signal_externals
                .deleted_keys()
                .map(|k| SubEntryKey::SignalExternal(*k)),
        );
        keys.extend(
            self.signal_requested
                .deleted_keys()
                .map(|k| SubEntryKey::SignalRequested(k.clone())),
        );
        keys.extend(
            self.state_machine_nodes
                .deleted_keys()
                .map(|k| SubEntryKey::StateMachineNode(k.clone())),
        );
        keys
    }

    fn stamp_updated(&mut self, transition: VersionedTransition) {
        self.activities.stamp_updated(transition);
        self.timers.stamp_updated(transition);
        self.child_executions.stamp_updated(transition);
        self.request_cancels.stamp_updated(transition);
        self.signal_externals.stamp_updated(transition);
        self.signal_requested.stamp_updated(transition);
        self.state_machine_nodes.stamp_updated(transition);
    }

    fn stamp_all(&mut self, transition: VersionedTransition) {
        self.activities.stamp_all(transition);
        self.timers.stamp_all(transition);
        self.child_executions.stamp_all(transition);
        self.request_cancels.stamp_all(transition);
        self.signal_externals.stamp_all(transition);
        self.signal_requested.stamp_all(transition);
        self.state_machine_nodes.stamp_all(transition);
    }

    fn clear_changes(&mut self) {
        self.activities.clear_changes();
        self.timers.clear_changes();
        self.child_executions.clear_changes();
        self.request_cancels.clear_changes();
        self.signal_externals.clear_changes();
        self.signal_requested.clear_changes();
        self.state_machine_nodes.clear_changes();
    }

    fn remove_entry(&mut self, key: &SubEntryKey) {
        match key {
            SubEntryKey::Activity(id) => self.activities.remove_untracked(id),
            SubEntryKey::Timer(id) => self.timers.remove_untracked(id),
            SubEntryKey::ChildExecution(id) => self.child_executions.remove_untracked(id),
            SubEntryKey::RequestCancel(id) => self.request_cancels.remove_untracked(id),
            SubEntryKey::SignalExternal(id) => self.signal_externals.remove_untracked(id),
            SubEntryKey::SignalRequested(id) => self.signal_requested.remove_untracked(id),
            SubEntryKey::StateMachineNode(path) => self.state_machine_nodes.remove_untracked(path),
        }
    }

    /// Apply an incremental change without any ordering checks. The
    /// record version stays local.
    pub fn apply_mutation(&mut self, mutation: &Mutation) {
        self.execution_info = mutation.execution_info.clone();
        self.transition_history = mutation.transition_history.clone();
        self.transition_history_tracked = mutation.transition_history_tracked;
        self.version_history = mutation.version_history.clone();
        self.activities.apply_changes(&mutation.activities);
        self.timers.apply_changes(&mutation.timers);
        self.child_executions.apply_changes(&mutation.child_executions);
        self.request_cancels.apply_changes(&mutation.request_cancels);
        self.signal_externals.apply_changes(&mutation.signal_externals);
        self.signal_requested.apply_changes(&mutation.signal_requested);
        self.state_machine_nodes.apply_changes(&mutation.state_machine_nodes);
        if let Some(batch) = &mutation.new_tombstone_batch {
            for key in &batch.tombstones {
                self.remove_entry(key);
            }
        }
        self.tombstones = mutation.tombstones.clone();
        self.checksum = mutation.checksum;
    }
}

/// Incremental close output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub key: ExecutionKey,
    /// Transition the receiver must be at for this mutation to apply
    pub exclusive_start_versioned_transition: Option<VersionedTransition>,
    pub versioned_transition: Option<VersionedTransition>,
    pub execution_info: ExecutionInfo,
    pub transition_history: TransitionHistory,
    pub transition_history_tracked: bool,
    pub version_history: VersionHistory,
    pub activities: SubStateChanges<i64, ActivityInfo>,
    pub timers: SubStateChanges<String, TimerInfo>,
    pub child_executions: SubStateChanges<i64, ChildExecutionInfo>,
    pub request_cancels: SubStateChanges<i64, RequestCancelInfo>,
    pub signal_externals: SubStateChanges<i64, SignalInfo>,
    pub signal_requested: SubStateChanges<String, SignalRequestedInfo>,
    pub state_machine_nodes: SubStateChanges<String, StateMachineNode>,
    pub new_tombstone_batch: Option<TombstoneBatch>,
    /// Tombstone log after this close
    pub tombstones: TombstoneLog,
    pub new_events: Vec<HistoryEvent>,
    pub tasks: Vec<Task>,
    pub checksum: Option<Checksum>,
    pub db_record_version: i64,
    /// Incremental replication cannot represent this close
    pub requires_snapshot: bool,
}

/// Complete close output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub versioned_transition: Option<VersionedTransition>,
    pub state: ExecutionState,
    pub new_events: Vec<HistoryEvent>,
    pub tasks: Vec<Task>,
}

impl Snapshot {
    pub fn key(&self) -> &ExecutionKey {
        self.state.key()
    }
}

struct ClosedTransaction {
    tombstone_batch: Option<TombstoneBatch>,
    new_events: Vec<HistoryEvent>,
    tasks: Vec<Task>,
    requires_snapshot: bool,
}

/// One execution's state plus the bookkeeping of the open transaction
#[derive(Debug, Clone)]
pub struct MutableState {
    state: ExecutionState,
    namespace: Arc<NamespaceEntry>,
    config: Arc<TransactionConfig>,
    in_transaction: bool,
    exclusive_start: Option<VersionedTransition>,
    info_changed: bool,
    status_changed: bool,
    pending_events: Vec<HistoryEvent>,
    pending_visibility: Vec<TaskKind>,
    /// Set once a transaction is aborted over partial edits
    needs_reload: bool,
}

impl MutableState {
    /// A brand-new execution. Transition tracking starts in whatever mode
    /// is configured, so no migration is needed on the first close.
    pub fn new(
        key: ExecutionKey,
        namespace: Arc<NamespaceEntry>,
        config: Arc<TransactionConfig>,
        start_time: DateTime<Utc>,
    ) -> Self {
        let mut state = ExecutionState::new(ExecutionInfo::new(key, start_time));
        state.transition_history_tracked = config.transition_history_enabled;
        Self::from_parts(state, namespace, config)
    }

    /// Wrap persisted state, verifying its checksum when the verify roll
    /// hits. State last written before the invalidation threshold has its
    /// checksum discarded instead of failing the load.
    pub fn load(
        state: ExecutionState,
        namespace: Arc<NamespaceEntry>,
        config: Arc<TransactionConfig>,
    ) -> StateResult<Self> {
        let mut state = state;
        state.clear_changes();
        let invalidated = config
            .checksum
            .invalidate_before
            .map(|threshold| state.execution_info.last_update_time < threshold)
            .unwrap_or(false);

        if let Some(stored) = state.checksum {
            if invalidated {
                state.checksum = None;
                Logger::info(
                    Event::ChecksumInvalidated,
                    &[("execution", &state.key().to_string())],
                );
            } else if checksum::roll(config.checksum.verify_probability) {
                if let Err(err) = checksum::verify(&state, &stored) {
                    Logger::error(
                        Event::ChecksumMismatch,
                        &[
                            ("error", &err.to_string()),
                            ("execution", &state.key().to_string()),
                        ],
                    );
                    return Err(err);
                }
            }
        }
        Ok(Self::from_parts(state, namespace, config))
    }

    /// Replica-side construction from a full snapshot. The result has not
    /// been persisted locally yet.
    pub fn from_snapshot(
        snapshot: &Snapshot,
        namespace: Arc<NamespaceEntry>,
        config: Arc<TransactionConfig>,
    ) -> Self {
        let mut state = snapshot.state.clone();
        state.clear_changes();
        state.db_record_version = 0;
        Self::from_parts(state, namespace, config)
    }

    fn from_parts(
        state: ExecutionState,
        namespace: Arc<NamespaceEntry>,
        config: Arc<TransactionConfig>,
    ) -> Self {
        Self {
            state,
            namespace,
            config,
            in_transaction: false,
            exclusive_start: None,
            info_changed: false,
            status_changed: false,
            pending_events: Vec::new(),
            pending_visibility: Vec::new(),
            needs_reload: false,
        }
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    pub fn key(&self) -> &ExecutionKey {
        self.state.key()
    }

    pub fn status(&self) -> ExecutionStatus {
        self.state.execution_info.status
    }

    pub fn namespace(&self) -> &Arc<NamespaceEntry> {
        &self.namespace
    }

    pub fn next_event_id(&self) -> i64 {
        self.state.execution_info.next_event_id
    }

    pub fn current_versioned_transition(&self) -> Option<VersionedTransition> {
        self.state.current_versioned_transition()
    }

    pub fn version_history(&self) -> &VersionHistory {
        &self.state.version_history
    }

    pub fn tombstones(&self) -> &TombstoneLog {
        &self.state.tombstones
    }

    pub fn is_in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// The in-memory state may hold edits the store never saw.
    pub fn needs_reload(&self) -> bool {
        self.needs_reload
    }

    /// Failover version new transitions and events are written under.
    pub fn current_version(&self) -> i64 {
        if self.namespace.is_global {
            self.namespace.replication.failover_version
        } else {
            0
        }
    }

    pub fn start_transaction(&mut self, namespace: Arc<NamespaceEntry>) -> StateResult<()> {
        if self.in_transaction {
            return Err(StateError::TransactionOpen);
        }
        self.namespace = namespace;
        self.exclusive_start = self.state.current_versioned_transition();
        self.in_transaction = true;
        Ok(())
    }

    fn ensure_open(&self) -> StateResult<()> {
        if self.in_transaction {
            Ok(())
        } else {
            Err(StateError::NoTransaction)
        }
    }

    // -----------------------------------------------------------------
    // Edits
    // -----------------------------------------------------------------

    pub fn set_status(&mut self, status: ExecutionStatus) -> StateResult<()> {
        self.ensure_open()?;
        if self.state.execution_info.status == status {
            return Ok(());
        }
        self.state.execution_info.status = status;
        self.info_changed = true;
        self.status_changed = true;
        self.pending_visibility.push(TaskKind::UpsertVisibility);
        if status.is_closed() {
            self.pending_visibility.push(TaskKind::CloseVisibility);
        }
        Ok(())
    }

    /// Append a locally generated event.
    pub fn add_history_event(
        &mut self,
        event_type: EventType,
        event_time: DateTime<Utc>,
        attributes: serde_json::Value,
    ) -> StateResult<HistoryEvent> {
        self.ensure_open()?;
        let mut event = HistoryEvent::new(
            self.state.execution_info.next_event_id,
            self.current_version(),
            event_type,
            event_time,
        );
        event.attributes = attributes;
        self.state.execution_info.next_event_id += 1;
        self.info_changed = true;
        self.pending_events.push(event.clone());
        Ok(event)
    }

    /// Append events replicated from another cluster. Events already
    /// present locally are skipped; a batch starting past the next local
    /// event id is a gap.
    pub fn append_replicated_events(&mut self, events: &[HistoryEvent]) -> StateResult<()> {
        self.ensure_open()?;
        let next = self.state.execution_info.next_event_id;
        let Some(first) = events.first() else {
            return Ok(());
        };
        if first.event_id > next {
            return Err(StateError::EventGap {
                next_event_id: next,
                first_event_id: first.event_id,
            });
        }
        for event in events.iter().filter(|e| e.event_id >= next) {
            if event.event_id != self.state.execution_info.next_event_id {
                return Err(StateError::EventGap {
                    next_event_id: self.state.execution_info.next_event_id,
                    first_event_id: event.event_id,
                });
            }
            self.state.execution_info.next_event_id += 1;
            self.state.execution_info.last_write_version = event.version;
            self.info_changed = true;
            self.pending_events.push(event.clone());
            match event.event_type {
                EventType::WorkflowExecutionStarted => self.set_status(ExecutionStatus::Running)?,
                EventType::WorkflowExecutionCompleted => self.set_status(ExecutionStatus::Completed)?,
                EventType::WorkflowExecutionFailed => self.set_status(ExecutionStatus::Failed)?,
                EventType::WorkflowExecutionTerminated => {
                    self.set_status(ExecutionStatus::Terminated)?
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn activities(&self) -> &SubStateMap<i64, ActivityInfo> {
        &self.state.activities
    }

    pub fn activities_mut(&mut self) -> StateResult<&mut SubStateMap<i64, ActivityInfo>> {
        self.ensure_open()?;
        Ok(&mut self.state.activities)
    }

    pub fn timers(&self) -> &SubStateMap<String, TimerInfo> {
        &self.state.timers
    }

    pub fn timers_mut(&mut self) -> StateResult<&mut SubStateMap<String, TimerInfo>> {
        self.ensure_open()?;
        Ok(&mut self.state.timers)
    }

    pub fn child_executions(&self) -> &SubStateMap<i64, ChildExecutionInfo> {
        &self.state.child_executions
    }

    pub fn child_executions_mut(&mut self) -> StateResult<&mut SubStateMap<i64, ChildExecutionInfo>> {
        self.ensure_open()?;
        Ok(&mut self.state.child_executions)
    }

    pub fn request_cancels(&self) -> &SubStateMap<i64, RequestCancelInfo> {
        &self.state.request_cancels
    }

    pub fn request_cancels_mut(&mut self) -> StateResult<&mut SubStateMap<i64, RequestCancelInfo>> {
        self.ensure_open()?;
        Ok(&mut self.state.request_cancels)
    }

    pub fn signal_externals(&self) -> &SubStateMap<i64, SignalInfo> {
        &self.state.signal_externals
    }

    pub fn signal_externals_mut(&mut self) -> StateResult<&mut SubStateMap<i64, SignalInfo>> {
        self.ensure_open()?;
        Ok(&mut self.state.signal_externals)
    }

    pub fn signal_requested(&self) -> &SubStateMap<String, SignalRequestedInfo> {
        &self.state.signal_requested
    }

    pub fn signal_requested_mut(&mut self) -> StateResult<&mut SubStateMap<String, SignalRequestedInfo>> {
        self.ensure_open()?;
        Ok(&mut self.state.signal_requested)
    }

    pub fn state_machine_nodes(&self) -> &SubStateMap<String, StateMachineNode> {
        &self.state.state_machine_nodes
    }

    pub fn state_machine_nodes_mut(&mut self) -> StateResult<&mut SubStateMap<String, StateMachineNode>> {
        self.ensure_open()?;
        Ok(&mut self.state.state_machine_nodes)
    }

    /// Request a visibility refresh on close.
    pub fn upsert_visibility(&mut self) -> StateResult<()> {
        self.ensure_open()?;
        self.pending_visibility.push(TaskKind::UpsertVisibility);
        Ok(())
    }

    /// Remove the execution from visibility on close.
    pub fn delete_execution(&mut self) -> StateResult<()> {
        self.ensure_open()?;
        self.pending_visibility.push(TaskKind::DeleteVisibility);
        Ok(())
    }

    /// Check that an operation created against a state machine node still
    /// addresses the same node incarnation.
    pub fn validate_state_machine_ref(&self, reference: &StateMachineRef) -> StateResult<()> {
        if !self.state.transition_history_tracked || self.state.transition_history.is_empty() {
            return Ok(());
        }
        self.state
            .transition_history
            .staleness_check(&reference.mutable_state_versioned_transition)?;

        let node = self
            .state
            .state_machine_nodes
            .get(&reference.path)
            .ok_or_else(|| {
                StateError::StaleReference(format!("node {} no longer exists", reference.path))
            })?;

        if let Some(initial) = node.initial_versioned_transition {
            if reference.machine_initial_versioned_transition < initial {
                return Err(StateError::StaleReference(format!(
                    "reference to {} predates node created at {}",
                    reference.path, initial
                )));
            }
            if reference.machine_initial_versioned_transition > initial {
                return Err(StateError::StaleState(format!(
                    "node {} created at {} is older than referenced {}",
                    reference.path, initial, reference.machine_initial_versioned_transition
                )));
            }
        }
        if let Some(last) = node.last_update_versioned_transition {
            if reference.machine_last_update_versioned_transition > last {
                return Err(StateError::StaleState(format!(
                    "node {} last updated at {}, reference expects {}",
                    reference.path, last, reference.machine_last_update_versioned_transition
                )));
            }
            if reference.machine_last_update_versioned_transition < last
                && reference.machine_transition_count != node.transition_count
            {
                return Err(StateError::StaleReference(format!(
                    "node {} transitioned since reference",
                    reference.path
                )));
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Close
    // -----------------------------------------------------------------

    fn has_changes(&self) -> bool {
        self.info_changed
            || self.state.has_entry_changes()
            || !self.pending_events.is_empty()
            || !self.pending_visibility.is_empty()
    }

    fn close(&mut self, now: DateTime<Utc>, policy: TransactionPolicy) -> StateResult<ClosedTransaction> {
        self.ensure_open()?;
        let changed = self.has_changes();
        let mut requires_snapshot = false;
        let mut tombstone_batch = None;
        let key = self.state.key().to_string();

        if policy == TransactionPolicy::Active {
            if self.config.transition_history_enabled {
                let migrating = !self.state.transition_history_tracked;
                if changed || migrating {
                    let transition = self
                        .state
                        .transition_history
                        .advance(self.current_version())?;
                    if migrating {
                        self.state.stamp_all(transition);
                        self.state.transition_history_tracked = true;
                        requires_snapshot = true;
                        Logger::info(
                            Event::TransitionHistoryMigrated,
                            &[("enabled", "true"), ("execution", &key)],
                        );
                    } else {
                        self.state.stamp_updated(transition);
                    }

                    let deleted = self.state.deleted_keys();
                    match self.state.tombstones.record(
                        transition,
                        deleted,
                        self.config.tombstone_count_limit,
                    ) {
                        TombstoneOutcome::Empty => {}
                        TombstoneOutcome::Recorded(batch) => tombstone_batch = Some(batch),
                        TombstoneOutcome::Untracked => requires_snapshot = true,
                        TombstoneOutcome::Dropped { count } => {
                            requires_snapshot = true;
                            Logger::warn(
                                Event::TombstonesDropped,
                                &[
                                    ("count", &count.to_string()),
                                    ("execution", &key),
                                    ("limit", &self.config.tombstone_count_limit.to_string()),
                                ],
                            );
                        }
                    }
                }
            } else if self.state.transition_history_tracked {
                let previous = self.state.transition_history.take();
                self.state.previous_transition_history = Some(previous);
                self.state.transition_history_tracked = false;
                requires_snapshot = true;
                Logger::info(
                    Event::TransitionHistoryMigrated,
                    &[("enabled", "false"), ("execution", &key)],
                );
            }
        }

        let new_events = std::mem::take(&mut self.pending_events);
        for event in &new_events {
            self.state
                .version_history
                .add_or_update_item(VersionHistoryItem::new(event.event_id, event.version))?;
        }

        if changed {
            self.state.execution_info.last_update_time = now;
            if policy == TransactionPolicy::Active {
                self.state.execution_info.last_write_version = self.current_version();
            }
        }

        let tasks = self.generate_tasks(policy, now, &new_events);

        self.state.db_record_version += 1;
        self.state.checksum = if checksum::roll(self.config.checksum.generate_probability) {
            Some(checksum::generate(&self.state)?)
        } else {
            None
        };

        self.in_transaction = false;
        self.info_changed = false;
        self.status_changed = false;

        Ok(ClosedTransaction {
            tombstone_batch,
            new_events,
            tasks,
            requires_snapshot,
        })
    }

    fn generate_tasks(
        &mut self,
        policy: TransactionPolicy,
        now: DateTime<Utc>,
        new_events: &[HistoryEvent],
    ) -> Vec<Task> {
        let key = self.state.key().clone();
        let version = self.current_version();
        let mut tasks: Vec<Task> = self
            .pending_visibility
            .drain(..)
            .map(|kind| Task::new(key.clone(), version, now, kind))
            .collect();

        if policy == TransactionPolicy::Active && self.namespace.is_global {
            if let (Some(first), Some(last)) = (new_events.first(), new_events.last()) {
                tasks.push(Task::new(
                    key.clone(),
                    version,
                    now,
                    TaskKind::HistoryReplication {
                        first_event_id: first.event_id,
                        next_event_id: last.event_id + 1,
                    },
                ));
            }
            for scheduled_event_id in self.state.activities.updated_keys() {
                tasks.push(Task::new(
                    key.clone(),
                    version,
                    now,
                    TaskKind::SyncActivity {
                        scheduled_event_id: *scheduled_event_id,
                    },
                ));
            }
            if self.state.state_machine_nodes.has_changes() {
                tasks.push(Task::new(key.clone(), version, now, TaskKind::SyncHsm));
            }
            if self.status_changed && self.status().is_closed() {
                tasks.push(Task::new(key.clone(), version, now, TaskKind::SyncWorkflowState));
            }
        }
        collapse_visibility_tasks(tasks)
    }

    pub fn close_transaction_as_mutation(
        &mut self,
        now: DateTime<Utc>,
        policy: TransactionPolicy,
    ) -> StateResult<Mutation> {
        let exclusive_start = self.exclusive_start;
        let closed = self.close(now, policy)?;
        let state = &mut self.state;
        Ok(Mutation {
            key: state.key().clone(),
            exclusive_start_versioned_transition: exclusive_start,
            versioned_transition: state.current_versioned_transition(),
            execution_info: state.execution_info.clone(),
            transition_history: state.transition_history.clone(),
            transition_history_tracked: state.transition_history_tracked,
            version_history: state.version_history.clone(),
            activities: state.activities.take_changes(),
            timers: state.timers.take_changes(),
            child_executions: state.child_executions.take_changes(),
            request_cancels: state.request_cancels.take_changes(),
            signal_externals: state.signal_externals.take_changes(),
            signal_requested: state.signal_requested.take_changes(),
            state_machine_nodes: state.state_machine_nodes.take_changes(),
            new_tombstone_batch: closed.tombstone_batch,
            tombstones: state.tombstones.clone(),
            new_events: closed.new_events,
            tasks: closed.tasks,
            checksum: state.checksum,
            db_record_version: state.db_record_version,
            requires_snapshot: closed.requires_snapshot,
        })
    }

    pub fn close_transaction_as_snapshot(
        &mut self,
        now: DateTime<Utc>,
        policy: TransactionPolicy,
    ) -> StateResult<Snapshot> {
        let closed = self.close(now, policy)?;
        self.state.clear_changes();
        Ok(Snapshot {
            versioned_transition: self.state.current_versioned_transition(),
            state: self.state.clone(),
            new_events: closed.new_events,
            tasks: closed.tasks,
        })
    }

    /// Abandon the open transaction's bookkeeping. Edits already made to the
    /// in-memory state stay, so the instance is marked for reload and the
    /// cache drops it on release.
    pub fn abort_transaction(&mut self) {
        self.needs_reload = true;
        self.in_transaction = false;
        self.info_changed = false;
        self.status_changed = false;
        self.pending_events.clear();
        self.pending_visibility.clear();
        self.state.clear_changes();
    }

    // -----------------------------------------------------------------
    // Replica side
    // -----------------------------------------------------------------

    /// Apply an incremental change from the source cluster.
    pub fn apply_mutation(&mut self, mutation: &Mutation) -> StateResult<()> {
        if mutation.key != *self.key() {
            return Err(StateError::InvalidState(format!(
                "mutation for {} applied to {}",
                mutation.key,
                self.key()
            )));
        }
        let local = self.current_versioned_transition();
        let Some(incoming) = mutation.versioned_transition else {
            return Err(StateError::SnapshotRequired(
                "mutation carries no versioned transition".to_string(),
            ));
        };
        if matches!(local, Some(local) if local >= incoming) {
            return Ok(());
        }
        if mutation.requires_snapshot {
            return Err(StateError::SnapshotRequired(format!(
                "mutation at {} cannot be applied incrementally",
                incoming
            )));
        }
        if mutation.exclusive_start_versioned_transition != local {
            return Err(StateError::SnapshotRequired(format!(
                "mutation starts at {:?}, local state is at {:?}",
                mutation.exclusive_start_versioned_transition, local
            )));
        }
        self.state.apply_mutation(mutation);
        Ok(())
    }

    /// Replace local state with a snapshot unless local is already at or
    /// past it.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> StateResult<()> {
        if snapshot.key() != self.key() {
            return Err(StateError::InvalidState(format!(
                "snapshot for {} applied to {}",
                snapshot.key(),
                self.key()
            )));
        }
        if let (Some(local), Some(incoming)) =
            (self.current_versioned_transition(), snapshot.versioned_transition)
        {
            if local >= incoming {
                return Ok(());
            }
        }
        let db_record_version = self.state.db_record_version;
        self.state = snapshot.state.clone();
        self.state.clear_changes();
        self.state.db_record_version = db_record_version;
        Ok(())
    }
}
