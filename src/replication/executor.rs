//! Replica-side application of replication tasks
//!
//! `ReplicaApplier` applies each kind of task to local state under the
//! execution lock with the Passive policy. When local history is behind,
//! it reports the missing range instead of applying; the
//! `StateReplicationExecutor` then resends that range from the source
//! cluster and retries the task once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::FutureExt;

use super::dlq::{DlqQueueKey, DlqStore};
use super::errors::{EventRange, ReplicationError, ReplicationResult};
use super::resender::{EventsApplier, HistoryResender};
use super::task::{ReplicationTask, StateSync};
use crate::namespace::{NamespaceEntry, NamespaceRegistry};
use crate::observability::{Event, Logger};
use crate::state::{
    ActivityInfo, CacheOutcome, ExecutionCache, ExecutionKey, HistoryEvent, LockedExecution,
    MutableState, StateError, StateMachineNode, StateMachineRef, TransactionPolicy,
};
use crate::tasks::{DlqWriter, ExecuteContext, ExecuteResponse, Executor, TaskError, TaskResult};
use crate::versioning::{
    compare_versioned_transition, VersionHistory, VersionHistoryItem, VersionedTransition,
};

#[derive(Debug)]
enum ApplyError {
    /// Local history is missing this range
    Gap(EventRange),
    Divergence(String),
    State(StateError),
}

impl From<StateError> for ApplyError {
    fn from(err: StateError) -> Self {
        ApplyError::State(err)
    }
}

impl From<crate::versioning::VersioningError> for ApplyError {
    fn from(err: crate::versioning::VersioningError) -> Self {
        ApplyError::State(err.into())
    }
}

impl CacheOutcome for ApplyError {
    fn state_error(&self) -> Option<&StateError> {
        match self {
            ApplyError::State(err) => Some(err),
            _ => None,
        }
    }
}

impl ApplyError {
    fn into_task_error(self) -> TaskError {
        match self {
            ApplyError::Gap(range) => ReplicationError::retry_replication(
                format!(
                    "missing events ({}, {}) after resend",
                    range.start_event_id, range.end_event_id
                ),
                range,
            )
            .into(),
            ApplyError::Divergence(message) => ReplicationError::history_divergence(message).into(),
            ApplyError::State(err) => err.into(),
        }
    }

    fn into_replication_error(self) -> ReplicationError {
        match self {
            ApplyError::Gap(range) => ReplicationError::retry_replication(
                format!(
                    "resent batch does not continue local history at {}",
                    range.start_event_id
                ),
                range,
            ),
            ApplyError::Divergence(message) => ReplicationError::history_divergence(message),
            ApplyError::State(err) => ReplicationError::apply_failed(err.to_string()),
        }
    }
}

type ApplyResult<T> = Result<T, ApplyError>;

/// Range from the end of local history up to (excluding) `end`.
fn gap_after(local: &MutableState, end_event_id: i64, end_event_version: i64) -> EventRange {
    let last = local.version_history().last_item();
    EventRange {
        start_event_id: last.map(|i| i.event_id).unwrap_or(0),
        start_event_version: last.map(|i| i.version).unwrap_or(0),
        end_event_id,
        end_event_version,
    }
}

/// Applies replication payloads to local executions.
pub struct ReplicaApplier {
    cache: Arc<ExecutionCache>,
}

impl ReplicaApplier {
    pub fn new(cache: Arc<ExecutionCache>) -> Self {
        Self { cache }
    }

    fn namespace(&self, namespace_id: &str) -> ApplyResult<Arc<NamespaceEntry>> {
        Ok(self
            .cache
            .namespaces()
            .get_namespace_by_id(namespace_id)
            .map_err(StateError::from)?)
    }

    async fn apply_history(
        &self,
        execution: &ExecutionKey,
        version_history_items: &[VersionHistoryItem],
        batches: &[Vec<HistoryEvent>],
    ) -> ApplyResult<()> {
        let Some(first) = batches.iter().flat_map(|b| b.first()).next() else {
            return Ok(());
        };
        let namespace = self.namespace(&execution.namespace_id)?;
        let incoming = VersionHistory::from_items(version_history_items.to_vec())?;

        let mut locked = self.cache.lock(execution).await?;
        let result = self
            .apply_history_locked(&mut locked, namespace, &incoming, first, batches)
            .await;
        locked.release(result.as_ref().err().and_then(ApplyError::state_error));
        result
    }

    async fn apply_history_locked(
        &self,
        locked: &mut LockedExecution,
        namespace: Arc<NamespaceEntry>,
        incoming: &VersionHistory,
        first: &HistoryEvent,
        batches: &[Vec<HistoryEvent>],
    ) -> ApplyResult<()> {
        if !locked.exists() {
            if first.event_id != 1 {
                return Err(ApplyError::Gap(EventRange {
                    start_event_id: 0,
                    start_event_version: 0,
                    end_event_id: first.event_id,
                    end_event_version: first.version,
                }));
            }
            locked.install(MutableState::new(
                locked.key().clone(),
                namespace.clone(),
                self.cache.config().clone(),
                first.event_time,
            ));
        }
        let ms = locked.mutable_state()?;
        check_same_branch(ms.version_history(), incoming)?;

        if first.event_id > ms.next_event_id() {
            return Err(ApplyError::Gap(gap_after(ms, first.event_id, first.version)));
        }
        let last_id = batches
            .iter()
            .flat_map(|b| b.last())
            .map(|e| e.event_id)
            .max()
            .unwrap_or(0);
        if last_id < ms.next_event_id() {
            return Ok(());
        }

        ms.start_transaction(namespace)?;
        for batch in batches {
            if let Err(err) = ms.append_replicated_events(batch) {
                ms.abort_transaction();
                return match err {
                    StateError::EventGap { first_event_id, .. } => {
                        let version = batch.first().map(|e| e.version).unwrap_or(0);
                        Err(ApplyError::Gap(gap_after(ms, first_event_id, version)))
                    }
                    other => Err(other.into()),
                };
            }
        }
        locked
            .commit_snapshot(Utc::now(), TransactionPolicy::Passive)
            .await?;
        Ok(())
    }

    async fn apply_activity(
        &self,
        execution: &ExecutionKey,
        version: i64,
        activity: &ActivityInfo,
    ) -> ApplyResult<()> {
        let namespace = self.namespace(&execution.namespace_id)?;
        self.cache
            .with_reload_once(execution, |locked| {
                let namespace = namespace.clone();
                let activity = activity.clone();
                async move { Self::apply_activity_locked(locked, namespace, version, &activity).await }
                    .boxed()
            })
            .await
    }

    async fn apply_activity_locked(
        locked: &mut LockedExecution,
        namespace: Arc<NamespaceEntry>,
        version: i64,
        activity: &ActivityInfo,
    ) -> ApplyResult<()> {
        let ms = locked.mutable_state()?;
        if activity.scheduled_event_id >= ms.next_event_id() {
            return Err(ApplyError::Gap(gap_after(
                ms,
                activity.scheduled_event_id + 1,
                version,
            )));
        }
        let Some(local) = ms.activities().get(&activity.scheduled_event_id) else {
            // Already completed locally.
            return Ok(());
        };
        if let Some(updated_at) = activity.last_update_versioned_transition {
            if on_discarded_branch(ms, &updated_at) {
                Logger::info(
                    Event::StaleReferenceSkipped,
                    &[
                        ("activity", &activity.scheduled_event_id.to_string()),
                        ("execution", &ms.key().to_string()),
                        ("versioned_transition", &updated_at.to_string()),
                    ],
                );
                return Ok(());
            }
        }
        let newer = compare_versioned_transition(
            activity.last_update_versioned_transition.as_ref(),
            local.last_update_versioned_transition.as_ref(),
        )
        .is_gt()
            || activity.attempt > local.attempt;
        if !newer {
            return Ok(());
        }

        ms.start_transaction(namespace)?;
        ms.activities_mut()?
            .upsert(activity.scheduled_event_id, activity.clone());
        locked
            .commit_snapshot(Utc::now(), TransactionPolicy::Passive)
            .await?;
        Ok(())
    }

    async fn apply_state(&self, execution: &ExecutionKey, sync: &StateSync) -> ApplyResult<()> {
        let namespace = self.namespace(&execution.namespace_id)?;
        let mut locked = self.cache.lock(execution).await?;
        let result = self.apply_state_locked(&mut locked, namespace, sync).await;
        locked.release(result.as_ref().err().and_then(ApplyError::state_error));
        result
    }

    async fn apply_state_locked(
        &self,
        locked: &mut LockedExecution,
        namespace: Arc<NamespaceEntry>,
        sync: &StateSync,
    ) -> ApplyResult<()> {
        if !locked.exists() {
            let StateSync::Snapshot(snapshot) = sync else {
                return Err(ApplyError::State(StateError::SnapshotRequired(format!(
                    "execution {} does not exist locally",
                    locked.key()
                ))));
            };
            locked.install(MutableState::from_snapshot(
                snapshot,
                namespace.clone(),
                self.cache.config().clone(),
            ));
        } else {
            let ms = locked.mutable_state()?;
            let before = ms.current_versioned_transition();
            match sync {
                StateSync::Snapshot(snapshot) => ms.apply_snapshot(snapshot)?,
                StateSync::Mutation(mutation) => ms.apply_mutation(mutation)?,
            }
            if ms.current_versioned_transition() == before {
                return Ok(());
            }
        }
        locked.mutable_state()?.start_transaction(namespace)?;
        locked
            .commit_snapshot(Utc::now(), TransactionPolicy::Passive)
            .await?;
        Ok(())
    }

    async fn apply_hsm(&self, execution: &ExecutionKey, nodes: &[StateMachineNode]) -> ApplyResult<()> {
        let namespace = self.namespace(&execution.namespace_id)?;
        self.cache
            .with_reload_once(execution, |locked| {
                let namespace = namespace.clone();
                let nodes = nodes.to_vec();
                async move { Self::apply_hsm_locked(locked, namespace, &nodes).await }.boxed()
            })
            .await
    }

    async fn apply_hsm_locked(
        locked: &mut LockedExecution,
        namespace: Arc<NamespaceEntry>,
        nodes: &[StateMachineNode],
    ) -> ApplyResult<()> {
        let ms = locked.mutable_state()?;
        let mut newer = Vec::new();
        for node in nodes {
            let Some(local) = ms.state_machine_nodes().get(&node.path) else {
                newer.push(node);
                continue;
            };
            if let Some(reference) = incarnation_ref(node, local) {
                match ms.validate_state_machine_ref(&reference) {
                    Ok(()) => {}
                    Err(StateError::StaleReference(reason)) => {
                        Logger::info(
                            Event::StaleReferenceSkipped,
                            &[
                                ("execution", &ms.key().to_string()),
                                ("path", &node.path),
                                ("reason", &reason),
                            ],
                        );
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            if compare_versioned_transition(
                node.last_update_versioned_transition.as_ref(),
                local.last_update_versioned_transition.as_ref(),
            )
            .is_gt()
            {
                newer.push(node);
            }
        }
        if newer.is_empty() {
            return Ok(());
        }

        ms.start_transaction(namespace)?;
        let map = ms.state_machine_nodes_mut()?;
        for node in newer {
            map.upsert(node.path.clone(), node.clone());
        }
        locked
            .commit_snapshot(Utc::now(), TransactionPolicy::Passive)
            .await?;
        Ok(())
    }

    async fn apply(&self, task: &ReplicationTask) -> ApplyResult<()> {
        match task {
            ReplicationTask::SyncActivity {
                execution,
                version,
                activity,
                ..
            } => self.apply_activity(execution, *version, activity).await,
            ReplicationTask::History {
                execution,
                events,
                version_history_items,
                ..
            } => {
                self.apply_history(execution, version_history_items, std::slice::from_ref(events))
                    .await
            }
            ReplicationTask::SyncWorkflowState {
                execution, state, ..
            } => self.apply_state(execution, state).await,
            ReplicationTask::SyncHsm {
                execution, nodes, ..
            } => self.apply_hsm(execution, nodes).await,
        }
    }
}

/// Reference to the incarnation `incoming` belongs to, positioned at the
/// local node's last update so that only the incarnation is checked.
fn incarnation_ref(incoming: &StateMachineNode, local: &StateMachineNode) -> Option<StateMachineRef> {
    let initial = incoming.initial_versioned_transition?;
    Some(StateMachineRef {
        path: incoming.path.clone(),
        mutable_state_versioned_transition: initial,
        machine_initial_versioned_transition: initial,
        machine_last_update_versioned_transition: local
            .last_update_versioned_transition
            .unwrap_or(initial),
        machine_transition_count: local.transition_count,
    })
}

/// A transition at or before local's latest that local history never went
/// through. Transitions ahead of local are new and not discarded.
fn on_discarded_branch(ms: &MutableState, vt: &VersionedTransition) -> bool {
    let history = &ms.state().transition_history;
    ms.state().transition_history_tracked
        && !history.is_empty()
        && matches!(history.staleness_check(vt), Err(err) if !err.is_stale_state())
}

/// Local history must lie on the incoming branch up to where both end.
fn check_same_branch(local: &VersionHistory, incoming: &VersionHistory) -> ApplyResult<()> {
    let (Some(local_last), Some(incoming_last)) = (local.last_item(), incoming.last_item()) else {
        return Ok(());
    };
    let overlap_end = local_last.event_id.min(incoming_last.event_id);
    let agreed = local
        .find_lowest_common_ancestor(incoming)
        .map(|lca| lca.event_id >= overlap_end)
        .unwrap_or(false);
    if agreed {
        Ok(())
    } else {
        Err(ApplyError::Divergence(format!(
            "local history {:?} diverges from incoming {:?}",
            local.items(),
            incoming.items()
        )))
    }
}

#[async_trait]
impl EventsApplier for ReplicaApplier {
    async fn apply_events(
        &self,
        _source_cluster: &str,
        execution: &ExecutionKey,
        version_history_items: &[VersionHistoryItem],
        batches: Vec<Vec<HistoryEvent>>,
    ) -> ReplicationResult<()> {
        self.apply_history(execution, version_history_items, &batches)
            .await
            .map_err(ApplyError::into_replication_error)
    }
}

/// Applies one replication task to local state.
#[async_trait]
pub trait ReplicationTaskExecutor: Send + Sync {
    /// `force_apply` ignores whether the namespace replicates to this
    /// cluster; DLQ merges use it.
    async fn execute(&self, task: &ReplicationTask, force_apply: bool) -> TaskResult<()>;
}

/// Executor for tasks from one source cluster
pub struct StateReplicationExecutor {
    source_cluster: String,
    current_cluster: String,
    namespaces: Arc<dyn NamespaceRegistry>,
    applier: Arc<ReplicaApplier>,
    resender: Arc<HistoryResender>,
}

impl StateReplicationExecutor {
    pub fn new(
        source_cluster: impl Into<String>,
        current_cluster: impl Into<String>,
        namespaces: Arc<dyn NamespaceRegistry>,
        applier: Arc<ReplicaApplier>,
        resender: Arc<HistoryResender>,
    ) -> Self {
        Self {
            source_cluster: source_cluster.into(),
            current_cluster: current_cluster.into(),
            namespaces,
            applier,
            resender,
        }
    }

    pub fn source_cluster(&self) -> &str {
        &self.source_cluster
    }
}

#[async_trait]
impl ReplicationTaskExecutor for StateReplicationExecutor {
    async fn execute(&self, task: &ReplicationTask, force_apply: bool) -> TaskResult<()> {
        let execution = task.execution();
        let namespace = self.namespaces.get_namespace_by_id(&execution.namespace_id)?;
        if !force_apply && !namespace.is_replicated_to(&self.current_cluster) {
            return Ok(());
        }

        let range = match self.applier.apply(task).await {
            Err(ApplyError::Gap(range)) => range,
            other => return other.map_err(ApplyError::into_task_error),
        };

        Logger::info(
            Event::ReplicationGap,
            &[
                ("end_event_id", &range.end_event_id.to_string()),
                ("execution", &execution.to_string()),
                ("source_cluster", &self.source_cluster),
                ("start_event_id", &range.start_event_id.to_string()),
            ],
        );
        self.resender
            .send_single_workflow_history(&self.source_cluster, execution, range)
            .await?;
        self.applier
            .apply(task)
            .await
            .map_err(ApplyError::into_task_error)
    }
}

/// Creates the executor for a source cluster.
pub trait ReplicationExecutorProvider: Send + Sync {
    fn executor_for(&self, source_cluster: &str) -> Arc<dyn ReplicationTaskExecutor>;
}

/// Builds `StateReplicationExecutor`s over shared collaborators.
pub struct StateExecutorProvider {
    current_cluster: String,
    namespaces: Arc<dyn NamespaceRegistry>,
    applier: Arc<ReplicaApplier>,
    resender: Arc<HistoryResender>,
}

impl StateExecutorProvider {
    pub fn new(
        current_cluster: impl Into<String>,
        namespaces: Arc<dyn NamespaceRegistry>,
        applier: Arc<ReplicaApplier>,
        resender: Arc<HistoryResender>,
    ) -> Self {
        Self {
            current_cluster: current_cluster.into(),
            namespaces,
            applier,
            resender,
        }
    }
}

impl ReplicationExecutorProvider for StateExecutorProvider {
    fn executor_for(&self, source_cluster: &str) -> Arc<dyn ReplicationTaskExecutor> {
        Arc::new(StateReplicationExecutor::new(
            source_cluster,
            self.current_cluster.clone(),
            self.namespaces.clone(),
            self.applier.clone(),
            self.resender.clone(),
        ))
    }
}

/// Lazily built executors, one per source cluster
#[derive(Default)]
pub(crate) struct ExecutorCache {
    executors: Mutex<HashMap<String, Arc<dyn ReplicationTaskExecutor>>>,
}

impl ExecutorCache {
    pub(crate) fn get_or_create(
        &self,
        source_cluster: &str,
        provider: &dyn ReplicationExecutorProvider,
    ) -> Arc<dyn ReplicationTaskExecutor> {
        let mut executors = self.executors.lock().unwrap_or_else(|e| e.into_inner());
        executors
            .entry(source_cluster.to_string())
            .or_insert_with(|| provider.executor_for(source_cluster))
            .clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.executors.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Runs replication tasks as task-engine executables.
pub struct ReplicationExecutorAdapter {
    inner: Arc<dyn ReplicationTaskExecutor>,
}

impl ReplicationExecutorAdapter {
    pub fn new(inner: Arc<dyn ReplicationTaskExecutor>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Executor<ReplicationTask> for ReplicationExecutorAdapter {
    async fn execute(&self, task: &ReplicationTask, _ctx: &ExecuteContext) -> ExecuteResponse {
        ExecuteResponse::standby(self.inner.execute(task, false).await)
    }
}

/// Writes terminally failed replication tasks to the DLQ of their source
/// cluster.
pub struct StoreDlqWriter {
    store: Arc<dyn DlqStore>,
    queue: DlqQueueKey,
}

impl StoreDlqWriter {
    pub fn new(store: Arc<dyn DlqStore>, shard_id: i32, source_cluster: impl Into<String>) -> Self {
        Self {
            store,
            queue: DlqQueueKey::replication(shard_id, source_cluster),
        }
    }
}

#[async_trait]
impl DlqWriter<ReplicationTask> for StoreDlqWriter {
    async fn write_to_dlq(&self, task: &ReplicationTask, _cause: &TaskError) -> TaskResult<()> {
        self.store
            .put(&self.queue, task.to_record())
            .await
            .map_err(|e| TaskError::DlqWrite(e.to_string()))
    }
}
