//! History resend batching
//!
//! Flushes follow remote branch and event version changes as well as the
//! batch-count limit, and the flushed batches reproduce the remote pages in
//! order. A flush that applies only partway leaves no trace in local state.

mod common;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use common::{events, history_task, key, ReplicaStack, REMOTE_CLUSTER};
use replicore::config::ResendConfig;
use replicore::namespace::{InMemoryNamespaceRegistry, NamespaceEntry};
use replicore::replication::{
    AdminClient, DataBlob, EventRange, EventsApplier, HistoryResender, RawHistoryRequest,
    RawHistoryResponse, ReplicationError, ReplicationErrorKind, ReplicationExecutorProvider,
    ReplicationMessages, ReplicationMessagesRequest, ReplicationResult, ReplicationTask,
    ReplicationTaskExecutor, ReplicationTaskInfo, StaticClientProvider,
};
use replicore::state::{ExecutionKey, HistoryEvent};
use replicore::tasks::TaskError;
use replicore::versioning::{VersionHistory, VersionHistoryItem};

/// Remote serving fixed pages, each with its own view of the branch.
struct PagedRemote {
    pages: Vec<(Vec<Vec<HistoryEvent>>, Vec<VersionHistoryItem>)>,
}

#[async_trait]
impl AdminClient for PagedRemote {
    async fn get_workflow_execution_raw_history_v2(
        &self,
        request: RawHistoryRequest,
    ) -> ReplicationResult<RawHistoryResponse> {
        let index = match request.next_page_token {
            Some(token) => String::from_utf8(token).unwrap().parse::<usize>().unwrap(),
            None => 0,
        };
        let (batches, items) = &self.pages[index];
        Ok(RawHistoryResponse {
            history_batches: batches
                .iter()
                .map(|b| DataBlob::from_events(b).unwrap())
                .collect(),
            version_history: VersionHistory::from_items(items.clone()).unwrap(),
            next_page_token: (index + 1 < self.pages.len())
                .then(|| (index + 1).to_string().into_bytes()),
        })
    }

    async fn get_replication_messages(
        &self,
        _request: ReplicationMessagesRequest,
    ) -> ReplicationResult<ReplicationMessages> {
        Err(ReplicationError::remote_unavailable("not served"))
    }

    async fn get_dlq_replication_messages(
        &self,
        _task_infos: &[ReplicationTaskInfo],
    ) -> ReplicationResult<Vec<ReplicationTask>> {
        Err(ReplicationError::remote_unavailable("not served"))
    }
}

#[derive(Default)]
struct RecordingApplier {
    flushes: Mutex<Vec<(Vec<VersionHistoryItem>, Vec<Vec<HistoryEvent>>)>>,
}

#[async_trait]
impl EventsApplier for RecordingApplier {
    async fn apply_events(
        &self,
        _source_cluster: &str,
        _execution: &ExecutionKey,
        version_history_items: &[VersionHistoryItem],
        batches: Vec<Vec<HistoryEvent>>,
    ) -> ReplicationResult<()> {
        self.flushes
            .lock()
            .unwrap()
            .push((version_history_items.to_vec(), batches));
        Ok(())
    }
}

fn resender(
    pages: Vec<(Vec<Vec<HistoryEvent>>, Vec<VersionHistoryItem>)>,
    max_event_batch_count: usize,
) -> (HistoryResender, Arc<RecordingApplier>) {
    let clients = Arc::new(StaticClientProvider::new());
    clients.register(REMOTE_CLUSTER, Arc::new(PagedRemote { pages }));
    let registry = Arc::new(InMemoryNamespaceRegistry::new());
    registry.upsert(NamespaceEntry::local("ns", "ns", REMOTE_CLUSTER));
    let applier = Arc::new(RecordingApplier::default());
    let resender = HistoryResender::new(
        clients,
        registry,
        applier.clone(),
        ResendConfig {
            max_event_batch_count,
            ..ResendConfig::default()
        },
    );
    (resender, applier)
}

fn open_range() -> EventRange {
    EventRange {
        start_event_id: 0,
        start_event_version: 0,
        end_event_id: 0,
        end_event_version: 0,
    }
}

fn concat_pages(pages: &[(Vec<Vec<HistoryEvent>>, Vec<VersionHistoryItem>)]) -> Vec<Vec<HistoryEvent>> {
    pages.iter().flat_map(|(batches, _)| batches.clone()).collect()
}

#[tokio::test]
async fn test_flush_on_batch_count_limit_across_pages() {
    let branch = vec![VersionHistoryItem::new(10, 1)];
    let pages = vec![
        (
            vec![events(1..=2, 1), events(3..=4, 1), events(5..=6, 1)],
            branch.clone(),
        ),
        (vec![events(7..=8, 1), events(9..=10, 1)], branch.clone()),
    ];
    let (resender, applier) = resender(pages.clone(), 2);

    let stats = resender
        .send_single_workflow_history(REMOTE_CLUSTER, &key(), open_range())
        .await
        .unwrap();

    let flushes = applier.flushes.lock().unwrap();
    assert_eq!(
        flushes.iter().map(|(_, b)| b.len()).collect::<Vec<_>>(),
        vec![2, 2, 1]
    );
    assert_eq!(stats.flushes, 3);
    assert_eq!(stats.pages, 2);
    assert_eq!(stats.events, 10);

    let flushed: Vec<Vec<HistoryEvent>> = flushes.iter().flat_map(|(_, b)| b.clone()).collect();
    assert_eq!(flushed, concat_pages(&pages));
}

#[tokio::test]
async fn test_flush_once_per_branch_change() {
    let first_branch = vec![VersionHistoryItem::new(4, 1)];
    let second_branch = vec![VersionHistoryItem::new(4, 1), VersionHistoryItem::new(8, 11)];
    let pages = vec![
        (vec![events(1..=2, 1), events(3..=4, 1)], first_branch.clone()),
        (vec![events(5..=6, 11)], second_branch.clone()),
        (vec![events(7..=8, 11)], second_branch.clone()),
    ];
    let (resender, applier) = resender(pages.clone(), 10);

    let stats = resender
        .send_single_workflow_history(REMOTE_CLUSTER, &key(), open_range())
        .await
        .unwrap();

    let flushes = applier.flushes.lock().unwrap();
    assert_eq!(stats.flushes, 2);
    assert_eq!(flushes.len(), 2);
    assert_eq!(flushes[0].0, first_branch);
    assert_eq!(flushes[0].1.len(), 2);
    assert_eq!(flushes[1].0, second_branch);
    assert_eq!(flushes[1].1.len(), 2);

    let flushed: Vec<Vec<HistoryEvent>> = flushes.iter().flat_map(|(_, b)| b.clone()).collect();
    assert_eq!(flushed, concat_pages(&pages));
}

#[tokio::test]
async fn test_flush_on_version_change_by_default() {
    let branch = vec![VersionHistoryItem::new(2, 1), VersionHistoryItem::new(4, 11)];
    let pages = vec![(vec![events(1..=2, 1), events(3..=4, 11)], branch)];
    let (resender, applier) = resender(pages, ResendConfig::default().max_event_batch_count);

    let stats = resender
        .send_single_workflow_history(REMOTE_CLUSTER, &key(), open_range())
        .await
        .unwrap();

    assert_eq!(stats.flushes, 2);
    let flushes = applier.flushes.lock().unwrap();
    assert_eq!(flushes[0].1, vec![events(1..=2, 1)]);
    assert_eq!(flushes[1].1, vec![events(3..=4, 11)]);
}

#[tokio::test]
async fn test_empty_remote_batch_rejected() {
    let pages = vec![(vec![Vec::new()], vec![VersionHistoryItem::new(2, 1)])];
    let (resender, applier) = resender(pages, 10);
    let err = resender
        .send_single_workflow_history(REMOTE_CLUSTER, &key(), open_range())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ReplicationErrorKind::InvalidArgument);
    assert!(applier.flushes.lock().unwrap().is_empty());
}

// =============================================================================
// Resend into local state
// =============================================================================

#[tokio::test]
async fn test_gap_filled_from_remote_in_small_pages() {
    let stack = ReplicaStack::new(ResendConfig {
        page_size: 2,
        max_event_batch_count: 2,
        ..ResendConfig::default()
    });
    for start in [1, 3, 5, 7] {
        stack
            .remote
            .append_batch(&key(), events(start..=start + 1, 2))
            .unwrap();
    }
    let executor = stack.executor_provider().executor_for(REMOTE_CLUSTER);

    executor
        .execute(&history_task(20, events(9..=10, 2)), false)
        .await
        .unwrap();
    assert_eq!(stack.next_event_id().await, Some(11));
    assert_eq!(stack.remote.raw_history_calls(), 4);

    // Everything is local now; replaying an old task changes nothing.
    executor
        .execute(&history_task(3, events(3..=4, 2)), false)
        .await
        .unwrap();
    assert_eq!(stack.next_event_id().await, Some(11));
    assert_eq!(stack.remote.raw_history_calls(), 4);
}

#[tokio::test]
async fn test_gap_on_missing_remote_history_is_dropped() {
    let stack = ReplicaStack::new(ResendConfig::default());
    let executor = stack.executor_provider().executor_for(REMOTE_CLUSTER);
    let err = executor
        .execute(&history_task(20, events(9..=10, 2)), false)
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::NotFound(_)));
    assert_eq!(stack.next_event_id().await, None);
}

#[tokio::test]
async fn test_partially_applied_flush_is_not_kept_in_cache() {
    let stack = ReplicaStack::new(ResendConfig::default());
    let executor = stack.executor_provider().executor_for(REMOTE_CLUSTER);
    executor
        .execute(&history_task(1, events(1..=2, 2)), false)
        .await
        .unwrap();

    // 3..=4 continues local history, 6..=7 does not.
    let err = stack
        .applier
        .apply_events(
            REMOTE_CLUSTER,
            &key(),
            &[VersionHistoryItem::new(7, 2)],
            vec![events(3..=4, 2), events(6..=7, 2)],
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, ReplicationErrorKind::RetryReplication);
    assert_eq!(stack.next_event_id().await, Some(3));

    // Without the lost 3..=4 the next batch is still a gap.
    let err = stack
        .applier
        .apply_events(
            REMOTE_CLUSTER,
            &key(),
            &[VersionHistoryItem::new(7, 2)],
            vec![events(5..=7, 2)],
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, ReplicationErrorKind::RetryReplication);
    assert_eq!(stack.next_event_id().await, Some(3));
}
