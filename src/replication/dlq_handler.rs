//! Operator protocol over the replication DLQ
//!
//! The DLQ holds coordinates only. Reading it fetches the task bodies back
//! from the source cluster; merging re-executes them with consistency
//! checks relaxed and purges only what executed cleanly.

use std::sync::Arc;

use tokio::time::timeout;

use super::clients::RemoteClientProvider;
use super::dlq::{DlqQueueKey, DlqStore};
use super::errors::{ReplicationError, ReplicationResult};
use super::executor::{ExecutorCache, ReplicationExecutorProvider};
use super::task::{ReplicationTask, ReplicationTaskInfo};
use crate::config::DlqConfig;
use crate::observability::{Event, Logger};

/// One page of DLQ content
#[derive(Debug, Clone, PartialEq)]
pub struct DlqMessages {
    pub tasks: Vec<ReplicationTask>,
    pub task_infos: Vec<ReplicationTaskInfo>,
    pub next_page_token: Option<String>,
}

pub struct ReplicationDlqHandler {
    shard_id: i32,
    store: Arc<dyn DlqStore>,
    clients: Arc<dyn RemoteClientProvider>,
    provider: Arc<dyn ReplicationExecutorProvider>,
    executors: ExecutorCache,
    config: DlqConfig,
}

impl ReplicationDlqHandler {
    pub fn new(
        shard_id: i32,
        store: Arc<dyn DlqStore>,
        clients: Arc<dyn RemoteClientProvider>,
        provider: Arc<dyn ReplicationExecutorProvider>,
        config: DlqConfig,
    ) -> Self {
        Self {
            shard_id,
            store,
            clients,
            provider,
            executors: ExecutorCache::default(),
            config,
        }
    }

    fn queue(&self, source_cluster: &str) -> DlqQueueKey {
        DlqQueueKey::replication(self.shard_id, source_cluster)
    }

    /// Read `(ack_level, last_message_id]` and fetch the task bodies from
    /// `source_cluster`.
    pub async fn get_messages(
        &self,
        source_cluster: &str,
        last_message_id: i64,
        page_size: Option<usize>,
        page_token: Option<&str>,
    ) -> ReplicationResult<DlqMessages> {
        let queue = self.queue(source_cluster);
        let ack_level = self.store.ack_level(&queue).await?;
        let page = self
            .store
            .read_range(
                &queue,
                ack_level,
                last_message_id,
                page_size.unwrap_or(self.config.default_page_size),
                page_token,
            )
            .await?;

        let task_infos: Vec<ReplicationTaskInfo> =
            page.records.iter().map(|r| r.to_task_info()).collect();
        let tasks = if task_infos.is_empty() {
            Vec::new()
        } else {
            self.clients
                .client_for(source_cluster)?
                .get_dlq_replication_messages(&task_infos)
                .await?
        };

        Ok(DlqMessages {
            tasks,
            task_infos,
            next_page_token: page.next_page_token,
        })
    }

    /// Delete `(ack_level, last_message_id]` and advance the ack level.
    pub async fn purge_messages(&self, source_cluster: &str, last_message_id: i64) -> ReplicationResult<()> {
        let ack_level = self.store.ack_level(&self.queue(source_cluster)).await?;
        self.purge_range(source_cluster, ack_level, last_message_id).await
    }

    /// Delete `(exclusive_start, inclusive_end]`. The ack level moves to
    /// `inclusive_end` only when nothing between it and `exclusive_start`
    /// is left in the queue.
    async fn purge_range(
        &self,
        source_cluster: &str,
        exclusive_start: i64,
        inclusive_end: i64,
    ) -> ReplicationResult<()> {
        let queue = self.queue(source_cluster);
        let purged = self
            .store
            .range_delete(&queue, exclusive_start, inclusive_end)
            .await?;

        let ack_level = self.store.ack_level(&queue).await?;
        let earlier = self
            .store
            .read_range(&queue, ack_level, exclusive_start, 1, None)
            .await?;
        if earlier.records.is_empty() {
            // The records are gone; a stale ack level only widens the next scan.
            if let Err(err) = self.store.update_ack_level(&queue, inclusive_end).await {
                Logger::warn(
                    Event::DlqAckLevelUpdateFailed,
                    &[
                        ("ack_level", &inclusive_end.to_string()),
                        ("error", &err.to_string()),
                        ("source_cluster", source_cluster),
                    ],
                );
            }
        }
        Logger::info(
            Event::DlqPurged,
            &[
                ("count", &purged.to_string()),
                ("exclusive_start", &exclusive_start.to_string()),
                ("last_message_id", &inclusive_end.to_string()),
                ("source_cluster", source_cluster),
            ],
        );
        Ok(())
    }

    /// Re-execute one page of the DLQ, then purge it. Any failure aborts
    /// the merge with nothing purged. Returns the token of the next page.
    pub async fn merge_messages(
        &self,
        source_cluster: &str,
        last_message_id: i64,
        page_size: Option<usize>,
        page_token: Option<&str>,
    ) -> ReplicationResult<Option<String>> {
        timeout(
            self.config.merge_timeout(),
            self.merge_page(source_cluster, last_message_id, page_size, page_token),
        )
        .await
        .map_err(|_| {
            ReplicationError::fetch_timeout(format!(
                "DLQ merge from {} timed out",
                source_cluster
            ))
        })?
    }

    async fn merge_page(
        &self,
        source_cluster: &str,
        last_message_id: i64,
        page_size: Option<usize>,
        page_token: Option<&str>,
    ) -> ReplicationResult<Option<String>> {
        let messages = self
            .get_messages(source_cluster, last_message_id, page_size, page_token)
            .await?;
        let executor = self
            .executors
            .get_or_create(source_cluster, self.provider.as_ref());

        let mut max_executed = None;
        for task in &messages.tasks {
            if let Err(err) = executor.execute(task, true).await {
                Logger::error(
                    Event::DlqMergeAborted,
                    &[
                        ("error", &err.to_string()),
                        ("source_cluster", source_cluster),
                        ("task_id", &task.source_task_id().to_string()),
                    ],
                );
                return Err(ReplicationError::apply_failed(format!(
                    "merge of task {} failed: {}",
                    task.source_task_id(),
                    err
                )));
            }
            max_executed = max_executed.max(Some(task.source_task_id()));
        }

        let purge_to = match (&messages.next_page_token, max_executed) {
            (None, _) => Some(last_message_id),
            (Some(_), executed) => executed,
        };
        let Some(purge_to) = purge_to else {
            return Ok(messages.next_page_token);
        };
        // Only the tasks this page executed; a page reached through a token
        // leaves earlier pages alone.
        let purge_from = match messages.task_infos.first() {
            Some(first) => Some(first.task_id - 1),
            None if page_token.is_none() => Some(self.store.ack_level(&self.queue(source_cluster)).await?),
            None => None,
        };
        if let Some(purge_from) = purge_from {
            self.purge_range(source_cluster, purge_from, purge_to).await?;
        }
        Ok(messages.next_page_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::clients::{InMemoryAdminClient, StaticClientProvider};
    use crate::replication::dlq::InMemoryDlqStore;
    use crate::replication::executor::ReplicationTaskExecutor;
    use crate::state::ExecutionKey;
    use crate::tasks::{TaskError, TaskResult};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FlakyExecutor {
        fail_ids: HashSet<i64>,
        executed: Mutex<Vec<(i64, bool)>>,
    }

    #[async_trait]
    impl ReplicationTaskExecutor for FlakyExecutor {
        async fn execute(&self, task: &ReplicationTask, force_apply: bool) -> TaskResult<()> {
            self.executed
                .lock()
                .unwrap()
                .push((task.source_task_id(), force_apply));
            if self.fail_ids.contains(&task.source_task_id()) {
                return Err(TaskError::Internal("boom".into()));
            }
            Ok(())
        }
    }

    struct FixedProvider(Arc<FlakyExecutor>);

    impl ReplicationExecutorProvider for FixedProvider {
        fn executor_for(&self, _source_cluster: &str) -> Arc<dyn ReplicationTaskExecutor> {
            self.0.clone()
        }
    }

    fn task(id: i64) -> ReplicationTask {
        ReplicationTask::SyncHsm {
            source_task_id: id,
            visibility_time: Utc::now(),
            execution: ExecutionKey::new("ns", "wf", "run"),
            versioned_transition: None,
            nodes: Vec::new(),
        }
    }

    async fn handler(
        ids: &[i64],
        fail_ids: &[i64],
    ) -> (ReplicationDlqHandler, Arc<InMemoryDlqStore>, Arc<FlakyExecutor>) {
        let store = Arc::new(InMemoryDlqStore::new());
        let remote = Arc::new(InMemoryAdminClient::new());
        let queue = DlqQueueKey::replication(1, "west");
        for id in ids {
            remote.publish(task(*id));
            store.put(&queue, task(*id).to_record()).await.unwrap();
        }
        let clients = Arc::new(StaticClientProvider::new());
        clients.register("west", remote);
        let executor = Arc::new(FlakyExecutor {
            fail_ids: fail_ids.iter().copied().collect(),
            ..FlakyExecutor::default()
        });
        let handler = ReplicationDlqHandler::new(
            1,
            store.clone(),
            clients,
            Arc::new(FixedProvider(executor.clone())),
            DlqConfig::default(),
        );
        (handler, store, executor)
    }

    #[tokio::test]
    async fn test_get_messages_fetches_bodies() {
        let (handler, _store, _executor) = handler(&[3, 5, 8], &[]).await;
        let messages = handler.get_messages("west", 5, None, None).await.unwrap();
        assert_eq!(
            messages.tasks.iter().map(|t| t.source_task_id()).collect::<Vec<_>>(),
            vec![3, 5]
        );
        assert_eq!(messages.task_infos.len(), 2);
        assert!(messages.next_page_token.is_none());
    }

    #[tokio::test]
    async fn test_purge_survives_ack_level_failure() {
        let (handler, store, _executor) = handler(&[1, 2, 3], &[]).await;
        store.set_fail_ack_updates(true);
        handler.purge_messages("west", 2).await.unwrap();
        let queue = DlqQueueKey::replication(1, "west");
        assert_eq!(store.task_ids(&queue), vec![3]);
        assert_eq!(store.ack_level(&queue).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_merge_purges_after_full_success() {
        let (handler, store, executor) = handler(&[1, 2, 3], &[]).await;
        let next = handler.merge_messages("west", 10, None, None).await.unwrap();
        assert!(next.is_none());
        let queue = DlqQueueKey::replication(1, "west");
        assert_eq!(store.len(&queue), 0);
        assert_eq!(store.ack_level(&queue).await.unwrap(), 10);
        assert!(executor.executed.lock().unwrap().iter().all(|(_, forced)| *forced));
    }

    #[tokio::test]
    async fn test_merge_failure_purges_nothing() {
        let (handler, store, _executor) = handler(&[1, 2, 3], &[2]).await;
        let err = handler.merge_messages("west", 10, None, None).await.unwrap_err();
        assert_eq!(err.kind, super::super::errors::ReplicationErrorKind::ApplyFailed);
        let queue = DlqQueueKey::replication(1, "west");
        assert_eq!(store.task_ids(&queue), vec![1, 2, 3]);
        assert_eq!(store.ack_level(&queue).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_paged_merge_purges_only_executed() {
        let (handler, store, _executor) = handler(&[1, 2, 3, 4], &[]).await;
        let token = handler
            .merge_messages("west", 10, Some(2), None)
            .await
            .unwrap();
        let queue = DlqQueueKey::replication(1, "west");
        assert!(token.is_some());
        assert_eq!(store.task_ids(&queue), vec![3, 4]);
        assert_eq!(store.ack_level(&queue).await.unwrap(), 2);

        let token = handler
            .merge_messages("west", 10, Some(2), None)
            .await
            .unwrap();
        assert!(token.is_none());
        assert_eq!(store.len(&queue), 0);
    }

    #[tokio::test]
    async fn test_merge_from_token_keeps_earlier_pages() {
        let (handler, store, executor) = handler(&[1, 2, 3, 4], &[]).await;
        let first_page = handler.get_messages("west", 10, Some(2), None).await.unwrap();
        let token = first_page.next_page_token.unwrap();

        let next = handler
            .merge_messages("west", 10, Some(2), Some(&token))
            .await
            .unwrap();
        assert!(next.is_none());
        let executed: Vec<i64> = executor.executed.lock().unwrap().iter().map(|(id, _)| *id).collect();
        assert_eq!(executed, vec![3, 4]);

        let queue = DlqQueueKey::replication(1, "west");
        assert_eq!(store.task_ids(&queue), vec![1, 2]);
        assert_eq!(store.ack_level(&queue).await.unwrap(), 0);

        // merging the remaining head catches the ack level up
        handler.merge_messages("west", 10, None, None).await.unwrap();
        assert_eq!(store.len(&queue), 0);
        assert_eq!(store.ack_level(&queue).await.unwrap(), 10);
    }
}
