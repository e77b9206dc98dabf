//! Replication dead-letter queue storage
//!
//! Queues are keyed by shard, task category and source cluster. Reads and
//! deletes are range-scoped over task ids; `(ack_level, max]` is the live
//! range an operator sees.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};

use super::errors::{ReplicationError, ReplicationResult};
use super::task::ReplicationTaskRecord;
use crate::tasks::TaskCategory;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DlqQueueKey {
    pub shard_id: i32,
    pub category: TaskCategory,
    pub source_cluster: String,
}

impl DlqQueueKey {
    pub fn replication(shard_id: i32, source_cluster: impl Into<String>) -> Self {
        Self {
            shard_id,
            category: TaskCategory::Replication,
            source_cluster: source_cluster.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlqPage {
    pub records: Vec<ReplicationTaskRecord>,
    /// Opaque continuation; `None` once the range is exhausted
    pub next_page_token: Option<String>,
}

/// Durable DLQ storage.
#[async_trait]
pub trait DlqStore: Send + Sync {
    async fn put(&self, queue: &DlqQueueKey, record: ReplicationTaskRecord) -> ReplicationResult<()>;

    /// Records with `exclusive_min < task_id <= inclusive_max`.
    async fn read_range(
        &self,
        queue: &DlqQueueKey,
        exclusive_min: i64,
        inclusive_max: i64,
        page_size: usize,
        page_token: Option<&str>,
    ) -> ReplicationResult<DlqPage>;

    async fn range_delete(
        &self,
        queue: &DlqQueueKey,
        exclusive_min: i64,
        inclusive_max: i64,
    ) -> ReplicationResult<usize>;

    async fn ack_level(&self, queue: &DlqQueueKey) -> ReplicationResult<i64>;

    async fn update_ack_level(&self, queue: &DlqQueueKey, ack_level: i64) -> ReplicationResult<()>;
}

/// Page tokens carry the last task id returned, base64 encoded.
fn encode_token(last_task_id: i64) -> String {
    STANDARD.encode(last_task_id.to_string())
}

fn decode_token(token: &str) -> ReplicationResult<i64> {
    STANDARD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ReplicationError::invalid_argument("malformed DLQ page token"))
}

#[derive(Debug, Default)]
struct Queue {
    records: BTreeMap<i64, ReplicationTaskRecord>,
    ack_level: i64,
}

#[derive(Debug, Default)]
pub struct InMemoryDlqStore {
    queues: Mutex<HashMap<DlqQueueKey, Queue>>,
    fail_ack_updates: AtomicBool,
}

impl InMemoryDlqStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make ack-level updates fail, to exercise purge error handling.
    pub fn set_fail_ack_updates(&self, fail: bool) {
        self.fail_ack_updates.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self, queue: &DlqQueueKey) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(queue)
            .map(|q| q.records.len())
            .unwrap_or(0)
    }

    pub fn task_ids(&self, queue: &DlqQueueKey) -> Vec<i64> {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(queue)
            .map(|q| q.records.keys().copied().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DlqStore for InMemoryDlqStore {
    async fn put(&self, queue: &DlqQueueKey, record: ReplicationTaskRecord) -> ReplicationResult<()> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues
            .entry(queue.clone())
            .or_default()
            .records
            .insert(record.task_id, record);
        Ok(())
    }

    async fn read_range(
        &self,
        queue: &DlqQueueKey,
        exclusive_min: i64,
        inclusive_max: i64,
        page_size: usize,
        page_token: Option<&str>,
    ) -> ReplicationResult<DlqPage> {
        if page_size == 0 {
            return Err(ReplicationError::invalid_argument("page size must be positive"));
        }
        let lower = match page_token {
            Some(token) => decode_token(token)?.max(exclusive_min),
            None => exclusive_min,
        };
        if lower >= inclusive_max {
            return Ok(DlqPage {
                records: Vec::new(),
                next_page_token: None,
            });
        }

        let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let Some(q) = queues.get(queue) else {
            return Ok(DlqPage {
                records: Vec::new(),
                next_page_token: None,
            });
        };
        let mut in_range = q.records.range(lower + 1..=inclusive_max).map(|(_, r)| r);
        let records: Vec<ReplicationTaskRecord> = in_range.by_ref().take(page_size).cloned().collect();
        let more = in_range.next().is_some();
        let next_page_token = match (more, records.last()) {
            (true, Some(last)) => Some(encode_token(last.task_id)),
            _ => None,
        };
        Ok(DlqPage {
            records,
            next_page_token,
        })
    }

    async fn range_delete(
        &self,
        queue: &DlqQueueKey,
        exclusive_min: i64,
        inclusive_max: i64,
    ) -> ReplicationResult<usize> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let Some(q) = queues.get_mut(queue) else {
            return Ok(0);
        };
        if exclusive_min >= inclusive_max {
            return Ok(0);
        }
        let doomed: Vec<i64> = q
            .records
            .range(exclusive_min + 1..=inclusive_max)
            .map(|(id, _)| *id)
            .collect();
        for id in &doomed {
            q.records.remove(id);
        }
        Ok(doomed.len())
    }

    async fn ack_level(&self, queue: &DlqQueueKey) -> ReplicationResult<i64> {
        let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        Ok(queues.get(queue).map(|q| q.ack_level).unwrap_or(0))
    }

    async fn update_ack_level(&self, queue: &DlqQueueKey, ack_level: i64) -> ReplicationResult<()> {
        if self.fail_ack_updates.load(Ordering::SeqCst) {
            return Err(ReplicationError::apply_failed("ack level update rejected"));
        }
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let q = queues.entry(queue.clone()).or_default();
        q.ack_level = q.ack_level.max(ack_level);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::task::RecordDetails;
    use crate::state::ExecutionKey;
    use chrono::Utc;

    fn record(task_id: i64) -> ReplicationTaskRecord {
        ReplicationTaskRecord {
            task_id,
            visibility_time: Utc::now(),
            execution: ExecutionKey::new("ns", "wf", "run"),
            details: RecordDetails::SyncHsm {
                versioned_transition: None,
            },
        }
    }

    async fn seeded(ids: &[i64]) -> (InMemoryDlqStore, DlqQueueKey) {
        let store = InMemoryDlqStore::new();
        let queue = DlqQueueKey::replication(1, "west");
        for id in ids {
            store.put(&queue, record(*id)).await.unwrap();
        }
        (store, queue)
    }

    #[tokio::test]
    async fn test_read_range_pages() {
        let (store, queue) = seeded(&[1, 2, 3, 4, 5]).await;
        let page = store.read_range(&queue, 0, 4, 2, None).await.unwrap();
        assert_eq!(page.records.iter().map(|r| r.task_id).collect::<Vec<_>>(), vec![1, 2]);
        let token = page.next_page_token.unwrap();

        let page = store.read_range(&queue, 0, 4, 2, Some(&token)).await.unwrap();
        assert_eq!(page.records.iter().map(|r| r.task_id).collect::<Vec<_>>(), vec![3, 4]);
        assert!(page.next_page_token.is_none());
    }

    #[tokio::test]
    async fn test_range_delete_and_ack_level() {
        let (store, queue) = seeded(&[1, 2, 3, 4]).await;
        assert_eq!(store.range_delete(&queue, 1, 3).await.unwrap(), 2);
        assert_eq!(store.task_ids(&queue), vec![1, 4]);

        store.update_ack_level(&queue, 3).await.unwrap();
        store.update_ack_level(&queue, 2).await.unwrap();
        assert_eq!(store.ack_level(&queue).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_malformed_token_rejected() {
        let (store, queue) = seeded(&[1]).await;
        let err = store
            .read_range(&queue, 0, 10, 5, Some("not base64!"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, super::super::errors::ReplicationErrorKind::InvalidArgument);
    }
}
