//! Remote cluster admin endpoints
//!
//! Each cluster exposes raw history and replication messages to its peers.
//! `InMemoryAdminClient` serves them from process memory and backs
//! single-process deployments and tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::errors::{ReplicationError, ReplicationResult};
use super::task::{ReplicationTask, ReplicationTaskInfo};
use crate::state::{ExecutionKey, HistoryEvent};
use crate::versioning::VersionHistory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncodingType {
    Json,
}

/// One serialized event batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataBlob {
    pub encoding: EncodingType,
    pub data: Vec<u8>,
}

impl DataBlob {
    pub fn from_events(events: &[HistoryEvent]) -> ReplicationResult<Self> {
        let data = serde_json::to_vec(events)
            .map_err(|e| ReplicationError::invalid_argument(format!("encode batch: {}", e)))?;
        Ok(Self {
            encoding: EncodingType::Json,
            data,
        })
    }

    pub fn to_events(&self) -> ReplicationResult<Vec<HistoryEvent>> {
        match self.encoding {
            EncodingType::Json => serde_json::from_slice(&self.data)
                .map_err(|e| ReplicationError::invalid_argument(format!("decode batch: {}", e))),
        }
    }
}

/// Raw history range request. Event bounds are exclusive; zero leaves a
/// side open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawHistoryRequest {
    pub execution: ExecutionKey,
    pub start_event_id: i64,
    pub start_event_version: i64,
    pub end_event_id: i64,
    pub end_event_version: i64,
    /// Events per page; batches are never split
    pub page_size: usize,
    pub next_page_token: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawHistoryResponse {
    pub history_batches: Vec<DataBlob>,
    pub version_history: VersionHistory,
    pub next_page_token: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationMessagesRequest {
    /// Cluster asking for tasks
    pub polling_cluster: String,
    pub last_retrieved_message_id: i64,
    pub max_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationMessages {
    pub tasks: Vec<ReplicationTask>,
    pub last_retrieved_message_id: i64,
    pub has_more: bool,
}

/// Admin-facing endpoints of one remote cluster
#[async_trait]
pub trait AdminClient: Send + Sync {
    async fn get_workflow_execution_raw_history_v2(
        &self,
        request: RawHistoryRequest,
    ) -> ReplicationResult<RawHistoryResponse>;

    async fn get_replication_messages(
        &self,
        request: ReplicationMessagesRequest,
    ) -> ReplicationResult<ReplicationMessages>;

    /// Fetch task bodies for DLQ'd coordinates.
    async fn get_dlq_replication_messages(
        &self,
        task_infos: &[ReplicationTaskInfo],
    ) -> ReplicationResult<Vec<ReplicationTask>>;
}

/// Resolves the admin client of a named cluster.
pub trait RemoteClientProvider: Send + Sync {
    fn client_for(&self, cluster: &str) -> ReplicationResult<Arc<dyn AdminClient>>;
}

#[derive(Default)]
pub struct StaticClientProvider {
    clients: RwLock<HashMap<String, Arc<dyn AdminClient>>>,
}

impl StaticClientProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, cluster: impl Into<String>, client: Arc<dyn AdminClient>) {
        self.clients
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(cluster.into(), client);
    }
}

impl RemoteClientProvider for StaticClientProvider {
    fn client_for(&self, cluster: &str) -> ReplicationResult<Arc<dyn AdminClient>> {
        self.clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(cluster)
            .cloned()
            .ok_or_else(|| ReplicationError::remote_unavailable(format!("unknown cluster {}", cluster)))
    }
}

#[derive(Debug, Clone, Default)]
struct StoredHistory {
    batches: Vec<Vec<HistoryEvent>>,
    version_history: VersionHistory,
}

/// Admin endpoints served from memory
#[derive(Default)]
pub struct InMemoryAdminClient {
    histories: Mutex<HashMap<ExecutionKey, StoredHistory>>,
    tasks: Mutex<BTreeMap<i64, ReplicationTask>>,
    unavailable: AtomicBool,
    raw_history_calls: AtomicUsize,
}

impl InMemoryAdminClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one event batch to an execution's history.
    pub fn append_batch(&self, execution: &ExecutionKey, events: Vec<HistoryEvent>) -> ReplicationResult<()> {
        let mut histories = self.histories.lock().unwrap_or_else(|e| e.into_inner());
        let stored = histories.entry(execution.clone()).or_default();
        for event in &events {
            stored
                .version_history
                .add_or_update_item(crate::versioning::VersionHistoryItem::new(
                    event.event_id,
                    event.version,
                ))
                .map_err(|e| ReplicationError::invalid_argument(e.to_string()))?;
        }
        stored.batches.push(events);
        Ok(())
    }

    pub fn publish(&self, task: ReplicationTask) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task.source_task_id(), task);
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn raw_history_calls(&self) -> usize {
        self.raw_history_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> ReplicationResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ReplicationError::remote_unavailable("cluster is unavailable"));
        }
        Ok(())
    }
}

fn decode_index(token: Option<&[u8]>) -> ReplicationResult<usize> {
    match token {
        None => Ok(0),
        Some(bytes) => std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ReplicationError::invalid_argument("malformed page token")),
    }
}

#[async_trait]
impl AdminClient for InMemoryAdminClient {
    async fn get_workflow_execution_raw_history_v2(
        &self,
        request: RawHistoryRequest,
    ) -> ReplicationResult<RawHistoryResponse> {
        self.raw_history_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        if request.page_size == 0 {
            return Err(ReplicationError::invalid_argument("page size must be positive"));
        }

        let histories = self.histories.lock().unwrap_or_else(|e| e.into_inner());
        let stored = histories
            .get(&request.execution)
            .ok_or_else(|| ReplicationError::not_found(format!("execution {}", request.execution)))?;

        let in_range: Vec<&Vec<HistoryEvent>> = stored
            .batches
            .iter()
            .filter(|batch| {
                let first = batch.first().map(|e| e.event_id).unwrap_or_default();
                let last = batch.last().map(|e| e.event_id).unwrap_or_default();
                last > request.start_event_id
                    && (request.end_event_id == 0 || first < request.end_event_id)
            })
            .collect();

        let start = decode_index(request.next_page_token.as_deref())?;
        let mut history_batches = Vec::new();
        let mut events_in_page = 0;
        let mut index = start;
        while index < in_range.len() && events_in_page < request.page_size {
            events_in_page += in_range[index].len();
            history_batches.push(DataBlob::from_events(in_range[index])?);
            index += 1;
        }

        Ok(RawHistoryResponse {
            history_batches,
            version_history: stored.version_history.clone(),
            next_page_token: (index < in_range.len()).then(|| index.to_string().into_bytes()),
        })
    }

    async fn get_replication_messages(
        &self,
        request: ReplicationMessagesRequest,
    ) -> ReplicationResult<ReplicationMessages> {
        self.check_available()?;
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let pending: Vec<&ReplicationTask> = tasks
            .range(request.last_retrieved_message_id + 1..)
            .map(|(_, task)| task)
            .collect();
        let batch: Vec<ReplicationTask> = pending
            .iter()
            .take(request.max_count)
            .map(|task| (*task).clone())
            .collect();
        let last_retrieved_message_id = batch
            .last()
            .map(ReplicationTask::source_task_id)
            .unwrap_or(request.last_retrieved_message_id);
        Ok(ReplicationMessages {
            has_more: pending.len() > batch.len(),
            tasks: batch,
            last_retrieved_message_id,
        })
    }

    async fn get_dlq_replication_messages(
        &self,
        task_infos: &[ReplicationTaskInfo],
    ) -> ReplicationResult<Vec<ReplicationTask>> {
        self.check_available()?;
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        Ok(task_infos
            .iter()
            .filter_map(|info| tasks.get(&info.task_id).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::EventType;
    use chrono::Utc;

    fn key() -> ExecutionKey {
        ExecutionKey::new("ns", "wf", "run")
    }

    fn batch(ids: std::ops::RangeInclusive<i64>, version: i64) -> Vec<HistoryEvent> {
        ids.map(|id| HistoryEvent::new(id, version, EventType::TimerFired, Utc::now()))
            .collect()
    }

    fn request(start: i64, end: i64, page_size: usize, token: Option<Vec<u8>>) -> RawHistoryRequest {
        RawHistoryRequest {
            execution: key(),
            start_event_id: start,
            start_event_version: 0,
            end_event_id: end,
            end_event_version: 0,
            page_size,
            next_page_token: token,
        }
    }

    #[tokio::test]
    async fn test_raw_history_pages_never_split_batches() {
        let client = InMemoryAdminClient::new();
        client.append_batch(&key(), batch(1..=3, 1)).unwrap();
        client.append_batch(&key(), batch(4..=5, 1)).unwrap();
        client.append_batch(&key(), batch(6..=9, 2)).unwrap();

        let first = client
            .get_workflow_execution_raw_history_v2(request(0, 0, 4, None))
            .await
            .unwrap();
        assert_eq!(first.history_batches.len(), 2);
        let second = client
            .get_workflow_execution_raw_history_v2(request(0, 0, 4, first.next_page_token))
            .await
            .unwrap();
        assert_eq!(second.history_batches.len(), 1);
        assert!(second.next_page_token.is_none());
        assert_eq!(second.history_batches[0].to_events().unwrap().len(), 4);
        assert_eq!(client.raw_history_calls(), 2);
    }

    #[tokio::test]
    async fn test_raw_history_respects_exclusive_bounds() {
        let client = InMemoryAdminClient::new();
        client.append_batch(&key(), batch(1..=3, 1)).unwrap();
        client.append_batch(&key(), batch(4..=5, 1)).unwrap();
        client.append_batch(&key(), batch(6..=9, 2)).unwrap();

        let page = client
            .get_workflow_execution_raw_history_v2(request(3, 6, 100, None))
            .await
            .unwrap();
        assert_eq!(page.history_batches.len(), 1);
        assert_eq!(page.history_batches[0].to_events().unwrap()[0].event_id, 4);
    }

    #[tokio::test]
    async fn test_unavailable_client_fails() {
        let client = InMemoryAdminClient::new();
        client.set_available(false);
        let err = client
            .get_dlq_replication_messages(&[])
            .await
            .unwrap_err();
        assert!(err.is_remote_failure());
    }

    #[test]
    fn test_provider_unknown_cluster() {
        let provider = StaticClientProvider::new();
        provider.register("west", Arc::new(InMemoryAdminClient::new()));
        assert!(provider.client_for("west").is_ok());
        assert!(provider.client_for("north").is_err());
    }
}
