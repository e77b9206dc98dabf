//! History resend
//!
//! Rebuilds a missing stretch of an execution's history from a remote
//! cluster while keeping the source's original event-batch boundaries.
//! Batches are accumulated and handed to the applier together; a flush is
//! forced whenever the remote branch changes, the event version changes
//! between batches, or the batch-count limit is reached.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::timeout;

use super::clients::{RawHistoryRequest, RemoteClientProvider};
use super::errors::{EventRange, ReplicationError, ReplicationResult};
use crate::config::ResendConfig;
use crate::namespace::NamespaceRegistry;
use crate::observability::{Event, Logger};
use crate::state::{ExecutionKey, HistoryEvent};
use crate::versioning::VersionHistoryItem;

/// Applies resent event batches to local state.
#[async_trait]
pub trait EventsApplier: Send + Sync {
    async fn apply_events(
        &self,
        source_cluster: &str,
        execution: &ExecutionKey,
        version_history_items: &[VersionHistoryItem],
        batches: Vec<Vec<HistoryEvent>>,
    ) -> ReplicationResult<()>;
}

/// Counters of one resend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResendStats {
    pub pages: usize,
    pub flushes: usize,
    pub events: usize,
}

#[derive(Default)]
struct PendingBatches {
    batches: Vec<Vec<HistoryEvent>>,
    version_history_items: Vec<VersionHistoryItem>,
    last_version: Option<i64>,
}

impl PendingBatches {
    fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

pub struct HistoryResender {
    clients: Arc<dyn RemoteClientProvider>,
    namespaces: Arc<dyn NamespaceRegistry>,
    applier: Arc<dyn EventsApplier>,
    config: ResendConfig,
}

impl HistoryResender {
    pub fn new(
        clients: Arc<dyn RemoteClientProvider>,
        namespaces: Arc<dyn NamespaceRegistry>,
        applier: Arc<dyn EventsApplier>,
        config: ResendConfig,
    ) -> Self {
        Self {
            clients,
            namespaces,
            applier,
            config,
        }
    }

    /// Pull `range` of `execution`'s history from `remote_cluster` and
    /// apply it locally.
    pub async fn send_single_workflow_history(
        &self,
        remote_cluster: &str,
        execution: &ExecutionKey,
        range: EventRange,
    ) -> ReplicationResult<ResendStats> {
        self.namespaces
            .get_namespace_by_id(&execution.namespace_id)
            .map_err(|e| ReplicationError::namespace_not_found(e.to_string()))?;
        let client = self.clients.client_for(remote_cluster)?;

        let mut stats = ResendStats::default();
        let mut pending = PendingBatches::default();
        let mut next_page_token = None;

        loop {
            let request = RawHistoryRequest {
                execution: execution.clone(),
                start_event_id: range.start_event_id,
                start_event_version: range.start_event_version,
                end_event_id: range.end_event_id,
                end_event_version: range.end_event_version,
                page_size: self.config.page_size,
                next_page_token: next_page_token.take(),
            };
            let response = timeout(
                self.config.fetch_timeout(),
                client.get_workflow_execution_raw_history_v2(request),
            )
            .await
            .map_err(|_| {
                ReplicationError::fetch_timeout(format!(
                    "raw history of {} from {}",
                    execution, remote_cluster
                ))
            })??;
            stats.pages += 1;

            let items = response.version_history.items();
            for blob in &response.history_batches {
                let events = blob.to_events()?;
                let (Some(first), Some(last)) = (events.first(), events.last()) else {
                    return Err(ReplicationError::invalid_argument(format!(
                        "empty event batch in history of {}",
                        execution
                    )));
                };
                let (first_version, last_version) = (first.version, last.version);

                if !pending.is_empty() {
                    let branch_changed = pending.version_history_items.as_slice() != items;
                    let version_changed = pending.last_version != Some(first_version);
                    if branch_changed || version_changed {
                        self.flush(remote_cluster, execution, &mut pending, &mut stats)
                            .await?;
                    }
                }

                stats.events += events.len();
                pending.batches.push(events);
                pending.version_history_items = items.to_vec();
                pending.last_version = Some(last_version);

                if pending.batches.len() >= self.config.max_event_batch_count {
                    self.flush(remote_cluster, execution, &mut pending, &mut stats)
                        .await?;
                }
            }

            match response.next_page_token {
                Some(token) => next_page_token = Some(token),
                None => break,
            }
        }

        if !pending.is_empty() {
            self.flush(remote_cluster, execution, &mut pending, &mut stats)
                .await?;
        }

        Logger::info(
            Event::ResendComplete,
            &[
                ("events", &stats.events.to_string()),
                ("execution", &execution.to_string()),
                ("flushes", &stats.flushes.to_string()),
                ("pages", &stats.pages.to_string()),
                ("remote_cluster", remote_cluster),
            ],
        );
        Ok(stats)
    }

    async fn flush(
        &self,
        remote_cluster: &str,
        execution: &ExecutionKey,
        pending: &mut PendingBatches,
        stats: &mut ResendStats,
    ) -> ReplicationResult<()> {
        let batches = std::mem::take(&mut pending.batches);
        let items = std::mem::take(&mut pending.version_history_items);
        pending.last_version = None;
        let batch_count = batches.len();

        timeout(
            self.config.apply_timeout(),
            self.applier
                .apply_events(remote_cluster, execution, &items, batches),
        )
        .await
        .map_err(|_| {
            ReplicationError::apply_timeout(format!(
                "applying {} resent batches to {}",
                batch_count, execution
            ))
        })??;

        stats.flushes += 1;
        Logger::trace(
            Event::ResendFlush,
            &[
                ("batches", &batch_count.to_string()),
                ("execution", &execution.to_string()),
            ],
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::{InMemoryNamespaceRegistry, NamespaceEntry};
    use crate::replication::clients::{InMemoryAdminClient, StaticClientProvider};
    use crate::replication::errors::ReplicationErrorKind;
    use crate::state::EventType;
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingApplier {
        flushes: Mutex<Vec<Vec<Vec<HistoryEvent>>>>,
    }

    #[async_trait]
    impl EventsApplier for RecordingApplier {
        async fn apply_events(
            &self,
            _source_cluster: &str,
            _execution: &ExecutionKey,
            _version_history_items: &[VersionHistoryItem],
            batches: Vec<Vec<HistoryEvent>>,
        ) -> ReplicationResult<()> {
            self.flushes.lock().unwrap().push(batches);
            Ok(())
        }
    }

    fn key() -> ExecutionKey {
        ExecutionKey::new("ns", "wf", "run")
    }

    fn batch(ids: std::ops::RangeInclusive<i64>, version: i64) -> Vec<HistoryEvent> {
        ids.map(|id| HistoryEvent::new(id, version, EventType::TimerFired, Utc::now()))
            .collect()
    }

    fn setup(config: ResendConfig) -> (HistoryResender, Arc<InMemoryAdminClient>, Arc<RecordingApplier>) {
        let remote = Arc::new(InMemoryAdminClient::new());
        let provider = Arc::new(StaticClientProvider::new());
        provider.register("west", remote.clone());
        let registry = Arc::new(InMemoryNamespaceRegistry::new());
        registry.upsert(NamespaceEntry::local("ns", "ns", "east"));
        let applier = Arc::new(RecordingApplier::default());
        let resender = HistoryResender::new(provider, registry, applier.clone(), config);
        (resender, remote, applier)
    }

    fn whole_history() -> EventRange {
        EventRange {
            start_event_id: 0,
            start_event_version: 0,
            end_event_id: 0,
            end_event_version: 0,
        }
    }

    #[tokio::test]
    async fn test_flushes_on_batch_count_limit() {
        let (resender, remote, applier) = setup(ResendConfig {
            page_size: 2,
            max_event_batch_count: 2,
            ..ResendConfig::default()
        });
        for start in [1, 3, 5, 7, 9] {
            remote.append_batch(&key(), batch(start..=start + 1, 1)).unwrap();
        }

        let stats = resender
            .send_single_workflow_history("west", &key(), whole_history())
            .await
            .unwrap();

        let flushes = applier.flushes.lock().unwrap();
        assert_eq!(
            flushes.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![2, 2, 1]
        );
        assert_eq!(stats.flushes, 3);
        assert_eq!(stats.pages, 5);
        assert_eq!(stats.events, 10);
    }

    #[tokio::test]
    async fn test_version_change_flushes() {
        let (resender, remote, applier) = setup(ResendConfig::default());
        remote.append_batch(&key(), batch(1..=2, 1)).unwrap();
        remote.append_batch(&key(), batch(3..=4, 1)).unwrap();
        remote.append_batch(&key(), batch(5..=6, 11)).unwrap();

        resender
            .send_single_workflow_history("west", &key(), whole_history())
            .await
            .unwrap();

        let flushes = applier.flushes.lock().unwrap();
        assert_eq!(flushes.len(), 2);
        assert_eq!(flushes[0].len(), 2);
        assert_eq!(flushes[1][0][0].event_id, 5);
    }

    #[tokio::test]
    async fn test_remote_not_found_propagates() {
        let (resender, _remote, _applier) = setup(ResendConfig::default());
        let err = resender
            .send_single_workflow_history("west", &key(), whole_history())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ReplicationErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_unknown_namespace_rejected() {
        let (resender, _remote, _applier) = setup(ResendConfig::default());
        let err = resender
            .send_single_workflow_history("west", &ExecutionKey::new("other", "wf", "run"), whole_history())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ReplicationErrorKind::NamespaceNotFound);
    }
}
