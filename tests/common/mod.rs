//! Shared fixtures for integration tests
//!
//! Builds a replica-side stack (namespace registry, execution cache,
//! in-memory remote cluster, applier, resender) the way a shard would wire
//! it.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use replicore::config::{ChecksumConfig, ResendConfig, TransactionConfig};
use replicore::namespace::{InMemoryNamespaceRegistry, NamespaceEntry};
use replicore::replication::{
    HistoryResender, InMemoryAdminClient, ReplicaApplier, ReplicationTask, StateExecutorProvider,
    StaticClientProvider,
};
use replicore::state::{EventType, ExecutionCache, ExecutionKey, HistoryEvent, InMemoryExecutionStore};
use replicore::versioning::VersionHistoryItem;

pub const LOCAL_CLUSTER: &str = "east";
pub const REMOTE_CLUSTER: &str = "west";

pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

pub fn key() -> ExecutionKey {
    ExecutionKey::new("ns", "wf", "run")
}

/// Global namespace replicated between both clusters, active in `active`.
pub fn namespace(active: &str, failover_version: i64) -> Arc<NamespaceEntry> {
    Arc::new(NamespaceEntry::global(
        "ns",
        "ns",
        active,
        vec![LOCAL_CLUSTER.to_string(), REMOTE_CLUSTER.to_string()],
        failover_version,
    ))
}

/// Transaction config with deterministic checksums and a small tombstone cap.
pub fn transaction_config(tombstone_count_limit: usize) -> Arc<TransactionConfig> {
    Arc::new(TransactionConfig {
        transition_history_enabled: true,
        tombstone_count_limit,
        checksum: ChecksumConfig {
            generate_probability: 100,
            verify_probability: 100,
            invalidate_before: None,
        },
        ..TransactionConfig::default()
    })
}

pub fn events(ids: std::ops::RangeInclusive<i64>, version: i64) -> Vec<HistoryEvent> {
    ids.map(|id| {
        let event_type = if id == 1 {
            EventType::WorkflowExecutionStarted
        } else {
            EventType::TimerFired
        };
        HistoryEvent::new(id, version, event_type, now())
    })
    .collect()
}

pub fn history_task(source_task_id: i64, batch: Vec<HistoryEvent>) -> ReplicationTask {
    let version = batch[0].version;
    let last_event_id = batch[batch.len() - 1].event_id;
    ReplicationTask::History {
        source_task_id,
        visibility_time: now(),
        execution: key(),
        version,
        events: batch,
        version_history_items: vec![VersionHistoryItem::new(last_event_id, version)],
    }
}

/// Replica-side wiring for one shard of the local cluster.
pub struct ReplicaStack {
    pub registry: Arc<InMemoryNamespaceRegistry>,
    pub cache: Arc<ExecutionCache>,
    pub remote: Arc<InMemoryAdminClient>,
    pub clients: Arc<StaticClientProvider>,
    pub applier: Arc<ReplicaApplier>,
    pub resender: Arc<HistoryResender>,
}

impl ReplicaStack {
    pub fn new(resend: ResendConfig) -> Self {
        let registry = Arc::new(InMemoryNamespaceRegistry::new());
        registry.upsert(namespace(REMOTE_CLUSTER, 2).as_ref().clone());
        let cache = Arc::new(ExecutionCache::new(
            Arc::new(InMemoryExecutionStore::new()),
            registry.clone(),
            Arc::new(TransactionConfig::default()),
        ));
        let remote = Arc::new(InMemoryAdminClient::new());
        let clients = Arc::new(StaticClientProvider::new());
        clients.register(REMOTE_CLUSTER, remote.clone());
        let applier = Arc::new(ReplicaApplier::new(cache.clone()));
        let resender = Arc::new(HistoryResender::new(
            clients.clone(),
            registry.clone(),
            applier.clone(),
            resend,
        ));
        Self {
            registry,
            cache,
            remote,
            clients,
            applier,
            resender,
        }
    }

    pub fn executor_provider(&self) -> Arc<StateExecutorProvider> {
        Arc::new(StateExecutorProvider::new(
            LOCAL_CLUSTER,
            self.registry.clone(),
            self.applier.clone(),
            self.resender.clone(),
        ))
    }

    /// Next event id of the replicated execution, if it exists locally.
    pub async fn next_event_id(&self) -> Option<i64> {
        let mut locked = self.cache.lock(&key()).await.unwrap();
        let next = locked.mutable_state().ok().map(|ms| ms.next_event_id());
        locked.release(None);
        next
    }
}
