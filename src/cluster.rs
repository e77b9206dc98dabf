//! Cluster metadata
//!
//! Static, config-driven view of the clusters participating in replication.
//! Failover versions are allocated per cluster as
//! `initial_failover_version + n * failover_version_increment`, so the owner
//! of any version is recoverable with a modulo.

use std::collections::BTreeMap;

use crate::config::{ClusterConfig, ClusterInfoConfig};

/// Read access to cluster topology.
pub trait ClusterMetadata: Send + Sync {
    fn current_cluster_name(&self) -> &str;

    /// Cluster that allocated `version`, if any.
    fn cluster_name_for_failover_version(&self, version: i64) -> Option<String>;

    fn all_cluster_info(&self) -> &BTreeMap<String, ClusterInfoConfig>;

    fn failover_version_increment(&self) -> i64;

    /// Next failover version owned by the current cluster that is greater
    /// than `current`.
    fn next_failover_version(&self, current: i64) -> Option<i64> {
        let info = self.all_cluster_info().get(self.current_cluster_name())?;
        let increment = self.failover_version_increment();
        let mut next = (current / increment) * increment + info.initial_failover_version;
        if next <= current {
            next += increment;
        }
        Some(next)
    }
}

/// Cluster metadata backed by configuration
#[derive(Debug, Clone)]
pub struct StaticClusterMetadata {
    config: ClusterConfig,
}

impl StaticClusterMetadata {
    pub fn new(config: ClusterConfig) -> Self {
        Self { config }
    }

    /// Shard count of the named cluster.
    pub fn shard_count(&self, cluster: &str) -> Option<i32> {
        self.config.clusters.get(cluster).map(|c| c.shard_count)
    }
}

impl ClusterMetadata for StaticClusterMetadata {
    fn current_cluster_name(&self) -> &str {
        &self.config.current_cluster
    }

    fn cluster_name_for_failover_version(&self, version: i64) -> Option<String> {
        if version < 0 {
            return None;
        }
        let initial = version % self.config.failover_version_increment;
        self.config
            .clusters
            .iter()
            .find(|(_, info)| info.initial_failover_version == initial)
            .map(|(name, _)| name.clone())
    }

    fn all_cluster_info(&self) -> &BTreeMap<String, ClusterInfoConfig> {
        &self.config.clusters
    }

    fn failover_version_increment(&self) -> i64 {
        self.config.failover_version_increment
    }
}

/// History shard (1-based) owning a workflow.
pub fn workflow_id_to_shard(namespace_id: &str, workflow_id: &str, shard_count: i32) -> i32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(namespace_id.as_bytes());
    hasher.update(b"_");
    hasher.update(workflow_id.as_bytes());
    let hash = hasher.finalize();
    (hash % shard_count.max(1) as u32) as i32 + 1
}

/// Shards of a target cluster that cover `source_shard` of a source cluster.
///
/// Shard counts must divide one another; `None` otherwise.
pub fn map_shard_id(source_shard_count: i32, target_shard_count: i32, source_shard: i32) -> Option<Vec<i32>> {
    if source_shard_count <= 0 || target_shard_count <= 0 {
        return None;
    }
    if source_shard < 1 || source_shard > source_shard_count {
        return None;
    }
    if source_shard_count == target_shard_count {
        return Some(vec![source_shard]);
    }
    if target_shard_count > source_shard_count {
        if target_shard_count % source_shard_count != 0 {
            return None;
        }
        let ratio = target_shard_count / source_shard_count;
        return Some(
            (0..ratio)
                .map(|i| source_shard + i * source_shard_count)
                .collect(),
        );
    }
    if source_shard_count % target_shard_count != 0 {
        return None;
    }
    Some(vec![(source_shard - 1) % target_shard_count + 1])
}
