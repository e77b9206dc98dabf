//! Namespace registry
//!
//! Tasks consult the registry to decide whether a namespace is active in the
//! current cluster, is being handed over, or no longer exists.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NamespaceError {
    #[error("namespace {0} not found")]
    NotFound(String),
}

pub type NamespaceResult<T> = Result<T, NamespaceError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NamespaceState {
    Registered,
    Deprecated,
    Deleted,
}

/// Replication settings of a namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceReplication {
    pub active_cluster: String,
    pub clusters: Vec<String>,
    pub failover_version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceEntry {
    pub id: String,
    pub name: String,
    pub state: NamespaceState,
    pub replication: NamespaceReplication,
    /// Set while the active cluster is being switched
    pub handover: bool,
    pub is_global: bool,
}

impl NamespaceEntry {
    /// A local (non-replicated) namespace active in `cluster`.
    pub fn local(id: impl Into<String>, name: impl Into<String>, cluster: impl Into<String>) -> Self {
        let cluster = cluster.into();
        Self {
            id: id.into(),
            name: name.into(),
            state: NamespaceState::Registered,
            replication: NamespaceReplication {
                active_cluster: cluster.clone(),
                clusters: vec![cluster],
                failover_version: 0,
            },
            handover: false,
            is_global: false,
        }
    }

    /// A global namespace replicated to `clusters`, active in `active_cluster`.
    pub fn global(
        id: impl Into<String>,
        name: impl Into<String>,
        active_cluster: impl Into<String>,
        clusters: Vec<String>,
        failover_version: i64,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            state: NamespaceState::Registered,
            replication: NamespaceReplication {
                active_cluster: active_cluster.into(),
                clusters,
                failover_version,
            },
            handover: false,
            is_global: true,
        }
    }

    pub fn is_active_in(&self, cluster: &str) -> bool {
        !self.is_global || self.replication.active_cluster == cluster
    }

    pub fn is_replicated_to(&self, cluster: &str) -> bool {
        self.replication.clusters.iter().any(|c| c == cluster)
    }

    pub fn is_deleted(&self) -> bool {
        self.state == NamespaceState::Deleted
    }
}

/// Lookup of namespaces by id.
pub trait NamespaceRegistry: Send + Sync {
    fn get_namespace_by_id(&self, id: &str) -> NamespaceResult<Arc<NamespaceEntry>>;
}

/// Registry held entirely in memory
#[derive(Debug, Default)]
pub struct InMemoryNamespaceRegistry {
    entries: RwLock<HashMap<String, Arc<NamespaceEntry>>>,
}

impl InMemoryNamespaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry.
    pub fn upsert(&self, entry: NamespaceEntry) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(entry.id.clone(), Arc::new(entry));
    }
}

impl NamespaceRegistry for InMemoryNamespaceRegistry {
    fn get_namespace_by_id(&self, id: &str) -> NamespaceResult<Arc<NamespaceEntry>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(id)
            .cloned()
            .ok_or_else(|| NamespaceError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_namespace_is_active_everywhere() {
        let ns = NamespaceEntry::local("ns-id", "ns", "east");
        assert!(ns.is_active_in("east"));
        assert!(ns.is_active_in("west"));
        assert!(!ns.is_replicated_to("west"));
    }

    #[test]
    fn test_global_namespace_active_in_one_cluster() {
        let ns = NamespaceEntry::global(
            "ns-id",
            "ns",
            "east",
            vec!["east".to_string(), "west".to_string()],
            1,
        );
        assert!(ns.is_active_in("east"));
        assert!(!ns.is_active_in("west"));
        assert!(ns.is_replicated_to("west"));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = InMemoryNamespaceRegistry::new();
        registry.upsert(NamespaceEntry::local("a", "alpha", "east"));
        assert_eq!(registry.get_namespace_by_id("a").unwrap().name, "alpha");
        assert_eq!(
            registry.get_namespace_by_id("b").unwrap_err(),
            NamespaceError::NotFound("b".to_string())
        );
    }
}
