//! Change-tracking maps for execution sub-entries
//!
//! A `SubStateMap` remembers which keys were upserted or removed since the
//! last transaction close. Closing drains that record into a
//! `SubStateChanges`, which is what a mutation carries.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::execution::{
    ActivityInfo, ChildExecutionInfo, RequestCancelInfo, SignalInfo, SignalRequestedInfo,
    StateMachineNode, TimerInfo,
};
use crate::versioning::VersionedTransition;

/// Sub-entry stamped with the transition that last modified it.
pub trait VersionedEntry {
    fn last_update(&self) -> Option<&VersionedTransition>;

    fn set_last_update(&mut self, transition: VersionedTransition);

    /// Called when the entry is first stamped; most entries only track updates.
    fn on_first_stamp(&mut self, _transition: VersionedTransition) {}

    /// Called on every stamp after the entry changed.
    fn stamp(&mut self, transition: VersionedTransition) {
        if self.last_update().is_none() {
            self.on_first_stamp(transition);
        }
        self.set_last_update(transition);
    }
}

macro_rules! versioned_entry {
    ($($ty:ty),* $(,)?) => {
        $(
            impl VersionedEntry for $ty {
                fn last_update(&self) -> Option<&VersionedTransition> {
                    self.last_update_versioned_transition.as_ref()
                }

                fn set_last_update(&mut self, transition: VersionedTransition) {
                    self.last_update_versioned_transition = Some(transition);
                }
            }
        )*
    };
}

versioned_entry!(
    ActivityInfo,
    TimerInfo,
    ChildExecutionInfo,
    RequestCancelInfo,
    SignalInfo,
    SignalRequestedInfo,
);

impl VersionedEntry for StateMachineNode {
    fn last_update(&self) -> Option<&VersionedTransition> {
        self.last_update_versioned_transition.as_ref()
    }

    fn set_last_update(&mut self, transition: VersionedTransition) {
        self.last_update_versioned_transition = Some(transition);
    }

    fn on_first_stamp(&mut self, transition: VersionedTransition) {
        if self.initial_versioned_transition.is_none() {
            self.initial_versioned_transition = Some(transition);
        }
    }

    fn stamp(&mut self, transition: VersionedTransition) {
        if self.initial_versioned_transition.is_none() {
            self.on_first_stamp(transition);
        }
        self.transition_count += 1;
        self.set_last_update(transition);
    }
}

/// Delta of one map between two transaction closes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubStateChanges<K: Ord, V> {
    pub upserts: BTreeMap<K, V>,
    pub deletes: BTreeSet<K>,
}

impl<K: Ord, V> Default for SubStateChanges<K, V> {
    fn default() -> Self {
        Self {
            upserts: BTreeMap::new(),
            deletes: BTreeSet::new(),
        }
    }
}

impl<K: Ord, V> SubStateChanges<K, V> {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }
}

/// Keyed entries plus the keys touched in the open transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubStateMap<K: Ord, V> {
    entries: BTreeMap<K, V>,
    #[serde(skip)]
    updated: BTreeSet<K>,
    #[serde(skip)]
    deleted: BTreeSet<K>,
}

impl<K: Ord, V> Default for SubStateMap<K, V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            updated: BTreeSet::new(),
            deleted: BTreeSet::new(),
        }
    }
}

// Equality is over entries; the change record is transaction-local.
impl<K: Ord, V: PartialEq> PartialEq for SubStateMap<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl<K: Ord + Clone, V: VersionedEntry + Clone> SubStateMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    /// Mutable access; the entry counts as updated.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let entry = self.entries.get_mut(key)?;
        self.updated.insert(key.clone());
        Some(entry)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    pub fn upsert(&mut self, key: K, value: V) {
        self.deleted.remove(&key);
        self.updated.insert(key.clone());
        self.entries.insert(key, value);
    }

    /// Remove an entry, recording the deletion if it existed.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let removed = self.entries.remove(key)?;
        self.updated.remove(key);
        self.deleted.insert(key.clone());
        Some(removed)
    }

    pub fn has_changes(&self) -> bool {
        !self.updated.is_empty() || !self.deleted.is_empty()
    }

    pub fn updated_keys(&self) -> impl Iterator<Item = &K> {
        self.updated.iter()
    }

    pub fn deleted_keys(&self) -> impl Iterator<Item = &K> {
        self.deleted.iter()
    }

    /// Stamp every entry updated in the open transaction.
    pub fn stamp_updated(&mut self, transition: VersionedTransition) {
        for key in &self.updated {
            if let Some(entry) = self.entries.get_mut(key) {
                entry.stamp(transition);
            }
        }
    }

    /// Stamp every entry; used when transition tracking is first enabled.
    pub fn stamp_all(&mut self, transition: VersionedTransition) {
        for entry in self.entries.values_mut() {
            entry.stamp(transition);
        }
    }

    /// Drain the change record.
    pub fn take_changes(&mut self) -> SubStateChanges<K, V> {
        let updated = std::mem::take(&mut self.updated);
        let deletes = std::mem::take(&mut self.deleted);
        let upserts = updated
            .into_iter()
            .filter_map(|key| {
                let value = self.entries.get(&key)?.clone();
                Some((key, value))
            })
            .collect();
        SubStateChanges { upserts, deletes }
    }

    /// Apply a delta without recording it. Repeated application is a no-op.
    pub fn apply_changes(&mut self, changes: &SubStateChanges<K, V>) {
        for (key, value) in &changes.upserts {
            self.entries.insert(key.clone(), value.clone());
        }
        for key in &changes.deletes {
            self.entries.remove(key);
        }
    }

    /// Remove without recording; used for replicated tombstones.
    pub fn remove_untracked(&mut self, key: &K) {
        self.entries.remove(key);
    }

    /// Discard uncommitted change tracking.
    pub fn clear_changes(&mut self) {
        self.updated.clear();
        self.deleted.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activity(id: i64) -> ActivityInfo {
        ActivityInfo::new(id, format!("act-{}", id), "type")
    }

    #[test]
    fn test_changes_track_upserts_and_deletes() {
        let mut map = SubStateMap::new();
        map.upsert(5, activity(5));
        map.upsert(6, activity(6));
        map.take_changes();

        map.get_mut(&5).unwrap().attempt = 2;
        map.remove(&6);
        assert!(map.has_changes());

        let changes = map.take_changes();
        assert_eq!(changes.upserts.len(), 1);
        assert_eq!(changes.upserts[&5].attempt, 2);
        assert_eq!(changes.deletes.iter().copied().collect::<Vec<_>>(), vec![6]);
        assert!(!map.has_changes());
    }

    #[test]
    fn test_remove_missing_key_is_not_recorded() {
        let mut map: SubStateMap<i64, ActivityInfo> = SubStateMap::new();
        assert!(map.remove(&1).is_none());
        assert!(!map.has_changes());
    }

    #[test]
    fn test_stamp_updated_only_touches_changed_entries() {
        let mut map = SubStateMap::new();
        map.upsert(1, activity(1));
        map.take_changes();
        map.upsert(2, activity(2));

        let vt = VersionedTransition::new(1, 3);
        map.stamp_updated(vt);
        assert_eq!(map.get(&1).unwrap().last_update_versioned_transition, None);
        assert_eq!(map.get(&2).unwrap().last_update_versioned_transition, Some(vt));
    }

    #[test]
    fn test_node_stamp_sets_initial_once() {
        let mut node = StateMachineNode::new("root/a", serde_json::json!({}));
        node.stamp(VersionedTransition::new(1, 1));
        node.stamp(VersionedTransition::new(1, 2));
        assert_eq!(node.initial_versioned_transition, Some(VersionedTransition::new(1, 1)));
        assert_eq!(node.last_update_versioned_transition, Some(VersionedTransition::new(1, 2)));
        assert_eq!(node.transition_count, 2);
    }

    #[test]
    fn test_apply_changes_twice_is_idempotent() {
        let mut source = SubStateMap::new();
        source.upsert(1, activity(1));
        source.upsert(2, activity(2));
        source.take_changes();
        source.remove(&1);
        let changes = source.take_changes();

        let mut replica = SubStateMap::new();
        replica.upsert(1, activity(1));
        replica.upsert(2, activity(2));
        replica.apply_changes(&changes);
        let once = replica.clone();
        replica.apply_changes(&changes);
        assert_eq!(replica, once);
        assert_eq!(replica, source);
    }
}
