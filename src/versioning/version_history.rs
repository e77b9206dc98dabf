//! Event-ID/version history
//!
//! Each item `(event_id, version)` says that the events after the previous
//! item's event id, up to and including `event_id`, were written under
//! `version`. Comparing two histories tells a replica whether an incoming
//! batch continues its branch, repeats what it has, or leaves a gap.

use serde::{Deserialize, Serialize};

use super::errors::{VersioningError, VersioningResult};

/// One run-length segment of event versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionHistoryItem {
    /// Last event id of the segment (inclusive)
    pub event_id: i64,
    /// Version the segment was written under
    pub version: i64,
}

impl VersionHistoryItem {
    /// Create a history item.
    pub const fn new(event_id: i64, version: i64) -> Self {
        Self { event_id, version }
    }
}

/// Run-length encoded event versions of one history branch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistory {
    items: Vec<VersionHistoryItem>,
}

impl VersionHistory {
    /// Empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from items, validating ordering.
    pub fn from_items(items: Vec<VersionHistoryItem>) -> VersioningResult<Self> {
        let mut history = Self::new();
        for item in items {
            history.add_or_update_item(item)?;
        }
        Ok(history)
    }

    /// Items in event order.
    pub fn items(&self) -> &[VersionHistoryItem] {
        &self.items
    }

    /// Check if no event was recorded.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Last item, i.e. the last event id and its version.
    pub fn last_item(&self) -> Option<VersionHistoryItem> {
        self.items.last().copied()
    }

    /// Extends the history with events up to `item.event_id` under `item.version`.
    pub fn add_or_update_item(&mut self, item: VersionHistoryItem) -> VersioningResult<()> {
        match self.items.last_mut() {
            None => {
                self.items.push(item);
                Ok(())
            }
            Some(last) => {
                if item.event_id <= last.event_id {
                    return Err(VersioningError::VersionHistory(format!(
                        "event id {} does not advance past {}",
                        item.event_id, last.event_id
                    )));
                }
                if item.version < last.version {
                    return Err(VersioningError::VersionHistory(format!(
                        "version {} is lower than last version {}",
                        item.version, last.version
                    )));
                }
                if item.version == last.version {
                    last.event_id = item.event_id;
                } else {
                    self.items.push(item);
                }
                Ok(())
            }
        }
    }

    /// Whether the event `item.event_id` exists on this branch with `item.version`.
    pub fn contains_item(&self, item: &VersionHistoryItem) -> bool {
        matches!(self.version_for_event(item.event_id), Ok(v) if v == item.version)
    }

    /// Version the given event was written under.
    pub fn version_for_event(&self, event_id: i64) -> VersioningResult<i64> {
        let mut segment_start = 0;
        for item in &self.items {
            if event_id > segment_start && event_id <= item.event_id {
                return Ok(item.version);
            }
            segment_start = item.event_id;
        }
        Err(VersioningError::VersionHistory(format!(
            "event id {} is not on this branch",
            event_id
        )))
    }

    /// The last event both histories agree on.
    pub fn find_lowest_common_ancestor(
        &self,
        other: &VersionHistory,
    ) -> VersioningResult<VersionHistoryItem> {
        let mut a = self.items.len();
        let mut b = other.items.len();
        while a > 0 && b > 0 {
            let a_item = self.items[a - 1];
            let b_item = other.items[b - 1];
            if a_item.version == b_item.version {
                return Ok(if a_item.event_id > b_item.event_id {
                    b_item
                } else {
                    a_item
                });
            }
            if a_item.version > b_item.version {
                a -= 1;
            } else {
                b -= 1;
            }
        }
        Err(VersioningError::VersionHistory(
            "histories share no common ancestor".to_string(),
        ))
    }

    /// Item-by-item equality with raw items.
    pub fn is_equal_items(&self, other: &[VersionHistoryItem]) -> bool {
        self.items.as_slice() == other
    }
}
