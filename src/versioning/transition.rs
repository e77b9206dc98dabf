//! Versioned transitions
//!
//! A `VersionedTransition` is `(failover_version, transition_count)`. Later
//! transitions have a higher failover version, or the same failover version
//! and a higher transition count. `TransitionHistory` keeps one entry per
//! failover-version segment: the entry holds the last transition count
//! reached while that version was current.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::errors::{VersioningError, VersioningResult};

/// Fingerprint of one point in an execution's history.
///
/// Field order matters: the derived `Ord` compares failover version first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionedTransition {
    /// Failover version of the cluster that was authoritative
    pub failover_version: i64,
    /// Count of transitions since the execution was created
    pub transition_count: i64,
}

impl VersionedTransition {
    /// Create a versioned transition.
    pub const fn new(failover_version: i64, transition_count: i64) -> Self {
        Self {
            failover_version,
            transition_count,
        }
    }
}

impl fmt::Display for VersionedTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.failover_version, self.transition_count)
    }
}

/// Compares two optional transitions; `None` sorts before everything.
pub fn compare_versioned_transition(
    a: Option<&VersionedTransition>,
    b: Option<&VersionedTransition>,
) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => a.cmp(b),
    }
}

/// Run-length encoded history of transitions, one entry per failover version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionHistory {
    entries: Vec<VersionedTransition>,
}

impl TransitionHistory {
    /// Empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from persisted entries, validating ordering.
    pub fn from_entries(entries: Vec<VersionedTransition>) -> VersioningResult<Self> {
        let history = Self { entries };
        history.validate()?;
        Ok(history)
    }

    /// Persisted entries.
    pub fn entries(&self) -> &[VersionedTransition] {
        &self.entries
    }

    /// Check if no transition was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Latest transition.
    pub fn last(&self) -> Option<&VersionedTransition> {
        self.entries.last()
    }

    /// Clears the history, returning what it held.
    pub fn take(&mut self) -> TransitionHistory {
        std::mem::take(self)
    }

    /// Records one more transition under `failover_version`.
    ///
    /// Returns the new latest transition.
    pub fn advance(&mut self, failover_version: i64) -> VersioningResult<VersionedTransition> {
        match self.entries.last_mut() {
            None => {
                let vt = VersionedTransition::new(failover_version, 1);
                self.entries.push(vt);
                Ok(vt)
            }
            Some(last) if last.failover_version == failover_version => {
                last.transition_count += 1;
                Ok(*last)
            }
            Some(last) if last.failover_version < failover_version => {
                let vt = VersionedTransition::new(failover_version, last.transition_count + 1);
                self.entries.push(vt);
                Ok(vt)
            }
            Some(last) => Err(VersioningError::VersionRegression {
                current: last.failover_version,
                attempted: failover_version,
            }),
        }
    }

    /// Checks strictly increasing versions and counts across entries.
    pub fn validate(&self) -> VersioningResult<()> {
        for (index, pair) in self.entries.windows(2).enumerate() {
            let (prev, next) = (pair[0], pair[1]);
            if next.failover_version <= prev.failover_version {
                return Err(VersioningError::CorruptedHistory {
                    index: index + 1,
                    reason: format!(
                        "failover version {} does not increase over {}",
                        next.failover_version, prev.failover_version
                    ),
                });
            }
            if next.transition_count <= prev.transition_count {
                return Err(VersioningError::CorruptedHistory {
                    index: index + 1,
                    reason: format!(
                        "transition count {} does not increase over {}",
                        next.transition_count, prev.transition_count
                    ),
                });
            }
        }
        if let Some(first) = self.entries.first() {
            if first.transition_count < 1 {
                return Err(VersioningError::CorruptedHistory {
                    index: 0,
                    reason: "transition count must start at 1".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Whether `vt` is one of the transitions this history went through.
    pub fn contains(&self, vt: &VersionedTransition) -> bool {
        self.staleness_check(vt).is_ok()
    }

    /// Decides how `reference` relates to this history.
    ///
    /// - `Ok(())`: the reference is part of this history
    /// - `StaleState`: the reference is ahead of this history; reload
    /// - `StaleReference`: the reference belongs to a history this one never had
    pub fn staleness_check(&self, reference: &VersionedTransition) -> VersioningResult<()> {
        let last = match self.entries.last() {
            Some(last) => *last,
            None => {
                return Err(VersioningError::StaleState {
                    local: None,
                    reference: *reference,
                })
            }
        };
        if reference > &last {
            return Err(VersioningError::StaleState {
                local: Some(last),
                reference: *reference,
            });
        }

        for (index, entry) in self.entries.iter().enumerate().rev() {
            if entry.failover_version == reference.failover_version {
                let segment_start = if index == 0 {
                    0
                } else {
                    self.entries[index - 1].transition_count
                };
                if reference.transition_count > segment_start
                    && reference.transition_count <= entry.transition_count
                {
                    return Ok(());
                }
                break;
            }
            if entry.failover_version < reference.failover_version {
                break;
            }
        }
        Err(VersioningError::StaleReference {
            reference: *reference,
        })
    }
}
