//! Execution state checksums
//!
//! Flavor `Crc32IeeeJsonV1`: CRC-32 (IEEE polynomial, as computed by
//! `crc32fast`) over the compact `serde_json` encoding of a
//! `ChecksumPayload`. Every collection in the payload is ordered, so the
//! encoding is canonical. Another implementation only verifies our
//! checksums if it reproduces this exact payload.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::errors::{StateError, StateResult};
use super::execution::{ExecutionKey, ExecutionStatus};
use super::mutable_state::ExecutionState;
use super::sub_state::{SubStateMap, VersionedEntry};
use crate::versioning::{VersionHistoryItem, VersionedTransition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumFlavor {
    Crc32IeeeJsonV1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    pub flavor: ChecksumFlavor,
    pub value: u32,
}

#[derive(Serialize)]
struct ChecksumPayload<'a> {
    key: &'a ExecutionKey,
    status: ExecutionStatus,
    next_event_id: i64,
    last_write_version: i64,
    transition_history: &'a [VersionedTransition],
    version_history: &'a [VersionHistoryItem],
    activities: BTreeMap<String, Option<VersionedTransition>>,
    timers: BTreeMap<String, Option<VersionedTransition>>,
    child_executions: BTreeMap<String, Option<VersionedTransition>>,
    request_cancels: BTreeMap<String, Option<VersionedTransition>>,
    signal_externals: BTreeMap<String, Option<VersionedTransition>>,
    signal_requested: BTreeMap<String, Option<VersionedTransition>>,
    state_machine_nodes: BTreeMap<String, (Option<VersionedTransition>, i64)>,
}

fn last_updates<K, V>(map: &SubStateMap<K, V>) -> BTreeMap<String, Option<VersionedTransition>>
where
    K: Ord + Clone + ToString,
    V: VersionedEntry + Clone,
{
    map.iter()
        .map(|(k, v)| (k.to_string(), v.last_update().copied()))
        .collect()
}

fn payload_bytes(state: &ExecutionState) -> StateResult<Vec<u8>> {
    let info = &state.execution_info;
    let payload = ChecksumPayload {
        key: &info.key,
        status: info.status,
        next_event_id: info.next_event_id,
        last_write_version: info.last_write_version,
        transition_history: state.transition_history.entries(),
        version_history: state.version_history.items(),
        activities: last_updates(&state.activities),
        timers: last_updates(&state.timers),
        child_executions: last_updates(&state.child_executions),
        request_cancels: last_updates(&state.request_cancels),
        signal_externals: last_updates(&state.signal_externals),
        signal_requested: last_updates(&state.signal_requested),
        state_machine_nodes: state
            .state_machine_nodes
            .iter()
            .map(|(path, node)| {
                (
                    path.clone(),
                    (node.last_update_versioned_transition, node.transition_count),
                )
            })
            .collect(),
    };
    Ok(serde_json::to_vec(&payload)?)
}

/// Compute the checksum of `state`.
pub fn generate(state: &ExecutionState) -> StateResult<Checksum> {
    let bytes = payload_bytes(state)?;
    Ok(Checksum {
        flavor: ChecksumFlavor::Crc32IeeeJsonV1,
        value: crc32fast::hash(&bytes),
    })
}

/// Verify `state` against a stored checksum.
pub fn verify(state: &ExecutionState, stored: &Checksum) -> StateResult<()> {
    let computed = generate(state)?;
    if computed.value != stored.value {
        return Err(StateError::ChecksumMismatch {
            stored: stored.value,
            computed: computed.value,
        });
    }
    Ok(())
}

/// Roll a percentage (0-100).
pub fn roll(probability: u32) -> bool {
    match probability {
        0 => false,
        p if p >= 100 => true,
        p => rand::thread_rng().gen_range(0..100) < p,
    }
}
