//! Execution cache with per-execution exclusive locks
//!
//! All mutation of one execution goes through a `LockedExecution`. The lock
//! is released through `release`, which decides whether the cached copy
//! survives: benign outcomes keep it, cache-invalidating errors evict it so
//! the next lock reloads from the store. The number of slots is capped;
//! idle slots are dropped when a new execution is locked over the cap.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::errors::{StateError, StateResult};
use super::execution::ExecutionKey;
use super::mutable_state::{ExecutionState, MutableState, Mutation, Snapshot};
use super::store::ExecutionStore;
use crate::config::TransactionConfig;
use crate::namespace::NamespaceRegistry;
use crate::observability::{Event, Logger};
use crate::tasks::Task;

type Slot = Arc<AsyncMutex<Option<MutableState>>>;

/// Error types that may wrap an execution state failure
pub trait CacheOutcome {
    fn state_error(&self) -> Option<&StateError>;
}

impl CacheOutcome for StateError {
    fn state_error(&self) -> Option<&StateError> {
        Some(self)
    }
}

/// Exclusive access to one execution
pub struct LockedExecution {
    key: ExecutionKey,
    guard: OwnedMutexGuard<Option<MutableState>>,
    store: Arc<dyn ExecutionStore>,
    /// A close went through but its persist failed
    unpersisted: bool,
}

impl LockedExecution {
    pub fn key(&self) -> &ExecutionKey {
        &self.key
    }

    /// Whether the execution exists (in the store or freshly installed).
    pub fn exists(&self) -> bool {
        self.guard.is_some()
    }

    pub fn mutable_state(&mut self) -> StateResult<&mut MutableState> {
        let key = &self.key;
        self.guard
            .as_mut()
            .ok_or_else(|| StateError::NotFound(format!("execution {}", key)))
    }

    /// Install state for an execution that does not exist yet.
    pub fn install(&mut self, mutable_state: MutableState) {
        *self.guard = Some(mutable_state);
    }

    pub async fn persist_mutation(&mut self, mutation: &Mutation) -> StateResult<Vec<Task>> {
        let result = self.store.update_execution(mutation).await;
        self.unpersisted |= result.is_err();
        result
    }

    /// Persist a full state, creating the record on its first write.
    pub async fn persist_snapshot(&mut self, snapshot: &Snapshot) -> StateResult<Vec<Task>> {
        let result = self.persist_state(&snapshot.state, snapshot.tasks.clone()).await;
        self.unpersisted |= result.is_err();
        result
    }

    async fn persist_state(&mut self, state: &ExecutionState, tasks: Vec<Task>) -> StateResult<Vec<Task>> {
        if state.db_record_version <= 1 {
            self.store.create_execution(state, tasks).await
        } else {
            self.store.set_execution(state, tasks).await
        }
    }

    /// Close the open transaction as a mutation and persist it.
    pub async fn commit_mutation(
        &mut self,
        now: DateTime<Utc>,
        policy: super::TransactionPolicy,
    ) -> StateResult<Vec<Task>> {
        let mutation = self.mutable_state()?.close_transaction_as_mutation(now, policy)?;
        self.persist_mutation(&mutation).await
    }

    /// Close the open transaction as a snapshot and persist it.
    pub async fn commit_snapshot(
        &mut self,
        now: DateTime<Utc>,
        policy: super::TransactionPolicy,
    ) -> StateResult<Vec<Task>> {
        let snapshot = self.mutable_state()?.close_transaction_as_snapshot(now, policy)?;
        self.persist_snapshot(&snapshot).await
    }

    fn evict(&mut self) {
        if self.guard.take().is_some() {
            Logger::info(Event::CacheEvicted, &[("execution", &self.key.to_string())]);
        }
    }

    /// Release the lock. The cached copy is dropped after a
    /// cache-invalidating error, a transaction left open or aborted, or a
    /// persist that failed.
    pub fn release(mut self, error: Option<&StateError>) {
        let invalidating = error.map(StateError::is_cache_invalidating).unwrap_or(false);
        let diverged = self
            .guard
            .as_ref()
            .map(|ms| ms.is_in_transaction() || ms.needs_reload())
            .unwrap_or(false);
        if invalidating || diverged || self.unpersisted {
            self.evict();
        }
    }
}

pub struct ExecutionCache {
    store: Arc<dyn ExecutionStore>,
    namespaces: Arc<dyn NamespaceRegistry>,
    config: Arc<TransactionConfig>,
    slots: Mutex<HashMap<ExecutionKey, Slot>>,
}

impl ExecutionCache {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        namespaces: Arc<dyn NamespaceRegistry>,
        config: Arc<TransactionConfig>,
    ) -> Self {
        Self {
            store,
            namespaces,
            config,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn namespaces(&self) -> &Arc<dyn NamespaceRegistry> {
        &self.namespaces
    }

    pub fn config(&self) -> &Arc<TransactionConfig> {
        &self.config
    }

    /// Number of executions currently holding a cache slot.
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lock an execution, loading it on first use. A missing execution
    /// yields a lock with no state.
    pub async fn lock(&self, key: &ExecutionKey) -> StateResult<LockedExecution> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            let slot = slots.entry(key.clone()).or_default().clone();
            if slots.len() > self.config.cache_max_entries {
                Self::prune_idle(&mut slots, self.config.cache_max_entries);
            }
            slot
        };
        let mut guard = slot.lock_owned().await;
        if guard.is_none() {
            match self.store.get_execution(key).await {
                Ok(state) => {
                    let namespace = self.namespaces.get_namespace_by_id(&key.namespace_id)?;
                    *guard = Some(MutableState::load(state, namespace, self.config.clone())?);
                }
                Err(StateError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(LockedExecution {
            key: key.clone(),
            guard,
            store: self.store.clone(),
            unpersisted: false,
        })
    }

    /// Drop slots only the map references until at most `cap` remain. A
    /// held lock or a waiter keeps its own clone of the slot, and clones are
    /// only taken under the map lock, so a count of one means idle.
    fn prune_idle(slots: &mut HashMap<ExecutionKey, Slot>, cap: usize) {
        let excess = slots.len().saturating_sub(cap);
        let idle: Vec<ExecutionKey> = slots
            .iter()
            .filter(|(_, slot)| Arc::strong_count(slot) == 1)
            .map(|(key, _)| key.clone())
            .take(excess)
            .collect();
        for key in idle {
            slots.remove(&key);
        }
    }

    /// Run `op` under the execution lock. A stale-state failure evicts the
    /// cached copy, reloads and retries exactly once.
    pub async fn with_reload_once<T, E, F>(&self, key: &ExecutionKey, mut op: F) -> Result<T, E>
    where
        E: CacheOutcome + From<StateError>,
        F: for<'a> FnMut(&'a mut LockedExecution) -> BoxFuture<'a, Result<T, E>>,
    {
        let mut locked = self.lock(key).await?;
        let first = op(&mut locked).await;
        match first {
            Err(err) if is_stale(&err) => {
                locked.release(err.state_error());
                let mut locked = self.lock(key).await?;
                let second = op(&mut locked).await;
                if let Err(err) = &second {
                    if let Some(stale) = err.state_error().filter(|e| e.is_stale_state()) {
                        Logger::error(
                            Event::ReloadExhausted,
                            &[("error", &stale.to_string()), ("execution", &key.to_string())],
                        );
                    }
                }
                locked.release(second.as_ref().err().and_then(CacheOutcome::state_error));
                second
            }
            other => {
                locked.release(other.as_ref().err().and_then(CacheOutcome::state_error));
                other
            }
        }
    }
}

fn is_stale<E: CacheOutcome>(err: &E) -> bool {
    err.state_error().map(StateError::is_stale_state).unwrap_or(false)
}
