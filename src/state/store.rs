//! Execution persistence seam
//!
//! Writes are conditional on `db_record_version`: a write carrying version
//! `n` only succeeds if the stored record is at `n - 1`. Task ids are
//! assigned here, at persist time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::errors::{StateError, StateResult};
use super::execution::ExecutionKey;
use super::mutable_state::{ExecutionState, Mutation};
use crate::tasks::Task;

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn get_execution(&self, key: &ExecutionKey) -> StateResult<ExecutionState>;

    /// Persist a new execution; fails if one already exists.
    async fn create_execution(&self, state: &ExecutionState, tasks: Vec<Task>) -> StateResult<Vec<Task>>;

    /// Persist an incremental change.
    async fn update_execution(&self, mutation: &Mutation) -> StateResult<Vec<Task>>;

    /// Overwrite an execution with a full state.
    async fn set_execution(&self, state: &ExecutionState, tasks: Vec<Task>) -> StateResult<Vec<Task>>;
}

/// Store kept in process memory; executions plus an outbox of emitted tasks
#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    executions: Mutex<HashMap<ExecutionKey, ExecutionState>>,
    outbox: Mutex<Vec<Task>>,
    last_task_id: AtomicI64,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every task persisted so far, in id order.
    pub fn tasks(&self) -> Vec<Task> {
        self.outbox.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn execution_count(&self) -> usize {
        self.executions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn assign_task_ids(&self, tasks: Vec<Task>) -> Vec<Task> {
        let tasks: Vec<Task> = tasks
            .into_iter()
            .map(|mut task| {
                task.key.task_id = self.last_task_id.fetch_add(1, Ordering::SeqCst) + 1;
                task
            })
            .collect();
        self.outbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(tasks.iter().cloned());
        tasks
    }

    fn check_version(stored: &ExecutionState, incoming: i64) -> StateResult<()> {
        if stored.db_record_version != incoming - 1 {
            return Err(StateError::ConditionFailed {
                expected: incoming - 1,
                actual: stored.db_record_version,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn get_execution(&self, key: &ExecutionKey) -> StateResult<ExecutionState> {
        let executions = self.executions.lock().unwrap_or_else(|e| e.into_inner());
        executions
            .get(key)
            .cloned()
            .ok_or_else(|| StateError::NotFound(format!("execution {}", key)))
    }

    async fn create_execution(&self, state: &ExecutionState, tasks: Vec<Task>) -> StateResult<Vec<Task>> {
        {
            let mut executions = self.executions.lock().unwrap_or_else(|e| e.into_inner());
            if executions.contains_key(state.key()) {
                return Err(StateError::AlreadyExists(format!("execution {}", state.key())));
            }
            executions.insert(state.key().clone(), state.clone());
        }
        Ok(self.assign_task_ids(tasks))
    }

    async fn update_execution(&self, mutation: &Mutation) -> StateResult<Vec<Task>> {
        {
            let mut executions = self.executions.lock().unwrap_or_else(|e| e.into_inner());
            let stored = executions
                .get_mut(&mutation.key)
                .ok_or_else(|| StateError::NotFound(format!("execution {}", mutation.key)))?;
            Self::check_version(stored, mutation.db_record_version)?;
            stored.apply_mutation(mutation);
            stored.db_record_version = mutation.db_record_version;
        }
        Ok(self.assign_task_ids(mutation.tasks.clone()))
    }

    async fn set_execution(&self, state: &ExecutionState, tasks: Vec<Task>) -> StateResult<Vec<Task>> {
        {
            let mut executions = self.executions.lock().unwrap_or_else(|e| e.into_inner());
            let stored = executions
                .get_mut(state.key())
                .ok_or_else(|| StateError::NotFound(format!("execution {}", state.key())))?;
            Self::check_version(stored, state.db_record_version)?;
            *stored = state.clone();
        }
        Ok(self.assign_task_ids(tasks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransactionConfig;
    use crate::namespace::NamespaceEntry;
    use crate::state::{ActivityInfo, MutableState, TransactionPolicy};
    use chrono::Utc;
    use std::sync::Arc;

    fn mutable_state() -> MutableState {
        let namespace = Arc::new(NamespaceEntry::global("ns", "ns", "east", vec!["east".into()], 1));
        MutableState::new(
            ExecutionKey::new("ns", "wf", "run"),
            namespace,
            Arc::new(TransactionConfig::default()),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_create_then_update() {
        let store = InMemoryExecutionStore::new();
        let mut ms = mutable_state();
        let ns = ms.namespace().clone();

        ms.start_transaction(ns.clone()).unwrap();
        ms.activities_mut().unwrap().upsert(1, ActivityInfo::new(1, "a", "t"));
        let snapshot = ms.close_transaction_as_snapshot(Utc::now(), TransactionPolicy::Active).unwrap();
        store.create_execution(&snapshot.state, snapshot.tasks).await.unwrap();

        ms.start_transaction(ns).unwrap();
        ms.activities_mut().unwrap().remove(&1);
        let mutation = ms.close_transaction_as_mutation(Utc::now(), TransactionPolicy::Active).unwrap();
        let tasks = store.update_execution(&mutation).await.unwrap();

        let stored = store.get_execution(ms.key()).await.unwrap();
        assert!(stored.activities.is_empty());
        assert_eq!(stored.db_record_version, 2);
        assert!(tasks.iter().all(|t| t.key.task_id > 0));
    }

    #[tokio::test]
    async fn test_stale_write_fails_condition() {
        let store = InMemoryExecutionStore::new();
        let mut ms = mutable_state();
        let ns = ms.namespace().clone();
        ms.start_transaction(ns.clone()).unwrap();
        let snapshot = ms.close_transaction_as_snapshot(Utc::now(), TransactionPolicy::Active).unwrap();
        store.create_execution(&snapshot.state, vec![]).await.unwrap();

        let err = store.set_execution(&snapshot.state, vec![]).await.unwrap_err();
        assert_eq!(err, StateError::ConditionFailed { expected: 0, actual: 1 });
        assert!(matches!(
            store.create_execution(&snapshot.state, vec![]).await.unwrap_err(),
            StateError::AlreadyExists(_)
        ));
    }
}
