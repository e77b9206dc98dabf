//! Inbound replication task polling

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use super::clients::{RemoteClientProvider, ReplicationMessagesRequest};
use super::errors::ReplicationResult;
use super::task::ReplicationTask;
use crate::tasks::{Executable, ExecutableFactory, Scheduler, SchedulerError};

/// Pulls replication tasks from one source cluster and submits them to
/// the scheduler.
pub struct ReplicationTaskFetcher {
    source_cluster: String,
    current_cluster: String,
    clients: Arc<dyn RemoteClientProvider>,
    factory: ExecutableFactory<ReplicationTask>,
    scheduler: Arc<dyn Scheduler>,
    batch_size: usize,
    last_retrieved: AtomicI64,
}

impl ReplicationTaskFetcher {
    pub fn new(
        source_cluster: impl Into<String>,
        current_cluster: impl Into<String>,
        clients: Arc<dyn RemoteClientProvider>,
        factory: ExecutableFactory<ReplicationTask>,
        scheduler: Arc<dyn Scheduler>,
        batch_size: usize,
    ) -> Self {
        Self {
            source_cluster: source_cluster.into(),
            current_cluster: current_cluster.into(),
            clients,
            factory,
            scheduler,
            batch_size,
            last_retrieved: AtomicI64::new(0),
        }
    }

    pub fn last_retrieved_message_id(&self) -> i64 {
        self.last_retrieved.load(Ordering::SeqCst)
    }

    /// Fetch one batch and submit it. A full queue stops the batch; tasks
    /// not submitted are fetched again on the next poll. Returns how many
    /// tasks were submitted.
    pub async fn poll_once(&self) -> ReplicationResult<usize> {
        let client = self.clients.client_for(&self.source_cluster)?;
        let messages = client
            .get_replication_messages(ReplicationMessagesRequest {
                polling_cluster: self.current_cluster.clone(),
                last_retrieved_message_id: self.last_retrieved_message_id(),
                max_count: self.batch_size,
            })
            .await?;

        let mut submitted = 0;
        for task in messages.tasks {
            let task_id = task.source_task_id();
            let executable: Arc<dyn Executable> = self.factory.create(task);
            match self.scheduler.submit(executable) {
                Ok(()) => {
                    self.last_retrieved.fetch_max(task_id, Ordering::SeqCst);
                    submitted += 1;
                }
                Err(SchedulerError::QueueFull) | Err(SchedulerError::Stopped) => break,
            }
        }
        Ok(submitted)
    }
}
