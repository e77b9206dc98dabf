//! Bounded worker pool and time-ordered rescheduler
//!
//! Workers never retry in place: a failed task is either put straight back
//! on the queue (resubmit) or parked in the rescheduler until its backoff
//! expires, so a stuck task cannot hold a worker slot.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use super::errors::SchedulerError;
use super::executable::{run_executable, Executable, RetryDecision, TaskState};
use crate::config::WorkerPoolConfig;

/// Delay before retrying a due task that found the queue full
const QUEUE_FULL_RETRY: Duration = Duration::from_millis(100);

/// Accepts executables for processing.
pub trait Scheduler: Send + Sync {
    fn submit(&self, executable: Arc<dyn Executable>) -> Result<(), SchedulerError>;
}

struct Parked {
    due: Instant,
    seq: u64,
    executable: Arc<dyn Executable>,
}

impl PartialEq for Parked {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Parked {}

impl PartialOrd for Parked {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Parked {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

/// Holds failed tasks until their backoff expires.
#[derive(Default)]
pub struct Rescheduler {
    heap: Mutex<BinaryHeap<Reverse<Parked>>>,
    seq: AtomicU64,
    wake: Notify,
}

impl Rescheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, executable: Arc<dyn Executable>, delay: Duration) {
        let parked = Parked {
            due: Instant::now() + delay,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            executable,
        };
        self.heap
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Reverse(parked));
        self.wake.notify_one();
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_due(&self) -> Option<Instant> {
        self.heap
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .peek()
            .map(|Reverse(p)| p.due)
    }

    /// Remove every task due at `now`.
    fn take_due(&self, now: Instant) -> Vec<Arc<dyn Executable>> {
        let mut heap = self.heap.lock().unwrap_or_else(|e| e.into_inner());
        let mut due = Vec::new();
        while heap.peek().map(|Reverse(p)| p.due <= now).unwrap_or(false) {
            if let Some(Reverse(parked)) = heap.pop() {
                due.push(parked.executable);
            }
        }
        due
    }

    async fn run(
        self: Arc<Self>,
        sender: mpsc::Sender<Arc<dyn Executable>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let sleep_until = self
                .next_due()
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.wake.notified() => continue,
                _ = time::sleep_until(sleep_until) => {}
            }

            for executable in self.take_due(Instant::now()) {
                if executable.state() != TaskState::Pending {
                    continue;
                }
                match sender.try_send(executable) {
                    Ok(()) => {}
                    Err(TrySendError::Full(executable)) => self.add(executable, QUEUE_FULL_RETRY),
                    Err(TrySendError::Closed(_)) => return,
                }
            }
        }
    }
}

/// Fixed number of workers draining a bounded queue
pub struct WorkerPool {
    sender: mpsc::Sender<Arc<dyn Executable>>,
    rescheduler: Arc<Rescheduler>,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn the workers and the rescheduler loop on the current runtime.
    pub fn start(config: &WorkerPoolConfig) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let receiver = Arc::new(AsyncMutex::new(receiver));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let rescheduler = Arc::new(Rescheduler::new());

        let mut handles = Vec::with_capacity(config.worker_count + 1);
        for _ in 0..config.worker_count {
            handles.push(tokio::spawn(worker_loop(
                receiver.clone(),
                sender.clone(),
                rescheduler.clone(),
                shutdown_rx.clone(),
            )));
        }
        handles.push(tokio::spawn(
            rescheduler.clone().run(sender.clone(), shutdown_rx),
        ));

        Arc::new(Self {
            sender,
            rescheduler,
            shutdown,
            handles: Mutex::new(handles),
        })
    }

    pub fn rescheduler(&self) -> &Arc<Rescheduler> {
        &self.rescheduler
    }

    /// Stop workers; tasks still queued or parked are abandoned.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Scheduler for WorkerPool {
    fn submit(&self, executable: Arc<dyn Executable>) -> Result<(), SchedulerError> {
        self.sender.try_send(executable).map_err(|e| match e {
            TrySendError::Full(_) => SchedulerError::QueueFull,
            TrySendError::Closed(_) => SchedulerError::Stopped,
        })
    }
}

async fn worker_loop(
    receiver: Arc<AsyncMutex<mpsc::Receiver<Arc<dyn Executable>>>>,
    sender: mpsc::Sender<Arc<dyn Executable>>,
    rescheduler: Arc<Rescheduler>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let next = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                _ = shutdown.changed() => None,
                item = receiver.recv() => item,
            }
        };
        let Some(executable) = next else {
            break;
        };

        match run_executable(executable.as_ref()).await {
            None => {}
            Some(RetryDecision::Resubmit) => match sender.try_send(executable) {
                Ok(()) => {}
                Err(TrySendError::Full(executable)) => rescheduler.add(executable, QUEUE_FULL_RETRY),
                Err(TrySendError::Closed(_)) => break,
            },
            Some(RetryDecision::Reschedule(delay)) => rescheduler.add(executable, delay),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskConfig;
    use crate::state::ExecutionKey;
    use crate::tasks::errors::{TaskError, TaskResult};
    use crate::tasks::executable::{ExecutableFactory, ExecuteContext, ExecuteResponse, Executor};
    use crate::tasks::task::{Task, TaskKind};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;

    struct FailTimes {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Executor<Task> for FailTimes {
        async fn execute(&self, _task: &Task, _ctx: &ExecuteContext) -> ExecuteResponse {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let result: TaskResult<()> = if call < self.failures {
                Err(TaskError::Unexpected("not yet".into()))
            } else {
                Ok(())
            };
            ExecuteResponse::active(result)
        }
    }

    fn task() -> Task {
        Task::new(ExecutionKey::new("ns", "wf", "run"), 1, Utc::now(), TaskKind::SyncHsm)
    }

    async fn wait_for(exec: &Arc<dyn Executable>, state: TaskState) {
        for _ in 0..200 {
            if exec.state() == state {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("executable never reached {:?}", state);
    }

    #[tokio::test]
    async fn test_pool_retries_until_success() {
        let executor = Arc::new(FailTimes {
            failures: 2,
            calls: AtomicUsize::new(0),
        });
        let factory =
            ExecutableFactory::<Task>::new(executor.clone(), None, Arc::new(TaskConfig::default())).unwrap();
        let pool = WorkerPool::start(&WorkerPoolConfig {
            worker_count: 2,
            queue_capacity: 8,
        });

        let exec: Arc<dyn Executable> = factory.create(task());
        pool.submit(exec.clone()).unwrap();
        wait_for(&exec, TaskState::Acked).await;
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_rescheduler_delivers_due_tasks() {
        let executor = Arc::new(FailTimes {
            failures: 0,
            calls: AtomicUsize::new(0),
        });
        let factory =
            ExecutableFactory::<Task>::new(executor, None, Arc::new(TaskConfig::default())).unwrap();
        let pool = WorkerPool::start(&WorkerPoolConfig {
            worker_count: 1,
            queue_capacity: 4,
        });

        let exec: Arc<dyn Executable> = factory.create(task());
        pool.rescheduler().add(exec.clone(), Duration::from_millis(30));
        assert_eq!(pool.rescheduler().len(), 1);
        wait_for(&exec, TaskState::Acked).await;
        assert!(pool.rescheduler().is_empty());
        pool.shutdown().await;
    }
}
