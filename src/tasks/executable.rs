//! Retryable task wrapper
//!
//! A `TaskExecutable` drives one unit of work through
//! `Pending -> {Acked | Cancelled | Aborted}`. Only `Pending` is
//! re-enterable: every transition out of it is final, and all fields are
//! read and written under one short-held lock, never across an await.
//!
//! Terminal failures are not written to the DLQ where they are detected.
//! `handle_err` records the cause and returns `TerminalFailure`; the next
//! `execute` performs the DLQ write instead of invoking the executor again.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::FutureExt;

use super::backoff::{should_resubmit, BackoffPolicies};
use super::classifier::{Classification, ErrorClassifier, RetryKind, TerminalCause};
use super::errors::{TaskError, TaskResult};
use super::task::{TaskCategory, TaskDescriptor};
use crate::config::TaskConfig;
use crate::observability::{Event, Logger};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Acked,
    Cancelled,
    Aborted,
}

/// Priority tag passed to the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerPriority {
    High,
    Low,
    Background,
}

impl CallerPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallerPriority::High => "high",
            CallerPriority::Low => "low",
            CallerPriority::Background => "background",
        }
    }
}

/// What the worker pool should do with a failed task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Resubmit,
    Reschedule(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteContext {
    pub attempt: u32,
    pub priority: CallerPriority,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteResponse {
    pub result: TaskResult<()>,
    /// Whether the namespace was active in this cluster
    pub executed_as_active: bool,
    /// Time spent in user-controlled code, excluded from non-user latency
    pub user_latency: Duration,
}

impl ExecuteResponse {
    pub fn active(result: TaskResult<()>) -> Self {
        Self {
            result,
            executed_as_active: true,
            user_latency: Duration::ZERO,
        }
    }

    pub fn standby(result: TaskResult<()>) -> Self {
        Self {
            result,
            executed_as_active: false,
            user_latency: Duration::ZERO,
        }
    }
}

/// Business logic of a task category.
#[async_trait]
pub trait Executor<T: TaskDescriptor>: Send + Sync {
    async fn execute(&self, task: &T, ctx: &ExecuteContext) -> ExecuteResponse;
}

/// Destination for terminally failed tasks.
#[async_trait]
pub trait DlqWriter<T: TaskDescriptor>: Send + Sync {
    async fn write_to_dlq(&self, task: &T, cause: &TaskError) -> TaskResult<()>;
}

/// Object-safe view of an executable, as the worker pool sees it.
#[async_trait]
pub trait Executable: Send + Sync {
    async fn execute(&self) -> TaskResult<()>;

    /// Classify a failure. `Ok` means the task is done; `Err` means retry.
    fn handle_err(&self, err: TaskError) -> TaskResult<()>;

    fn ack(&self);

    /// Decide how to retry; `None` once the task left `Pending`.
    fn nack(&self, err: &TaskError) -> Option<RetryDecision>;

    fn abort(&self);

    fn cancel(&self);

    fn state(&self) -> TaskState;

    fn attempt(&self) -> u32;

    fn describe(&self) -> String;
}

/// Shared collaborators of every executable of one task type
pub struct ExecutableFactory<T: TaskDescriptor> {
    executor: Arc<dyn Executor<T>>,
    dlq_writer: Option<Arc<dyn DlqWriter<T>>>,
    classifier: Arc<ErrorClassifier>,
    policies: Arc<BackoffPolicies>,
    config: Arc<TaskConfig>,
}

impl<T: TaskDescriptor> Clone for ExecutableFactory<T> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            dlq_writer: self.dlq_writer.clone(),
            classifier: self.classifier.clone(),
            policies: self.policies.clone(),
            config: self.config.clone(),
        }
    }
}

impl<T: TaskDescriptor> ExecutableFactory<T> {
    pub fn new(
        executor: Arc<dyn Executor<T>>,
        dlq_writer: Option<Arc<dyn DlqWriter<T>>>,
        config: Arc<TaskConfig>,
    ) -> Result<Self, regex::Error> {
        let classifier = Arc::new(ErrorClassifier::new(&config)?);
        let policies = Arc::new(BackoffPolicies::from_config(&config));
        Ok(Self {
            executor,
            dlq_writer,
            classifier,
            policies,
            config,
        })
    }

    pub fn create(&self, task: T) -> Arc<TaskExecutable<T>> {
        Arc::new(TaskExecutable {
            task,
            factory: self.clone(),
            inner: Mutex::new(ExecutableInner::default()),
        })
    }
}

#[derive(Debug)]
struct ExecutableInner {
    state: TaskState,
    attempt: u32,
    resource_exhausted_count: u32,
    unexpected_error_attempts: u32,
    terminal_failure_cause: Option<TaskError>,
    non_user_latency: Duration,
    last_executed_as_active: Option<bool>,
}

impl Default for ExecutableInner {
    fn default() -> Self {
        Self {
            state: TaskState::Pending,
            attempt: 1,
            resource_exhausted_count: 0,
            unexpected_error_attempts: 0,
            terminal_failure_cause: None,
            non_user_latency: Duration::ZERO,
            last_executed_as_active: None,
        }
    }
}

pub struct TaskExecutable<T: TaskDescriptor> {
    task: T,
    factory: ExecutableFactory<T>,
    inner: Mutex<ExecutableInner>,
}

impl<T: TaskDescriptor> fmt::Debug for TaskExecutable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskExecutable")
            .field("task", &self.task)
            .field("inner", &*self.lock())
            .finish()
    }
}

impl<T: TaskDescriptor> TaskExecutable<T> {
    pub fn task(&self) -> &T {
        &self.task
    }

    pub fn non_user_latency(&self) -> Duration {
        self.lock().non_user_latency
    }

    pub fn unexpected_error_attempts(&self) -> u32 {
        self.lock().unexpected_error_attempts
    }

    pub fn terminal_failure_cause(&self) -> Option<TaskError> {
        self.lock().terminal_failure_cause.clone()
    }

    fn lock(&self) -> MutexGuard<'_, ExecutableInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn caller_priority(&self, inner: &ExecutableInner) -> CallerPriority {
        if self.task.category() == TaskCategory::Replication
            || inner.last_executed_as_active == Some(false)
        {
            CallerPriority::Background
        } else if inner.attempt <= 1 {
            CallerPriority::High
        } else {
            CallerPriority::Low
        }
    }

    fn log_fields(&self, attempt: u32) -> Vec<(&'static str, String)> {
        let key = self.task.key();
        vec![
            ("attempt", attempt.to_string()),
            ("category", self.task.category().as_str().to_string()),
            ("kind", self.task.kind_name().to_string()),
            ("namespace_id", self.task.namespace_id().to_string()),
            ("task_id", key.task_id.to_string()),
        ]
    }

    fn log(&self, severity: crate::observability::Severity, event: Event, attempt: u32, extra: &[(&'static str, String)]) {
        let mut fields = self.log_fields(attempt);
        fields.extend(extra.iter().cloned());
        let borrowed: Vec<(&str, &str)> = fields.iter().map(|(k, v)| (*k, v.as_str())).collect();
        Logger::log(severity, event, &borrowed);
    }

    async fn write_to_dlq(&self, cause: TaskError, attempt: u32) -> TaskResult<()> {
        let Some(writer) = self.factory.dlq_writer.clone() else {
            return Ok(());
        };
        writer
            .write_to_dlq(&self.task, &cause)
            .await
            .map_err(|e| TaskError::DlqWrite(e.to_string()))?;
        self.log(
            crate::observability::Severity::Error,
            Event::TaskDlqWrite,
            attempt,
            &[("cause", cause.to_string())],
        );
        Ok(())
    }

    fn classify_locked(&self, inner: &mut ExecutableInner, err: TaskError) -> TaskResult<()> {
        use crate::observability::Severity;

        let err = err.unwrap_destination_down();
        if err.is_resource_exhausted() {
            inner.resource_exhausted_count += 1;
        } else {
            inner.resource_exhausted_count = 0;
        }

        let classification = self
            .factory
            .classifier
            .classify(&err, inner.unexpected_error_attempts);
        if classification.counts_as_unexpected() {
            inner.unexpected_error_attempts += 1;
        }

        match classification {
            Classification::SafeDrop(_) => Ok(()),
            Classification::Retryable(RetryKind::Unexpected) => {
                let (severity, event) = if inner.attempt >= self.factory.config.critical_log_attempts {
                    (Severity::Error, Event::TaskCriticalRetry)
                } else {
                    (Severity::Warn, Event::TaskUnexpectedError)
                };
                self.log(severity, event, inner.attempt, &[("error", err.to_string())]);
                Err(err)
            }
            Classification::Retryable(_) => Err(err),
            Classification::Terminal(cause) => {
                if cause == TerminalCause::PatternMatched {
                    self.log(
                        Severity::Warn,
                        Event::TaskPatternMatched,
                        inner.attempt,
                        &[("error", err.to_string())],
                    );
                }
                if !self.factory.config.dlq_enabled || self.factory.dlq_writer.is_none() {
                    self.log(
                        Severity::Warn,
                        Event::TaskDropped,
                        inner.attempt,
                        &[("cause", cause.as_str().to_string()), ("error", err.to_string())],
                    );
                    return Ok(());
                }
                self.log(
                    Severity::Error,
                    Event::TaskTerminal,
                    inner.attempt,
                    &[("cause", cause.as_str().to_string()), ("error", err.to_string())],
                );
                inner.terminal_failure_cause = Some(err.clone());
                Err(TaskError::TerminalFailure(Box::new(err)))
            }
        }
    }

    fn transition(&self, to: TaskState) {
        let mut inner = self.lock();
        if inner.state == TaskState::Pending {
            inner.state = to;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[async_trait]
impl<T: TaskDescriptor> Executable for TaskExecutable<T> {
    async fn execute(&self) -> TaskResult<()> {
        let (ctx, terminal) = {
            let inner = self.lock();
            if inner.state != TaskState::Pending {
                return Ok(());
            }
            let ctx = ExecuteContext {
                attempt: inner.attempt,
                priority: self.caller_priority(&inner),
            };
            (ctx, inner.terminal_failure_cause.clone())
        };

        if let Some(cause) = terminal {
            return self.write_to_dlq(cause, ctx.attempt).await;
        }

        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.factory.executor.execute(&self.task, &ctx))
            .catch_unwind()
            .await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(response) => {
                let mut inner = self.lock();
                inner.non_user_latency += elapsed.saturating_sub(response.user_latency);
                inner.last_executed_as_active = Some(response.executed_as_active);
                response.result
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                self.log(
                    crate::observability::Severity::Error,
                    Event::TaskPanic,
                    ctx.attempt,
                    &[("panic", message.clone())],
                );
                Err(TaskError::Internal(format!("executor panicked: {}", message)))
            }
        }
    }

    fn handle_err(&self, err: TaskError) -> TaskResult<()> {
        let mut inner = self.lock();
        let result = self.classify_locked(&mut inner, err);
        if result.is_err() {
            inner.attempt += 1;
        }
        result
    }

    fn ack(&self) {
        self.transition(TaskState::Acked);
    }

    fn nack(&self, err: &TaskError) -> Option<RetryDecision> {
        let inner = self.lock();
        if inner.state != TaskState::Pending {
            return None;
        }
        if should_resubmit(
            inner.attempt,
            inner.resource_exhausted_count,
            err,
            &self.factory.config,
        ) {
            return Some(RetryDecision::Resubmit);
        }
        Some(RetryDecision::Reschedule(self.factory.policies.delay_for(
            err,
            inner.attempt,
            inner.resource_exhausted_count,
        )))
    }

    fn abort(&self) {
        self.transition(TaskState::Aborted);
    }

    fn cancel(&self) {
        self.transition(TaskState::Cancelled);
    }

    fn state(&self) -> TaskState {
        self.lock().state
    }

    fn attempt(&self) -> u32 {
        self.lock().attempt
    }

    fn describe(&self) -> String {
        format!(
            "{} {} {}",
            self.task.category().as_str(),
            self.task.kind_name(),
            self.task.key()
        )
    }
}

/// Run one execution attempt to a decision: `None` when the task is
/// finished (acked or no longer pending), otherwise how to retry it.
pub async fn run_executable(executable: &dyn Executable) -> Option<RetryDecision> {
    if executable.state() != TaskState::Pending {
        return None;
    }
    let err = match executable.execute().await {
        Ok(()) => {
            executable.ack();
            return None;
        }
        Err(err) => err,
    };
    match executable.handle_err(err) {
        Ok(()) => {
            executable.ack();
            None
        }
        Err(err) => executable.nack(&err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ExecutionKey;
    use crate::tasks::errors::ResourceExhaustedCause;
    use crate::tasks::task::{Task, TaskKind};
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedExecutor {
        results: Mutex<VecDeque<TaskResult<()>>>,
        calls: AtomicUsize,
    }

    impl ScriptedExecutor {
        fn new(results: Vec<TaskResult<()>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Executor<Task> for ScriptedExecutor {
        async fn execute(&self, _task: &Task, _ctx: &ExecuteContext) -> ExecuteResponse {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = self.results.lock().unwrap().pop_front().unwrap_or(Ok(()));
            ExecuteResponse::active(result)
        }
    }

    struct PanickingExecutor;

    #[async_trait]
    impl Executor<Task> for PanickingExecutor {
        async fn execute(&self, _task: &Task, _ctx: &ExecuteContext) -> ExecuteResponse {
            panic!("executor bug");
        }
    }

    #[derive(Default)]
    struct CountingDlq {
        writes: AtomicUsize,
    }

    #[async_trait]
    impl DlqWriter<Task> for CountingDlq {
        async fn write_to_dlq(&self, _task: &Task, _cause: &TaskError) -> TaskResult<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn task() -> Task {
        Task::new(
            ExecutionKey::new("ns", "wf", "run"),
            1,
            Utc::now(),
            TaskKind::UpsertVisibility,
        )
    }

    fn factory(
        executor: Arc<dyn Executor<Task>>,
        dlq: Option<Arc<dyn DlqWriter<Task>>>,
        config: TaskConfig,
    ) -> ExecutableFactory<Task> {
        ExecutableFactory::new(executor, dlq, Arc::new(config)).unwrap()
    }

    #[tokio::test]
    async fn test_success_acks() {
        let executor = ScriptedExecutor::new(vec![Ok(())]);
        let exec = factory(executor, None, TaskConfig::default()).create(task());
        assert_eq!(run_executable(exec.as_ref()).await, None);
        assert_eq!(exec.state(), TaskState::Acked);
    }

    #[tokio::test]
    async fn test_safe_drop_acks_without_retry() {
        let executor = ScriptedExecutor::new(vec![Err(TaskError::NotFound("gone".into()))]);
        let exec = factory(executor, None, TaskConfig::default()).create(task());
        assert_eq!(run_executable(exec.as_ref()).await, None);
        assert_eq!(exec.state(), TaskState::Acked);
        assert_eq!(exec.attempt(), 1);
    }

    #[tokio::test]
    async fn test_retryable_error_counts_attempt_and_resubmits() {
        let executor = ScriptedExecutor::new(vec![Err(TaskError::Unexpected("flaky".into()))]);
        let exec = factory(executor, None, TaskConfig::default()).create(task());
        assert_eq!(run_executable(exec.as_ref()).await, Some(RetryDecision::Resubmit));
        assert_eq!(exec.state(), TaskState::Pending);
        assert_eq!(exec.attempt(), 2);
        assert_eq!(exec.unexpected_error_attempts(), 1);
    }

    #[tokio::test]
    async fn test_terminal_error_writes_dlq_on_next_execute() {
        let executor = ScriptedExecutor::new(vec![Err(TaskError::DataLoss("corrupt".into()))]);
        let dlq = Arc::new(CountingDlq::default());
        let exec = factory(executor.clone(), Some(dlq.clone()), TaskConfig::default()).create(task());

        let err = exec.execute().await.unwrap_err();
        let wrapped = exec.handle_err(err).unwrap_err();
        assert!(matches!(wrapped, TaskError::TerminalFailure(_)));
        assert_eq!(dlq.writes.load(Ordering::SeqCst), 0);

        exec.execute().await.unwrap();
        assert_eq!(dlq.writes.load(Ordering::SeqCst), 1);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_terminal_error_dropped_when_dlq_disabled() {
        let executor = ScriptedExecutor::new(vec![Err(TaskError::NonRetryable("bad".into()))]);
        let dlq = Arc::new(CountingDlq::default());
        let config = TaskConfig {
            dlq_enabled: false,
            ..TaskConfig::default()
        };
        let exec = factory(executor, Some(dlq.clone()), config).create(task());
        assert_eq!(run_executable(exec.as_ref()).await, None);
        assert_eq!(exec.state(), TaskState::Acked);
        assert_eq!(dlq.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_error() {
        let exec = factory(Arc::new(PanickingExecutor), None, TaskConfig::default()).create(task());
        let err = exec.execute().await.unwrap_err();
        assert!(matches!(err, TaskError::Internal(ref m) if m.contains("executor bug")));
    }

    #[tokio::test]
    async fn test_resource_exhausted_counter_limits_resubmit() {
        let rps = || Err(TaskError::resource_exhausted(ResourceExhaustedCause::RpsLimit, "slow down"));
        let executor = ScriptedExecutor::new(vec![rps(), rps()]);
        let exec = factory(executor, None, TaskConfig::default()).create(task());

        assert_eq!(run_executable(exec.as_ref()).await, Some(RetryDecision::Resubmit));
        assert!(matches!(
            run_executable(exec.as_ref()).await,
            Some(RetryDecision::Reschedule(_))
        ));
    }

    #[tokio::test]
    async fn test_abort_is_final() {
        let executor = ScriptedExecutor::new(vec![]);
        let exec = factory(executor.clone(), None, TaskConfig::default()).create(task());
        exec.abort();
        exec.ack();
        assert_eq!(exec.state(), TaskState::Aborted);
        assert_eq!(run_executable(exec.as_ref()).await, None);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(exec.nack(&TaskError::Unexpected("x".into())), None);
    }
}
