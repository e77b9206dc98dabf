//! Task engine
//!
//! Wraps units of background work in retryable executables, classifies
//! their failures, and runs them on a bounded worker pool with backoff.

mod backoff;
mod circuit_breaker;
mod classifier;
mod errors;
mod executable;
mod scheduler;
mod task;

pub use backoff::{should_resubmit, BackoffPolicies, RetryPolicy};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerExecutor, CircuitState};
pub use classifier::{Classification, DropReason, ErrorClassifier, RetryKind, TerminalCause};
pub use errors::{ResourceExhaustedCause, SchedulerError, TaskError, TaskResult};
pub use executable::{
    run_executable, CallerPriority, DlqWriter, Executable, ExecutableFactory, ExecuteContext,
    ExecuteResponse, Executor, RetryDecision, TaskExecutable, TaskState,
};
pub use scheduler::{Rescheduler, Scheduler, WorkerPool};
pub use task::{collapse_visibility_tasks, Task, TaskCategory, TaskDescriptor, TaskKey, TaskKind};
