//! Circuit breaking around a remote destination
//!
//! `CircuitBreakerExecutor` decorates any executor. Executors report an
//! unreachable destination by returning `DestinationDown`; the decorator
//! records the failure and hands the inner error on. While the circuit is
//! open, calls fail fast with a retryable resource-exhausted error so the
//! task backs off instead of being dead-lettered. A panicking inner
//! executor counts as a failure before the panic continues to the caller.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::FutureExt;

use super::errors::{ResourceExhaustedCause, TaskError};
use super::executable::{ExecuteContext, ExecuteResponse, Executor};
use super::task::TaskDescriptor;
use crate::config::CircuitBreakerConfig;
use crate::observability::{Event, Logger};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    open_timeout: Duration,
    half_open_max_requests: u32,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            failure_threshold: config.failure_threshold,
            open_timeout: config.open_timeout(),
            half_open_max_requests: config.half_open_max_requests,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_in_flight: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Whether a call may go through now.
    pub fn allow(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.open_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_in_flight = 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.half_open_max_requests {
                    inner.half_open_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        if inner.state != CircuitState::Closed {
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            inner.half_open_in_flight = 0;
            Logger::info(Event::CircuitClosed, &[("breaker", &self.name)]);
        }
    }

    pub fn on_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        let trip = match inner.state {
            CircuitState::Closed => inner.consecutive_failures >= self.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if trip {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.half_open_in_flight = 0;
            Logger::warn(
                Event::CircuitOpened,
                &[
                    ("breaker", &self.name),
                    ("failures", &inner.consecutive_failures.to_string()),
                ],
            );
        }
    }
}

pub struct CircuitBreakerExecutor<T: TaskDescriptor> {
    inner: Arc<dyn Executor<T>>,
    breaker: Arc<CircuitBreaker>,
}

impl<T: TaskDescriptor> CircuitBreakerExecutor<T> {
    pub fn new(inner: Arc<dyn Executor<T>>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }
}

#[async_trait]
impl<T: TaskDescriptor> Executor<T> for CircuitBreakerExecutor<T> {
    async fn execute(&self, task: &T, ctx: &ExecuteContext) -> ExecuteResponse {
        if !self.breaker.allow() {
            return ExecuteResponse::active(Err(TaskError::resource_exhausted(
                ResourceExhaustedCause::CircuitBreakerOpen,
                format!("circuit breaker {} is open", self.breaker.name),
            )));
        }

        let mut response = match AssertUnwindSafe(self.inner.execute(task, ctx))
            .catch_unwind()
            .await
        {
            Ok(response) => response,
            Err(payload) => {
                self.breaker.on_failure();
                panic::resume_unwind(payload);
            }
        };
        response.result = match response.result {
            Err(TaskError::DestinationDown(inner)) => {
                self.breaker.on_failure();
                Err(inner.unwrap_destination_down())
            }
            other => {
                self.breaker.on_success();
                other
            }
        };
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ExecutionKey;
    use crate::tasks::task::{Task, TaskKind};
    use chrono::Utc;

    fn config(open_timeout_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 2,
            open_timeout_ms,
            half_open_max_requests: 1,
        }
    }

    struct DownExecutor;

    #[async_trait]
    impl Executor<Task> for DownExecutor {
        async fn execute(&self, _task: &Task, _ctx: &ExecuteContext) -> ExecuteResponse {
            ExecuteResponse::active(Err(TaskError::destination_down(TaskError::Unexpected(
                "connection refused".into(),
            ))))
        }
    }

    struct PanickingExecutor;

    #[async_trait]
    impl Executor<Task> for PanickingExecutor {
        async fn execute(&self, _task: &Task, _ctx: &ExecuteContext) -> ExecuteResponse {
            panic!("executor bug")
        }
    }

    fn ctx() -> ExecuteContext {
        ExecuteContext {
            attempt: 1,
            priority: super::super::executable::CallerPriority::High,
        }
    }

    #[test]
    fn test_opens_after_threshold_and_half_opens_after_timeout() {
        let breaker = CircuitBreaker::new("remote", &config(0));
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        assert!(breaker.allow());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.allow());
        breaker.on_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("remote", &config(0));
        breaker.on_failure();
        breaker.on_failure();
        assert!(breaker.allow());
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_executor_unwraps_and_fails_fast() {
        let breaker = Arc::new(CircuitBreaker::new("remote", &config(60_000)));
        let executor = CircuitBreakerExecutor::new(Arc::new(DownExecutor), breaker.clone());
        let task = Task::new(ExecutionKey::new("ns", "wf", "run"), 1, Utc::now(), TaskKind::SyncHsm);

        for _ in 0..2 {
            let response = executor.execute(&task, &ctx()).await;
            assert_eq!(
                response.result,
                Err(TaskError::Unexpected("connection refused".into()))
            );
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let response = executor.execute(&task, &ctx()).await;
        assert!(matches!(
            response.result,
            Err(TaskError::ResourceExhausted {
                cause: ResourceExhaustedCause::CircuitBreakerOpen,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_panicking_half_open_call_reopens() {
        let breaker = Arc::new(CircuitBreaker::new("remote", &config(0)));
        breaker.on_failure();
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        let executor = CircuitBreakerExecutor::new(Arc::new(PanickingExecutor), breaker.clone());
        let task = Task::new(ExecutionKey::new("ns", "wf", "run"), 1, Utc::now(), TaskKind::SyncHsm);
        let outcome = AssertUnwindSafe(executor.execute(&task, &ctx()))
            .catch_unwind()
            .await;
        assert!(outcome.is_err());

        // the trial slot is released; the next call is a fresh trial
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.allow());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }
}
