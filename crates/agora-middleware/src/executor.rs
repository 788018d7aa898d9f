//! [`ExecutorService`] – shared task executor for kernel services.
//!
//! Wraps a Tokio runtime [`Handle`] and runs units of work that return
//! `Result<(), TaskError>`.  Every completion is classified into a
//! [`TaskOutcome`]:
//!
//! | Result | Outcome | Reporting |
//! |---|---|---|
//! | `Ok(())` | [`TaskOutcome::Completed`] | none |
//! | [`TaskError::Cancelled`] (any wrapping depth) | [`TaskOutcome::Cancelled`] | silent |
//! | [`TaskError::Interrupted`] or an aborted task | [`TaskOutcome::Interrupted`] | `debug!` |
//! | anything else, panics included | [`TaskOutcome::Failed`] | [`UncaughtErrorHandler`], once |
//!
//! Registered [`TaskListener`]s observe every outcome.  Periodic tasks stop at
//! their first non-completed run and are never retried.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use agora_types::TaskError;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinError};
use tracing::{debug, error, trace};

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Identifier of a submitted unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Final classification of a unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Cancelled,
    Interrupted(String),
    Failed(String),
}

/// Observer of task completions.
pub trait TaskListener: Send + Sync {
    fn task_finished(&self, task: TaskId, outcome: &TaskOutcome);
}

/// Channel for task failures nobody else handled.
pub trait UncaughtErrorHandler: Send + Sync {
    fn uncaught(&self, task: TaskId, error: &TaskError);
}

/// Default [`UncaughtErrorHandler`]: logs at `error` level.
#[derive(Debug, Default)]
pub struct LoggingErrorHandler;

impl UncaughtErrorHandler for LoggingErrorHandler {
    fn uncaught(&self, task: TaskId, error: &TaskError) {
        error!(task = %task, error = %error, "uncaught task failure");
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Handles
// ────────────────────────────────────────────────────────────────────────────

/// Handle on a one-shot task.
pub struct TaskHandle {
    id: TaskId,
    abort: AbortHandle,
    outcome: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Abort the task.  Work already running on a blocking thread runs to
    /// completion; the outcome is still reported.
    pub fn abort(&self) {
        self.abort.abort();
    }

    /// Wait for the task's outcome.
    pub async fn join(self) -> TaskOutcome {
        self.outcome
            .await
            .unwrap_or_else(|_| TaskOutcome::Interrupted("executor dropped".to_string()))
    }
}

/// Handle on a delayed or periodic task.
pub struct ScheduledTask {
    id: TaskId,
    cancelled: Arc<AtomicBool>,
    abort: AbortHandle,
    outcome: oneshot::Receiver<TaskOutcome>,
}

impl ScheduledTask {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Cancel further runs.  A deliberate cancel is reported as
    /// [`TaskOutcome::Cancelled`].
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.abort.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub async fn join(self) -> TaskOutcome {
        self.outcome
            .await
            .unwrap_or_else(|_| TaskOutcome::Interrupted("executor dropped".to_string()))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ExecutorService
// ────────────────────────────────────────────────────────────────────────────

struct Inner {
    handle: Handle,
    next_id: AtomicU64,
    listeners: Mutex<Vec<Arc<dyn TaskListener>>>,
    error_handler: Arc<dyn UncaughtErrorHandler>,
}

/// Shared executor.  Clone it cheaply – all clones share the same runtime
/// handle, listeners and error handler.
#[derive(Clone)]
pub struct ExecutorService {
    inner: Arc<Inner>,
}

impl fmt::Debug for ExecutorService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorService")
            .field("next_id", &self.inner.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

impl ExecutorService {
    /// Executor on `handle` reporting failures through [`LoggingErrorHandler`].
    pub fn new(handle: Handle) -> Self {
        Self::with_error_handler(handle, Arc::new(LoggingErrorHandler))
    }

    pub fn with_error_handler(handle: Handle, error_handler: Arc<dyn UncaughtErrorHandler>) -> Self {
        Self {
            inner: Arc::new(Inner {
                handle,
                next_id: AtomicU64::new(0),
                listeners: Mutex::new(Vec::new()),
                error_handler,
            }),
        }
    }

    pub fn add_task_listener(&self, listener: Arc<dyn TaskListener>) {
        self.inner.listeners.lock().push(listener);
    }

    /// Run a blocking closure on the runtime's blocking pool.
    pub fn submit<F>(&self, task: F) -> TaskHandle
    where
        F: FnOnce() -> Result<(), TaskError> + Send + 'static,
    {
        self.spawn(async move { run_blocking(task).await })
    }

    /// Run a future on the runtime.
    pub fn spawn<Fut>(&self, future: Fut) -> TaskHandle
    where
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        let id = self.inner.next_task_id();
        let work = self.inner.handle.spawn(future);
        let abort = work.abort_handle();
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        self.inner.handle.spawn(async move {
            let result = work.await.unwrap_or_else(|e| Err(join_error(e)));
            let _ = tx.send(inner.report(id, result));
        });
        TaskHandle {
            id,
            abort,
            outcome: rx,
        }
    }

    /// Run `task` once after `delay`.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> ScheduledTask
    where
        F: FnOnce() -> Result<(), TaskError> + Send + 'static,
    {
        self.scheduled(async move {
            tokio::time::sleep(delay).await;
            run_blocking(task).await
        })
    }

    /// Run `task` every `period`, measured from the start of each run.
    pub fn schedule_at_fixed_rate<F>(&self, initial: Duration, period: Duration, task: F) -> ScheduledTask
    where
        F: FnMut() -> Result<(), TaskError> + Send + 'static,
    {
        self.scheduled(fixed_rate(initial, period, task))
    }

    /// Run `task` repeatedly with `delay` between the end of one run and the
    /// start of the next.
    pub fn schedule_with_fixed_delay<F>(&self, initial: Duration, delay: Duration, task: F) -> ScheduledTask
    where
        F: FnMut() -> Result<(), TaskError> + Send + 'static,
    {
        self.scheduled(fixed_delay(initial, delay, task))
    }

    fn scheduled<Fut>(&self, future: Fut) -> ScheduledTask
    where
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        let id = self.inner.next_task_id();
        let cancelled = Arc::new(AtomicBool::new(false));
        let work = self.inner.handle.spawn(future);
        let abort = work.abort_handle();
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let flag = Arc::clone(&cancelled);
        self.inner.handle.spawn(async move {
            let result = match work.await {
                Ok(r) => r,
                Err(e) if e.is_cancelled() && flag.load(Ordering::Acquire) => Err(TaskError::Cancelled),
                Err(e) => Err(join_error(e)),
            };
            let _ = tx.send(inner.report(id, result));
        });
        ScheduledTask {
            id,
            cancelled,
            abort,
            outcome: rx,
        }
    }
}

impl Inner {
    fn next_task_id(&self) -> TaskId {
        TaskId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn report(&self, id: TaskId, result: Result<(), TaskError>) -> TaskOutcome {
        let outcome = match result {
            Ok(()) => TaskOutcome::Completed,
            Err(e) if e.is_cancellation() => {
                trace!(task = %id, "task cancelled");
                TaskOutcome::Cancelled
            }
            Err(e) if e.is_interruption() => {
                debug!(task = %id, error = %e, "task interrupted");
                TaskOutcome::Interrupted(e.to_string())
            }
            Err(e) => {
                self.error_handler.uncaught(id, &e);
                TaskOutcome::Failed(e.to_string())
            }
        };
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener.task_finished(id, &outcome);
        }
        outcome
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Internal helpers
// ────────────────────────────────────────────────────────────────────────────

async fn run_blocking<F>(task: F) -> Result<(), TaskError>
where
    F: FnOnce() -> Result<(), TaskError> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .unwrap_or_else(|e| Err(join_error(e)))
}

async fn fixed_rate<F>(initial: Duration, period: Duration, mut task: F) -> Result<(), TaskError>
where
    F: FnMut() -> Result<(), TaskError> + Send + 'static,
{
    tokio::time::sleep(initial).await;
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        task = run_repeatable(task).await?;
    }
}

async fn fixed_delay<F>(initial: Duration, delay: Duration, mut task: F) -> Result<(), TaskError>
where
    F: FnMut() -> Result<(), TaskError> + Send + 'static,
{
    tokio::time::sleep(initial).await;
    loop {
        task = run_repeatable(task).await?;
        tokio::time::sleep(delay).await;
    }
}

/// Run one iteration of a periodic task and hand the closure back for the
/// next run.  Any non-`Ok` result ends the schedule.
async fn run_repeatable<F>(mut task: F) -> Result<F, TaskError>
where
    F: FnMut() -> Result<(), TaskError> + Send + 'static,
{
    let (task, result) = tokio::task::spawn_blocking(move || {
        let result = task();
        (task, result)
    })
    .await
    .map_err(join_error)?;
    result.map(|()| task)
}

fn join_error(e: JoinError) -> TaskError {
    if e.is_cancelled() {
        return TaskError::Interrupted("task aborted".to_string());
    }
    match e.try_into_panic() {
        Ok(payload) => TaskError::failed(format!("task panicked: {}", panic_message(payload.as_ref()))),
        Err(e) => TaskError::failed(e.to_string()),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
