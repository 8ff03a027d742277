//! Execution backends: where task bodies actually run.
//!
//! The scheduler talks to an [`ExecutionBackend`] rather than spawning bodies
//! itself, so tests can swap in a backend that doesn't touch the shared pool.
//!
//! [`LocalBackend`] is the default. Each submitted task becomes a tokio task
//! that:
//! 1. waits for a worker permit (a batch larger than `max_workers` queues),
//! 2. validates the task,
//! 3. checks out one resource handle (fails fast with `ResourceExhausted`),
//! 4. runs the body, retrying `TaskError::Retryable` up to the task's
//!    `retries` budget with exponential back-off,
//! 5. releases the handle and the permit on every exit path, panics included.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tasks::{Task, TaskContext, TaskError, TaskOutput};

use crate::pool::ResourcePool;
use crate::{EngineConfig, EngineError};

/// Handle to a submitted task; resolves once the body has finished.
#[derive(Debug)]
pub struct PendingTask {
    task: String,
    handle: JoinHandle<Result<TaskOutput, EngineError>>,
}

impl PendingTask {
    /// Spawn `fut` onto the runtime as the execution of `task`.
    pub fn spawn<F>(task: impl Into<String>, fut: F) -> Self
    where
        F: Future<Output = Result<TaskOutput, EngineError>> + Send + 'static,
    {
        Self {
            task: task.into(),
            handle: tokio::spawn(fut),
        }
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    /// Wait for the task to finish. A panicking body surfaces as
    /// [`EngineError::Execution`].
    pub async fn wait(self) -> Result<TaskOutput, EngineError> {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(join_err) => {
                let message = if join_err.is_panic() {
                    format!("task body panicked: {}", panic_message(join_err.into_panic()))
                } else {
                    "task was cancelled".to_owned()
                };
                Err(EngineError::Execution {
                    task: self.task,
                    message,
                })
            }
        }
    }
}

/// Strategy for running task bodies.
pub trait ExecutionBackend: Send + Sync {
    /// Dispatch `task` for execution and return immediately.
    fn submit(&self, task: Task, ctx: Arc<TaskContext>) -> PendingTask;
}

/// Runs task bodies on the tokio runtime, bounded by a worker semaphore and
/// wrapped with resource-pool checkout.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    workers: Arc<Semaphore>,
    max_workers: usize,
    pool: Arc<ResourcePool>,
    retry_base_delay: Duration,
}

impl LocalBackend {
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_pool(config, Arc::new(ResourcePool::new(config.pool_size)))
    }

    /// Build a backend over an existing pool, e.g. one shared between backends.
    pub fn with_pool(config: &EngineConfig, pool: Arc<ResourcePool>) -> Self {
        // Zero workers would park every task forever.
        let max_workers = config.max_workers.max(1);
        Self {
            workers: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            pool,
            retry_base_delay: config.retry_base_delay,
        }
    }

    pub fn pool(&self) -> &Arc<ResourcePool> {
        &self.pool
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Worker permits not currently held by a running body.
    pub fn idle_workers(&self) -> usize {
        self.workers.available_permits()
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

impl ExecutionBackend for LocalBackend {
    fn submit(&self, task: Task, ctx: Arc<TaskContext>) -> PendingTask {
        let workers = Arc::clone(&self.workers);
        let pool = Arc::clone(&self.pool);
        let retry_base_delay = self.retry_base_delay;
        let name = task.name().to_owned();

        PendingTask::spawn(name, async move {
            let _permit = workers.acquire_owned().await.map_err(|_| EngineError::Execution {
                task: task.name().to_owned(),
                message: "worker pool is closed".into(),
            })?;

            task.validate()
                .map_err(|err| engine_error(task.name(), err, 1))?;

            let resource = pool.checkout()?;
            debug!(
                workflow_id = %ctx.workflow_id,
                task = task.name(),
                resource = %resource.handle(),
                "executing task"
            );

            execute_with_retry(&task, &ctx, retry_base_delay).await
        })
    }
}

// ---------------------------------------------------------------------------
// Internal: execute a single task with retry logic.
// ---------------------------------------------------------------------------

async fn execute_with_retry(
    task: &Task,
    ctx: &TaskContext,
    base_delay: Duration,
) -> Result<TaskOutput, EngineError> {
    let max_retries = task.retries();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match task.execute(ctx).await {
            Ok(output) => return Ok(output),

            Err(TaskError::Retryable(msg)) if attempts <= max_retries => {
                let delay = base_delay.saturating_mul(2u32.saturating_pow(attempts - 1));

                warn!(
                    workflow_id = %ctx.workflow_id,
                    task = task.name(),
                    attempt = attempts,
                    max_attempts = max_retries + 1,
                    ?delay,
                    error = %msg,
                    "retryable error, retrying"
                );

                tokio::time::sleep(delay).await;
            }

            Err(err) => return Err(engine_error(task.name(), err, attempts)),
        }
    }
}

fn engine_error(task: &str, err: TaskError, attempts: u32) -> EngineError {
    let task = task.to_owned();
    match err {
        TaskError::Validation(message) => EngineError::Validation { task, message },
        TaskError::Fatal(message) => EngineError::Execution { task, message },
        TaskError::Retryable(message) => EngineError::RetryExhausted {
            task,
            attempts,
            message,
        },
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
