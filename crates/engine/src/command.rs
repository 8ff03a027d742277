//! A task dispatch wrapped as a command with an `undo` compensation hook.

use std::sync::Arc;

use tracing::{debug, info, warn};

use tasks::{Task, TaskContext};

use crate::backend::{ExecutionBackend, PendingTask};
use crate::EngineError;

/// One task of one run, bound to the backend that executes it.
pub struct TaskCommand {
    task: Task,
    ctx: Arc<TaskContext>,
    backend: Arc<dyn ExecutionBackend>,
}

impl TaskCommand {
    pub fn new(task: Task, ctx: Arc<TaskContext>, backend: Arc<dyn ExecutionBackend>) -> Self {
        Self { task, ctx, backend }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Submit the task to the backend.
    pub fn execute(&self) -> PendingTask {
        self.backend.submit(self.task.clone(), Arc::clone(&self.ctx))
    }

    /// Best-effort compensation after `error`.
    ///
    /// Runs the task's undo body, if any, on its own tokio task so a
    /// panicking compensation can't take the scheduler down. Failures are
    /// logged and swallowed; nothing is retried.
    pub async fn undo(&self, error: &EngineError) {
        let Some(body) = self.task.undo_body().cloned() else {
            debug!(task = self.task.name(), "no compensation registered");
            return;
        };

        info!(task = self.task.name(), cause = %error, "running compensation");

        let ctx = Arc::clone(&self.ctx);
        let params = self.task.params().clone();
        let outcome = tokio::spawn(async move { body.run(&ctx, &params).await }).await;

        match outcome {
            Ok(Ok(_)) => debug!(task = self.task.name(), "compensation finished"),
            Ok(Err(err)) => {
                warn!(task = self.task.name(), error = %err, "compensation failed");
            }
            Err(join_err) => {
                warn!(task = self.task.name(), error = %join_err, "compensation panicked");
            }
        }
    }
}
