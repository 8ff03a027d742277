//! The body traits every task must be built from, and the context they see.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::TaskError;

/// Free-form task or workflow parameters. Opaque to the engine.
pub type Params = serde_json::Map<String, Value>;

/// Shared, read-only context passed to every task body during a run.
///
/// Defined here (in the tasks crate) so both the engine and individual task
/// bodies can import it without a circular dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    /// ID of the workflow (the DAG) being executed.
    pub workflow_id: String,
    /// ID of the current execution run.
    pub run_id: uuid::Uuid,
    /// Workflow-wide parameters supplied when the DAG was built.
    pub global_params: Params,
}

impl TaskContext {
    pub fn new(workflow_id: impl Into<String>, global_params: Params) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id: uuid::Uuid::new_v4(),
            global_params,
        }
    }
}

/// Body of an action task. The returned value is passed through unchanged.
#[async_trait]
pub trait Action: Send + Sync {
    async fn run(&self, ctx: &TaskContext, params: &Params) -> Result<Value, TaskError>;
}

/// Body of a branch task.
///
/// Must return a JSON array of task names drawn from the branch task's own
/// children; anything else is rejected as a validation error.
#[async_trait]
pub trait Decision: Send + Sync {
    async fn decide(&self, ctx: &TaskContext, params: &Params) -> Result<Value, TaskError>;
}

#[async_trait]
impl<F> Action for F
where
    F: Fn(&TaskContext, &Params) -> Result<Value, TaskError> + Send + Sync,
{
    async fn run(&self, ctx: &TaskContext, params: &Params) -> Result<Value, TaskError> {
        self(ctx, params)
    }
}

#[async_trait]
impl<F> Decision for F
where
    F: Fn(&TaskContext, &Params) -> Result<Value, TaskError> + Send + Sync,
{
    async fn decide(&self, ctx: &TaskContext, params: &Params) -> Result<Value, TaskError> {
        self(ctx, params)
    }
}
