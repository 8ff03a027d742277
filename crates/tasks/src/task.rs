//! The `Task` unit of work and its closed set of kinds.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{Action, Decision, Params, TaskContext, TaskError};

/// Parameter key holding a task's retry budget.
pub const RETRIES_PARAM: &str = "retries";

/// Tag for each task kind; used by workflow definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKindTag {
    Action,
    Branch,
}

impl fmt::Display for TaskKindTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Action => write!(f, "action"),
            Self::Branch => write!(f, "branch"),
        }
    }
}

/// The body a task executes, one variant per kind.
#[derive(Clone)]
pub enum TaskKind {
    /// Runs an arbitrary body; its value is passed through unchanged.
    Action(Arc<dyn Action>),
    /// Runs a decision body that selects which children to pursue.
    Branch(Arc<dyn Decision>),
}

impl TaskKind {
    pub fn tag(&self) -> TaskKindTag {
        match self {
            Self::Action(_) => TaskKindTag::Action,
            Self::Branch(_) => TaskKindTag::Branch,
        }
    }
}

impl fmt::Debug for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// What a successful task execution produced.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
    /// Result of an action task.
    Value(Value),
    /// Child names selected by a branch task, in the order returned.
    Branch(Vec<String>),
}

impl TaskOutput {
    /// The value to record as this task's result.
    pub fn into_value(self) -> Value {
        match self {
            Self::Value(v) => v,
            Self::Branch(names) => Value::Array(names.into_iter().map(Value::String).collect()),
        }
    }
}

/// A named unit of work. Cheap to clone; bodies are shared.
#[derive(Clone)]
pub struct Task {
    name: String,
    kind: TaskKind,
    params: Params,
    undo: Option<Arc<dyn Action>>,
}

impl Task {
    pub fn new(name: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            name: name.into(),
            kind,
            params: Params::new(),
            undo: None,
        }
    }

    /// An action task running `body`.
    pub fn action(name: impl Into<String>, body: impl Action + 'static) -> Self {
        Self::new(name, TaskKind::Action(Arc::new(body)))
    }

    /// An action task from a plain closure.
    pub fn action_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&TaskContext, &Params) -> Result<Value, TaskError> + Send + Sync + 'static,
    {
        Self::action(name, f)
    }

    /// A branch task running `body`.
    pub fn branch(name: impl Into<String>, body: impl Decision + 'static) -> Self {
        Self::new(name, TaskKind::Branch(Arc::new(body)))
    }

    /// A branch task from a plain closure.
    pub fn branch_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&TaskContext, &Params) -> Result<Value, TaskError> + Send + Sync + 'static,
    {
        Self::branch(name, f)
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Set the retry budget enforced by the execution backend.
    pub fn with_retries(self, retries: u32) -> Self {
        self.with_param(RETRIES_PARAM, retries)
    }

    /// Attach a compensation body, run best-effort when this task fails.
    pub fn with_undo(mut self, body: impl Action + 'static) -> Self {
        self.undo = Some(Arc::new(body));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn is_branch(&self) -> bool {
        matches!(self.kind, TaskKind::Branch(_))
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn undo_body(&self) -> Option<&Arc<dyn Action>> {
        self.undo.as_ref()
    }

    /// Retry budget from the `retries` parameter; 0 when absent or malformed.
    pub fn retries(&self) -> u32 {
        self.params
            .get(RETRIES_PARAM)
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0)
    }

    /// Check the task is well-formed before it is executed.
    ///
    /// Bodies are always present by construction, so this only covers the
    /// name and the parameters the backend interprets.
    pub fn validate(&self) -> Result<(), TaskError> {
        if self.name.trim().is_empty() {
            return Err(TaskError::Validation("task name must not be empty".into()));
        }
        if let Some(retries) = self.params.get(RETRIES_PARAM) {
            let ok = retries
                .as_u64()
                .map(|n| u32::try_from(n).is_ok())
                .unwrap_or(false);
            if !ok {
                return Err(TaskError::Validation(format!(
                    "task '{}': '{RETRIES_PARAM}' must be a non-negative integer, got {retries}",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// Execute the task body once.
    ///
    /// # Errors
    /// Whatever the body returns, plus [`TaskError::Validation`] when a
    /// branch body returns anything other than a list of task names.
    pub async fn execute(&self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        match &self.kind {
            TaskKind::Action(body) => body.run(ctx, &self.params).await.map(TaskOutput::Value),
            TaskKind::Branch(body) => {
                let decision = body.decide(ctx, &self.params).await?;
                let selected = parse_branch_selection(&self.name, decision)?;
                debug!(task = %self.name, ?selected, "branch decided");
                Ok(TaskOutput::Branch(selected))
            }
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("params", &self.params)
            .field("has_undo", &self.undo.is_some())
            .finish()
    }
}

fn parse_branch_selection(task: &str, decision: Value) -> Result<Vec<String>, TaskError> {
    let invalid = || {
        TaskError::Validation(format!(
            "branch task '{task}' must return a list of task names"
        ))
    };

    let Value::Array(items) = decision else {
        return Err(invalid());
    };

    items
        .into_iter()
        .map(|item| match item {
            Value::String(name) => Ok(name),
            _ => Err(invalid()),
        })
        .collect()
}
