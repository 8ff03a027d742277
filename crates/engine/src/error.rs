//! Engine-level error types.

use thiserror::Error;

use crate::pool::ResourceHandle;

/// Errors produced by the workflow engine (graph building + execution).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    // ------ Graph errors ------

    /// Two or more task definitions share the same name.
    #[error("duplicate task name: '{0}'")]
    DuplicateTask(String),

    /// An edge references a task name that doesn't exist in the DAG.
    #[error("edge references unknown task '{task}' ({side} side)")]
    UnknownTaskReference {
        task: String,
        side: &'static str,
    },

    /// A task definition names a handler that isn't registered.
    #[error("task '{task}' uses unregistered handler '{handler}'")]
    UnknownHandler {
        task: String,
        handler: String,
    },

    /// Topological sort could not place these tasks; they sit on or behind a cycle.
    #[error("workflow graph contains a cycle through {0:?}")]
    CycleDetected(Vec<String>),

    /// A run for this workflow ID is already in progress.
    #[error("workflow '{0}' is already running")]
    AlreadyRunning(String),

    // ------ Execution errors ------

    /// The task, or the shape of its result, is invalid.
    #[error("task '{task}' failed validation: {message}")]
    Validation {
        task: String,
        message: String,
    },

    /// The task body failed.
    #[error("task '{task}' failed: {message}")]
    Execution {
        task: String,
        message: String,
    },

    /// The task body kept failing with retryable errors.
    #[error("task '{task}' exceeded retry limit after {attempts} attempts: {message}")]
    RetryExhausted {
        task: String,
        attempts: u32,
        message: String,
    },

    // ------ Resource pool errors ------

    /// No free handle was available at acquire time.
    #[error("resource pool exhausted ({capacity} handles in use)")]
    ResourceExhausted {
        capacity: usize,
    },

    /// A handle was released that is not currently checked out.
    #[error("unknown resource handle: {0}")]
    UnknownHandle(ResourceHandle),
}
