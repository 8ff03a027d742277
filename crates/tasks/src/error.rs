//! Task-level error type.

use thiserror::Error;

/// Errors returned by a task body or by task validation.
///
/// The backend uses the variant to decide retry behaviour:
/// - `Retryable`  — re-invoked while the task's `retries` budget lasts.
/// - `Fatal`      — the task fails immediately.
/// - `Validation` — the task (or what it returned) is malformed; never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// Transient failure; the backend may re-try the body.
    #[error("retryable task error: {0}")]
    Retryable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal task error: {0}")]
    Fatal(String),

    /// The task definition or its result has the wrong shape.
    #[error("task validation error: {0}")]
    Validation(String),
}

impl TaskError {
    /// The message carried by any variant, without the variant prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(msg) | Self::Fatal(msg) | Self::Validation(msg) => msg,
        }
    }
}
