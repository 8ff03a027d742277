//! Core domain models for the workflow engine.
//!
//! Definitions describe a workflow as submitted (flat task list with
//! dependencies); results describe what one run produced. Both serialize to
//! JSON so outer layers can persist or forward them unchanged.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use tasks::{Params, TaskKindTag};

// ---------------------------------------------------------------------------
// RunState
// ---------------------------------------------------------------------------

/// Lifecycle of one workflow run.
///
/// `Running ⇄ Paused`, then `Running → Completed` once nothing is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Paused,
    Completed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskOutcome
// ---------------------------------------------------------------------------

/// Recorded result of a task that reached a terminal, non-failed state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "result", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// The task ran and returned this value.
    Completed(Value),
    /// A branch parent did not select this task.
    Skipped,
}

impl TaskOutcome {
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Completed(v) => Some(v),
            Self::Skipped => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }
}

// ---------------------------------------------------------------------------
// WorkflowResult
// ---------------------------------------------------------------------------

/// Snapshot returned when a run finishes.
///
/// `status` is `Completed` whenever the run drained its ready set, even if
/// tasks failed or were left unresolved. Inspect `failed` and `unresolved`
/// (or the `task_failed` / `task_skipped` events) to detect partial failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub status: RunState,
    /// Completed and skipped tasks. Failed and unresolved tasks are absent.
    pub results: BTreeMap<String, TaskOutcome>,
    /// Error message per failed task.
    pub failed: BTreeMap<String, String>,
    /// Tasks never scheduled because an upstream failure or skip left their
    /// in-degree above zero. Sorted by name.
    pub unresolved: Vec<String>,
    /// Task names of each dispatched batch, in dispatch order.
    pub batches: Vec<Vec<String>>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl WorkflowResult {
    /// Value returned by `task`, if it completed.
    pub fn value(&self, task: &str) -> Option<&Value> {
        self.results.get(task).and_then(TaskOutcome::value)
    }

    pub fn is_skipped(&self, task: &str) -> bool {
        self.results.get(task).is_some_and(TaskOutcome::is_skipped)
    }

    /// True when every task completed or was skipped.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.unresolved.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

/// One task as submitted in a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Unique within the workflow; referenced by `dependencies`.
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TaskKindTag,
    /// Registered handler providing the body; defaults per kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    #[serde(default)]
    pub params: Params,
    /// Names of the tasks this one runs after.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// A complete workflow definition: a flat task list with dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Global parameters visible to every task through its context.
    #[serde(default)]
    pub params: Params,
    pub tasks: Vec<TaskDefinition>,
}

impl WorkflowDefinition {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
