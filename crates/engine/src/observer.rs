//! Lifecycle events and the subscriber registry that broadcasts them.
//!
//! The [`Subject`] holds observers through `Weak` references: it never keeps
//! one alive, and an observer whose last `Arc` is dropped simply stops
//! receiving events. Delivery is synchronous and in attachment order.
//! An observer that errors or panics is logged and skipped; the failure never
//! reaches the scheduler.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

/// A workflow lifecycle event and its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    WorkflowStarted {
        id: String,
    },
    TaskCompleted {
        workflow_id: String,
        task: String,
        result: Value,
    },
    TaskSkipped {
        workflow_id: String,
        task: String,
    },
    TaskFailed {
        workflow_id: String,
        task: String,
        error: String,
    },
    WorkflowCompleted {
        id: String,
    },
    WorkflowPaused {
        id: String,
    },
    WorkflowResumed {
        id: String,
    },
}

impl Event {
    /// Wire name of the event, e.g. `task_completed`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow_started",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskSkipped { .. } => "task_skipped",
            Self::TaskFailed { .. } => "task_failed",
            Self::WorkflowCompleted { .. } => "workflow_completed",
            Self::WorkflowPaused { .. } => "workflow_paused",
            Self::WorkflowResumed { .. } => "workflow_resumed",
        }
    }

    pub fn workflow_id(&self) -> &str {
        match self {
            Self::WorkflowStarted { id }
            | Self::WorkflowCompleted { id }
            | Self::WorkflowPaused { id }
            | Self::WorkflowResumed { id } => id,
            Self::TaskCompleted { workflow_id, .. }
            | Self::TaskSkipped { workflow_id, .. }
            | Self::TaskFailed { workflow_id, .. } => workflow_id,
        }
    }

    /// Task the event concerns, if any.
    pub fn task(&self) -> Option<&str> {
        match self {
            Self::TaskCompleted { task, .. }
            | Self::TaskSkipped { task, .. }
            | Self::TaskFailed { task, .. } => Some(task),
            _ => None,
        }
    }
}

/// Receives lifecycle events.
///
/// Called synchronously from the scheduler; keep handlers short and hand off
/// slow work (I/O, network) to a channel.
pub trait Observer: Send + Sync {
    fn update(&self, event: &Event) -> anyhow::Result<()>;
}

/// Identifies one attachment, for [`Subject::detach_id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

struct Registration {
    id: ObserverId,
    observer: Weak<dyn Observer>,
}

/// Non-owning observer registry.
#[derive(Default)]
pub struct Subject {
    next_id: AtomicU64,
    observers: RwLock<Vec<Registration>>,
}

impl Subject {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `observer` without taking ownership of it.
    pub fn attach(&self, observer: &Arc<dyn Observer>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.write().push(Registration {
            id,
            observer: Arc::downgrade(observer),
        });
        id
    }

    /// Remove every registration of `observer`. Returns whether one was found.
    pub fn detach(&self, observer: &Arc<dyn Observer>) -> bool {
        let target = Arc::downgrade(observer);
        let mut observers = self.write();
        let before = observers.len();
        observers.retain(|r| !Weak::ptr_eq(&r.observer, &target));
        observers.len() != before
    }

    /// Remove the registration returned by [`Subject::attach`].
    pub fn detach_id(&self, id: ObserverId) -> bool {
        let mut observers = self.write();
        let before = observers.len();
        observers.retain(|r| r.id != id);
        observers.len() != before
    }

    /// Number of registrations whose observer is still alive.
    pub fn len(&self) -> usize {
        self.read()
            .iter()
            .filter(|r| r.observer.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every live observer, in attachment order.
    ///
    /// Observers are called outside the registry lock, so a handler may
    /// attach or detach without deadlocking; the change applies from the
    /// next event.
    pub fn notify(&self, event: &Event) {
        let (live, dead) = {
            let observers = self.read();
            let live: Vec<Arc<dyn Observer>> =
                observers.iter().filter_map(|r| r.observer.upgrade()).collect();
            let dead = observers.len() - live.len();
            (live, dead)
        };

        if dead > 0 {
            self.write().retain(|r| r.observer.strong_count() > 0);
        }

        for observer in live {
            match catch_unwind(AssertUnwindSafe(|| observer.update(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(event = event.name(), error = %err, "observer failed to handle event");
                }
                Err(_) => {
                    error!(event = event.name(), "observer panicked while handling event");
                }
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Registration>> {
        self.observers.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Registration>> {
        self.observers.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Forwards every event into the `tracing` log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn update(&self, event: &Event) -> anyhow::Result<()> {
        match event {
            Event::TaskFailed { workflow_id, task, error } => {
                warn!(workflow_id = %workflow_id, task = %task, error = %error, "task_failed");
            }
            Event::TaskCompleted { workflow_id, task, result } => {
                info!(workflow_id = %workflow_id, task = %task, result = %result, "task_completed");
            }
            other => {
                info!(
                    workflow_id = %other.workflow_id(),
                    task = other.task().unwrap_or("-"),
                    "{}",
                    other.name()
                );
            }
        }
        Ok(())
    }
}
