//! Workflow execution engine.
//!
//! `WorkflowEngine` is the central orchestrator. For each run it:
//! 1. Rejects cyclic DAGs and registers the run as `Running`.
//! 2. Seeds the ready set with every zero in-degree task.
//! 3. Dispatches the whole ready set as one batch to the backend and waits
//!    for every member to finish (batch barrier).
//! 4. At the barrier, records results, prunes children a branch task did not
//!    select, and decrements in-degrees to form the next batch. A failed task
//!    gets its compensation hook called and its children are never visited.
//! 5. Repeats until nothing is ready, then reports `Completed`.
//!
//! Pausing only holds back the next batch; in-flight bodies always finish.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use tasks::{TaskContext, TaskOutput};

use crate::backend::{ExecutionBackend, LocalBackend, PendingTask};
use crate::command::TaskCommand;
use crate::models::{RunState, TaskOutcome, WorkflowResult};
use crate::observer::{Event, Observer, ObserverId, Subject};
use crate::{Dag, EngineConfig, EngineError};

type RunTable = Mutex<HashMap<String, watch::Sender<RunState>>>;

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Runs DAGs on an execution backend and broadcasts lifecycle events.
///
/// Share one engine (behind an `Arc`) between all runs; each run owns its
/// DAG and scheduling state, while the backend's resource pool and the
/// observer set are shared.
pub struct WorkflowEngine {
    backend: Arc<dyn ExecutionBackend>,
    subject: Subject,
    runs: RunTable,
}

impl WorkflowEngine {
    /// Create an engine on top of `backend`.
    pub fn new(backend: Arc<dyn ExecutionBackend>) -> Self {
        Self {
            backend,
            subject: Subject::new(),
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Create an engine with a [`LocalBackend`] built from `config`.
    pub fn with_config(config: &EngineConfig) -> Self {
        Self::new(Arc::new(LocalBackend::new(config)))
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    /// Subscribe `observer` to lifecycle events. The engine does not keep
    /// it alive.
    pub fn attach(&self, observer: &Arc<dyn Observer>) -> ObserverId {
        self.subject.attach(observer)
    }

    pub fn detach(&self, observer: &Arc<dyn Observer>) -> bool {
        self.subject.detach(observer)
    }

    pub fn detach_id(&self, id: ObserverId) -> bool {
        self.subject.detach_id(id)
    }

    // ------------------------------------------------------------------
    // Run state
    // ------------------------------------------------------------------

    /// Current state of a live run, or `None` if no run with this ID is
    /// registered.
    pub fn state(&self, workflow_id: &str) -> Option<RunState> {
        self.runs().get(workflow_id).map(|tx| *tx.borrow())
    }

    /// Hold back the next batch of a running workflow.
    ///
    /// Returns `true` if the run went from `Running` to `Paused`; any other
    /// state, or an unknown ID, is a no-op.
    ///
    /// A pause that lands during the final batch holds nothing back: the run
    /// goes straight from `Paused` to `Completed` and no `workflow_resumed`
    /// follows the `workflow_paused` event.
    pub fn pause(&self, workflow_id: &str) -> bool {
        let changed = self.transition(workflow_id, RunState::Running, RunState::Paused);
        if changed {
            info!(workflow_id, "workflow paused");
            self.subject.notify(&Event::WorkflowPaused {
                id: workflow_id.to_owned(),
            });
        }
        changed
    }

    /// Let a paused workflow dispatch its next batch.
    ///
    /// Returns `true` if the run went from `Paused` to `Running`; any other
    /// state, or an unknown ID, is a no-op.
    pub fn resume(&self, workflow_id: &str) -> bool {
        let changed = self.transition(workflow_id, RunState::Paused, RunState::Running);
        if changed {
            info!(workflow_id, "workflow resumed");
            self.subject.notify(&Event::WorkflowResumed {
                id: workflow_id.to_owned(),
            });
        }
        changed
    }

    fn transition(&self, workflow_id: &str, from: RunState, to: RunState) -> bool {
        match self.runs().get(workflow_id) {
            Some(tx) => tx.send_if_modified(|state| {
                if *state == from {
                    *state = to;
                    true
                } else {
                    false
                }
            }),
            None => false,
        }
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<String, watch::Sender<RunState>>> {
        self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, workflow_id: &str) -> Result<(RunGuard<'_>, watch::Receiver<RunState>), EngineError> {
        let mut runs = self.runs();
        if runs.contains_key(workflow_id) {
            return Err(EngineError::AlreadyRunning(workflow_id.to_owned()));
        }
        let (tx, rx) = watch::channel(RunState::Running);
        runs.insert(workflow_id.to_owned(), tx);
        Ok((
            RunGuard {
                runs: &self.runs,
                workflow_id: workflow_id.to_owned(),
            },
            rx,
        ))
    }

    // ------------------------------------------------------------------
    // Running
    // ------------------------------------------------------------------

    /// Run `dag` on a background tokio task and return its handle.
    pub fn spawn(self: &Arc<Self>, dag: Dag) -> JoinHandle<Result<WorkflowResult, EngineError>> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.run(dag).await })
    }

    /// Run the workflow to completion and return a result snapshot.
    ///
    /// Task failures never fail the run; they are reported through
    /// `task_failed` events and [`WorkflowResult::failed`].
    ///
    /// The pause check sits in front of each dispatch, so a run paused while
    /// its last batch is in flight still completes once that batch joins.
    ///
    /// # Errors
    /// - [`EngineError::CycleDetected`] if the DAG is cyclic (no events are
    ///   emitted).
    /// - [`EngineError::AlreadyRunning`] if a run with the same workflow ID
    ///   is live.
    #[instrument(skip(self, dag), fields(workflow_id = %dag.workflow_id()))]
    pub async fn run(&self, dag: Dag) -> Result<WorkflowResult, EngineError> {
        // ------------------------------------------------------------------
        // Reject cycles before any state is registered.
        // ------------------------------------------------------------------
        let layers = dag.layers()?;
        debug!(tasks = dag.len(), ?layers, "DAG validated");

        let workflow_id = dag.workflow_id().to_owned();
        let (registration, mut state_rx) = self.register(&workflow_id)?;

        let ctx = Arc::new(TaskContext::new(workflow_id.clone(), dag.params().clone()));
        let started_at = Utc::now();

        // ------------------------------------------------------------------
        // Scheduling state, owned by this loop alone.
        // ------------------------------------------------------------------
        let mut in_degree = dag.in_degrees();
        let mut ready: Vec<String> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(name, _)| name.clone())
            .collect();
        let mut results: BTreeMap<String, TaskOutcome> = BTreeMap::new();
        let mut failed: BTreeMap<String, String> = BTreeMap::new();
        let mut batches: Vec<Vec<String>> = Vec::new();

        info!(run_id = %ctx.run_id, tasks = dag.len(), "workflow started");
        self.subject.notify(&Event::WorkflowStarted {
            id: workflow_id.clone(),
        });

        while !ready.is_empty() {
            if !wait_while_paused(&mut state_rx, &workflow_id).await {
                break;
            }

            let mut batch = std::mem::take(&mut ready);
            batch.sort();
            debug!(?batch, "dispatching batch");

            let commands: Vec<TaskCommand> = batch
                .iter()
                .filter_map(|name| dag.task(name))
                .map(|task| {
                    TaskCommand::new(task.clone(), Arc::clone(&ctx), Arc::clone(&self.backend))
                })
                .collect();

            // Barrier: every member finishes before any scheduling decision.
            let pending: Vec<PendingTask> = commands.iter().map(TaskCommand::execute).collect();
            let mut outcomes = Vec::with_capacity(pending.len());
            for p in pending {
                outcomes.push(p.wait().await);
            }

            for (command, outcome) in commands.iter().zip(outcomes) {
                let name = command.task().name();

                match outcome.and_then(|output| check_selection(&dag, name, output)) {
                    Ok(output) => {
                        let selected: Option<BTreeSet<String>> = match &output {
                            TaskOutput::Branch(names) => Some(names.iter().cloned().collect()),
                            TaskOutput::Value(_) => None,
                        };
                        let value = output.into_value();

                        debug!(task = name, "task completed");
                        results.insert(name.to_owned(), TaskOutcome::Completed(value.clone()));
                        self.subject.notify(&Event::TaskCompleted {
                            workflow_id: workflow_id.clone(),
                            task: name.to_owned(),
                            result: value,
                        });

                        for child in dag.children(name) {
                            if let Some(allowed) = &selected {
                                if !allowed.contains(child) {
                                    // Pruned: recorded as skipped, in-degree left as is.
                                    if !results.contains_key(child) {
                                        debug!(task = child, branch = name, "task skipped");
                                        results.insert(child.to_owned(), TaskOutcome::Skipped);
                                        self.subject.notify(&Event::TaskSkipped {
                                            workflow_id: workflow_id.clone(),
                                            task: child.to_owned(),
                                        });
                                    }
                                    continue;
                                }
                            }

                            if let Some(deg) = in_degree.get_mut(child) {
                                *deg = deg.saturating_sub(1);
                                if *deg == 0 {
                                    ready.push(child.to_owned());
                                }
                            }
                        }
                    }

                    Err(err) => {
                        error!(task = name, error = %err, "task failed");
                        failed.insert(name.to_owned(), err.to_string());
                        self.subject.notify(&Event::TaskFailed {
                            workflow_id: workflow_id.clone(),
                            task: name.to_owned(),
                            error: err.to_string(),
                        });
                        command.undo(&err).await;
                    }
                }
            }

            batches.push(batch);
        }

        // ------------------------------------------------------------------
        // Drained: whatever never ran, failed, or was skipped is dangling.
        // ------------------------------------------------------------------
        let unresolved: Vec<String> = dag
            .task_names()
            .filter(|name| !results.contains_key(*name) && !failed.contains_key(*name))
            .map(str::to_owned)
            .collect();

        registration.complete();

        info!(
            completed = results.values().filter(|o| !o.is_skipped()).count(),
            skipped = results.values().filter(|o| o.is_skipped()).count(),
            failed = failed.len(),
            unresolved = unresolved.len(),
            "workflow completed"
        );
        self.subject.notify(&Event::WorkflowCompleted {
            id: workflow_id.clone(),
        });

        Ok(WorkflowResult {
            workflow_id,
            run_id: ctx.run_id,
            status: RunState::Completed,
            results,
            failed,
            unresolved,
            batches,
            started_at,
            finished_at: Utc::now(),
        })
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Deregisters a run when dropped, including when the run future is dropped
/// mid-flight.
struct RunGuard<'a> {
    runs: &'a RunTable,
    workflow_id: String,
}

impl RunGuard<'_> {
    /// Mark the run `Completed`, then deregister it.
    fn complete(self) {
        if let Some(tx) = self.lock().get(&self.workflow_id) {
            tx.send_replace(RunState::Completed);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, watch::Sender<RunState>>> {
        self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.lock().remove(&self.workflow_id);
    }
}

/// Block while the run is paused. Returns `false` if the state channel is
/// gone, which ends the run.
async fn wait_while_paused(state_rx: &mut watch::Receiver<RunState>, workflow_id: &str) -> bool {
    let paused = *state_rx.borrow() == RunState::Paused;
    if paused {
        info!(workflow_id, "paused; holding next batch until resumed");
    }
    state_rx.wait_for(|state| *state != RunState::Paused).await.is_ok()
}

/// A branch task may only select among its own children.
fn check_selection(dag: &Dag, task: &str, output: TaskOutput) -> Result<TaskOutput, EngineError> {
    if let TaskOutput::Branch(names) = &output {
        let children: BTreeSet<&str> = dag.children(task).collect();
        if let Some(stray) = names.iter().find(|n| !children.contains(n.as_str())) {
            return Err(EngineError::Validation {
                task: task.to_owned(),
                message: format!("selected '{stray}', which is not one of its children"),
            });
        }
    }
    Ok(output)
}
