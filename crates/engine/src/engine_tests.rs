//! End-to-end tests for the workflow engine.
//!
//! Bodies are `MockAction` / `MockDecision` doubles, plus a `Gate` body that
//! blocks until the test opens it so pause and detach can be exercised at a
//! known point in the run.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use tasks::mock::{MockAction, MockDecision};
use tasks::{Action, Params, Task, TaskContext, TaskError, TaskKind};

use crate::{
    Dag, EngineConfig, EngineError, Event, LocalBackend, Observer, RunState, WorkflowEngine,
};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

#[derive(Default)]
struct EventLog {
    events: Mutex<Vec<Event>>,
}

impl EventLog {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// `name` or `name(task)` per event, in delivery order.
    fn trace(&self) -> Vec<String> {
        self.events()
            .iter()
            .map(|e| match e.task() {
                Some(task) => format!("{}({task})", e.name()),
                None => e.name().to_owned(),
            })
            .collect()
    }

    fn contains(&self, entry: &str) -> bool {
        self.trace().iter().any(|e| e == entry)
    }
}

impl Observer for EventLog {
    fn update(&self, event: &Event) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// A body that parks until `open` is called.
struct Gate {
    started: Semaphore,
    release: Semaphore,
    calls: AtomicUsize,
}

impl Gate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Semaphore::new(0),
            release: Semaphore::new(0),
            calls: AtomicUsize::new(0),
        })
    }

    fn task(self: &Arc<Self>, name: &str) -> Task {
        Task::new(name, TaskKind::Action(Arc::clone(self) as Arc<dyn Action>))
    }

    async fn wait_started(&self) {
        self.started.acquire().await.unwrap().forget();
    }

    fn open(&self) {
        self.release.add_permits(1);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Action for Gate {
    async fn run(&self, _ctx: &TaskContext, _params: &Params) -> Result<Value, TaskError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.add_permits(1);
        self.release
            .acquire()
            .await
            .map_err(|_| TaskError::Fatal("gate closed".into()))?
            .forget();
        Ok(json!("opened"))
    }
}

/// Sleeps for a fixed time, holding its worker and resource meanwhile.
struct Sleeper(Duration);

#[async_trait]
impl Action for Sleeper {
    async fn run(&self, _ctx: &TaskContext, _params: &Params) -> Result<Value, TaskError> {
        tokio::time::sleep(self.0).await;
        Ok(Value::Null)
    }
}

fn engine() -> Arc<WorkflowEngine> {
    Arc::new(WorkflowEngine::with_config(&EngineConfig::default()))
}

fn attach_log(engine: &WorkflowEngine) -> Arc<EventLog> {
    let log = Arc::new(EventLog::default());
    let observer: Arc<dyn Observer> = log.clone();
    engine.attach(&observer);
    log
}

fn ok(name: &str) -> MockAction {
    MockAction::returning(name, json!({ "ok": true }))
}

fn dag(id: &str, tasks: Vec<Task>, edges: &[(&str, &str)]) -> Dag {
    let mut dag = Dag::new(id);
    for task in tasks {
        assert!(dag.add_task(task));
    }
    for (parent, child) in edges {
        dag.add_edge(parent, child).unwrap();
    }
    dag
}

/// Poll until `cond` holds; fails the test after two seconds.
async fn eventually(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ============================================================
// Scheduling
// ============================================================

#[tokio::test]
async fn linear_chain_runs_in_order() {
    let engine = engine();
    let log = attach_log(&engine);
    let a = MockAction::returning("a", json!({ "step": 1 }));
    let b = MockAction::returning("b", json!({ "step": 2 }));

    let result = engine
        .run(dag(
            "wf",
            vec![Task::action("a", a.clone()), Task::action("b", b.clone())],
            &[("a", "b")],
        ))
        .await
        .unwrap();

    assert_eq!(result.status, RunState::Completed);
    assert!(result.is_clean());
    assert_eq!(result.batches, vec![vec!["a"], vec!["b"]]);
    assert_eq!(result.value("a").unwrap()["step"], 1);
    assert_eq!(result.value("b").unwrap()["task"], "b");
    assert_eq!((a.call_count(), b.call_count()), (1, 1));

    assert_eq!(
        log.trace(),
        vec![
            "workflow_started",
            "task_completed(a)",
            "task_completed(b)",
            "workflow_completed",
        ]
    );
    assert_eq!(engine.state("wf"), None);
}

#[tokio::test]
async fn diamond_batches_match_layers_on_every_run() {
    let engine = engine();
    let build = || {
        dag(
            "diamond",
            vec![
                Task::action("d", ok("d")),
                Task::action("c", ok("c")),
                Task::action("b", ok("b")),
                Task::action("a", ok("a")),
            ],
            &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
        )
    };

    let expected = build().layers().unwrap();
    assert_eq!(expected, vec![vec!["a"], vec!["b", "c"], vec!["d"]]);

    for _ in 0..3 {
        let result = engine.run(build()).await.unwrap();
        assert_eq!(result.batches, expected);
        assert_eq!(result.results.len(), 4);
    }
}

#[tokio::test]
async fn empty_dag_completes_immediately() {
    let engine = engine();
    let log = attach_log(&engine);

    let result = engine.run(Dag::new("empty")).await.unwrap();

    assert_eq!(result.status, RunState::Completed);
    assert!(result.results.is_empty());
    assert!(result.batches.is_empty());
    assert_eq!(log.trace(), vec!["workflow_started", "workflow_completed"]);
}

#[tokio::test]
async fn global_params_reach_every_task() {
    let engine = engine();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let probe = Task::action_fn("probe", move |ctx, params| {
        sink.lock().unwrap().push(ctx.workflow_id.clone());
        Ok(json!({
            "env": ctx.global_params.get("env").cloned().unwrap_or(Value::Null),
            "local": params.get("local").cloned().unwrap_or(Value::Null),
        }))
    })
    .with_param("local", 7);

    let mut params = Params::new();
    params.insert("env".into(), json!("staging"));
    let dag = dag("params", vec![probe], &[]).with_params(params);

    let result = engine.run(dag).await.unwrap();

    assert_eq!(result.value("probe").unwrap(), &json!({ "env": "staging", "local": 7 }));
    assert_eq!(*seen.lock().unwrap(), vec!["params"]);
}

#[tokio::test]
async fn cyclic_dag_is_rejected_without_events() {
    let engine = engine();
    let log = attach_log(&engine);
    let a = ok("a");

    let err = engine
        .run(dag(
            "cyclic",
            vec![Task::action("a", a.clone()), Task::action("b", ok("b"))],
            &[("a", "b"), ("b", "a")],
        ))
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::CycleDetected(ref tasks) if tasks == &["a", "b"]));
    assert!(log.events().is_empty());
    assert_eq!(a.call_count(), 0);
    assert_eq!(engine.state("cyclic"), None);
}

// ============================================================
// Branching
// ============================================================

#[tokio::test]
async fn branch_prunes_unselected_children() {
    let engine = engine();
    let log = attach_log(&engine);
    let decide = MockDecision::selecting(["high"]);
    let high = ok("high");
    let low = ok("low");
    let low_next = ok("low_next");

    let result = engine
        .run(dag(
            "branch",
            vec![
                Task::branch("check", decide.clone()),
                Task::action("high", high.clone()),
                Task::action("low", low.clone()),
                Task::action("low_next", low_next.clone()),
            ],
            &[("check", "high"), ("check", "low"), ("low", "low_next")],
        ))
        .await
        .unwrap();

    assert_eq!(decide.call_count(), 1);
    assert_eq!(result.value("check").unwrap(), &json!(["high"]));
    assert!(result.value("high").is_some());
    assert!(result.is_skipped("low"));
    assert_eq!((high.call_count(), low.call_count()), (1, 0));

    // Only direct children are marked skipped; descendants just never run.
    assert_eq!(low_next.call_count(), 0);
    assert!(!result.results.contains_key("low_next"));
    assert_eq!(result.unresolved, vec!["low_next"]);

    assert!(log.contains("task_skipped(low)"));
    assert!(!log.contains("task_skipped(low_next)"));
    assert_eq!(result.batches, vec![vec!["check"], vec!["high"]]);
}

#[tokio::test]
async fn join_behind_pruned_branch_never_runs() {
    let engine = engine();
    let join = ok("join");

    let result = engine
        .run(dag(
            "join",
            vec![
                Task::branch("check", MockDecision::selecting(["high"])),
                Task::action("high", ok("high")),
                Task::action("low", ok("low")),
                Task::action("join", join.clone()),
            ],
            &[
                ("check", "high"),
                ("check", "low"),
                ("high", "join"),
                ("low", "join"),
            ],
        ))
        .await
        .unwrap();

    assert_eq!(result.status, RunState::Completed);
    assert_eq!(join.call_count(), 0);
    assert!(!result.results.contains_key("join"));
    assert_eq!(result.unresolved, vec!["join"]);
}

#[tokio::test]
async fn branch_selecting_empty_list_skips_all_children() {
    let engine = engine();

    let result = engine
        .run(dag(
            "none",
            vec![
                Task::branch("check", MockDecision::selecting(Vec::<String>::new())),
                Task::action("x", ok("x")),
                Task::action("y", ok("y")),
            ],
            &[("check", "x"), ("check", "y")],
        ))
        .await
        .unwrap();

    assert!(result.is_skipped("x"));
    assert!(result.is_skipped("y"));
    assert!(result.is_clean());
}

#[tokio::test]
async fn branch_selecting_non_child_fails() {
    let engine = engine();
    let log = attach_log(&engine);

    let result = engine
        .run(dag(
            "stray",
            vec![
                Task::branch("check", MockDecision::selecting(["other"])),
                Task::action("child", ok("child")),
                Task::action("other", ok("other")),
            ],
            &[("check", "child")],
        ))
        .await
        .unwrap();

    let message = &result.failed["check"];
    assert!(message.contains("failed validation"), "{message}");
    assert!(message.contains("'other'"), "{message}");
    assert!(log.contains("task_failed(check)"));
    assert!(!result.results.contains_key("child"));
    assert_eq!(result.unresolved, vec!["child"]);
    // `other` is an independent root and runs regardless.
    assert!(result.value("other").is_some());
}

#[tokio::test]
async fn branch_returning_non_list_fails() {
    let engine = engine();

    let result = engine
        .run(dag(
            "shape",
            vec![
                Task::branch("check", MockDecision::returning_raw(json!("child"))),
                Task::action("child", ok("child")),
            ],
            &[("check", "child")],
        ))
        .await
        .unwrap();

    assert!(result.failed["check"].contains("list of task names"));
    assert_eq!(result.unresolved, vec!["child"]);
}

// ============================================================
// Failures, retries and compensation
// ============================================================

#[tokio::test]
async fn fatal_failure_leaves_descendants_unresolved() {
    let engine = engine();
    let log = attach_log(&engine);
    let undo = ok("undo");
    let child = ok("child");
    let sibling = ok("sibling");

    let result = engine
        .run(dag(
            "fatal",
            vec![
                Task::action("boom", MockAction::failing_fatal("boom", "disk on fire"))
                    .with_undo(undo.clone()),
                Task::action("sibling", sibling.clone()),
                Task::action("child", child.clone()),
            ],
            &[("boom", "child")],
        ))
        .await
        .unwrap();

    assert_eq!(result.status, RunState::Completed);
    assert!(!result.is_clean());
    assert_eq!(result.failed["boom"], "task 'boom' failed: disk on fire");
    assert_eq!(sibling.call_count(), 1);
    assert_eq!(child.call_count(), 0);
    assert_eq!(result.unresolved, vec!["child"]);
    assert_eq!(undo.call_count(), 1);

    let trace = log.trace();
    assert!(trace.contains(&"task_failed(boom)".to_owned()));
    assert!(trace.contains(&"task_completed(sibling)".to_owned()));
    assert_eq!(trace.last().map(String::as_str), Some("workflow_completed"));
}

#[tokio::test]
async fn panicking_compensation_does_not_stop_run() {
    let engine = engine();

    let result = engine
        .run(dag(
            "undo-panic",
            vec![
                Task::action("boom", MockAction::failing_fatal("boom", "nope"))
                    .with_undo(MockAction::panicking("undo", "undo blew up")),
                Task::action("other", ok("other")),
                Task::action("after", ok("after")),
            ],
            &[("other", "after")],
        ))
        .await
        .unwrap();

    assert!(result.failed.contains_key("boom"));
    assert!(result.value("after").is_some());
}

#[tokio::test]
async fn retryable_failures_are_retried_with_backoff() {
    let engine = Arc::new(WorkflowEngine::with_config(
        &EngineConfig::default().with_retry_base_delay(Duration::from_millis(1)),
    ));
    let flaky = MockAction::flaky("flaky", 2, json!({ "done": true }));
    let stubborn = MockAction::flaky("stubborn", 3, json!({}));

    let result = engine
        .run(dag(
            "retry",
            vec![
                Task::action("flaky", flaky.clone()).with_retries(2),
                Task::action("stubborn", stubborn.clone()).with_retries(1),
            ],
            &[],
        ))
        .await
        .unwrap();

    assert_eq!(flaky.call_count(), 3);
    assert_eq!(result.value("flaky").unwrap()["done"], true);

    assert_eq!(stubborn.call_count(), 2);
    assert!(result.failed["stubborn"].contains("after 2 attempts"));
}

#[tokio::test]
async fn panicking_task_is_recorded_and_releases_its_resource() {
    let backend = Arc::new(LocalBackend::new(&EngineConfig::default().with_pool_size(2)));
    let engine = WorkflowEngine::new(backend.clone());

    let result = engine
        .run(dag(
            "panic",
            vec![
                Task::action("bad", MockAction::panicking("bad", "kaboom")),
                Task::action("good", ok("good")),
            ],
            &[],
        ))
        .await
        .unwrap();

    assert!(result.failed["bad"].contains("kaboom"));
    assert!(result.value("good").is_some());
    assert_eq!(backend.pool().in_use(), 0);
    assert_eq!(backend.idle_workers(), backend.max_workers());
}

#[tokio::test]
async fn exhausted_pool_fails_the_task_that_could_not_check_out() {
    let config = EngineConfig::default().with_max_workers(2).with_pool_size(1);
    let backend = Arc::new(LocalBackend::new(&config));
    let engine = WorkflowEngine::new(backend.clone());

    let result = engine
        .run(dag(
            "pool",
            vec![
                Task::action("one", Sleeper(Duration::from_millis(100))),
                Task::action("two", Sleeper(Duration::from_millis(100))),
            ],
            &[],
        ))
        .await
        .unwrap();

    assert_eq!(result.failed.len(), 1);
    assert!(result.failed.values().all(|m| m.contains("resource pool exhausted")));
    assert_eq!(result.results.len(), 1);
    assert_eq!(backend.pool().in_use(), 0);
}

// ============================================================
// Pause / resume and run registration
// ============================================================

#[tokio::test]
async fn pause_holds_next_batch_until_resume() {
    let engine = engine();
    let log = attach_log(&engine);
    let gate = Gate::new();
    let b = ok("b");

    let handle = engine.spawn(dag(
        "pausable",
        vec![gate.task("a"), Task::action("b", b.clone())],
        &[("a", "b")],
    ));

    gate.wait_started().await;
    assert_eq!(engine.state("pausable"), Some(RunState::Running));
    assert!(!engine.resume("pausable"), "resume of a running run is a no-op");

    assert!(engine.pause("pausable"));
    assert!(!engine.pause("pausable"), "second pause is a no-op");
    assert_eq!(engine.state("pausable"), Some(RunState::Paused));

    // The in-flight task finishes; the next batch is held back.
    gate.open();
    eventually(|| log.contains("task_completed(a)")).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(b.call_count(), 0);

    assert!(engine.resume("pausable"));
    let result = handle.await.unwrap().unwrap();

    assert_eq!(b.call_count(), 1);
    assert_eq!(result.batches, vec![vec!["a"], vec!["b"]]);
    assert_eq!(
        log.trace(),
        vec![
            "workflow_started",
            "workflow_paused",
            "task_completed(a)",
            "workflow_resumed",
            "task_completed(b)",
            "workflow_completed",
        ]
    );
    assert_eq!(engine.state("pausable"), None);
}

#[tokio::test]
async fn pause_during_last_batch_completes_without_resume() {
    let engine = engine();
    let log = attach_log(&engine);
    let gate = Gate::new();

    let handle = engine.spawn(dag("last", vec![gate.task("a")], &[]));

    gate.wait_started().await;
    assert!(engine.pause("last"));
    gate.open();

    let result = handle.await.unwrap().unwrap();

    assert_eq!(result.status, RunState::Completed);
    assert_eq!(engine.state("last"), None);
    assert!(!engine.resume("last"));
    assert_eq!(
        log.trace(),
        vec![
            "workflow_started",
            "workflow_paused",
            "task_completed(a)",
            "workflow_completed",
        ]
    );
}

#[tokio::test]
async fn independent_runs_share_observers_but_not_run_state() {
    let engine = engine();
    let log = attach_log(&engine);
    let gate_a = Gate::new();
    let gate_b = Gate::new();
    let a2 = ok("a2");
    let b2 = ok("b2");

    let run_a = engine.spawn(dag(
        "wa",
        vec![gate_a.task("a1"), Task::action("a2", a2.clone())],
        &[("a1", "a2")],
    ));
    let run_b = engine.spawn(dag(
        "wb",
        vec![gate_b.task("b1"), Task::action("b2", b2.clone())],
        &[("b1", "b2")],
    ));

    gate_a.wait_started().await;
    gate_b.wait_started().await;
    assert!(engine.pause("wa"));
    assert_eq!(engine.state("wb"), Some(RunState::Running));

    gate_a.open();
    gate_b.open();

    // The unpaused run finishes while the paused one holds its next batch.
    let result_b = run_b.await.unwrap().unwrap();
    assert!(result_b.value("b2").is_some());
    assert_eq!(b2.call_count(), 1);

    eventually(|| log.contains("task_completed(a1)")).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(a2.call_count(), 0);
    assert_eq!(engine.state("wa"), Some(RunState::Paused));

    assert!(engine.resume("wa"));
    let result_a = run_a.await.unwrap().unwrap();
    assert!(result_a.value("a2").is_some());
    assert_eq!(result_a.batches, vec![vec!["a1"], vec!["a2"]]);

    let events = log.events();
    assert_eq!(events.len(), 10);
    let per_run = |id: &str| events.iter().filter(|e| e.workflow_id() == id).count();
    assert_eq!(per_run("wa"), 6);
    assert_eq!(per_run("wb"), 4);
}

#[tokio::test]
async fn pause_and_resume_of_unknown_run_are_noops() {
    let engine = engine();
    let log = attach_log(&engine);

    assert!(!engine.pause("ghost"));
    assert!(!engine.resume("ghost"));
    assert_eq!(engine.state("ghost"), None);
    assert!(log.events().is_empty());
}

#[tokio::test]
async fn concurrent_run_with_same_id_is_rejected() {
    let engine = engine();
    let gate = Gate::new();

    let handle = engine.spawn(dag("dup", vec![gate.task("a")], &[]));
    gate.wait_started().await;

    let err = engine
        .run(dag("dup", vec![Task::action("x", ok("x"))], &[]))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::AlreadyRunning("dup".into()));

    gate.open();
    handle.await.unwrap().unwrap();
    assert_eq!(gate.calls(), 1);

    // Once finished, the ID is free again.
    let rerun = engine
        .run(dag("dup", vec![Task::action("x", ok("x"))], &[]))
        .await
        .unwrap();
    assert!(rerun.value("x").is_some());
}

// ============================================================
// Observers
// ============================================================

#[tokio::test]
async fn detached_observer_stops_receiving_mid_run() {
    let engine = engine();
    let kept = attach_log(&engine);
    let leaving = Arc::new(EventLog::default());
    let leaving_dyn: Arc<dyn Observer> = leaving.clone();
    engine.attach(&leaving_dyn);

    let gate = Gate::new();
    let handle = engine.spawn(dag(
        "detach",
        vec![gate.task("a"), Task::action("b", ok("b"))],
        &[("a", "b")],
    ));

    gate.wait_started().await;
    assert!(engine.detach(&leaving_dyn));
    gate.open();
    handle.await.unwrap().unwrap();

    assert_eq!(leaving.trace(), vec!["workflow_started"]);
    assert_eq!(kept.events().first(), leaving.events().first());
    assert_eq!(
        kept.trace(),
        vec![
            "workflow_started",
            "task_completed(a)",
            "task_completed(b)",
            "workflow_completed",
        ]
    );
}

#[tokio::test]
async fn dropped_observer_is_not_kept_alive() {
    let engine = engine();
    let log = attach_log(&engine);
    let weak = Arc::downgrade(&log);
    drop(log);

    engine
        .run(dag("dropped", vec![Task::action("a", ok("a"))], &[]))
        .await
        .unwrap();

    assert!(weak.upgrade().is_none());
}
