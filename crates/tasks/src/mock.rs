//! `MockAction` / `MockDecision` — test doubles for task bodies.
//!
//! Useful in unit and integration tests where a real task body is either
//! unavailable or irrelevant. Each mock records the params it was called with
//! and can be cloned; clones share the call log.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::{Action, Decision, Params, TaskContext, TaskError};

/// Behaviour injected into `MockAction` at construction time.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Fail with a `Retryable` error.
    FailRetryable(String),
    /// Fail with a `Fatal` error.
    FailFatal(String),
    /// Fail with a `Retryable` error for the first `n` calls, then return the value.
    FlakyThen(usize, Value),
    /// Panic inside the body.
    Panic(String),
}

/// A mock body that records every call it receives and returns a
/// programmer-specified result.
#[derive(Debug, Clone)]
pub struct MockAction {
    /// Label used in test assertions and merged into the output.
    pub name: String,
    /// What the body will do when `run` is called.
    pub behaviour: MockBehaviour,
    /// All params seen by this body (in call order).
    pub calls: Arc<Mutex<Vec<Params>>>,
}

impl MockAction {
    fn with_behaviour(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a mock that always succeeds with the given value.
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::ReturnValue(value))
    }

    /// Create a mock that always fails with a `Fatal` error.
    pub fn failing_fatal(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::FailFatal(msg.into()))
    }

    /// Create a mock that always fails with a `Retryable` error.
    pub fn failing_retryable(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::FailRetryable(msg.into()))
    }

    /// Create a mock that fails `failures` times before succeeding.
    pub fn flaky(name: impl Into<String>, failures: usize, value: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::FlakyThen(failures, value))
    }

    /// Create a mock whose body panics.
    pub fn panicking(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::Panic(msg.into()))
    }

    /// Number of times this body has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or(0)
    }

    fn record(&self, params: &Params) -> usize {
        match self.calls.lock() {
            Ok(mut calls) => {
                calls.push(params.clone());
                calls.len()
            }
            Err(poisoned) => {
                let mut calls = poisoned.into_inner();
                calls.push(params.clone());
                calls.len()
            }
        }
    }

    fn output(&self, v: &Value) -> Value {
        // Merge the task's own name with the configured value so tests can
        // trace which body produced a result.
        let Some(v_obj) = v.as_object() else {
            return v.clone();
        };
        let mut out = Params::new();
        out.insert("task".into(), json!(self.name));
        for (k, val) in v_obj {
            out.insert(k.clone(), val.clone());
        }
        Value::Object(out)
    }
}

#[async_trait]
impl Action for MockAction {
    async fn run(&self, _ctx: &TaskContext, params: &Params) -> Result<Value, TaskError> {
        let call = self.record(params);

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => Ok(self.output(v)),
            MockBehaviour::FailRetryable(msg) => Err(TaskError::Retryable(msg.clone())),
            MockBehaviour::FailFatal(msg) => Err(TaskError::Fatal(msg.clone())),
            MockBehaviour::FlakyThen(failures, v) => {
                if call <= *failures {
                    Err(TaskError::Retryable(format!("{} flaked on call {call}", self.name)))
                } else {
                    Ok(self.output(v))
                }
            }
            MockBehaviour::Panic(msg) => panic!("{msg}"),
        }
    }
}

/// A mock branch body that always selects the same children.
#[derive(Debug, Clone)]
pub struct MockDecision {
    /// Raw value returned from `decide`; need not be a valid selection.
    pub selection: Value,
    calls: Arc<AtomicUsize>,
}

impl MockDecision {
    /// Select the given child names.
    pub fn selecting<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<Value> = names.into_iter().map(|n| Value::String(n.into())).collect();
        Self::returning_raw(Value::Array(names))
    }

    /// Return `value` verbatim, e.g. to exercise shape validation.
    pub fn returning_raw(value: Value) -> Self {
        Self {
            selection: value,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Decision for MockDecision {
    async fn decide(&self, _ctx: &TaskContext, _params: &Params) -> Result<Value, TaskError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.selection.clone())
    }
}
