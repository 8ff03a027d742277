//! Handler registry: maps handler names to task bodies, and turns workflow
//! definitions into DAGs.
//!
//! The registry is built once at startup; nothing registers itself at
//! runtime.

use std::collections::HashMap;
use std::sync::Arc;

use tasks::builtin::{Echo, Noop, Select};
use tasks::{Action, Decision, Task, TaskKind, TaskKindTag};

use crate::models::{TaskDefinition, WorkflowDefinition};
use crate::{Dag, EngineError};

/// Handler used by action tasks that don't name one.
pub const DEFAULT_ACTION_HANDLER: &str = "echo";
/// Handler used by branch tasks that don't name one.
pub const DEFAULT_BRANCH_HANDLER: &str = "select";

/// Maps handler names to action and decision bodies.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
    decisions: HashMap<String, Arc<dyn Decision>>,
}

impl HandlerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in `echo`, `noop` and `select` handlers.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry
            .register_action("echo", Echo)
            .register_action("noop", Noop)
            .register_decision("select", Select);
        registry
    }

    pub fn register_action(&mut self, name: impl Into<String>, body: impl Action + 'static) -> &mut Self {
        self.actions.insert(name.into(), Arc::new(body));
        self
    }

    pub fn register_decision(
        &mut self,
        name: impl Into<String>,
        body: impl Decision + 'static,
    ) -> &mut Self {
        self.decisions.insert(name.into(), Arc::new(body));
        self
    }

    /// Build the task described by `def`.
    ///
    /// # Errors
    /// [`EngineError::UnknownHandler`] if the handler isn't registered for
    /// the task's kind.
    pub fn instantiate(&self, def: &TaskDefinition) -> Result<Task, EngineError> {
        let handler = def.handler.as_deref().unwrap_or(match def.kind {
            TaskKindTag::Action => DEFAULT_ACTION_HANDLER,
            TaskKindTag::Branch => DEFAULT_BRANCH_HANDLER,
        });

        let kind = match def.kind {
            TaskKindTag::Action => self.actions.get(handler).cloned().map(TaskKind::Action),
            TaskKindTag::Branch => self.decisions.get(handler).cloned().map(TaskKind::Branch),
        }
        .ok_or_else(|| EngineError::UnknownHandler {
            task: def.name.clone(),
            handler: handler.to_owned(),
        })?;

        Ok(Task::new(def.name.clone(), kind).with_params(def.params.clone()))
    }
}

impl WorkflowDefinition {
    /// Build a validated, acyclic DAG from this definition.
    ///
    /// # Errors
    /// - [`EngineError::DuplicateTask`] if two tasks share a name.
    /// - [`EngineError::UnknownHandler`] for an unregistered handler.
    /// - [`EngineError::Validation`] if a task fails [`Task::validate`].
    /// - [`EngineError::UnknownTaskReference`] for a dependency on an
    ///   undeclared task.
    /// - [`EngineError::CycleDetected`] if dependencies form a cycle.
    pub fn build(&self, registry: &HandlerRegistry) -> Result<Dag, EngineError> {
        let mut dag = Dag::new(self.id.clone()).with_params(self.params.clone());

        for def in &self.tasks {
            let task = registry.instantiate(def)?;
            task.validate().map_err(|err| EngineError::Validation {
                task: def.name.clone(),
                message: err.message().to_owned(),
            })?;
            if !dag.add_task(task) {
                return Err(EngineError::DuplicateTask(def.name.clone()));
            }
        }

        for def in &self.tasks {
            for parent in &def.dependencies {
                dag.add_edge(parent, &def.name)?;
            }
        }

        dag.layers()?;
        Ok(dag)
    }
}
