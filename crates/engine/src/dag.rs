//! The task graph a workflow run executes.
//!
//! Rules:
//! 1. Task names are unique; re-adding a name keeps the first task.
//! 2. Every edge references tasks present in the DAG.
//! 3. The graph must be acyclic. This is checked by [`Dag::layers`], which
//!    the engine calls before a run starts.
//!
//! Tasks and child sets live in ordered maps so batch layering and event
//! order are deterministic.

use std::collections::{BTreeMap, BTreeSet};

use tasks::{Params, Task};

use crate::EngineError;

/// A workflow's tasks plus parent → children adjacency.
#[derive(Debug, Clone)]
pub struct Dag {
    workflow_id: String,
    params: Params,
    tasks: BTreeMap<String, Task>,
    children: BTreeMap<String, BTreeSet<String>>,
}

impl Dag {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            params: Params::new(),
            tasks: BTreeMap::new(),
            children: BTreeMap::new(),
        }
    }

    /// Workflow-wide parameters handed to every task through its context.
    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Insert `task` with an empty child set.
    ///
    /// Idempotent: if a task with the same name exists it is kept and `false`
    /// is returned.
    pub fn add_task(&mut self, task: Task) -> bool {
        let name = task.name().to_owned();
        if self.tasks.contains_key(&name) {
            return false;
        }
        self.children.entry(name.clone()).or_default();
        self.tasks.insert(name, task);
        true
    }

    /// Record `parent → child`, adding either task if absent.
    pub fn add_dependency(&mut self, parent: &Task, child: &Task) {
        self.add_task(parent.clone());
        self.add_task(child.clone());
        self.children
            .entry(parent.name().to_owned())
            .or_default()
            .insert(child.name().to_owned());
    }

    /// Record `parent → child` between tasks already in the DAG.
    ///
    /// # Errors
    /// [`EngineError::UnknownTaskReference`] if either name is missing.
    pub fn add_edge(&mut self, parent: &str, child: &str) -> Result<(), EngineError> {
        if !self.tasks.contains_key(parent) {
            return Err(EngineError::UnknownTaskReference {
                task: parent.to_owned(),
                side: "parent",
            });
        }
        if !self.tasks.contains_key(child) {
            return Err(EngineError::UnknownTaskReference {
                task: child.to_owned(),
                side: "child",
            });
        }
        self.children
            .entry(parent.to_owned())
            .or_default()
            .insert(child.to_owned());
        Ok(())
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.get(name)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Declared children of `name`; empty for unknown names.
    pub fn children(&self, name: &str) -> impl Iterator<Item = &str> {
        self.children
            .get(name)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    /// Tasks that never appear as the child of any edge.
    pub fn roots(&self) -> Vec<&Task> {
        let in_degree = self.in_degrees();
        self.tasks
            .values()
            .filter(|t| in_degree.get(t.name()).copied().unwrap_or(0) == 0)
            .collect()
    }

    /// Number of incoming edges per task.
    pub fn in_degrees(&self) -> BTreeMap<String, usize> {
        let mut in_degree: BTreeMap<String, usize> =
            self.tasks.keys().map(|name| (name.clone(), 0)).collect();

        for child in self.children.values().flatten() {
            *in_degree.entry(child.clone()).or_insert(0) += 1;
        }

        in_degree
    }

    /// Group tasks into batches that may run together, in dependency order
    /// (Kahn's algorithm, one level at a time).
    ///
    /// This is the layering a run produces when no task fails or is pruned.
    ///
    /// # Errors
    /// [`EngineError::CycleDetected`] listing every task that could not be
    /// placed.
    pub fn layers(&self) -> Result<Vec<Vec<String>>, EngineError> {
        let mut in_degree = self.in_degrees();

        let mut current: Vec<String> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(name, _)| name.clone())
            .collect();

        let mut layers = Vec::new();
        let mut placed = 0usize;

        while !current.is_empty() {
            let mut next = Vec::new();
            for name in &current {
                for child in self.children(name) {
                    if let Some(deg) = in_degree.get_mut(child) {
                        *deg -= 1;
                        if *deg == 0 {
                            next.push(child.to_owned());
                        }
                    }
                }
            }
            placed += current.len();
            next.sort();
            layers.push(std::mem::replace(&mut current, next));
        }

        // If we didn't place every task the graph contains a cycle.
        if placed != self.tasks.len() {
            let stuck = in_degree
                .into_iter()
                .filter(|(_, d)| *d > 0)
                .map(|(name, _)| name)
                .collect();
            return Err(EngineError::CycleDetected(stuck));
        }

        Ok(layers)
    }
}
