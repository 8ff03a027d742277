//! `engine` crate — DAG model, scheduling, execution backend, resource pool
//! and lifecycle events.
//!
//! A [`Dag`] is either built by hand or from a [`WorkflowDefinition`] via a
//! [`HandlerRegistry`], then run by a [`WorkflowEngine`].

pub mod backend;
pub mod command;
pub mod config;
pub mod dag;
pub mod error;
pub mod executor;
pub mod models;
pub mod observer;
pub mod pool;
pub mod registry;

pub use backend::{ExecutionBackend, LocalBackend, PendingTask};
pub use config::EngineConfig;
pub use dag::Dag;
pub use error::EngineError;
pub use executor::WorkflowEngine;
pub use models::{RunState, TaskDefinition, TaskOutcome, WorkflowDefinition, WorkflowResult};
pub use observer::{Event, Observer, ObserverId, Subject, TracingObserver};
pub use pool::{PooledResource, ResourceHandle, ResourcePool};
pub use registry::HandlerRegistry;

#[cfg(test)]
mod engine_tests;
