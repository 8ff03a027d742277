//! `tasks` crate — the `Task` abstraction, its body traits, and built-in bodies.
//!
//! Every task is either an action or a branch. The engine crate schedules
//! tasks and dispatches their bodies through [`Task::execute`].

pub mod builtin;
pub mod error;
pub mod mock;
pub mod task;
pub mod traits;

pub use error::TaskError;
pub use task::{Task, TaskKind, TaskKindTag, TaskOutput};
pub use traits::{Action, Decision, Params, TaskContext};
