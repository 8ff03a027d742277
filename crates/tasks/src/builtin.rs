//! Built-in task bodies available to every workflow definition.

use async_trait::async_trait;
use serde_json::Value;

use crate::{Action, Decision, Params, TaskContext, TaskError};

/// Returns the task's own params as its result.
#[derive(Debug, Clone, Copy, Default)]
pub struct Echo;

#[async_trait]
impl Action for Echo {
    async fn run(&self, _ctx: &TaskContext, params: &Params) -> Result<Value, TaskError> {
        Ok(Value::Object(params.clone()))
    }
}

/// Does nothing and returns `null`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Noop;

#[async_trait]
impl Action for Noop {
    async fn run(&self, _ctx: &TaskContext, _params: &Params) -> Result<Value, TaskError> {
        Ok(Value::Null)
    }
}

/// Branch decision that follows the children listed in the `next` param.
///
/// A missing `next` selects nothing; a malformed one is passed through so the
/// task's shape check reports it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Select;

/// Param read by [`Select`].
pub const SELECT_PARAM: &str = "next";

#[async_trait]
impl Decision for Select {
    async fn decide(&self, _ctx: &TaskContext, params: &Params) -> Result<Value, TaskError> {
        Ok(params
            .get(SELECT_PARAM)
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new())))
    }
}
