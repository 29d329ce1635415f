// src/engine/iterator.rs
use std::sync::Arc;

use serde_json::Value;
use tracing::trace;

use crate::error::{FlowError, TaskError};
use crate::task::{Task, TaskOutcome, TaskRef};

use super::batch::TaskJob;
use super::RunConfig;

/// Everything a custom per-slot resolver receives for one task.
pub struct TaskInvocation<C> {
    pub task: Task<C>,
    pub slot: TaskRef,
    pub context: Arc<C>,
    pub params: Arc<Vec<Value>>,
    pub settle: bool,
    pub nesting_limit: usize,
}

/// Custom per-slot resolver, configured through `FlowOptions::iterator`.
/// Replaces [`resolve_slot`] entirely, hook firing included.
pub type TaskIterator<C> = Arc<dyn Fn(TaskInvocation<C>) -> TaskJob + Send + Sync>;

/// Default per-slot resolver.
///
/// Fires `before_each`, drives the task to its terminal outcome, fires
/// `after_each` exactly once with that outcome, then branches on settle
/// mode: a failure either becomes the slot's result (`Rejected`) or aborts
/// the batch. Failures are annotated with the slot they came from before
/// any hook sees them.
pub(crate) async fn resolve_slot<C>(
    config: RunConfig<C>,
    slot: TaskRef,
    task: Task<C>,
) -> Result<TaskOutcome, FlowError> {
    config.hooks.fire_before_each(&slot, &config.context);
    trace!(slot = %slot, "invoking task");

    let outcome = task
        .resolve(
            config.context.clone(),
            config.params.clone(),
            config.nesting_limit,
        )
        .await;

    match outcome {
        Ok(value) => {
            config
                .hooks
                .fire_after_each(None, Some(&value), &slot, &config.context);
            Ok(TaskOutcome::Fulfilled(value))
        }
        Err(source) => {
            let err = TaskError::new(slot.clone(), source);
            trace!(slot = %slot, error = %err.message, "task failed");
            config
                .hooks
                .fire_after_each(Some(&err), None, &slot, &config.context);
            config.hooks.fire_error(&err, &config.context);
            if config.settle {
                Ok(TaskOutcome::Rejected(err))
            } else {
                Err(FlowError::Task(err))
            }
        }
    }
}
