use serde::Serialize;
use thiserror::Error;

use crate::task::TaskRef;

/// Failure of a single task, annotated with the slot it occupied.
///
/// In settle mode these end up embedded in the result sequence as
/// `TaskOutcome::Rejected`; in fail-fast mode the first one aborts the run
/// as `FlowError::Task`. The originating error is flattened to a message so
/// outcomes stay cloneable and serializable.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[error("task {task} failed: {message}")]
pub struct TaskError {
    pub task: TaskRef,
    pub message: String,
}

impl TaskError {
    pub(crate) fn new(task: TaskRef, source: anyhow::Error) -> Self {
        Self {
            task,
            message: source.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum FlowError {
    /// Structural misuse of the API, reported eagerly at call time and never
    /// through a run result.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A task failed while the run was in fail-fast mode.
    #[error(transparent)]
    Task(#[from] TaskError),
}

impl FlowError {
    /// The failing task's annotation, when this error came out of a run.
    pub fn task(&self) -> Option<&TaskError> {
        match self {
            FlowError::Task(err) => Some(err),
            _ => None,
        }
    }
}

pub type FlowResult<T> = std::result::Result<T, FlowError>;
