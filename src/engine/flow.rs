// src/engine/flow.rs
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, FlowResult};
use crate::options::FlowOptions;
use crate::task::{TaskList, TaskOutcome};

use super::FlowEngine;

/// Execution strategy for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flow {
    /// One task at a time, in input order.
    Series,
    /// All tasks at once; results still ordered by input position.
    Parallel,
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flow::Series => f.write_str("series"),
            Flow::Parallel => f.write_str("parallel"),
        }
    }
}

impl FromStr for Flow {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, FlowError> {
        match s {
            "series" => Ok(Flow::Series),
            "parallel" => Ok(Flow::Parallel),
            other => Err(FlowError::InvalidArgument(format!(
                "unknown flow `{}`, expected \"series\" or \"parallel\"",
                other
            ))),
        }
    }
}

/// Reusable runner produced by [`FlowEngine::compose`], bound to one flow
/// strategy and an optional options overlay. Running it is equivalent to
/// calling `series`/`parallel` on the engine directly.
pub struct FlowRunner<'a, C> {
    engine: &'a FlowEngine<C>,
    flow: Flow,
    overrides: Option<FlowOptions<C>>,
}

impl<'a, C: Send + Sync + 'static> FlowRunner<'a, C> {
    pub(crate) fn new(
        engine: &'a FlowEngine<C>,
        flow: Flow,
        overrides: Option<FlowOptions<C>>,
    ) -> Self {
        Self {
            engine,
            flow,
            overrides,
        }
    }

    pub fn flow(&self) -> Flow {
        self.flow
    }

    pub async fn run(&self, tasks: impl Into<TaskList<C>>) -> FlowResult<Vec<TaskOutcome>> {
        self.engine
            .run(self.flow, tasks.into(), self.overrides.clone())
            .await
    }

    /// Run with a further per-call overlay on top of the runner's options.
    pub async fn run_with(
        &self,
        tasks: impl Into<TaskList<C>>,
        options: FlowOptions<C>,
    ) -> FlowResult<Vec<TaskOutcome>> {
        let overlay = match &self.overrides {
            Some(base) => base.merge(options),
            None => options,
        };
        self.engine.run(self.flow, tasks.into(), Some(overlay)).await
    }
}

impl<C> fmt::Debug for FlowRunner<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowRunner")
            .field("flow", &self.flow)
            .finish()
    }
}
