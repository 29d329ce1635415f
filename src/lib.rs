//! Series/parallel flow orchestration with lifecycle hooks.
//!
//! An engine takes an ordered collection of [`Task`]s and runs them either
//! sequentially ([`FlowEngine::series`]) or concurrently
//! ([`FlowEngine::parallel`]), collecting results in input order and firing
//! `before`/`beforeEach`/`afterEach`/`after` hooks around the run. Runs are
//! fail-fast by default; settle mode captures each failure in its slot
//! instead of aborting.
//!
//! ```no_run
//! use asyncflow::{FlowEngine, FlowOptions, Task};
//! use serde_json::json;
//!
//! # async fn demo() -> asyncflow::FlowResult<()> {
//! let engine = FlowEngine::default();
//! let results = engine
//!     .series_with(
//!         vec![
//!             Task::value(|_| json!("foo")),
//!             Task::try_value(|_| Err::<serde_json::Value, _>(anyhow::anyhow!("oops"))),
//!         ],
//!         FlowOptions::new().settle(true),
//!     )
//!     .await?;
//! assert!(results[0].is_fulfilled());
//! assert!(results[1].is_rejected());
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod error;
pub mod hooks;
pub mod options;
pub mod task;

// Re-export main types for easier access
pub use engine::batch::{BatchRunner, TaskJob, TokioBatchRunner};
pub use engine::flow::{Flow, FlowRunner};
pub use engine::iterator::{TaskInvocation, TaskIterator};
pub use engine::FlowEngine;
pub use error::{FlowError, FlowResult, TaskError};
pub use hooks::{AfterEachHook, AfterHook, BeforeEachHook, BeforeHook, ErrorHook};
pub use options::{FlowOptions, DEFAULT_NESTING_LIMIT};
pub use task::{Proceed, Task, TaskArgs, TaskFuture, TaskList, TaskOutcome, TaskRef, TaskReturn};
