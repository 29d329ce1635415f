// src/options.rs
use std::sync::Arc;

use serde_json::Value;

use crate::error::{FlowError, TaskError};
use crate::hooks::{AfterEachHook, AfterHook, BeforeEachHook, BeforeHook};
use crate::task::{TaskOutcome, TaskRef};

pub use crate::engine::iterator::TaskIterator;

/// Depth cap for nested task factories when none is configured.
pub const DEFAULT_NESTING_LIMIT: usize = 32;

/// Run configuration.
///
/// Every field is optional so a per-call options value shallow-merges onto
/// the engine's standing options: only explicitly set fields override. The
/// merged result is snapshotted at run start, so options are immutable for
/// the duration of one run.
pub struct FlowOptions<C> {
    /// Settle mode: errors are captured in place of their slot's result
    /// instead of aborting the run. Defaults to fail-fast.
    pub settle: Option<bool>,
    /// Extra arguments forwarded to every task invocation.
    pub params: Option<Vec<Value>>,
    /// Depth cap for nested task factories.
    pub nesting_limit: Option<usize>,
    pub before: Option<BeforeHook<C>>,
    pub before_each: Option<BeforeEachHook<C>>,
    pub after_each: Option<AfterEachHook<C>>,
    pub after: Option<AfterHook<C>>,
    /// Custom per-slot resolver; replaces the default entirely, including
    /// its hook firing.
    pub iterator: Option<TaskIterator<C>>,
    /// Shared execution context for this run; defaults to the engine's own.
    pub context: Option<Arc<C>>,
}

impl<C> Default for FlowOptions<C> {
    fn default() -> Self {
        Self {
            settle: None,
            params: None,
            nesting_limit: None,
            before: None,
            before_each: None,
            after_each: None,
            after: None,
            iterator: None,
            context: None,
        }
    }
}

impl<C> Clone for FlowOptions<C> {
    fn clone(&self) -> Self {
        Self {
            settle: self.settle,
            params: self.params.clone(),
            nesting_limit: self.nesting_limit,
            before: self.before.clone(),
            before_each: self.before_each.clone(),
            after_each: self.after_each.clone(),
            after: self.after.clone(),
            iterator: self.iterator.clone(),
            context: self.context.clone(),
        }
    }
}

impl<C> FlowOptions<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settle(mut self, settle: bool) -> Self {
        self.settle = Some(settle);
        self
    }

    pub fn params(mut self, params: Vec<Value>) -> Self {
        self.params = Some(params);
        self
    }

    pub fn nesting_limit(mut self, limit: usize) -> Self {
        self.nesting_limit = Some(limit);
        self
    }

    pub fn before(mut self, hook: impl Fn(&Arc<C>, &[TaskRef]) + Send + Sync + 'static) -> Self {
        self.before = Some(Arc::new(hook));
        self
    }

    pub fn before_each(mut self, hook: impl Fn(&TaskRef, &Arc<C>) + Send + Sync + 'static) -> Self {
        self.before_each = Some(Arc::new(hook));
        self
    }

    pub fn after_each(
        mut self,
        hook: impl Fn(Option<&TaskError>, Option<&Value>, &TaskRef, &Arc<C>) + Send + Sync + 'static,
    ) -> Self {
        self.after_each = Some(Arc::new(hook));
        self
    }

    pub fn after(
        mut self,
        hook: impl Fn(Option<&FlowError>, &[TaskOutcome], &Arc<C>) + Send + Sync + 'static,
    ) -> Self {
        self.after = Some(Arc::new(hook));
        self
    }

    pub fn iterator(mut self, iterator: TaskIterator<C>) -> Self {
        self.iterator = Some(iterator);
        self
    }

    pub fn context(mut self, context: Arc<C>) -> Self {
        self.context = Some(context);
        self
    }

    /// Shallow merge: fields explicitly set on `overrides` win, everything
    /// else keeps this value. Neither side is mutated.
    pub fn merge(&self, overrides: FlowOptions<C>) -> FlowOptions<C> {
        FlowOptions {
            settle: overrides.settle.or(self.settle),
            params: overrides.params.or_else(|| self.params.clone()),
            nesting_limit: overrides.nesting_limit.or(self.nesting_limit),
            before: overrides.before.or_else(|| self.before.clone()),
            before_each: overrides.before_each.or_else(|| self.before_each.clone()),
            after_each: overrides.after_each.or_else(|| self.after_each.clone()),
            after: overrides.after.or_else(|| self.after.clone()),
            iterator: overrides.iterator.or_else(|| self.iterator.clone()),
            context: overrides.context.or_else(|| self.context.clone()),
        }
    }
}
