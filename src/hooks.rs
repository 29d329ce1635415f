// src/hooks.rs
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::error::{FlowError, TaskError};
use crate::task::{TaskOutcome, TaskRef};

/// Fired once before any task is invoked, with the run's task collection.
pub type BeforeHook<C> = Arc<dyn Fn(&Arc<C>, &[TaskRef]) + Send + Sync>;
/// Fired before each task's invocation.
pub type BeforeEachHook<C> = Arc<dyn Fn(&TaskRef, &Arc<C>) + Send + Sync>;
/// Fired exactly once per task with its terminal outcome, before the slot
/// is reported to the batch runner.
pub type AfterEachHook<C> = Arc<dyn Fn(Option<&TaskError>, Option<&Value>, &TaskRef, &Arc<C>) + Send + Sync>;
/// Fired once after the run settles or aborts, before the caller observes
/// the result.
pub type AfterHook<C> = Arc<dyn Fn(Option<&FlowError>, &[TaskOutcome], &Arc<C>) + Send + Sync>;
/// Fired for every task failure, in both settle and fail-fast mode.
pub type ErrorHook<C> = Arc<dyn Fn(&TaskError, &Arc<C>) + Send + Sync>;

/// Handlers registered through the engine's `on_*` pub/sub surface.
///
/// Direct option hooks and subscribers feed the same `HookDispatcher`, so
/// the two attachment surfaces stay behaviorally identical.
pub(crate) struct SubscriberSet<C> {
    inner: RwLock<Subscribers<C>>,
}

pub(crate) struct Subscribers<C> {
    pub before: Vec<BeforeHook<C>>,
    pub before_each: Vec<BeforeEachHook<C>>,
    pub after_each: Vec<AfterEachHook<C>>,
    pub after: Vec<AfterHook<C>>,
    pub error: Vec<ErrorHook<C>>,
}

impl<C> Default for Subscribers<C> {
    fn default() -> Self {
        Self {
            before: Vec::new(),
            before_each: Vec::new(),
            after_each: Vec::new(),
            after: Vec::new(),
            error: Vec::new(),
        }
    }
}

impl<C> Clone for Subscribers<C> {
    fn clone(&self) -> Self {
        Self {
            before: self.before.clone(),
            before_each: self.before_each.clone(),
            after_each: self.after_each.clone(),
            after: self.after.clone(),
            error: self.error.clone(),
        }
    }
}

impl<C> Default for SubscriberSet<C> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Subscribers::default()),
        }
    }
}

impl<C> SubscriberSet<C> {
    pub fn add_before(&self, hook: BeforeHook<C>) {
        self.inner.write().before.push(hook);
    }

    pub fn add_before_each(&self, hook: BeforeEachHook<C>) {
        self.inner.write().before_each.push(hook);
    }

    pub fn add_after_each(&self, hook: AfterEachHook<C>) {
        self.inner.write().after_each.push(hook);
    }

    pub fn add_after(&self, hook: AfterHook<C>) {
        self.inner.write().after.push(hook);
    }

    pub fn add_error(&self, hook: ErrorHook<C>) {
        self.inner.write().error.push(hook);
    }

    pub fn snapshot(&self) -> Subscribers<C> {
        self.inner.read().clone()
    }
}

/// Per-run invocation path for every lifecycle hook.
///
/// Built once at run start from the merged options and a snapshot of the
/// subscriber registry; direct hooks fire before subscribers, matching the
/// original call-then-emit order. Hook panics are not caught.
pub(crate) struct HookDispatcher<C> {
    before: Vec<BeforeHook<C>>,
    before_each: Vec<BeforeEachHook<C>>,
    after_each: Vec<AfterEachHook<C>>,
    after: Vec<AfterHook<C>>,
    error: Vec<ErrorHook<C>>,
}

impl<C> HookDispatcher<C> {
    pub fn new(
        before: Option<BeforeHook<C>>,
        before_each: Option<BeforeEachHook<C>>,
        after_each: Option<AfterEachHook<C>>,
        after: Option<AfterHook<C>>,
        subscribers: Subscribers<C>,
    ) -> Self {
        let mut dispatcher = Self {
            before: before.into_iter().collect(),
            before_each: before_each.into_iter().collect(),
            after_each: after_each.into_iter().collect(),
            after: after.into_iter().collect(),
            error: Vec::new(),
        };
        dispatcher.before.extend(subscribers.before);
        dispatcher.before_each.extend(subscribers.before_each);
        dispatcher.after_each.extend(subscribers.after_each);
        dispatcher.after.extend(subscribers.after);
        dispatcher.error.extend(subscribers.error);
        dispatcher
    }

    pub fn fire_before(&self, context: &Arc<C>, tasks: &[TaskRef]) {
        for hook in &self.before {
            hook(context, tasks);
        }
    }

    pub fn fire_before_each(&self, task: &TaskRef, context: &Arc<C>) {
        for hook in &self.before_each {
            hook(task, context);
        }
    }

    pub fn fire_after_each(
        &self,
        error: Option<&TaskError>,
        value: Option<&Value>,
        task: &TaskRef,
        context: &Arc<C>,
    ) {
        for hook in &self.after_each {
            hook(error, value, task, context);
        }
    }

    pub fn fire_after(&self, error: Option<&FlowError>, results: &[TaskOutcome], context: &Arc<C>) {
        for hook in &self.after {
            hook(error, results, context);
        }
    }

    pub fn fire_error(&self, error: &TaskError, context: &Arc<C>) {
        for hook in &self.error {
            hook(error, context);
        }
    }
}
