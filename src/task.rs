// src/task.rs
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::TaskError;

/// Boxed future a task hands back when its outcome is asynchronous.
pub type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

type Action<C> = Box<dyn FnOnce(TaskArgs<C>) -> TaskReturn<C> + Send>;

/// Positional identity of a task within a run.
///
/// The index is load-bearing: results are always ordered by input position,
/// never by completion order, and task failures are annotated with the slot
/// they came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRef {
    pub index: usize,
    pub name: Option<String>,
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "`{}` (slot {})", name, self.index),
            None => write!(f, "slot {}", self.index),
        }
    }
}

/// Completion handle for callback-style tasks. Consuming it settles the
/// slot; once it has fired, the task's return value is no longer inspected.
pub struct Proceed {
    tx: oneshot::Sender<anyhow::Result<Value>>,
}

impl Proceed {
    pub(crate) fn channel() -> (Proceed, oneshot::Receiver<anyhow::Result<Value>>) {
        let (tx, rx) = oneshot::channel();
        (Proceed { tx }, rx)
    }

    /// Complete the slot with a value.
    pub fn resolve(self, value: impl Into<Value>) {
        let _ = self.tx.send(Ok(value.into()));
    }

    /// Complete the slot with an error.
    pub fn reject(self, error: impl Into<anyhow::Error>) {
        let _ = self.tx.send(Err(error.into()));
    }
}

/// Arguments every task invocation receives: the run's shared context and
/// the extra `params` configured for the run.
pub struct TaskArgs<C> {
    pub context: Arc<C>,
    pub params: Arc<Vec<Value>>,
    proceed: Option<Proceed>,
}

impl<C> TaskArgs<C> {
    /// Take the completion handle. Returns `None` if it was already taken.
    pub fn proceed(&mut self) -> Option<Proceed> {
        self.proceed.take()
    }
}

/// What one task invocation produced. The resolver loops over these until a
/// terminal outcome is reached.
pub enum TaskReturn<C> {
    /// Immediate success.
    Value(Value),
    /// Immediate failure.
    Failure(anyhow::Error),
    /// A further task to resolve in this slot (nested factory).
    Task(Task<C>),
    /// An awaitable whose resolution or rejection is the outcome.
    Future(TaskFuture),
    /// The task took its `Proceed` handle and completes through it. If the
    /// handle is dropped without firing, the slot fulfils with null.
    Deferred,
}

/// One element of a run's input collection.
pub struct Task<C> {
    name: Option<String>,
    action: Action<C>,
}

impl<C> Task<C> {
    pub fn new(action: impl FnOnce(TaskArgs<C>) -> TaskReturn<C> + Send + 'static) -> Self {
        Self {
            name: None,
            action: Box::new(action),
        }
    }

    /// Synchronous task producing a plain value.
    pub fn value<V>(f: impl FnOnce(TaskArgs<C>) -> V + Send + 'static) -> Self
    where
        V: Into<Value>,
    {
        Self::new(move |args| TaskReturn::Value(f(args).into()))
    }

    /// Synchronous fallible task.
    pub fn try_value<V>(f: impl FnOnce(TaskArgs<C>) -> anyhow::Result<V> + Send + 'static) -> Self
    where
        V: Into<Value>,
    {
        Self::new(move |args| match f(args) {
            Ok(value) => TaskReturn::Value(value.into()),
            Err(err) => TaskReturn::Failure(err),
        })
    }

    /// Fire-and-forget task whose only effect is mutating the shared
    /// context; the slot fulfils with null.
    pub fn effect(f: impl FnOnce(TaskArgs<C>) + Send + 'static) -> Self {
        Self::new(move |args| {
            f(args);
            TaskReturn::Value(Value::Null)
        })
    }

    /// Task producing an awaitable.
    pub fn future<V, Fut>(f: impl FnOnce(TaskArgs<C>) -> Fut + Send + 'static) -> Self
    where
        C: Send + Sync + 'static,
        V: Into<Value>,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        Self::new(move |args| {
            TaskReturn::Future(Box::pin(async move { f(args).await.map(Into::into) }))
        })
    }

    /// Classic completion-callback task: the body receives the `Proceed`
    /// handle and settles the slot by firing it (possibly from a spawned
    /// future).
    pub fn callback(f: impl FnOnce(TaskArgs<C>, Proceed) + Send + 'static) -> Self {
        Self::new(move |mut args| match args.proceed() {
            Some(proceed) => {
                f(args, proceed);
                TaskReturn::Deferred
            }
            None => TaskReturn::Failure(anyhow::anyhow!("completion handle already taken")),
        })
    }

    /// Factory task returning a further task for the same slot.
    pub fn factory(f: impl FnOnce(TaskArgs<C>) -> Task<C> + Send + 'static) -> Self {
        Self::new(move |args| TaskReturn::Task(f(args)))
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn reference(&self, index: usize) -> TaskRef {
        TaskRef {
            index,
            name: self.name.clone(),
        }
    }

    /// Drive this task to a terminal value.
    ///
    /// Nested factory returns re-enter the loop rather than recursing, with
    /// depth capped by `nesting_limit`. A completion delivered through the
    /// `Proceed` handle wins over whatever the invocation returned.
    pub async fn resolve(
        self,
        context: Arc<C>,
        params: Arc<Vec<Value>>,
        nesting_limit: usize,
    ) -> anyhow::Result<Value> {
        let mut action = self.action;
        let mut depth = 0usize;
        loop {
            let (proceed, mut rx) = Proceed::channel();
            let args = TaskArgs {
                context: context.clone(),
                params: params.clone(),
                proceed: Some(proceed),
            };
            let ret = action(args);
            match rx.try_recv() {
                Ok(sent) => return sent,
                // Handle already dropped without firing. For a deferred
                // task that is the empty success; any other return kind
                // still carries the outcome itself.
                Err(oneshot::error::TryRecvError::Closed) => {
                    if matches!(&ret, TaskReturn::Deferred) {
                        return Ok(Value::Null);
                    }
                }
                Err(oneshot::error::TryRecvError::Empty) => {}
            }
            match ret {
                TaskReturn::Value(value) => return Ok(value),
                TaskReturn::Failure(err) => return Err(err),
                TaskReturn::Future(fut) => return fut.await,
                TaskReturn::Deferred => {
                    // Handle is still alive somewhere (usually a spawned
                    // future); wait for it. It may yet be dropped unfired,
                    // which is again the empty success.
                    return match rx.await {
                        Ok(sent) => sent,
                        Err(_) => Ok(Value::Null),
                    };
                }
                TaskReturn::Task(next) => {
                    depth += 1;
                    if depth > nesting_limit {
                        return Err(anyhow::anyhow!(
                            "nested task factories exceeded the resolution limit of {}",
                            nesting_limit
                        ));
                    }
                    action = next.action;
                }
            }
        }
    }
}

impl<C> fmt::Debug for Task<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("name", &self.name).finish()
    }
}

/// Per-slot result of a run. `Rejected` only ever appears in settle mode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TaskOutcome {
    Fulfilled(Value),
    Rejected(TaskError),
}

impl TaskOutcome {
    pub fn value(&self) -> Option<&Value> {
        match self {
            TaskOutcome::Fulfilled(value) => Some(value),
            TaskOutcome::Rejected(_) => None,
        }
    }

    pub fn error(&self) -> Option<&TaskError> {
        match self {
            TaskOutcome::Fulfilled(_) => None,
            TaskOutcome::Rejected(err) => Some(err),
        }
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(self, TaskOutcome::Fulfilled(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, TaskOutcome::Rejected(_))
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            TaskOutcome::Fulfilled(value) => Some(value),
            TaskOutcome::Rejected(_) => None,
        }
    }
}

/// Normalized input collection for one run.
///
/// Every legal input shape of the engine converts into this: an ordered
/// sequence of tasks, a single task (wrapped into a one-element sequence),
/// or a sequence of named pairs.
pub struct TaskList<C>(Vec<Task<C>>);

impl<C> TaskList<C> {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn into_inner(self) -> Vec<Task<C>> {
        self.0
    }
}

impl<C> From<Vec<Task<C>>> for TaskList<C> {
    fn from(tasks: Vec<Task<C>>) -> Self {
        Self(tasks)
    }
}

impl<C> From<Task<C>> for TaskList<C> {
    fn from(task: Task<C>) -> Self {
        Self(vec![task])
    }
}

impl<C> From<Vec<(String, Task<C>)>> for TaskList<C> {
    fn from(tasks: Vec<(String, Task<C>)>) -> Self {
        Self(
            tasks
                .into_iter()
                .map(|(name, task)| task.named(name))
                .collect(),
        )
    }
}

impl<C> FromIterator<Task<C>> for TaskList<C> {
    fn from_iter<I: IntoIterator<Item = Task<C>>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
