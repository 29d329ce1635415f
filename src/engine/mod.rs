// src/engine/mod.rs
pub mod batch;
pub mod flow;
pub mod iterator;

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::{FlowError, FlowResult, TaskError};
use crate::hooks::{HookDispatcher, SubscriberSet};
use crate::options::{FlowOptions, DEFAULT_NESTING_LIMIT};
use crate::task::{TaskList, TaskOutcome, TaskRef};

use self::batch::{BatchRunner, TaskJob, TokioBatchRunner};
use self::flow::{Flow, FlowRunner};
use self::iterator::{TaskInvocation, TaskIterator};

/// Immutable snapshot of one run's effective configuration. Built when the
/// run starts, so later mutation of the engine's standing options or
/// subscriber registry never affects a run already in flight.
pub(crate) struct RunConfig<C> {
    pub settle: bool,
    pub nesting_limit: usize,
    pub params: Arc<Vec<Value>>,
    pub context: Arc<C>,
    pub hooks: Arc<HookDispatcher<C>>,
    pub iterator: Option<TaskIterator<C>>,
}

impl<C> Clone for RunConfig<C> {
    fn clone(&self) -> Self {
        Self {
            settle: self.settle,
            nesting_limit: self.nesting_limit,
            params: self.params.clone(),
            context: self.context.clone(),
            hooks: self.hooks.clone(),
            iterator: self.iterator.clone(),
        }
    }
}

/// Flow orchestration engine.
///
/// Owns the shared execution context and the standing run options; each
/// `series`/`parallel` call snapshots both, so overlapping runs on one
/// engine are safe. The context is handed to every task and hook as an
/// `Arc<C>`; tasks that mutate it from parallel runs must bring their own
/// interior mutability and synchronization. Hook/side-effect interleaving
/// across slots of a parallel run is implementation-defined.
pub struct FlowEngine<C = ()> {
    context: Arc<C>,
    options: FlowOptions<C>,
    subscribers: SubscriberSet<C>,
    batch: Arc<dyn BatchRunner>,
}

impl Default for FlowEngine<()> {
    fn default() -> Self {
        Self::new(())
    }
}

impl<C: Send + Sync + 'static> FlowEngine<C> {
    pub fn new(context: C) -> Self {
        Self::with_options(context, FlowOptions::default())
    }

    pub fn with_options(context: C, options: FlowOptions<C>) -> Self {
        Self {
            context: Arc::new(context),
            options,
            subscribers: SubscriberSet::default(),
            batch: Arc::new(TokioBatchRunner),
        }
    }

    /// Replace the batch runner driving slot execution.
    pub fn with_batch_runner(mut self, batch: Arc<dyn BatchRunner>) -> Self {
        self.batch = batch;
        self
    }

    pub fn context(&self) -> &Arc<C> {
        &self.context
    }

    pub fn options(&self) -> &FlowOptions<C> {
        &self.options
    }

    /// Standing options. Exclusive access, so they cannot change under a
    /// run that still borrows the engine.
    pub fn options_mut(&mut self) -> &mut FlowOptions<C> {
        &mut self.options
    }

    /// Subscribe to the `before` event. Subscribers and the direct option
    /// hooks share one dispatch path and fire with identical arguments.
    pub fn on_before(&self, hook: impl Fn(&Arc<C>, &[TaskRef]) + Send + Sync + 'static) {
        self.subscribers.add_before(Arc::new(hook));
    }

    /// Subscribe to the `beforeEach` event.
    pub fn on_before_each(&self, hook: impl Fn(&TaskRef, &Arc<C>) + Send + Sync + 'static) {
        self.subscribers.add_before_each(Arc::new(hook));
    }

    /// Subscribe to the `afterEach` event.
    pub fn on_after_each(
        &self,
        hook: impl Fn(Option<&TaskError>, Option<&Value>, &TaskRef, &Arc<C>) + Send + Sync + 'static,
    ) {
        self.subscribers.add_after_each(Arc::new(hook));
    }

    /// Subscribe to the `after` event.
    pub fn on_after(
        &self,
        hook: impl Fn(Option<&FlowError>, &[TaskOutcome], &Arc<C>) + Send + Sync + 'static,
    ) {
        self.subscribers.add_after(Arc::new(hook));
    }

    /// Subscribe to the `error` event, fired for every task failure in
    /// both settle and fail-fast mode.
    pub fn on_error(&self, hook: impl Fn(&TaskError, &Arc<C>) + Send + Sync + 'static) {
        self.subscribers.add_error(Arc::new(hook));
    }

    /// Run tasks one at a time, in input order. The returned future is
    /// lazy: nothing executes until it is awaited, and awaiting consumes
    /// the task list, so the run happens exactly once.
    pub async fn series(&self, tasks: impl Into<TaskList<C>>) -> FlowResult<Vec<TaskOutcome>> {
        self.run(Flow::Series, tasks.into(), None).await
    }

    /// `series` with a per-call options overlay (shallow-merged onto the
    /// standing options; the engine is not mutated).
    pub async fn series_with(
        &self,
        tasks: impl Into<TaskList<C>>,
        options: FlowOptions<C>,
    ) -> FlowResult<Vec<TaskOutcome>> {
        self.run(Flow::Series, tasks.into(), Some(options)).await
    }

    /// Run all tasks concurrently. Results are ordered by input position,
    /// never by completion order.
    pub async fn parallel(&self, tasks: impl Into<TaskList<C>>) -> FlowResult<Vec<TaskOutcome>> {
        self.run(Flow::Parallel, tasks.into(), None).await
    }

    /// `parallel` with a per-call options overlay.
    pub async fn parallel_with(
        &self,
        tasks: impl Into<TaskList<C>>,
        options: FlowOptions<C>,
    ) -> FlowResult<Vec<TaskOutcome>> {
        self.run(Flow::Parallel, tasks.into(), Some(options)).await
    }

    /// Build a reusable runner for the named flow. `flow` must be exactly
    /// `"series"` or `"parallel"`; anything else is `InvalidArgument`.
    pub fn compose(&self, flow: &str) -> FlowResult<FlowRunner<'_, C>> {
        Ok(FlowRunner::new(self, flow.parse()?, None))
    }

    /// `compose` with an options overlay carried by the runner.
    pub fn compose_with(
        &self,
        flow: &str,
        options: FlowOptions<C>,
    ) -> FlowResult<FlowRunner<'_, C>> {
        Ok(FlowRunner::new(self, flow.parse()?, Some(options)))
    }

    pub(crate) async fn run(
        &self,
        flow: Flow,
        tasks: TaskList<C>,
        overrides: Option<FlowOptions<C>>,
    ) -> FlowResult<Vec<TaskOutcome>> {
        let config = self.snapshot(overrides);
        let run_id = Uuid::new_v4();
        let tasks = tasks.into_inner();
        debug!(%run_id, %flow, tasks = tasks.len(), settle = config.settle, "starting flow run");

        let refs: Vec<TaskRef> = tasks
            .iter()
            .enumerate()
            .map(|(index, task)| task.reference(index))
            .collect();
        config.hooks.fire_before(&config.context, &refs);

        let mut jobs: Vec<TaskJob> = Vec::with_capacity(tasks.len());
        for (task, slot) in tasks.into_iter().zip(refs.into_iter()) {
            let job: TaskJob = match &config.iterator {
                Some(custom) => custom(TaskInvocation {
                    task,
                    slot,
                    context: config.context.clone(),
                    params: config.params.clone(),
                    settle: config.settle,
                    nesting_limit: config.nesting_limit,
                }),
                None => Box::pin(iterator::resolve_slot(config.clone(), slot, task)),
            };
            jobs.push(job);
        }

        let started = Instant::now();
        let result = match flow {
            Flow::Series => self.batch.run_series(jobs).await,
            Flow::Parallel => self.batch.run_parallel(jobs).await,
        };

        match &result {
            Ok(results) => {
                debug!(%run_id, slots = results.len(), elapsed = ?started.elapsed(), "flow run finished");
                config.hooks.fire_after(None, results, &config.context);
            }
            Err(err) => {
                debug!(%run_id, error = %err, elapsed = ?started.elapsed(), "flow run aborted");
                config.hooks.fire_after(Some(err), &[], &config.context);
            }
        }
        result
    }

    fn snapshot(&self, overrides: Option<FlowOptions<C>>) -> RunConfig<C> {
        let merged = match overrides {
            Some(overrides) => self.options.merge(overrides),
            None => self.options.clone(),
        };
        let hooks = HookDispatcher::new(
            merged.before,
            merged.before_each,
            merged.after_each,
            merged.after,
            self.subscribers.snapshot(),
        );
        RunConfig {
            settle: merged.settle.unwrap_or(false),
            nesting_limit: merged.nesting_limit.unwrap_or(DEFAULT_NESTING_LIMIT),
            params: Arc::new(merged.params.unwrap_or_default()),
            context: merged.context.unwrap_or_else(|| self.context.clone()),
            hooks: Arc::new(hooks),
            iterator: merged.iterator,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Task, TaskArgs};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Trace {
        counter: AtomicUsize,
        log: Mutex<Vec<String>>,
    }

    impl Trace {
        fn push(&self, entry: impl Into<String>) {
            self.log.lock().push(entry.into());
        }

        fn entries(&self) -> Vec<String> {
            self.log.lock().clone()
        }
    }

    fn values(results: &[TaskOutcome]) -> Vec<Value> {
        results.iter().filter_map(|o| o.value().cloned()).collect()
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    #[tokio::test]
    async fn test_series_all_success_input_order() {
        init_tracing();
        let engine = FlowEngine::default();
        let results = engine
            .series(vec![
                Task::value(|_| json!("foo")),
                Task::value(|_| json!("bar")),
                Task::value(|_| json!("qux")),
            ])
            .await
            .unwrap();
        assert_eq!(values(&results), vec![json!("foo"), json!("bar"), json!("qux")]);
    }

    #[tokio::test]
    async fn test_parallel_results_indexed_by_input_order() {
        init_tracing();
        // Completion order is the reverse of input order; the result
        // sequence must not care.
        let engine = FlowEngine::default();
        let results = engine
            .parallel(vec![
                Task::future(|_| async {
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    Ok(json!(100))
                }),
                Task::future(|_| async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(json!(700))
                }),
                Task::future(|_| async { Ok(json!(2000)) }),
            ])
            .await
            .unwrap();
        assert_eq!(values(&results), vec![json!(100), json!(700), json!(2000)]);
    }

    #[tokio::test]
    async fn test_settle_series_never_aborts() {
        let engine = FlowEngine::new(Trace::default());
        let results = engine
            .series_with(
                vec![
                    Task::value(|_| json!("foo")),
                    Task::try_value(|_| Err::<Value, _>(anyhow::anyhow!("broken"))).named("bad"),
                    Task::effect(|args: TaskArgs<Trace>| {
                        args.context.counter.fetch_add(1, Ordering::SeqCst);
                    }),
                ],
                FlowOptions::new().settle(true),
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].value(), Some(&json!("foo")));
        let err = results[1].error().unwrap();
        assert_eq!(err.task.index, 1);
        assert_eq!(err.task.name.as_deref(), Some("bad"));
        assert!(err.message.contains("broken"));
        // The task after the failure still ran.
        assert_eq!(engine.context().counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_settle_parallel_captures_every_slot() {
        let engine = FlowEngine::default();
        let results = engine
            .parallel_with(
                vec![
                    Task::future(|_| async {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(json!(1))
                    }),
                    Task::try_value(|_| Err::<Value, _>(anyhow::anyhow!("bad slot"))),
                    Task::value(|_| json!(3)),
                ],
                FlowOptions::new().settle(true),
            )
            .await
            .unwrap();
        assert!(results[0].is_fulfilled());
        assert!(results[1].is_rejected());
        assert!(results[2].is_fulfilled());
    }

    #[tokio::test]
    async fn test_fail_fast_series_skips_remaining_tasks() {
        let engine = FlowEngine::new(Trace::default());
        let err = engine
            .series(vec![
                Task::effect(|args: TaskArgs<Trace>| {
                    args.context.counter.fetch_add(1, Ordering::SeqCst);
                }),
                Task::try_value(|_| Err::<Value, _>(anyhow::anyhow!("stop here"))),
                Task::effect(|args: TaskArgs<Trace>| {
                    args.context.counter.fetch_add(1, Ordering::SeqCst);
                }),
            ])
            .await
            .unwrap_err();

        assert_eq!(err.task().unwrap().task.index, 1);
        // Only the first task ran.
        assert_eq!(engine.context().counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_each_hooks_fire_once_per_outcome_kind() {
        let engine = FlowEngine::new(Trace::default());
        let options = FlowOptions::new()
            .settle(true)
            .before_each(|task: &TaskRef, ctx: &Arc<Trace>| {
                ctx.push(format!("before {}", task.index))
            })
            .after_each(|_, _, task: &TaskRef, ctx: &Arc<Trace>| {
                ctx.push(format!("after {}", task.index))
            });

        let results = engine
            .series_with(
                vec![
                    Task::value(|_| json!(1)),
                    Task::try_value(|_| Err::<Value, _>(anyhow::anyhow!("sync failure"))),
                    Task::factory(|_| Task::value(|_| json!("nested"))),
                    Task::future(|_| async { Ok(json!("awaited")) }),
                    Task::callback(|_, proceed| proceed.resolve(json!("called back"))),
                ],
                options,
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 5);
        let entries = engine.context().entries();
        for index in 0..5 {
            let before = format!("before {}", index);
            let after = format!("after {}", index);
            assert_eq!(entries.iter().filter(|e| **e == before).count(), 1);
            assert_eq!(entries.iter().filter(|e| **e == after).count(), 1);
        }
    }

    #[tokio::test]
    async fn test_series_hook_ordering_is_strict() {
        let engine = FlowEngine::new(Trace::default());
        let options = FlowOptions::new()
            .before_each(|task: &TaskRef, ctx: &Arc<Trace>| {
                ctx.push(format!("before {}", task.index))
            })
            .after_each(|_, _, task: &TaskRef, ctx: &Arc<Trace>| {
                ctx.push(format!("after {}", task.index))
            });

        engine
            .series_with(
                vec![Task::value(|_| json!(1)), Task::value(|_| json!(2))],
                options,
            )
            .await
            .unwrap();

        assert_eq!(
            engine.context().entries(),
            vec!["before 0", "after 0", "before 1", "after 1"]
        );
    }

    #[tokio::test]
    async fn test_before_and_after_wrap_the_run() {
        let engine = FlowEngine::new(Trace::default());
        let options = FlowOptions::new()
            .before(|ctx: &Arc<Trace>, tasks: &[TaskRef]| {
                ctx.push(format!("before run of {}", tasks.len()))
            })
            .after(|err: Option<&FlowError>, results: &[TaskOutcome], ctx: &Arc<Trace>| {
                ctx.push(format!("after run: err={} slots={}", err.is_some(), results.len()))
            });

        engine
            .parallel_with(
                vec![Task::value(|_| json!(1)), Task::value(|_| json!(2))],
                options,
            )
            .await
            .unwrap();

        let entries = engine.context().entries();
        assert_eq!(entries.first().unwrap(), "before run of 2");
        assert_eq!(entries.last().unwrap(), "after run: err=false slots=2");
    }

    #[tokio::test]
    async fn test_after_fires_on_fail_fast_abort() {
        let engine = FlowEngine::new(Trace::default());
        let options = FlowOptions::new().after(
            |err: Option<&FlowError>, results: &[TaskOutcome], ctx: &Arc<Trace>| {
                ctx.push(format!("err={} slots={}", err.is_some(), results.len()))
            },
        );

        let _ = engine
            .series_with(
                vec![Task::try_value(|_| Err::<Value, _>(anyhow::anyhow!("boom")))],
                options,
            )
            .await
            .unwrap_err();

        assert_eq!(engine.context().entries(), vec!["err=true slots=0"]);
    }

    #[tokio::test]
    async fn test_subscribers_match_direct_hooks() {
        let engine = FlowEngine::new(Trace::default());
        engine.on_before(|ctx, _| ctx.push("sub before"));
        engine.on_before_each(|task, ctx| ctx.push(format!("sub before {}", task.index)));
        engine.on_after_each(|_, _, task, ctx| ctx.push(format!("sub after {}", task.index)));
        engine.on_after(|_, _, ctx| ctx.push("sub after"));

        engine
            .series(vec![Task::value(|_| json!(1))])
            .await
            .unwrap();

        assert_eq!(
            engine.context().entries(),
            vec!["sub before", "sub before 0", "sub after 0", "sub after"]
        );
    }

    #[tokio::test]
    async fn test_error_subscribers_fire_per_failure() {
        let engine = FlowEngine::new(Trace::default());
        engine.on_error(|err, ctx| ctx.push(format!("error at {}", err.task.index)));

        engine
            .series_with(
                vec![
                    Task::try_value(|_| Err::<Value, _>(anyhow::anyhow!("a"))),
                    Task::value(|_| json!(2)),
                    Task::try_value(|_| Err::<Value, _>(anyhow::anyhow!("b"))),
                ],
                FlowOptions::new().settle(true),
            )
            .await
            .unwrap();

        assert_eq!(
            engine.context().entries(),
            vec!["error at 0", "error at 2"]
        );
    }

    #[tokio::test]
    async fn test_compose_equivalent_to_direct_calls() {
        let engine: FlowEngine<()> = FlowEngine::default();
        let series = engine.compose("series").unwrap();
        let parallel = engine.compose("parallel").unwrap();

        let direct = engine
            .series(vec![Task::value(|_| json!(1)), Task::value(|_| json!(2))])
            .await
            .unwrap();
        let composed = series
            .run(vec![Task::value(|_| json!(1)), Task::value(|_| json!(2))])
            .await
            .unwrap();
        assert_eq!(direct, composed);

        let composed_parallel = parallel
            .run(vec![Task::value(|_| json!(1)), Task::value(|_| json!(2))])
            .await
            .unwrap();
        assert_eq!(values(&composed_parallel), vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_compose_rejects_unknown_flow() {
        let engine: FlowEngine<()> = FlowEngine::default();
        let err = engine.compose("invalid").unwrap_err();
        assert!(matches!(err, FlowError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_compose_overlay_does_not_mutate_standing_options() {
        let engine: FlowEngine<()> = FlowEngine::default();
        let settled = engine.compose_with("series", FlowOptions::new().settle(true)).unwrap();

        let results = settled
            .run(vec![Task::try_value(|_| Err::<Value, _>(anyhow::anyhow!("x")))])
            .await
            .unwrap();
        assert!(results[0].is_rejected());

        // The engine itself is still fail-fast.
        assert_eq!(engine.options().settle, None);
        engine
            .series(vec![Task::try_value(|_| Err::<Value, _>(anyhow::anyhow!("y")))])
            .await
            .unwrap_err();
    }

    #[tokio::test]
    async fn test_run_future_is_lazy_and_runs_once() {
        let engine = FlowEngine::new(Trace::default());
        let fut = engine.series(vec![Task::effect(|args: TaskArgs<Trace>| {
            args.context.counter.fetch_add(1, Ordering::SeqCst);
        })]);
        // Building the future starts nothing.
        assert_eq!(engine.context().counter.load(Ordering::SeqCst), 0);
        fut.await.unwrap();
        assert_eq!(engine.context().counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_single_task_wraps_into_a_run() {
        let engine: FlowEngine<()> = FlowEngine::default();
        let results = engine.series(Task::value(|_| json!("only"))).await.unwrap();
        assert_eq!(values(&results), vec![json!("only")]);
    }

    #[tokio::test]
    async fn test_params_forwarded_to_every_task() {
        let engine = FlowEngine::with_options(
            (),
            FlowOptions::new().params(vec![json!("alpha"), json!(7)]),
        );
        let results = engine
            .parallel(vec![
                Task::value(|args| args.params[0].clone()),
                Task::value(|args| args.params[1].clone()),
            ])
            .await
            .unwrap();
        assert_eq!(values(&results), vec![json!("alpha"), json!(7)]);
    }

    #[tokio::test]
    async fn test_context_override_per_call() {
        let engine = FlowEngine::new(Trace::default());
        let replacement = Arc::new(Trace::default());
        engine
            .series_with(
                vec![Task::effect(|args: TaskArgs<Trace>| {
                    args.context.counter.fetch_add(1, Ordering::SeqCst);
                })],
                FlowOptions::new().context(replacement.clone()),
            )
            .await
            .unwrap();

        assert_eq!(engine.context().counter.load(Ordering::SeqCst), 0);
        assert_eq!(replacement.counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_custom_iterator_replaces_default_resolver() {
        let engine = FlowEngine::new(Trace::default());
        let iterator: TaskIterator<Trace> = Arc::new(|invocation: TaskInvocation<Trace>| {
            Box::pin(async move {
                invocation.context.push(format!("custom {}", invocation.slot.index));
                // Outcome fabricated without ever invoking the task.
                Ok(TaskOutcome::Fulfilled(json!("custom")))
            })
        });

        let results = engine
            .series_with(
                vec![Task::value(|_| json!("never seen"))],
                FlowOptions::new().iterator(iterator),
            )
            .await
            .unwrap();

        assert_eq!(values(&results), vec![json!("custom")]);
        assert_eq!(engine.context().entries(), vec!["custom 0"]);
    }

    #[tokio::test]
    async fn test_empty_task_list() {
        let engine: FlowEngine<()> = FlowEngine::default();
        assert!(engine.series(Vec::<Task<()>>::new()).await.unwrap().is_empty());
        assert!(engine.parallel(Vec::<Task<()>>::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_named_pair_input_annotates_failures() {
        let engine: FlowEngine<()> = FlowEngine::default();
        let err = engine
            .series(vec![
                ("ok".to_string(), Task::value(|_| json!(1))),
                (
                    "doomed".to_string(),
                    Task::try_value(|_| Err::<Value, _>(anyhow::anyhow!("no luck"))),
                ),
            ])
            .await
            .unwrap_err();

        let task_err = err.task().unwrap();
        assert_eq!(task_err.task.name.as_deref(), Some("doomed"));
        assert_eq!(task_err.task.index, 1);
    }

    #[tokio::test]
    async fn test_overlapping_runs_share_one_engine() {
        let engine = Arc::new(FlowEngine::new(Trace::default()));
        let slow = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .series(vec![Task::future(|_| async {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok(json!("slow"))
                    })])
                    .await
            })
        };
        let fast = engine.series(vec![Task::value(|_| json!("fast"))]).await.unwrap();
        assert_eq!(values(&fast), vec![json!("fast")]);
        let slow = slow.await.unwrap().unwrap();
        assert_eq!(values(&slow), vec![json!("slow")]);
    }
}
