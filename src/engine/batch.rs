// src/engine/batch.rs
use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::{FlowError, TaskError};
use crate::task::{TaskOutcome, TaskRef};

/// One prepared slot: polling it invokes the task (and its hooks) and
/// yields the slot's outcome. Jobs are lazy, so slots a series run never
/// reaches are never invoked.
pub type TaskJob = Pin<Box<dyn Future<Output = Result<TaskOutcome, FlowError>> + Send>>;

/// The primitive that drives N independent slot jobs either one at a time
/// or all at once and aggregates their outcomes by input position. The
/// engine only talks to this boundary; swap it to change how work is
/// actually scheduled.
#[async_trait]
pub trait BatchRunner: Send + Sync {
    /// Drive jobs strictly in order, each started only after the previous
    /// one's terminal outcome. The first `Err` aborts the batch.
    async fn run_series(&self, jobs: Vec<TaskJob>) -> Result<Vec<TaskOutcome>, FlowError>;

    /// Drive all jobs concurrently. The result sequence preserves input
    /// order regardless of completion order; the first `Err` by completion
    /// order aborts the batch without cancelling in-flight jobs.
    async fn run_parallel(&self, jobs: Vec<TaskJob>) -> Result<Vec<TaskOutcome>, FlowError>;
}

/// Default batch runner backed by the tokio runtime.
pub struct TokioBatchRunner;

#[async_trait]
impl BatchRunner for TokioBatchRunner {
    async fn run_series(&self, jobs: Vec<TaskJob>) -> Result<Vec<TaskOutcome>, FlowError> {
        let mut results = Vec::with_capacity(jobs.len());
        for job in jobs {
            // A failing slot returns here; the remaining jobs are dropped
            // unpolled, so their tasks never run.
            results.push(job.await?);
        }
        Ok(results)
    }

    async fn run_parallel(&self, jobs: Vec<TaskJob>) -> Result<Vec<TaskOutcome>, FlowError> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let total = jobs.len();
        debug!(total, "fanning out parallel jobs");

        let (tx, mut rx) = mpsc::channel(total);
        let mut handles = Vec::with_capacity(total);
        for (index, job) in jobs.into_iter().enumerate() {
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                let result = job.await;
                // The receiver is gone after a fail-fast abort; those
                // outcomes are discarded.
                let _ = tx.send((index, result)).await;
            }));
        }
        drop(tx);

        let mut slots: Vec<Option<TaskOutcome>> = (0..total).map(|_| None).collect();
        let mut filled = 0usize;
        while let Some((index, result)) = rx.recv().await {
            match result {
                Ok(outcome) => {
                    slots[index] = Some(outcome);
                    filled += 1;
                }
                // First error by completion order wins; in-flight jobs keep
                // running detached but their results are dropped.
                Err(err) => return Err(err),
            }
        }

        if filled < total {
            // A worker died without reporting, i.e. a panic inside a task
            // or hook body. Re-raise it for the caller.
            for handle in handles {
                if let Err(err) = handle.await {
                    if err.is_panic() {
                        std::panic::resume_unwind(err.into_panic());
                    }
                    error!("parallel worker terminated abnormally: {}", err);
                }
            }
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                // Only reachable when a worker aborted for some non-panic
                // reason, e.g. runtime shutdown mid-batch.
                slot.ok_or_else(|| {
                    FlowError::Task(TaskError {
                        task: TaskRef { index, name: None },
                        message: "worker terminated before reporting an outcome".to_string(),
                    })
                })
            })
            .collect()
    }
}
