//! The batch executor runs per-partition computations of a dataset.
//!
//! The scheduler only hands deterministic, replayable tasks to a [BatchExecutor].
//! A task which fails because its worker was lost is computed again from the same
//! inputs, which is all the lineage a task needs.
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::dataset::Dataset;
use crate::types::Data;

/// Output of a single partition task
pub type PartitionOutput = Box<dyn Any + Send>;

/// A replayable partition computation
pub type Task = Arc<dyn Fn(TaskContext) -> Result<PartitionOutput, TaskError> + Send + Sync>;

/// Information handed to a task on every attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskContext {
    /// Index of the partition this task computes
    pub partition: usize,
    /// Attempt number, starting at 1
    pub attempt: usize,
}

/// Executes partition tasks, possibly in parallel
pub trait BatchExecutor: Send + Sync + 'static {
    /// Run all tasks and return their outputs in task order.
    /// Fails if any task could not be completed.
    fn run_tasks(&self, tasks: Vec<Task>) -> Result<Vec<PartitionOutput>, ExecutorError>;

    /// Stop accepting tasks
    fn shutdown(&self) {}
}

/// A partition computation failed on its worker
#[derive(Debug, Error, Clone)]
pub enum TaskError {
    #[error("Worker lost while computing partition: {0}")]
    WorkerLost(String),
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Partition {partition} failed after {attempts} attempts")]
    TaskFailed {
        partition: usize,
        attempts: usize,
        #[source]
        source: TaskError,
    },
    #[error("Partition {0} panicked")]
    Panicked(usize),
    #[error("Partition {0} produced output of an unexpected type")]
    OutputType(usize),
    #[error("Executor has been shut down")]
    Shutdown,
}

/// Runs tasks on a fixed number of scoped threads within this process
#[derive(Debug)]
pub struct LocalExecutor {
    parallelism: usize,
    max_attempts: usize,
    shut_down: AtomicBool,
}

impl LocalExecutor {
    /// Create an executor using up to `parallelism` threads per stage and
    /// attempting every task up to `max_attempts` times
    pub fn new(parallelism: usize, max_attempts: usize) -> Self {
        Self {
            parallelism: parallelism.max(1),
            max_attempts: max_attempts.max(1),
            shut_down: AtomicBool::new(false),
        }
    }

    fn run_with_retries(
        &self,
        task: &Task,
        partition: usize,
    ) -> Result<PartitionOutput, ExecutorError> {
        let mut last_error = None;
        for attempt in 1..=self.max_attempts {
            match task(TaskContext { partition, attempt }) {
                Ok(out) => return Ok(out),
                Err(e) => {
                    warn!(partition, attempt, "Recomputing lost partition: {e}");
                    last_error = Some(e);
                }
            }
        }
        Err(ExecutorError::TaskFailed {
            partition,
            attempts: self.max_attempts,
            // at least one attempt always runs
            source: last_error.unwrap_or_else(|| TaskError::WorkerLost("no attempt".into())),
        })
    }
}

impl BatchExecutor for LocalExecutor {
    fn run_tasks(&self, tasks: Vec<Task>) -> Result<Vec<PartitionOutput>, ExecutorError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ExecutorError::Shutdown);
        }
        let threads = self.parallelism.min(tasks.len());
        if threads <= 1 {
            return tasks
                .iter()
                .enumerate()
                .map(|(i, t)| self.run_with_retries(t, i))
                .collect();
        }
        debug!(tasks = tasks.len(), threads, "Running partition tasks");

        let tasks = &tasks;
        let results: Vec<Vec<(usize, Result<PartitionOutput, ExecutorError>)>> =
            std::thread::scope(|scope| {
                let handles: Vec<_> = (0..threads)
                    .map(|offset| {
                        scope.spawn(move || {
                            (offset..tasks.len())
                                .step_by(threads)
                                .map(|i| (i, self.run_with_retries(&tasks[i], i)))
                                .collect::<Vec<_>>()
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .enumerate()
                    .map(|(offset, h)| {
                        h.join()
                            .unwrap_or_else(|_| vec![(offset, Err(ExecutorError::Panicked(offset)))])
                    })
                    .collect()
            });

        let mut ordered: Vec<Option<PartitionOutput>> = (0..tasks.len()).map(|_| None).collect();
        for (i, result) in results.into_iter().flatten() {
            ordered[i] = Some(result?);
        }
        ordered
            .into_iter()
            .enumerate()
            .map(|(i, x)| x.ok_or(ExecutorError::Panicked(i)))
            .collect()
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
    }
}

/// Run `count` tasks computing `f(partition)` and collect their typed outputs
pub(crate) fn run_partitions<T: Send + 'static>(
    executor: &dyn BatchExecutor,
    count: usize,
    f: Arc<dyn Fn(usize) -> T + Send + Sync>,
) -> Result<Vec<T>, ExecutorError> {
    let tasks: Vec<Task> = (0..count)
        .map(|_| {
            let f = Arc::clone(&f);
            Arc::new(move |ctx: TaskContext| {
                Ok::<PartitionOutput, TaskError>(Box::new(f(ctx.partition)))
            }) as Task
        })
        .collect();
    executor
        .run_tasks(tasks)?
        .into_iter()
        .enumerate()
        .map(|(i, out)| {
            out.downcast::<T>()
                .map(|x| *x)
                .map_err(|_| ExecutorError::OutputType(i))
        })
        .collect()
}

/// Apply `f` to every partition of `input` on the executor
pub(crate) fn map_partitions<I: Data, O: Data>(
    executor: &dyn BatchExecutor,
    input: &Dataset<I>,
    f: Arc<dyn Fn(&[I]) -> Vec<O> + Send + Sync>,
) -> Result<Dataset<O>, ExecutorError> {
    let data = input.clone();
    let partitions = run_partitions(
        executor,
        input.num_partitions(),
        Arc::new(move |i: usize| f(&data.partitions()[i])),
    )?;
    Ok(Dataset::from_partitions(partitions))
}
