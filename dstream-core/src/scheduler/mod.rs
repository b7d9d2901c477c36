//! The micro-batch scheduler.
//!
//! A job generator thread ticks once per batch interval, allocates the blocks
//! received since the last tick to the new BatchTime and queues a job for it.
//! A single job runner thread executes queued jobs strictly in BatchTime order:
//! it runs the graph's output actions, clears datasets no longer retained and
//! hands checkpoints to the checkpoint writer.
mod generator;
mod job;
mod listener;
mod rate;
mod runner;

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use thiserror::Error;

pub(crate) use generator::{GeneratorParts, JobGenerator};
pub use job::{BatchInfo, BatchState};
pub use listener::{
    ListenerBus, ReceiverStatistics, StatisticsSnapshot, StreamingEvent, StreamingListener, StreamingStatistics,
};
pub use rate::PidRateEstimator;
pub(crate) use rate::RateController;
#[cfg(test)]
pub(crate) use runner::run_outputs;
pub(crate) use runner::{spawn_checkpoint_writer, Checkpointing, JobRunner, ReceivedDataCleanup, RunnerParts};

use crate::assembler::AssemblerError;
use crate::checkpoint::CheckpointError;
use crate::graph::ComputeError;

/// Reason a running job terminated
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Batch failed with an unrecoverable error")]
    Compute(#[from] ComputeError),
    #[error("Checkpointing failed")]
    Checkpoint(#[from] CheckpointError),
    #[error("Failed to allocate blocks to a batch")]
    Assembler(#[from] AssemblerError),
}

type Outcome = Result<(), Arc<SchedulerError>>;

/// Terminal outcome of a job, set once by whoever ends it first
#[derive(Debug, Default)]
pub(crate) struct Termination {
    outcome: Mutex<Option<Outcome>>,
    cond: Condvar,
}

impl Termination {
    fn set(&self, outcome: Outcome) {
        #[allow(clippy::unwrap_used)]
        let mut guard = self.outcome.lock().unwrap();
        if guard.is_none() {
            *guard = Some(outcome);
            self.cond.notify_all();
        }
    }

    /// The job ended regularly
    pub(crate) fn finish(&self) {
        self.set(Ok(()))
    }

    /// The job ended with an unrecoverable error
    pub(crate) fn fail(&self, error: SchedulerError) {
        self.set(Err(Arc::new(error)))
    }

    #[cfg(test)]
    pub(crate) fn is_terminated(&self) -> bool {
        #[allow(clippy::unwrap_used)]
        self.outcome.lock().unwrap().is_some()
    }

    /// Block until the job terminated
    pub(crate) fn wait(&self) -> Outcome {
        #[allow(clippy::unwrap_used)]
        let mut guard = self.outcome.lock().unwrap();
        loop {
            if let Some(outcome) = guard.as_ref() {
                return outcome.clone();
            }
            #[allow(clippy::unwrap_used)]
            {
                guard = self.cond.wait(guard).unwrap();
            }
        }
    }

    /// Block until the job terminated or `timeout` elapsed. Returns `None` on
    /// timeout.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> Option<Outcome> {
        #[allow(clippy::unwrap_used)]
        let guard = self.outcome.lock().unwrap();
        #[allow(clippy::unwrap_used)]
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |outcome| outcome.is_none())
            .unwrap();
        guard.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BatchTime;

    #[test]
    fn first_outcome_wins() {
        let termination = Arc::new(Termination::default());
        assert!(termination.wait_timeout(Duration::from_millis(10)).is_none());

        let t = Arc::clone(&termination);
        let waiter = std::thread::spawn(move || t.wait());
        termination.fail(SchedulerError::Assembler(AssemblerError::NotMonotonic {
            time: BatchTime::ZERO,
            last: BatchTime::ZERO,
        }));
        termination.finish();
        assert!(waiter.join().unwrap().is_err());
        assert!(termination.is_terminated());
        assert!(termination.wait_timeout(Duration::ZERO).unwrap().is_err());
    }
}
