use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use itertools::Itertools;
use tracing::{debug, debug_span, error, info, warn};

use super::job::{BatchState, JobSet};
use super::listener::{ListenerBus, StreamingEvent};
use super::rate::RateController;
use super::{SchedulerError, Termination};
use crate::assembler::BlockAssembler;
use crate::checkpoint::{CheckpointError, CheckpointRecord, CheckpointStore, CheckpointWriter};
use crate::clock::Clock;
use crate::graph::{ComputeEnv, ComputeError, FrozenGraph};
use crate::receiver::ReceiverLogs;
use crate::storage::BlockStore;
use crate::types::BatchTime;

/// Pause between two attempts to write the same checkpoint
const CHECKPOINT_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Run all output actions of `time` in definition order. The first failing
/// output aborts the batch.
pub(crate) fn run_outputs(graph: &mut FrozenGraph, time: BatchTime, env: &ComputeEnv) -> Result<(), ComputeError> {
    for output in graph.outputs().to_vec() {
        graph.materialize(output, time, env)?;
    }
    Ok(())
}

/// Render an error with all its sources
fn render(error: &(dyn std::error::Error + 'static)) -> String {
    std::iter::successors(Some(error), |e| e.source()).join(": ")
}

/// Drops received blocks, their metadata and their logs once no batch can
/// need them anymore
pub(crate) struct ReceivedDataCleanup {
    pub(crate) assembler: Arc<BlockAssembler>,
    pub(crate) block_store: Arc<BlockStore>,
    pub(crate) logs: ReceiverLogs,
    /// How long before a batch its received data may still be read
    pub(crate) retention: Duration,
}

impl ReceivedDataCleanup {
    /// Clean everything older than `time` minus the retention
    pub(crate) fn clean(&self, time: BatchTime) {
        let threshold = time - self.retention;
        match self.assembler.cleanup(threshold) {
            Ok(blocks) if !blocks.is_empty() => {
                self.block_store.remove(&blocks);
                debug!(%threshold, blocks = blocks.len(), "Removed old blocks");
            }
            Ok(_) => (),
            Err(e) => warn!(%threshold, "Failed to clean block metadata: {e}"),
        }
        match self.logs.clean(threshold) {
            Ok(0) => (),
            Ok(segments) => debug!(%threshold, segments, "Removed old received data logs"),
            Err(e) => warn!(%threshold, "Failed to clean received data logs: {e}"),
        }
    }
}

/// Start the checkpoint writer of a job. Every completed checkpoint is
/// announced on the listener bus and allows cleaning up older received data.
/// A checkpoint which can not be written terminates the job.
pub(crate) fn spawn_checkpoint_writer(
    store: impl CheckpointStore,
    listener: ListenerBus,
    cleanup: Arc<ReceivedDataCleanup>,
    termination: Arc<Termination>,
    stop_generation: Arc<AtomicBool>,
) -> std::io::Result<CheckpointWriter> {
    CheckpointWriter::spawn(
        store,
        CHECKPOINT_RETRY_DELAY,
        move |time: BatchTime| {
            listener.post(StreamingEvent::CheckpointCompleted(time));
            cleanup.clean(time);
        },
        move |e: CheckpointError| {
            stop_generation.store(true, Ordering::Release);
            termination.fail(SchedulerError::Checkpoint(e));
        },
    )
}

/// Checkpointing setup of a job
pub(crate) struct Checkpointing {
    pub(crate) writer: CheckpointWriter,
    pub(crate) interval: Duration,
}

/// Everything the runner thread needs
pub(crate) struct RunnerParts {
    pub(crate) graph: FrozenGraph,
    pub(crate) env: ComputeEnv,
    pub(crate) jobs: flume::Receiver<JobSet>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) listener: ListenerBus,
    pub(crate) rate: Option<RateController>,
    pub(crate) checkpointing: Option<Checkpointing>,
    /// Cleans received data after every batch if checkpointing is disabled
    pub(crate) cleanup: Arc<ReceivedDataCleanup>,
    pub(crate) termination: Arc<Termination>,
    /// Stops the job generator after a fatal error
    pub(crate) stop_generation: Arc<AtomicBool>,
}

/// Executes queued jobs one at a time in BatchTime order.
///
/// The runner exits once the job queue is closed and empty, after a fatal
/// error, or when it is told to abandon the queue.
pub(crate) struct JobRunner {
    thread: Option<JoinHandle<()>>,
    abandon: Arc<AtomicBool>,
}

impl JobRunner {
    pub(crate) fn spawn(parts: RunnerParts) -> std::io::Result<Self> {
        let abandon = Arc::new(AtomicBool::new(false));
        let thread_abandon = Arc::clone(&abandon);
        let thread = std::thread::Builder::new()
            .name("dstream-job-runner".into())
            .spawn(move || run(parts, &thread_abandon))?;
        Ok(Self {
            thread: Some(thread),
            abandon,
        })
    }

    /// Discard all queued batches once the running one finished
    pub(crate) fn abandon(&self) {
        self.abandon.store(true, Ordering::Release);
    }

    /// Wait until the runner exited. The runner only exits once the job queue
    /// is closed, was abandoned or a batch failed fatally.
    pub(crate) fn join(&mut self) {
        if let Some(t) = self.thread.take() {
            if t.join().is_err() {
                error!("Job runner thread panicked");
            }
        }
    }
}

impl Drop for JobRunner {
    fn drop(&mut self) {
        self.abandon();
        self.join();
    }
}

fn run(mut parts: RunnerParts, abandon: &AtomicBool) {
    while let Ok(job) = parts.jobs.recv() {
        if abandon.load(Ordering::Acquire) {
            let dropped = 1 + parts.jobs.drain().count();
            info!(dropped, "Discarding queued batches");
            break;
        }
        if !run_job(&mut parts, job) {
            break;
        }
    }
    if let Some(checkpointing) = parts.checkpointing.as_mut() {
        checkpointing.writer.close();
    }
    debug!("Job runner stopped");
}

/// Run one batch. Returns false if the job must terminate.
fn run_job(parts: &mut RunnerParts, job: JobSet) -> bool {
    let mut info = job.info;
    let time = info.time;
    info.state = BatchState::Computing;
    info.processing_start = Some(parts.clock.now());
    info.backlog = parts.jobs.len();
    parts.listener.post(StreamingEvent::BatchStarted(info.clone()));

    let result = {
        let span = debug_span!("scheduler::run_batch", batch_time = %time);
        let _guard = span.enter();
        run_outputs(&mut parts.graph, time, &parts.env)
    };
    info.processing_end = Some(parts.clock.now());

    let succeeded = result.is_ok();
    let mut keep_running = true;
    match result {
        Ok(()) => {
            info.state = BatchState::Completed;
            debug!(
                %time,
                records = info.num_records(),
                processing_time = ?info.processing_time(),
                "Batch completed"
            );
            if let Some(rate) = parts.rate.as_mut() {
                rate.on_batch_completed(&info);
            }
            parts.listener.post(StreamingEvent::BatchCompleted(info));
        }
        Err(e) => {
            info.state = BatchState::Failed;
            report_failure(&parts.listener, time, &e);
            let rendered = render(&e);
            parts.listener.post(StreamingEvent::BatchFailed {
                info,
                error: rendered.clone(),
            });
            if e.is_fatal() {
                error!(%time, "Batch failed with an unrecoverable error, terminating: {rendered}");
                parts.stop_generation.store(true, Ordering::Release);
                parts.termination.fail(SchedulerError::Compute(e));
                keep_running = false;
            } else {
                warn!(%time, "Batch failed: {rendered}");
            }
        }
    }
    parts.graph.clear_old(time);

    match parts.checkpointing.as_ref() {
        Some(checkpointing) if keep_running && succeeded => {
            if time.is_aligned(parts.graph.zero_time(), checkpointing.interval) {
                keep_running = checkpoint(parts, time);
            }
        }
        Some(_) => (),
        None => parts.cleanup.clean(time),
    }
    keep_running
}

fn report_failure(listener: &ListenerBus, time: BatchTime, error: &ComputeError) {
    match error {
        ComputeError::SourceDataLoss { node, blocks, .. } => listener.post(StreamingEvent::DataLoss {
            time,
            source: *node,
            blocks: *blocks,
        }),
        ComputeError::Output { output, source } => listener.post(StreamingEvent::OutputFailed {
            time,
            output: output.clone(),
            error: render(source.as_ref()),
        }),
        _ => (),
    }
}

/// Hand a checkpoint of `time` to the writer. Returns false if the job must
/// terminate.
fn checkpoint(parts: &RunnerParts, time: BatchTime) -> bool {
    let Some(checkpointing) = parts.checkpointing.as_ref() else {
        return true;
    };
    let node_states = match parts.graph.snapshot_states() {
        Ok(states) => states,
        Err(e) => {
            error!(%time, "Failed to snapshot node states: {}", render(&e));
            parts.stop_generation.store(true, Ordering::Release);
            parts.termination.fail(SchedulerError::Compute(e));
            return false;
        }
    };
    let record = CheckpointRecord {
        batch_time: time,
        zero_time: parts.graph.zero_time(),
        graph: parts.graph.descriptor().clone(),
        node_states,
    };
    if !checkpointing.writer.submit(record) {
        warn!(%time, "Checkpoint writer stopped, skipping checkpoint");
    }
    true
}
