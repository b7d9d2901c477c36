use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info};

use super::job::{BatchInfo, JobSet};
use super::listener::{ListenerBus, StreamingEvent};
use super::{SchedulerError, Termination};
use crate::assembler::BlockAssembler;
use crate::clock::Clock;
use crate::types::BatchTime;

/// Everything the generator thread needs
pub(crate) struct GeneratorParts {
    /// First BatchTime to generate
    pub(crate) first: BatchTime,
    pub(crate) batch_interval: Duration,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) assembler: Arc<BlockAssembler>,
    pub(crate) listener: ListenerBus,
    pub(crate) jobs: flume::Sender<JobSet>,
    pub(crate) termination: Arc<Termination>,
    /// Set to stop generating right away
    pub(crate) stop: Arc<AtomicBool>,
}

/// The tick loop: one job per batch interval
pub(crate) struct JobGenerator {
    thread: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    drain: Arc<AtomicBool>,
}

impl JobGenerator {
    pub(crate) fn spawn(parts: GeneratorParts) -> std::io::Result<Self> {
        let stop = Arc::clone(&parts.stop);
        let drain = Arc::new(AtomicBool::new(false));
        let thread_drain = Arc::clone(&drain);
        let thread = std::thread::Builder::new()
            .name("dstream-job-generator".into())
            .spawn(move || generate(parts, &thread_drain))?;
        Ok(Self {
            thread: Some(thread),
            stop,
            drain,
        })
    }

    /// Keep generating until every block received so far was allocated, then
    /// stop. Receivers must be stopped before calling this.
    pub(crate) fn drain(&mut self) {
        self.drain.store(true, Ordering::Release);
        self.join();
    }

    /// Stop at the next tick
    pub(crate) fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.join();
    }

    fn join(&mut self) {
        if let Some(t) = self.thread.take() {
            if t.join().is_err() {
                error!("Job generator thread panicked");
            }
        }
    }
}

impl Drop for JobGenerator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn generate(parts: GeneratorParts, drain: &AtomicBool) {
    let mut next = parts.first;
    info!(first = %next, interval = ?parts.batch_interval, "Starting job generator");
    while parts.clock.wait_till(next, &parts.stop) {
        let descriptor = match parts.assembler.allocate(next) {
            Ok(d) => d,
            Err(e) => {
                error!(time = %next, "Could not allocate blocks: {e}");
                parts.termination.fail(SchedulerError::Assembler(e));
                parts.stop.store(true, Ordering::Release);
                break;
            }
        };
        let info = BatchInfo::new(&descriptor, parts.clock.now());
        debug!(time = %next, records = info.num_records(), "Generated batch");
        parts.listener.post(StreamingEvent::BatchSubmitted(info.clone()));
        if parts.jobs.send(JobSet { info }).is_err() {
            // the runner exited
            break;
        }
        next = next + parts.batch_interval;
        if drain.load(Ordering::Acquire) && !parts.assembler.has_unallocated_blocks() {
            break;
        }
    }
    debug!(next = %next, "Job generator stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::ReceivedBlockInfo;
    use crate::clock::ManualClock;
    use crate::types::{BlockId, NodeId};

    fn parts(clock: &ManualClock, assembler: &Arc<BlockAssembler>) -> (GeneratorParts, flume::Receiver<JobSet>) {
        let (tx, rx) = flume::unbounded();
        let parts = GeneratorParts {
            first: BatchTime::from_millis(1000),
            batch_interval: Duration::from_secs(1),
            clock: Arc::new(clock.clone()),
            assembler: Arc::clone(assembler),
            listener: ListenerBus::start(),
            jobs: tx,
            termination: Arc::new(Termination::default()),
            stop: Arc::new(AtomicBool::new(false)),
        };
        (parts, rx)
    }

    #[test]
    fn generates_one_job_per_tick() {
        let clock = ManualClock::new(BatchTime::from_millis(500));
        let assembler = Arc::new(BlockAssembler::new());
        let source = NodeId::from_name("source");
        assembler
            .add_block(ReceivedBlockInfo {
                source,
                block: BlockId::new(0, 0),
                seal_time: BatchTime::from_millis(800),
                num_records: 3,
                wal_handle: None,
            })
            .unwrap();
        let (parts, jobs) = parts(&clock, &assembler);
        let mut generator = JobGenerator::spawn(parts).unwrap();
        assert!(jobs.recv_timeout(Duration::from_millis(50)).is_err());

        clock.set(BatchTime::from_millis(2000));
        let first = jobs.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = jobs.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first.info.time, BatchTime::from_millis(1000));
        assert_eq!(first.info.num_records(), 3);
        assert_eq!(second.info.time, BatchTime::from_millis(2000));
        assert_eq!(second.info.num_records(), 0);
        generator.stop();
        assert!(jobs.try_recv().is_err());
    }

    #[test]
    fn drain_stops_after_last_block_is_allocated() {
        let clock = ManualClock::new(BatchTime::from_millis(1000));
        let assembler = Arc::new(BlockAssembler::new());
        assembler
            .add_block(ReceivedBlockInfo {
                source: NodeId::from_name("source"),
                block: BlockId::new(0, 0),
                seal_time: BatchTime::from_millis(1500),
                num_records: 1,
                wal_handle: None,
            })
            .unwrap();
        let (parts, jobs) = parts(&clock, &assembler);
        let termination = Arc::clone(&parts.termination);
        let mut generator = JobGenerator::spawn(parts).unwrap();
        assert_eq!(
            jobs.recv_timeout(Duration::from_secs(5)).unwrap().info.time,
            BatchTime::from_millis(1000)
        );

        generator.drain.store(true, Ordering::Release);
        clock.set(BatchTime::from_millis(3000));
        generator.join();
        let remaining: Vec<u64> = jobs.try_iter().map(|j| j.info.time.as_millis()).collect();
        assert_eq!(remaining, vec![2000]);
        assert!(!termination.is_terminated());
    }
}
