use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{info, warn};

use super::block::{spawn_block_generator, BlockPusher, LogCleanup};
use super::supervisor::Supervisor;
use super::{RateBus, RateLimiter, Receiver, ReceiverError, ReceiverInfo, ReceiverSink};
use crate::assembler::BlockAssembler;
use crate::clock::Clock;
use crate::scheduler::ListenerBus;
use crate::storage::{BlockStore, WalError};
use crate::types::{BatchTime, Data, NodeId, Persistable, ReceiverId};

/// Directory below the checkpoint directory holding the received data logs
pub(crate) const RECEIVED_DATA_DIR: &str = "receivedData";

/// Everything receivers share within one job
pub(crate) struct ReceiverEnv {
    pub(crate) block_store: Arc<BlockStore>,
    pub(crate) assembler: Arc<BlockAssembler>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) listener: ListenerBus,
    pub(crate) rates: Arc<RateBus>,
    pub(crate) block_interval: Duration,
    pub(crate) restart_delay: Duration,
    pub(crate) max_rate: Option<u64>,
    /// Root of the per-receiver write-ahead logs, if enabled
    pub(crate) wal_root: Option<PathBuf>,
    pub(crate) wal_rolling_interval: Duration,
}

impl ReceiverEnv {
    /// Write-ahead log directory of a receiver
    pub(crate) fn wal_dir(&self, receiver: ReceiverId) -> Option<PathBuf> {
        self.wal_root
            .as_ref()
            .map(|root| root.join(RECEIVED_DATA_DIR).join(receiver.to_string()))
    }

    #[cfg(test)]
    pub(crate) fn for_tests(clock: Arc<dyn Clock>, wal_root: Option<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            block_store: Arc::new(BlockStore::new(3, 2)),
            assembler: Arc::new(BlockAssembler::new()),
            clock,
            listener: ListenerBus::start(),
            rates: Arc::new(RateBus::new()),
            block_interval: Duration::from_millis(200),
            restart_delay: Duration::from_millis(10),
            max_rate: None,
            wal_root,
            wal_rolling_interval: Duration::from_secs(60),
        })
    }
}

type Launch = Box<dyn FnOnce(Arc<ReceiverEnv>) -> Result<RunningReceiver, ReceiverError> + Send>;

/// A receiver registered with the graph which was not started yet
pub(crate) struct PendingReceiver {
    pub(crate) id: ReceiverId,
    pub(crate) source: NodeId,
    launch: Launch,
}

impl std::fmt::Debug for PendingReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReceiver")
            .field("id", &self.id)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl PendingReceiver {
    pub(crate) fn new<V: Data + Persistable>(
        id: ReceiverId,
        source: NodeId,
        name: String,
        receiver: Box<dyn Receiver<V>>,
    ) -> Self {
        let launch: Launch = Box::new(move |env: Arc<ReceiverEnv>| {
            launch_receiver(id, source, name, receiver, env)
        });
        Self { id, source, launch }
    }
}

fn launch_receiver<V: Data + Persistable>(
    id: ReceiverId,
    source: NodeId,
    name: String,
    receiver: Box<dyn Receiver<V>>,
    env: Arc<ReceiverEnv>,
) -> Result<RunningReceiver, ReceiverError> {
    let info = Arc::new(Mutex::new(ReceiverInfo::new(id, name, source)));
    let pusher = Arc::new(BlockPusher::<V>::new(
        id,
        source,
        Arc::clone(&env),
        Arc::clone(&info),
    )?);
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let stop = Arc::new(AtomicBool::new(false));
    let generator_stop = Arc::new(AtomicBool::new(false));

    let limiter = RateLimiter::new(env.max_rate, env.rates.subscribe(&source));
    let sink = ReceiverSink::new(
        Arc::clone(&buffer),
        Arc::clone(&pusher),
        limiter,
        Arc::clone(&stop),
    );
    let log: Arc<dyn LogCleanup> = pusher.clone();
    let generator = spawn_block_generator(buffer, pusher, Arc::clone(&generator_stop))
        .map_err(ReceiverError::Spawn)?;

    let supervisor = Supervisor {
        info: Arc::clone(&info),
        listener: env.listener.clone(),
        clock: Arc::clone(&env.clock),
        restart_delay: env.restart_delay,
        stop: Arc::clone(&stop),
    };
    let thread = std::thread::Builder::new()
        .name(format!("dstream-receiver-{id}"))
        .spawn(move || supervisor.run(receiver, sink))
        .map_err(ReceiverError::Spawn)?;

    Ok(RunningReceiver {
        id,
        info,
        log,
        stop,
        generator_stop,
        supervisor: Some(thread),
        generator: Some(generator),
    })
}

struct RunningReceiver {
    id: ReceiverId,
    info: Arc<Mutex<ReceiverInfo>>,
    log: Arc<dyn LogCleanup>,
    stop: Arc<AtomicBool>,
    generator_stop: Arc<AtomicBool>,
    supervisor: Option<JoinHandle<()>>,
    generator: Option<JoinHandle<()>>,
}

/// The write-ahead logs of all receivers of a job
#[derive(Clone, Default)]
pub(crate) struct ReceiverLogs {
    logs: Vec<Arc<dyn LogCleanup>>,
}

impl ReceiverLogs {
    /// Delete log segments of all receivers holding only records older than
    /// `threshold`
    pub(crate) fn clean(&self, threshold: BatchTime) -> Result<usize, WalError> {
        let mut deleted = 0;
        for log in self.logs.iter() {
            deleted += log.clean_log(threshold)?;
        }
        Ok(deleted)
    }
}

/// Starts, tracks and stops all receivers of a job
pub(crate) struct ReceiverManager {
    env: Arc<ReceiverEnv>,
    running: Vec<RunningReceiver>,
}

impl ReceiverManager {
    pub(crate) fn new(env: Arc<ReceiverEnv>) -> Self {
        Self {
            env,
            running: Vec::new(),
        }
    }

    /// Start all given receivers
    pub(crate) fn start(&mut self, pending: Vec<PendingReceiver>) -> Result<(), ReceiverError> {
        for p in pending {
            let running = (p.launch)(Arc::clone(&self.env))?;
            info!(receiver = running.id, source = %p.source, "Started receiver");
            self.running.push(running);
        }
        Ok(())
    }

    /// Monitoring counters of all receivers
    pub(crate) fn infos(&self) -> Vec<ReceiverInfo> {
        self.running
            .iter()
            .map(|r| {
                #[allow(clippy::unwrap_used)]
                r.info.lock().unwrap().clone()
            })
            .collect()
    }

    /// Cleanup access to the write-ahead logs of all running receivers
    pub(crate) fn logs(&self) -> ReceiverLogs {
        ReceiverLogs {
            logs: self.running.iter().map(|r| Arc::clone(&r.log)).collect(),
        }
    }

    /// True if every receiver stopped, e.g. because its source is exhausted
    pub(crate) fn all_stopped(&self) -> bool {
        self.running
            .iter()
            .all(|r| r.supervisor.as_ref().map_or(true, |t| t.is_finished()))
    }

    /// Stop all receivers and seal everything they buffered. Blocks until all
    /// receiver threads exited.
    pub(crate) fn stop(&mut self) {
        for r in self.running.iter() {
            r.stop.store(true, Ordering::Release);
        }
        for r in self.running.iter_mut() {
            if let Some(t) = r.supervisor.take() {
                if t.join().is_err() {
                    warn!(receiver = r.id, "Receiver thread panicked");
                }
            }
            r.generator_stop.store(true, Ordering::Release);
            if let Some(t) = r.generator.take() {
                if t.join().is_err() {
                    warn!(receiver = r.id, "Block generator thread panicked");
                }
            }
        }
    }
}

impl Drop for ReceiverManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::clock::SystemClock;
    use crate::receiver::ReceiveStatus;

    /// Fails on the first call, then emits its numbers and finishes
    struct FailingOnce {
        calls: Arc<AtomicUsize>,
        next: u64,
    }

    impl Receiver<u64> for FailingOnce {
        fn receive(&mut self, sink: &mut ReceiverSink<u64>) -> eyre::Result<ReceiveStatus> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                eyre::bail!("connection reset");
            }
            if self.next == 10 {
                return Ok(ReceiveStatus::Finished);
            }
            sink.push(self.next);
            self.next += 1;
            Ok(ReceiveStatus::Active)
        }
    }

    #[test]
    fn failed_receiver_is_restarted() {
        let env = ReceiverEnv::for_tests(Arc::new(SystemClock), None);
        let source = NodeId::from_name("numbers");
        let calls = Arc::new(AtomicUsize::new(0));
        let receiver = FailingOnce {
            calls: Arc::clone(&calls),
            next: 0,
        };
        let mut manager = ReceiverManager::new(Arc::clone(&env));
        manager
            .start(vec![PendingReceiver::new(
                0,
                source,
                "numbers".into(),
                Box::new(receiver),
            )])
            .unwrap();
        while !manager.all_stopped() {
            std::thread::sleep(Duration::from_millis(5));
        }
        manager.stop();

        let infos = manager.infos();
        let info = &infos[0];
        assert_eq!(info.errors, 1);
        assert_eq!(info.restarts, 1);
        assert!(!info.active);
        assert_eq!(info.last_error.as_deref(), Some("connection reset"));

        let far_future = BatchTime::from_millis(u64::MAX / 2);
        let batch = env.assembler.allocate(far_future).unwrap();
        let records: Vec<u64> = batch
            .blocks_for(&source)
            .iter()
            .flat_map(|b| env.block_store.get::<u64>(&b.block).unwrap().unwrap().to_vec())
            .collect();
        assert_eq!(records, (0..10).collect::<Vec<u64>>());
        assert_eq!(info.records_received, 10);
    }
}
