//! Monitoring feed of a running job.
//!
//! Events are posted to a [ListenerBus] and delivered to all registered
//! [StreamingListener]s on a dedicated thread, so a slow listener never blocks
//! the scheduler or a receiver.
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use indexmap::IndexMap;
use tracing::{debug, warn};

use super::job::BatchInfo;
use crate::receiver::ReceiverInfo;
use crate::types::{BatchTime, NodeId, ReceiverId};

/// Something that happened in a running job
#[derive(Debug, Clone)]
pub enum StreamingEvent {
    /// A batch was generated and queued
    BatchSubmitted(BatchInfo),
    /// The job runner started a batch
    BatchStarted(BatchInfo),
    /// All output actions of a batch completed
    BatchCompleted(BatchInfo),
    /// A batch failed
    BatchFailed {
        /// The failed batch
        info: BatchInfo,
        /// Rendered error
        error: String,
    },
    /// An output action returned an error
    OutputFailed {
        /// Batch the action ran for
        time: BatchTime,
        /// Name of the output node
        output: String,
        /// Rendered error
        error: String,
    },
    /// Blocks of a batch could be found neither in the block store nor in the
    /// write-ahead log
    DataLoss {
        /// Batch missing the blocks
        time: BatchTime,
        /// Source node of the lost blocks
        source: NodeId,
        /// Number of lost blocks
        blocks: usize,
    },
    /// A receiver started
    ReceiverStarted(ReceiverInfo),
    /// A receiver failed and will be restarted
    ReceiverError(ReceiverInfo),
    /// A receiver stopped for good
    ReceiverStopped(ReceiverInfo),
    /// A checkpoint was durably written
    CheckpointCompleted(BatchTime),
    /// Backpressure computed a new rate for a source
    RateUpdated {
        /// Source node the rate applies to
        source: NodeId,
        /// New rate in records/sec for the whole source
        rate: u64,
    },
}

/// Receives the events of a running job. All methods have empty default
/// implementations.
#[allow(unused_variables)]
pub trait StreamingListener: Send + 'static {
    /// A batch was generated and queued
    fn on_batch_submitted(&mut self, info: &BatchInfo) {}
    /// The job runner started a batch
    fn on_batch_started(&mut self, info: &BatchInfo) {}
    /// All output actions of a batch completed
    fn on_batch_completed(&mut self, info: &BatchInfo) {}
    /// A batch failed
    fn on_batch_failed(&mut self, info: &BatchInfo, error: &str) {}
    /// An output action returned an error
    fn on_output_failed(&mut self, time: BatchTime, output: &str, error: &str) {}
    /// Received data was lost
    fn on_data_loss(&mut self, time: BatchTime, source: NodeId, blocks: usize) {}
    /// A receiver started
    fn on_receiver_started(&mut self, info: &ReceiverInfo) {}
    /// A receiver failed
    fn on_receiver_error(&mut self, info: &ReceiverInfo) {}
    /// A receiver stopped
    fn on_receiver_stopped(&mut self, info: &ReceiverInfo) {}
    /// A checkpoint was completed
    fn on_checkpoint_completed(&mut self, time: BatchTime) {}
    /// Backpressure updated a source's rate
    fn on_rate_updated(&mut self, source: NodeId, rate: u64) {}
}

fn dispatch(listener: &mut dyn StreamingListener, event: &StreamingEvent) {
    match event {
        StreamingEvent::BatchSubmitted(info) => listener.on_batch_submitted(info),
        StreamingEvent::BatchStarted(info) => listener.on_batch_started(info),
        StreamingEvent::BatchCompleted(info) => listener.on_batch_completed(info),
        StreamingEvent::BatchFailed { info, error } => listener.on_batch_failed(info, error),
        StreamingEvent::OutputFailed {
            time,
            output,
            error,
        } => listener.on_output_failed(*time, output, error),
        StreamingEvent::DataLoss {
            time,
            source,
            blocks,
        } => listener.on_data_loss(*time, *source, *blocks),
        StreamingEvent::ReceiverStarted(info) => listener.on_receiver_started(info),
        StreamingEvent::ReceiverError(info) => listener.on_receiver_error(info),
        StreamingEvent::ReceiverStopped(info) => listener.on_receiver_stopped(info),
        StreamingEvent::CheckpointCompleted(time) => listener.on_checkpoint_completed(*time),
        StreamingEvent::RateUpdated { source, rate } => listener.on_rate_updated(*source, *rate),
    }
}

enum BusMessage {
    Event(StreamingEvent),
    AddListener(Box<dyn StreamingListener>),
    Stop,
}

/// Delivers events to listeners on a background thread. Cloning the bus gives
/// another handle posting to the same thread.
#[derive(Clone)]
pub struct ListenerBus {
    tx: flume::Sender<BusMessage>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for ListenerBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerBus").finish_non_exhaustive()
    }
}

impl ListenerBus {
    /// Start the bus thread
    pub fn start() -> Self {
        let (tx, rx) = flume::unbounded::<BusMessage>();
        let thread = std::thread::Builder::new()
            .name("dstream-listener-bus".into())
            .spawn(move || {
                let mut listeners: Vec<Box<dyn StreamingListener>> = Vec::new();
                while let Ok(msg) = rx.recv() {
                    match msg {
                        BusMessage::Event(event) => {
                            for l in listeners.iter_mut() {
                                dispatch(l.as_mut(), &event);
                            }
                        }
                        BusMessage::AddListener(l) => listeners.push(l),
                        BusMessage::Stop => break,
                    }
                }
                debug!("Listener bus stopped");
            });
        let thread = match thread {
            Ok(t) => Some(t),
            Err(e) => {
                warn!("Could not start listener bus, events will be dropped: {e}");
                None
            }
        };
        Self {
            tx,
            thread: Arc::new(Mutex::new(thread)),
        }
    }

    /// Register a listener. It receives all events posted after this call.
    pub fn add_listener(&self, listener: impl StreamingListener) {
        let _ = self.tx.send(BusMessage::AddListener(Box::new(listener)));
    }

    /// Post an event. Events posted after the bus was stopped are dropped.
    pub fn post(&self, event: StreamingEvent) {
        let _ = self.tx.send(BusMessage::Event(event));
    }

    /// Deliver all pending events and stop the bus thread
    pub fn stop(&self) {
        let _ = self.tx.send(BusMessage::Stop);
        #[allow(clippy::unwrap_used)]
        let thread = self.thread.lock().unwrap().take();
        if let Some(t) = thread {
            let _ = t.join();
        }
    }
}

/// Counters of one receiver
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReceiverStatistics {
    /// True while the receiver is running
    pub active: bool,
    /// Number of failures
    pub errors: u64,
    /// Number of records received
    pub records: u64,
    /// Number of restarts after failures
    pub restarts: u64,
    /// Last reported error
    pub last_error: Option<String>,
}

/// Point in time view of the statistics of a job
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatisticsSnapshot {
    /// Number of batches which completed
    pub batches_completed: u64,
    /// Number of batches which failed
    pub batches_failed: u64,
    /// Number of failed output actions
    pub output_errors: u64,
    /// Number of blocks reported lost
    pub lost_blocks: u64,
    /// Number of records processed by completed batches
    pub records_processed: u64,
    /// Last completed BatchTime
    pub last_completed: Option<BatchTime>,
    /// Processing time of the last completed batch
    pub last_processing_time: Option<Duration>,
    /// Scheduling delay of the last started batch
    pub last_scheduling_delay: Option<Duration>,
    /// Batches queued behind the last started batch
    pub backlog: usize,
    /// Last completed checkpoint
    pub last_checkpoint: Option<BatchTime>,
    /// Last rate published per source
    pub rates: IndexMap<NodeId, u64>,
    /// Counters per receiver
    pub receivers: IndexMap<ReceiverId, ReceiverStatistics>,
}

/// Listener collecting counters of a job. Clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct StreamingStatistics {
    inner: Arc<Mutex<StatisticsSnapshot>>,
}

impl StreamingStatistics {
    /// Create a new collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current counters
    pub fn snapshot(&self) -> StatisticsSnapshot {
        #[allow(clippy::unwrap_used)]
        self.inner.lock().unwrap().clone()
    }

    fn update(&self, f: impl FnOnce(&mut StatisticsSnapshot)) {
        #[allow(clippy::unwrap_used)]
        f(&mut self.inner.lock().unwrap())
    }

    fn update_receiver(&self, info: &ReceiverInfo) {
        self.update(|s| {
            let entry = s.receivers.entry(info.id).or_default();
            entry.active = info.active;
            entry.errors = info.errors;
            entry.records = info.records_received;
            entry.restarts = info.restarts;
            entry.last_error.clone_from(&info.last_error);
        })
    }
}

impl StreamingListener for StreamingStatistics {
    fn on_batch_started(&mut self, info: &BatchInfo) {
        self.update(|s| {
            s.last_scheduling_delay = info.scheduling_delay();
            s.backlog = info.backlog;
        })
    }

    fn on_batch_completed(&mut self, info: &BatchInfo) {
        self.update(|s| {
            s.batches_completed += 1;
            s.records_processed += info.num_records() as u64;
            s.last_completed = Some(info.time);
            s.last_processing_time = info.processing_time();
        })
    }

    fn on_batch_failed(&mut self, _info: &BatchInfo, _error: &str) {
        self.update(|s| s.batches_failed += 1)
    }

    fn on_output_failed(&mut self, _time: BatchTime, _output: &str, _error: &str) {
        self.update(|s| s.output_errors += 1)
    }

    fn on_data_loss(&mut self, _time: BatchTime, _source: NodeId, blocks: usize) {
        self.update(|s| s.lost_blocks += blocks as u64)
    }

    fn on_receiver_started(&mut self, info: &ReceiverInfo) {
        self.update_receiver(info)
    }

    fn on_receiver_error(&mut self, info: &ReceiverInfo) {
        self.update_receiver(info)
    }

    fn on_receiver_stopped(&mut self, info: &ReceiverInfo) {
        self.update_receiver(info)
    }

    fn on_checkpoint_completed(&mut self, time: BatchTime) {
        self.update(|s| s.last_checkpoint = Some(time))
    }

    fn on_rate_updated(&mut self, source: NodeId, rate: u64) {
        self.update(|s| {
            s.rates.insert(source, rate);
        })
    }
}
