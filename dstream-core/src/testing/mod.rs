//! Utilities for testing graphs and jobs without running a streaming context
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use indexmap::IndexMap;

use crate::assembler::BlockAssembler;
use crate::config::StreamingConfig;
use crate::dataset::Dataset;
use crate::executor::LocalExecutor;
use crate::graph::{ComputeEnv, ComputeError, DStream, FrozenGraph, Graph, GraphError};
use crate::operators::ForeachBatch;
use crate::receiver::{ReceiveStatus, Receiver, ReceiverSink};
use crate::scheduler::run_outputs;
use crate::state::StateStore;
use crate::storage::BlockStore;
use crate::types::{BatchTime, Data, NodeId, Persistable};

/// Serializes tests which start a streaming context, since only one context
/// may be active per process
static TEST_LOCK: Mutex<()> = Mutex::new(());

pub(crate) fn context_lock() -> MutexGuard<'static, ()> {
    TEST_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Print log output of the code under test
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// A config with one second batches, checkpointing to `checkpoint_dir` if given
pub(crate) fn test_config(checkpoint_dir: Option<&Path>) -> StreamingConfig {
    StreamingConfig::builder()
        .batch_interval(Duration::from_secs(1))
        .block_interval(Duration::from_millis(200))
        .executor_parallelism(2)
        .maybe_checkpoint_dir(checkpoint_dir.map(Path::to_path_buf))
        .build()
}

/// Runs the batches of a graph synchronously, one BatchTime after another.
///
/// The first batch is at `ZERO + batch_interval`.
pub(crate) struct TestHarness {
    graph: Graph,
    env: ComputeEnv,
    frozen: Option<FrozenGraph>,
    config: StreamingConfig,
    next: u64,
}

impl TestHarness {
    pub(crate) fn new(config: StreamingConfig) -> Self {
        let parallelism = config.effective_parallelism();
        let env = ComputeEnv {
            executor: Arc::new(LocalExecutor::new(parallelism, config.max_task_attempts)),
            block_store: Arc::new(BlockStore::new(3, 2)),
            assembler: Arc::new(BlockAssembler::new()),
            wal_root: None,
            num_partitions: parallelism,
        };
        Self {
            graph: Graph::new(config.batch_interval, Arc::new(StateStore::new())),
            env,
            frozen: None,
            config,
            next: 1,
        }
    }

    pub(crate) fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Read blocks missing from the block store back from the received data
    /// log under `root`
    pub(crate) fn read_received_data_from(&mut self, root: &Path) {
        self.env.wal_root = Some(root.to_path_buf());
    }

    pub(crate) fn env(&self) -> &ComputeEnv {
        &self.env
    }

    /// BatchTime of the `k`th batch
    pub(crate) fn time_of(&self, k: u64) -> BatchTime {
        BatchTime::ZERO + self.config.batch_interval * k as u32
    }

    /// Freeze the graph. Calling this again has no effect.
    pub(crate) fn freeze(&mut self) -> Result<(), GraphError> {
        if self.frozen.is_none() {
            let mut frozen = self.graph.freeze(&self.config)?;
            frozen.set_zero_time(BatchTime::ZERO);
            self.frozen = Some(frozen);
        }
        Ok(())
    }

    fn frozen(&mut self) -> &mut FrozenGraph {
        self.freeze().expect("graph should be valid");
        self.frozen.as_mut().expect("graph is frozen")
    }

    /// Materialize a node, treating "no dataset" as an empty one
    pub(crate) fn materialize<V: Data>(&mut self, id: NodeId, time: BatchTime) -> Result<Dataset<V>, ComputeError> {
        let env = self.env.clone();
        let dataset = self.frozen().materialize_typed::<V>(id, time, &env)?;
        Ok(dataset.unwrap_or_default())
    }

    pub(crate) fn uncache(&mut self, id: NodeId, time: BatchTime) {
        self.frozen().uncache(id, time);
    }

    /// Record every dataset of `stream`
    pub(crate) fn collect<V: Data>(&self, name: &str, stream: &DStream<V>) -> VecSink<V> {
        let sink = VecSink::default();
        let recorder = sink.clone();
        stream
            .foreach_batch(name, move |dataset: Dataset<V>, time: BatchTime| {
                recorder.push(time, dataset.collect());
                Ok(())
            })
            .expect("sink should be added");
        sink
    }

    /// Run the output actions of the next `n` batches, stopping at the first
    /// failing batch
    pub(crate) fn run_batches(&mut self, n: u64) -> Result<(), ComputeError> {
        let env = self.env.clone();
        for _ in 0..n {
            let time = self.time_of(self.next);
            self.next += 1;
            env.assembler.allocate(time).expect("batch times increase");
            let graph = self.frozen();
            run_outputs(graph, time, &env)?;
            graph.clear_old(time);
        }
        Ok(())
    }

    /// Continue after `n` batches without running them, as a job recovered
    /// from a checkpoint does
    pub(crate) fn skip_batches(&mut self, n: u64) {
        self.next += n;
    }

    /// The frozen graph and its environment, for running it on a job runner
    pub(crate) fn into_parts(mut self) -> (FrozenGraph, ComputeEnv) {
        self.freeze().expect("graph should be valid");
        (self.frozen.take().expect("graph is frozen"), self.env)
    }

    pub(crate) fn snapshot_states(&mut self) -> Result<IndexMap<NodeId, Vec<u8>>, ComputeError> {
        self.frozen().snapshot_states()
    }

    pub(crate) fn restore_states(&mut self, states: &IndexMap<NodeId, Vec<u8>>) -> Result<(), ComputeError> {
        self.frozen().restore_states(states)
    }
}

/// Records collected by [TestHarness::collect]. Clones share the records.
pub(crate) struct VecSink<V> {
    batches: Arc<Mutex<Vec<(BatchTime, Vec<V>)>>>,
}

impl<V> Clone for VecSink<V> {
    fn clone(&self) -> Self {
        Self {
            batches: Arc::clone(&self.batches),
        }
    }
}

impl<V> Default for VecSink<V> {
    fn default() -> Self {
        Self {
            batches: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<V> VecSink<V> {
    fn push(&self, time: BatchTime, records: Vec<V>) {
        self.batches.lock().unwrap().push((time, records));
    }

    /// Take the records of the batch at `time`, empty if the batch never ran
    pub(crate) fn drain_batch(&self, time: BatchTime) -> Vec<V> {
        let mut batches = self.batches.lock().unwrap();
        match batches.iter().position(|(t, _)| *t == time) {
            Some(i) => batches.remove(i).1,
            None => Vec::new(),
        }
    }

    /// BatchTimes of all recorded batches, in the order they ran
    pub(crate) fn batch_times(&self) -> Vec<BatchTime> {
        self.batches.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }
}

/// A receiver emitting whatever is sent through the paired channel. It
/// finishes once the sender is dropped and all records were received.
pub(crate) struct QueueReceiver<V> {
    rx: flume::Receiver<V>,
}

impl<V> QueueReceiver<V> {
    pub(crate) fn new() -> (flume::Sender<V>, Self) {
        let (tx, rx) = flume::unbounded();
        (tx, Self { rx })
    }
}

impl<V: Data + Persistable> Receiver<V> for QueueReceiver<V> {
    fn receive(&mut self, sink: &mut ReceiverSink<V>) -> eyre::Result<ReceiveStatus> {
        let mut received = false;
        for record in self.rx.try_iter() {
            sink.push(record);
            received = true;
        }
        if received {
            Ok(ReceiveStatus::Active)
        } else if self.rx.is_disconnected() {
            Ok(ReceiveStatus::Finished)
        } else {
            Ok(ReceiveStatus::Idle)
        }
    }
}
