//! The entry point of every streaming job.
//!
//! A [StreamingContext] owns the DStream graph while it is being built and all
//! threads of the job once it started: receivers, the job generator, the job
//! runner and the checkpoint writer.
//!
//! # Recovery
//! [StreamingContext::get_or_create] loads the newest checkpoint from the
//! configured checkpoint directory. Since closures can not be persisted, the
//! graph is always built by the given function; the checkpoint only restores
//! node state and where scheduling resumes. The rebuilt graph must have the same
//! structure as the graph which wrote the checkpoint.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::assembler::{AssemblerError, BlockAssembler};
use crate::checkpoint::{CheckpointError, CheckpointRecord, CheckpointStore, FileCheckpointStore};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, StreamingConfig};
use crate::executor::{BatchExecutor, LocalExecutor};
use crate::graph::{ComputeEnv, ComputeError, DStream, Graph, GraphError};
use crate::operators::InputQueue;
use crate::receiver::{RateBus, Receiver, ReceiverEnv, ReceiverError, ReceiverInfo, ReceiverManager};
use crate::scheduler::{
    spawn_checkpoint_writer, Checkpointing, GeneratorParts, JobGenerator, JobRunner, ListenerBus, RateController,
    ReceivedDataCleanup, RunnerParts, SchedulerError, StreamingListener, StreamingStatistics, Termination,
};
use crate::state::{StateError, StateHandle, StateStore};
use crate::storage::BlockStore;
use crate::types::{interval_millis, Data, Key, Persistable};

/// Directory below the checkpoint directory holding the block tracker log
const BLOCK_METADATA_DIR: &str = "receivedBlockMetadata";

/// Set while any context of this process is active
static ACTIVE: AtomicBool = AtomicBool::new(false);

/// How [StreamingContext::stop] treats data which was not processed yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Stop the receivers, then schedule and process everything they received
    /// before stopping
    Graceful,
    /// Let the running batch finish and discard all queued batches
    Immediate,
}

/// Lifecycle state of a [StreamingContext]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Created, the graph can be modified
    Initialized,
    /// Started and not stopped yet
    Active,
    /// Stopped. A stopped context can not be started again.
    Stopped,
}

/// Threads of a started context. Dropped in field order, so the generator
/// closes the job queue before the runner is joined.
struct Running {
    receivers: ReceiverManager,
    generator: JobGenerator,
    runner: JobRunner,
    assembler: Arc<BlockAssembler>,
}

enum Lifecycle {
    Initialized,
    Active(Box<Running>),
    Stopped,
}

/// A streaming job: build the graph, then [start](StreamingContext::start) it
pub struct StreamingContext {
    config: StreamingConfig,
    graph: Graph,
    state_store: Arc<StateStore>,
    listener: ListenerBus,
    statistics: StreamingStatistics,
    clock: Arc<dyn Clock>,
    executor: Arc<dyn BatchExecutor>,
    recovered: Option<CheckpointRecord>,
    lifecycle: Mutex<Lifecycle>,
    termination: Arc<Termination>,
}

impl std::fmt::Debug for StreamingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingContext")
            .field("state", &self.state())
            .field("graph", &self.graph)
            .finish_non_exhaustive()
    }
}

impl StreamingContext {
    /// Create a context with a fresh graph
    pub fn new(config: StreamingConfig) -> Result<Self, ContextError> {
        config.validate()?;
        let state_store = Arc::new(StateStore::new());
        let graph = Graph::new(config.batch_interval, Arc::clone(&state_store));
        let listener = ListenerBus::start();
        let statistics = StreamingStatistics::new();
        listener.add_listener(statistics.clone());
        let executor = Arc::new(LocalExecutor::new(
            config.effective_parallelism(),
            config.max_task_attempts,
        ));
        Ok(Self {
            config,
            graph,
            state_store,
            listener,
            statistics,
            clock: Arc::new(SystemClock),
            executor,
            recovered: None,
            lifecycle: Mutex::new(Lifecycle::Initialized),
            termination: Arc::new(Termination::default()),
        })
    }

    /// Recover the job from the newest checkpoint in the configured checkpoint
    /// directory, or create it fresh if there is none.
    ///
    /// `build` defines the graph in both cases. When recovering, it must define
    /// the same graph as the job which wrote the checkpoint.
    pub fn get_or_create(
        config: StreamingConfig,
        build: impl FnOnce(&StreamingContext) -> eyre::Result<()>,
    ) -> Result<Self, ContextError> {
        let mut ctx = Self::new(config)?;
        let latest = match &ctx.config.checkpoint_dir {
            Some(dir) => FileCheckpointStore::new(dir, ctx.config.checkpoint_retention).load_latest()?,
            None => None,
        };
        build(&ctx).map_err(|e| ContextError::Build(e.into()))?;
        if let Some(record) = latest {
            if let Some(diff) = record.graph.diff(&ctx.graph.descriptor()) {
                return Err(ContextError::SerializationIncompatibility { diff });
            }
            info!(checkpoint = %record.batch_time, "Recovering from checkpoint");
            ctx.recovered = Some(record);
        }
        Ok(ctx)
    }

    /// Use another clock for batch ticks and receiver timing
    pub fn with_clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Use another executor for partition tasks
    pub fn with_executor(mut self, executor: impl BatchExecutor) -> Self {
        self.executor = Arc::new(executor);
        self
    }

    /// The validated configuration
    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    /// The graph of this context
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// See [Graph::queue_stream]
    pub fn queue_stream<V: Data>(&self, name: &str) -> Result<(DStream<V>, InputQueue<V>), GraphError> {
        self.graph.queue_stream(name)
    }

    /// See [Graph::receiver_stream]
    pub fn receiver_stream<V, R>(&self, name: &str, receivers: Vec<R>) -> Result<DStream<V>, GraphError>
    where
        V: Data + Persistable,
        R: Receiver<V>,
    {
        self.graph.receiver_stream(name, receivers)
    }

    /// Read access to the per-key state of a stream created by
    /// [update_state_by_key](crate::operators::UpdateStateByKey::update_state_by_key)
    pub fn state_handle<K: Key, S: Data>(&self, stream: &DStream<(K, S)>) -> Result<StateHandle<K, S>, StateError> {
        self.state_store.handle(&stream.id())
    }

    /// Register a listener for the job's monitoring events
    pub fn add_listener(&self, listener: impl StreamingListener) {
        self.listener.add_listener(listener);
    }

    /// Counters collected from the job's monitoring events
    pub fn statistics(&self) -> &StreamingStatistics {
        &self.statistics
    }

    /// The checkpoint this context resumes from, if any
    pub fn recovered_checkpoint(&self) -> Option<&CheckpointRecord> {
        self.recovered.as_ref()
    }

    /// Monitoring counters of all receivers, empty unless the context is active
    pub fn receiver_infos(&self) -> Vec<ReceiverInfo> {
        match &*self.lock() {
            Lifecycle::Active(running) => running.receivers.infos(),
            _ => Vec::new(),
        }
    }

    /// True if the context is active and every receiver finished
    pub fn receivers_finished(&self) -> bool {
        match &*self.lock() {
            Lifecycle::Active(running) => running.receivers.all_stopped(),
            _ => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        #[allow(clippy::unwrap_used)]
        self.lifecycle.lock().unwrap()
    }

    /// Current lifecycle state
    pub fn state(&self) -> ContextState {
        match *self.lock() {
            Lifecycle::Initialized => ContextState::Initialized,
            Lifecycle::Active(_) => ContextState::Active,
            Lifecycle::Stopped => ContextState::Stopped,
        }
    }

    /// Freeze the graph and start receiving and scheduling.
    ///
    /// Only one context can be active per process.
    pub fn start(&self) -> Result<(), ContextError> {
        let mut lifecycle = self.lock();
        match *lifecycle {
            Lifecycle::Initialized => (),
            Lifecycle::Active(_) => return Err(ContextError::AlreadyStarted),
            Lifecycle::Stopped => return Err(ContextError::AlreadyStopped),
        }
        if ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ContextError::AnotherContextActive);
        }
        match self.launch() {
            Ok(running) => {
                *lifecycle = Lifecycle::Active(Box::new(running));
                info!("Streaming context started");
                Ok(())
            }
            Err(e) => {
                // the graph may be frozen already, so this context is done
                *lifecycle = Lifecycle::Stopped;
                self.termination.finish();
                ACTIVE.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    fn launch(&self) -> Result<Running, ContextError> {
        let config = &self.config;
        let batch_interval = config.batch_interval;
        let mut graph = self.graph.freeze(config)?;

        let (zero, first) = match &self.recovered {
            Some(record) => {
                graph.restore_states(&record.node_states)?;
                (record.zero_time, record.batch_time + batch_interval)
            }
            None => {
                let first = self.clock.now().floor(batch_interval) + batch_interval;
                (first - batch_interval, first)
            }
        };
        graph.set_zero_time(zero);
        info!(%zero, %first, "Scheduling first batch");

        let wal_root = if config.write_ahead_log_enabled {
            config.checkpoint_dir.clone()
        } else {
            None
        };
        let assembler = Arc::new(match &wal_root {
            Some(dir) => BlockAssembler::with_log(
                dir.join(BLOCK_METADATA_DIR),
                config.wal_rolling_interval,
                self.recovered.is_some(),
            )?,
            None => BlockAssembler::new(),
        });
        let parallelism = config.effective_parallelism();
        let block_store = Arc::new(BlockStore::new(
            parallelism.max(config.replication_factor),
            config.replication_factor,
        ));

        let mut rates = RateBus::new();
        let initial_rate = if config.backpressure_enabled {
            config.backpressure_initial_rate
        } else {
            None
        };
        for (source, receivers) in graph.receiver_sources() {
            rates.register(source, receivers, initial_rate);
        }
        let rates = Arc::new(rates);

        let mut receivers = ReceiverManager::new(Arc::new(ReceiverEnv {
            block_store: Arc::clone(&block_store),
            assembler: Arc::clone(&assembler),
            clock: Arc::clone(&self.clock),
            listener: self.listener.clone(),
            rates: Arc::clone(&rates),
            block_interval: config.block_interval,
            restart_delay: config.receiver_restart_delay,
            max_rate: config.max_receiver_rate,
            wal_root: wal_root.clone(),
            wal_rolling_interval: config.wal_rolling_interval,
        }));
        receivers.start(graph.take_receivers())?;

        let cleanup = Arc::new(ReceivedDataCleanup {
            assembler: Arc::clone(&assembler),
            block_store: Arc::clone(&block_store),
            logs: receivers.logs(),
            retention: graph.max_retention(),
        });
        let stop_generation = Arc::new(AtomicBool::new(false));
        let checkpointing = match &config.checkpoint_dir {
            Some(dir) => Some(Checkpointing {
                writer: spawn_checkpoint_writer(
                    FileCheckpointStore::new(dir, config.checkpoint_retention),
                    self.listener.clone(),
                    Arc::clone(&cleanup),
                    Arc::clone(&self.termination),
                    Arc::clone(&stop_generation),
                )
                .map_err(ContextError::Spawn)?,
                interval: config.effective_checkpoint_interval(),
            }),
            None => None,
        };
        let rate = config.backpressure_enabled.then(|| {
            RateController::new(
                Arc::clone(&rates),
                self.listener.clone(),
                interval_millis(batch_interval),
                config.rate_estimator,
            )
        });

        let env = ComputeEnv {
            executor: Arc::clone(&self.executor),
            block_store,
            assembler: Arc::clone(&assembler),
            wal_root,
            num_partitions: parallelism,
        };
        let (jobs_tx, jobs_rx) = flume::unbounded();
        let runner = JobRunner::spawn(RunnerParts {
            graph,
            env,
            jobs: jobs_rx,
            clock: Arc::clone(&self.clock),
            listener: self.listener.clone(),
            rate,
            checkpointing,
            cleanup,
            termination: Arc::clone(&self.termination),
            stop_generation: Arc::clone(&stop_generation),
        })
        .map_err(ContextError::Spawn)?;
        let generator = JobGenerator::spawn(GeneratorParts {
            first,
            batch_interval,
            clock: Arc::clone(&self.clock),
            assembler: Arc::clone(&assembler),
            listener: self.listener.clone(),
            jobs: jobs_tx,
            termination: Arc::clone(&self.termination),
            stop: stop_generation,
        })
        .map_err(ContextError::Spawn)?;

        Ok(Running {
            receivers,
            generator,
            runner,
            assembler,
        })
    }

    /// Stop the job. Stopping a stopped context has no effect.
    ///
    /// With `stop_executor` the executor is shut down as well and rejects all
    /// further work.
    pub fn stop(&self, mode: StopMode, stop_executor: bool) {
        let mut lifecycle = self.lock();
        match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Stopped => return,
            Lifecycle::Initialized => (),
            Lifecycle::Active(mut running) => {
                info!(?mode, "Stopping streaming context");
                match mode {
                    StopMode::Graceful => {
                        running.receivers.stop();
                        running.generator.drain();
                        running.runner.join();
                    }
                    StopMode::Immediate => {
                        running.runner.abandon();
                        running.generator.stop();
                        running.runner.join();
                        running.receivers.stop();
                    }
                }
                running.assembler.stop();
                ACTIVE.store(false, Ordering::Release);
            }
        }
        self.termination.finish();
        self.listener.stop();
        if stop_executor {
            self.executor.shutdown();
        }
        info!("Streaming context stopped");
    }

    /// Block until the context stopped. Returns the error which terminated the
    /// job, if it stopped because of one.
    pub fn await_termination(&self) -> Result<(), ContextError> {
        self.termination.wait().map_err(ContextError::Terminated)
    }

    /// Like [StreamingContext::await_termination], but gives up after
    /// `timeout`. Returns `true` if the context stopped.
    pub fn await_termination_timeout(&self, timeout: Duration) -> Result<bool, ContextError> {
        match self.termination.wait_timeout(timeout) {
            None => Ok(false),
            Some(Ok(())) => Ok(true),
            Some(Err(e)) => Err(ContextError::Terminated(e)),
        }
    }
}

impl Drop for StreamingContext {
    fn drop(&mut self) {
        if self.state() == ContextState::Active {
            warn!("Streaming context dropped while active, stopping immediately");
        }
        self.stop(StopMode::Immediate, false);
    }
}

/// Failure creating, starting or running a [StreamingContext]
#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("The streaming context was already started")]
    AlreadyStarted,
    #[error("A stopped streaming context can not be started again")]
    AlreadyStopped,
    #[error("Another streaming context is already active in this process")]
    AnotherContextActive,
    #[error("The checkpoint was written by a different graph: {diff}")]
    SerializationIncompatibility { diff: String },
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("Building the graph failed")]
    Build(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Failed to restore node state from the checkpoint")]
    Restore(#[from] ComputeError),
    #[error(transparent)]
    Receiver(#[from] ReceiverError),
    #[error("Failed to open the block tracker log")]
    Assembler(#[from] AssemblerError),
    #[error("Failed to start a job thread")]
    Spawn(#[source] std::io::Error),
    #[error("The job terminated with an error")]
    Terminated(#[from] Arc<SchedulerError>),
}
