use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::assembler::BlockAssembler;
use crate::dataset::{downcast, Dataset, ErasedDataset};
use crate::executor::{BatchExecutor, ExecutorError};
use crate::state::StateError;
use crate::storage::{BlockStore, BlockStoreError, WalError};
use crate::types::{interval_millis, BatchTime, Data, NodeId};

/// Operator kind of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Fed by receivers
    ReceiverSource {
        /// Number of receivers feeding the node
        receivers: usize,
    },
    /// Fed by a queue of prepared batches
    QueueSource,
    /// Record by record transformation
    Map,
    /// Record to many records transformation
    FlatMap,
    /// Record filter
    Filter,
    /// Arbitrary dataset to dataset function
    Transform,
    /// Concatenation of streams
    Union,
    /// Inner join of two keyed streams
    Join,
    /// Union over a sliding window
    Window,
    /// Per-key combination within one batch
    ReduceByKey,
    /// Per-key combination over a sliding window
    ReduceByKeyAndWindow {
        /// True if computed incrementally with an inverse function
        incremental: bool,
    },
    /// Per-key state carried across all batches
    UpdateStateByKey,
    /// Number of records per batch
    Count,
    /// Side effecting action
    Output,
}

impl NodeKind {
    /// True for nodes without upstreams
    pub fn is_source(&self) -> bool {
        matches!(self, NodeKind::ReceiverSource { .. } | NodeKind::QueueSource)
    }
}

/// Structural description of a node. Two graphs with equal descriptors can
/// share checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Id derived from the name
    pub id: NodeId,
    /// Unique name given at construction
    pub name: String,
    /// Operator kind
    pub kind: NodeKind,
    /// Upstream nodes in argument order
    pub upstreams: Vec<NodeId>,
    /// Interval at which the node produces datasets, in ms
    pub slide_ms: u64,
    /// Length of the node's window in ms, for windowed nodes
    pub window_ms: Option<u64>,
}

impl NodeDescriptor {
    pub(crate) fn new(name: &str, kind: NodeKind, upstreams: Vec<NodeId>, slide: Duration) -> Self {
        Self {
            id: NodeId::from_name(name),
            name: name.to_string(),
            kind,
            upstreams,
            slide_ms: interval_millis(slide),
            window_ms: None,
        }
    }

    pub(crate) fn with_id(mut self, id: NodeId) -> Self {
        self.id = id;
        self
    }

    pub(crate) fn with_window(mut self, window: Duration) -> Self {
        self.window_ms = Some(interval_millis(window));
        self
    }

    /// Interval at which the node produces datasets
    pub fn slide(&self) -> Duration {
        Duration::from_millis(self.slide_ms)
    }

    /// Window length of windowed nodes
    pub fn window(&self) -> Option<Duration> {
        self.window_ms.map(Duration::from_millis)
    }

    /// True if the node produces a dataset at `time` in a job whose zero time
    /// is `zero`
    pub fn is_valid_time(&self, time: BatchTime, zero: BatchTime) -> bool {
        time.is_aligned(zero, self.slide())
    }
}

/// Failure materializing a node for a BatchTime
#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("{blocks} blocks of source {name} for batch {time} were lost")]
    SourceDataLoss {
        name: String,
        node: NodeId,
        time: BatchTime,
        blocks: usize,
    },
    #[error("Output {output} failed")]
    Output {
        output: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Dataset of node {0} has an unexpected type")]
    TypeMismatch(NodeId),
    #[error("Node {0} is not part of the graph")]
    UnknownNode(NodeId),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    BlockStore(#[from] BlockStoreError),
    #[error("Failed to read received data from the write-ahead log")]
    Wal(#[from] WalError),
    #[error("Failed to encode state of node {node}")]
    Snapshot {
        node: String,
        #[source]
        source: rmp_serde::encode::Error,
    },
    #[error("Failed to decode state of node {node}")]
    Restore {
        node: String,
        #[source]
        source: rmp_serde::decode::Error,
    },
}

impl ComputeError {
    /// Errors which indicate corrupted internal state. A job hitting one of these
    /// cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ComputeError::TypeMismatch(_)
                | ComputeError::UnknownNode(_)
                | ComputeError::State(_)
                | ComputeError::Snapshot { .. }
                | ComputeError::Restore { .. }
        )
    }
}

/// Services shared by all nodes of a running graph
#[derive(Clone)]
pub(crate) struct ComputeEnv {
    pub(crate) executor: Arc<dyn BatchExecutor>,
    pub(crate) block_store: Arc<BlockStore>,
    pub(crate) assembler: Arc<BlockAssembler>,
    /// Checkpoint directory holding received data logs, if enabled
    pub(crate) wal_root: Option<PathBuf>,
    /// Number of partitions produced by shuffles
    pub(crate) num_partitions: usize,
}

pub(crate) type DatasetCache = HashMap<(NodeId, BatchTime), ErasedDataset>;

/// Handed to a node while it computes its dataset for one BatchTime
pub(crate) struct ComputeContext<'a> {
    pub(crate) zero: BatchTime,
    pub(crate) cache: &'a DatasetCache,
    pub(crate) env: &'a ComputeEnv,
}

impl<'a> ComputeContext<'a> {
    /// Dataset of an upstream node at `time`. Upstreams which produce no dataset
    /// at `time` yield an empty dataset.
    pub(crate) fn input<V: Data>(&self, node: NodeId, time: BatchTime) -> Result<Dataset<V>, ComputeError> {
        match self.cache.get(&(node, time)) {
            Some(erased) => downcast::<V>(erased).ok_or(ComputeError::TypeMismatch(node)),
            None => Ok(Dataset::empty()),
        }
    }

    pub(crate) fn executor(&self) -> &dyn BatchExecutor {
        self.env.executor.as_ref()
    }
}

/// A type erased node of the graph
pub(crate) trait ComputeNode: Send {
    fn descriptor(&self) -> &NodeDescriptor;

    /// Upstream datasets which must be materialised before computing `time`.
    /// Defaults to every upstream at the same time.
    fn dependencies(&self, time: BatchTime, _zero: BatchTime) -> Vec<(NodeId, BatchTime)> {
        self.descriptor()
            .upstreams
            .iter()
            .map(|u| (*u, time))
            .collect()
    }

    /// How far before its own time this node reads its upstreams
    fn lookback(&self) -> Duration {
        Duration::ZERO
    }

    /// True if the node can only run with checkpointing enabled
    fn requires_checkpointing(&self) -> bool {
        false
    }

    /// Compute the dataset at `time`. Output nodes run their action and return
    /// `None`.
    fn compute(
        &mut self,
        time: BatchTime,
        ctx: &mut ComputeContext<'_>,
    ) -> Result<Option<ErasedDataset>, ComputeError>;

    /// Drop internal data only needed for times before `threshold`
    fn forget_before(&mut self, _threshold: BatchTime) {}

    /// Serialized internal state, for nodes which have any
    fn snapshot(&self) -> Result<Option<Vec<u8>>, ComputeError> {
        Ok(None)
    }

    /// Restore the state produced by [ComputeNode::snapshot]
    fn restore(&mut self, _bytes: &[u8]) -> Result<(), ComputeError> {
        Ok(())
    }
}
