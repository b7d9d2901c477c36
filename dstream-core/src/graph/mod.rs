//! The DStream graph.
//!
//! User code adds nodes through the operators on [DStream] until the graph is
//! frozen when the streaming context starts. A frozen graph computes datasets
//! lazily: only nodes reachable from an output node are materialized for a
//! BatchTime, and every dataset is computed at most once while it is retained.
mod node;

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use indexmap::IndexMap;
use itertools::{EitherOrBoth, Itertools};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, debug_span};

pub use node::{ComputeError, NodeDescriptor, NodeKind};
pub(crate) use node::{ComputeContext, ComputeEnv, ComputeNode, DatasetCache};

use crate::config::StreamingConfig;
use crate::dataset::ErasedDataset;
#[cfg(test)]
use crate::dataset::{downcast, Dataset};
use crate::receiver::{PendingReceiver, Receiver};
use crate::state::{StateError, StateStore};
use crate::types::{interval_millis, is_multiple_of, BatchTime, Data, NodeId, Persistable, ReceiverId};

/// A discretized stream: one dataset of `V` per BatchTime at which the stream's
/// node is valid.
///
/// A DStream is a cheap handle to a node of the graph. Operators are provided
/// by the traits in [operators](crate::operators).
pub struct DStream<V> {
    graph: Graph,
    id: NodeId,
    slide: Duration,
    _data: PhantomData<fn() -> V>,
}

impl<V> Clone for DStream<V> {
    fn clone(&self) -> Self {
        Self {
            graph: self.graph.clone(),
            id: self.id,
            slide: self.slide,
            _data: PhantomData,
        }
    }
}

impl<V> std::fmt::Debug for DStream<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DStream")
            .field("id", &self.id)
            .field("slide", &self.slide)
            .finish()
    }
}

impl<V> DStream<V> {
    /// Id of the node producing this stream
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Interval at which this stream produces datasets
    pub fn slide(&self) -> Duration {
        self.slide
    }

    pub(crate) fn graph(&self) -> &Graph {
        &self.graph
    }
}

struct GraphInner {
    frozen: bool,
    batch_interval: Duration,
    nodes: IndexMap<NodeId, Box<dyn ComputeNode>>,
    outputs: Vec<NodeId>,
    receivers: Vec<PendingReceiver>,
    state_store: Arc<StateStore>,
}

/// Builder of the DStream graph. Clones share the same graph.
#[derive(Clone)]
pub struct Graph {
    inner: Arc<Mutex<GraphInner>>,
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Graph")
            .field("frozen", &inner.frozen)
            .field("nodes", &inner.nodes.len())
            .field("outputs", &inner.outputs.len())
            .finish()
    }
}

impl Graph {
    pub(crate) fn new(batch_interval: Duration, state_store: Arc<StateStore>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(GraphInner {
                frozen: false,
                batch_interval,
                nodes: IndexMap::new(),
                outputs: Vec::new(),
                receivers: Vec::new(),
                state_store,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GraphInner> {
        #[allow(clippy::unwrap_used)]
        self.inner.lock().unwrap()
    }

    /// Interval at which batches are generated
    pub fn batch_interval(&self) -> Duration {
        self.lock().batch_interval
    }

    /// True once the context started
    pub fn is_frozen(&self) -> bool {
        self.lock().frozen
    }

    pub(crate) fn same_graph(&self, other: &Graph) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Add a node after validating its descriptor. `build` receives the
    /// descriptor and the state store for nodes keeping per-key state.
    pub(crate) fn add_node<O>(
        &self,
        descriptor: NodeDescriptor,
        build: impl FnOnce(NodeDescriptor, &Arc<StateStore>) -> Result<Box<dyn ComputeNode>, GraphError>,
    ) -> Result<DStream<O>, GraphError> {
        let mut inner = self.lock();
        if inner.frozen {
            return Err(GraphError::Frozen);
        }
        if inner.nodes.contains_key(&descriptor.id) {
            return Err(GraphError::NonUniqueName(descriptor.name));
        }
        if let Some(missing) = descriptor
            .upstreams
            .iter()
            .find(|u| !inner.nodes.contains_key(*u))
        {
            return Err(GraphError::UnknownNode(*missing));
        }
        let batch = inner.batch_interval;
        check_multiple(&descriptor.name, "slide", descriptor.slide(), batch)?;
        if let Some(window) = descriptor.window() {
            check_multiple(&descriptor.name, "window", window, batch)?;
        }

        let id = descriptor.id;
        let slide = descriptor.slide();
        let is_output = descriptor.kind == NodeKind::Output;
        debug!(node = descriptor.name, kind = ?descriptor.kind, "Adding node");
        let node = build(descriptor, &inner.state_store)?;
        if is_output {
            inner.outputs.push(id);
        }
        inner.nodes.insert(id, node);
        Ok(DStream {
            graph: self.clone(),
            id,
            slide,
            _data: PhantomData,
        })
    }

    /// Register a receiver feeding the source node `source`
    pub(crate) fn add_receiver<V: Data + Persistable>(
        &self,
        source: NodeId,
        name: &str,
        receiver: Box<dyn Receiver<V>>,
    ) -> Result<ReceiverId, GraphError> {
        let mut inner = self.lock();
        if inner.frozen {
            return Err(GraphError::Frozen);
        }
        // ids follow definition order so they stay stable between runs
        let id = inner.receivers.len() as ReceiverId;
        inner
            .receivers
            .push(PendingReceiver::new(id, source, name.to_string(), receiver));
        Ok(id)
    }

    /// Structural description of the graph as built so far
    pub fn descriptor(&self) -> GraphDescriptor {
        let inner = self.lock();
        GraphDescriptor::from_nodes(inner.batch_interval, &inner.nodes, &inner.outputs)
    }

    /// Freeze the graph. No nodes can be added afterwards.
    pub(crate) fn freeze(&self, config: &StreamingConfig) -> Result<FrozenGraph, GraphError> {
        let mut inner = self.lock();
        if inner.frozen {
            return Err(GraphError::Frozen);
        }
        if inner.outputs.is_empty() {
            return Err(GraphError::NoOutputs);
        }
        if !config.checkpointing_enabled() {
            if let Some(node) = inner.nodes.values().find(|n| n.requires_checkpointing()) {
                return Err(GraphError::CheckpointRequired(node.descriptor().name.clone()));
            }
        }
        inner.frozen = true;

        let descriptor = GraphDescriptor::from_nodes(inner.batch_interval, &inner.nodes, &inner.outputs);
        let nodes = std::mem::take(&mut inner.nodes);
        let remember = config
            .remember_duration
            .unwrap_or(inner.batch_interval)
            .max(inner.batch_interval);
        let retention = compute_retention(&nodes, remember);
        Ok(FrozenGraph {
            batch_interval: inner.batch_interval,
            nodes,
            outputs: std::mem::take(&mut inner.outputs),
            receivers: std::mem::take(&mut inner.receivers),
            retention,
            cache: HashMap::new(),
            descriptor,
            zero: BatchTime::ZERO,
        })
    }
}

/// Fail unless `value` is a positive multiple of `base`
pub(crate) fn check_multiple(
    name: &str,
    what: &'static str,
    value: Duration,
    base: Duration,
) -> Result<(), GraphError> {
    if is_multiple_of(value, base) {
        Ok(())
    } else {
        Err(GraphError::InvalidDuration {
            name: name.to_string(),
            what,
            value,
            base,
        })
    }
}

/// How long the datasets of every node must be kept after their BatchTime so
/// all downstream nodes can still read them
fn compute_retention(
    nodes: &IndexMap<NodeId, Box<dyn ComputeNode>>,
    remember: Duration,
) -> HashMap<NodeId, Duration> {
    let mut retention: HashMap<NodeId, Duration> = HashMap::with_capacity(nodes.len());
    // insertion order is a topological order, so children come later
    for (id, node) in nodes.iter().rev() {
        retention.entry(*id).or_insert(remember);
        let own = retention.get(id).copied().unwrap_or(remember);
        let needed = node.lookback() + own;
        for upstream in node.descriptor().upstreams.iter() {
            let entry = retention.entry(*upstream).or_insert(remember);
            *entry = (*entry).max(needed);
        }
    }
    retention
}

/// Structure of a graph, stored in checkpoints to detect graph changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphDescriptor {
    /// Batch interval in ms
    pub batch_interval_ms: u64,
    /// All nodes in definition order
    pub nodes: Vec<NodeDescriptor>,
    /// Output nodes in definition order
    pub outputs: Vec<NodeId>,
}

impl GraphDescriptor {
    fn from_nodes(
        batch_interval: Duration,
        nodes: &IndexMap<NodeId, Box<dyn ComputeNode>>,
        outputs: &[NodeId],
    ) -> Self {
        Self {
            batch_interval_ms: interval_millis(batch_interval),
            nodes: nodes.values().map(|n| n.descriptor().clone()).collect(),
            outputs: outputs.to_vec(),
        }
    }

    /// Describe the first difference between `self` and `other`, `None` if both
    /// are equal
    pub fn diff(&self, other: &GraphDescriptor) -> Option<String> {
        if self.batch_interval_ms != other.batch_interval_ms {
            return Some(format!(
                "batch interval changed from {} ms to {} ms",
                self.batch_interval_ms, other.batch_interval_ms
            ));
        }
        for (i, pair) in self.nodes.iter().zip_longest(other.nodes.iter()).enumerate() {
            match pair {
                EitherOrBoth::Both(a, b) if a != b => {
                    return Some(format!("node {i} changed from {a:?} to {b:?}"));
                }
                EitherOrBoth::Both(..) => (),
                EitherOrBoth::Left(a) => return Some(format!("node {i} ({}) was removed", a.name)),
                EitherOrBoth::Right(b) => return Some(format!("node {i} ({}) was added", b.name)),
            }
        }
        if self.outputs != other.outputs {
            return Some("outputs were reordered".to_string());
        }
        None
    }
}

/// The immutable graph of a running context
pub(crate) struct FrozenGraph {
    batch_interval: Duration,
    nodes: IndexMap<NodeId, Box<dyn ComputeNode>>,
    outputs: Vec<NodeId>,
    receivers: Vec<PendingReceiver>,
    retention: HashMap<NodeId, Duration>,
    cache: DatasetCache,
    descriptor: GraphDescriptor,
    zero: BatchTime,
}

impl FrozenGraph {
    pub(crate) fn descriptor(&self) -> &GraphDescriptor {
        &self.descriptor
    }

    /// Time before the first batch. Node validity is relative to this time.
    pub(crate) fn zero_time(&self) -> BatchTime {
        self.zero
    }

    pub(crate) fn set_zero_time(&mut self, zero: BatchTime) {
        self.zero = zero;
    }

    /// Output nodes in definition order
    pub(crate) fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    /// Receiver fed source nodes with their number of receivers
    pub(crate) fn receiver_sources(&self) -> Vec<(NodeId, usize)> {
        self.nodes
            .values()
            .filter_map(|n| match n.descriptor().kind {
                NodeKind::ReceiverSource { receivers } => Some((n.descriptor().id, receivers)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn take_receivers(&mut self) -> Vec<PendingReceiver> {
        std::mem::take(&mut self.receivers)
    }

    #[cfg(test)]
    pub(crate) fn retention(&self, id: &NodeId) -> Duration {
        self.retention
            .get(id)
            .copied()
            .unwrap_or(self.batch_interval)
    }

    /// Longest retention of any node
    pub(crate) fn max_retention(&self) -> Duration {
        self.retention
            .values()
            .copied()
            .max()
            .unwrap_or(self.batch_interval)
    }

    /// Compute the dataset of `id` at `time`, materializing all its
    /// dependencies first. Returns `None` if the node is not valid at `time`
    /// or produces no dataset.
    pub(crate) fn materialize(
        &mut self,
        id: NodeId,
        time: BatchTime,
        env: &ComputeEnv,
    ) -> Result<Option<ErasedDataset>, ComputeError> {
        if let Some(cached) = self.cache.get(&(id, time)) {
            return Ok(Some(Arc::clone(cached)));
        }
        let node = self.nodes.get(&id).ok_or(ComputeError::UnknownNode(id))?;
        if !node.descriptor().is_valid_time(time, self.zero) {
            return Ok(None);
        }
        for (dependency, dep_time) in node.dependencies(time, self.zero) {
            self.materialize(dependency, dep_time, env)?;
        }

        let node = self
            .nodes
            .get_mut(&id)
            .ok_or(ComputeError::UnknownNode(id))?;
        let span = debug_span!("graph::materialize", node = node.descriptor().name, %time);
        let _guard = span.enter();
        let mut ctx = ComputeContext {
            zero: self.zero,
            cache: &self.cache,
            env,
        };
        let dataset = node.compute(time, &mut ctx)?;
        if let Some(d) = &dataset {
            self.cache.insert((id, time), Arc::clone(d));
        }
        Ok(dataset)
    }

    /// Typed variant of [FrozenGraph::materialize]
    #[cfg(test)]
    pub(crate) fn materialize_typed<V: Data>(
        &mut self,
        id: NodeId,
        time: BatchTime,
        env: &ComputeEnv,
    ) -> Result<Option<Dataset<V>>, ComputeError> {
        match self.materialize(id, time, env)? {
            Some(erased) => downcast::<V>(&erased)
                .map(Some)
                .ok_or(ComputeError::TypeMismatch(id)),
            None => Ok(None),
        }
    }

    /// Drop a cached dataset so it is computed again on the next request
    #[cfg(test)]
    pub(crate) fn uncache(&mut self, id: NodeId, time: BatchTime) {
        self.cache.remove(&(id, time));
    }

    /// Drop all datasets and node internal data no longer needed once `time`
    /// completed
    pub(crate) fn clear_old(&mut self, time: BatchTime) {
        let before = self.cache.len();
        let retention = &self.retention;
        let fallback = self.batch_interval;
        self.cache.retain(|(id, t), _| {
            let keep_for = retention.get(id).copied().unwrap_or(fallback);
            *t > time - keep_for
        });
        for (id, node) in self.nodes.iter_mut() {
            let keep_for = retention.get(id).copied().unwrap_or(fallback);
            node.forget_before(time - keep_for);
        }
        debug!(%time, dropped = before - self.cache.len(), "Cleared old datasets");
    }

    /// Serialized state of every node which has any
    pub(crate) fn snapshot_states(&self) -> Result<IndexMap<NodeId, Vec<u8>>, ComputeError> {
        let mut states = IndexMap::new();
        for (id, node) in self.nodes.iter() {
            if let Some(bytes) = node.snapshot()? {
                states.insert(*id, bytes);
            }
        }
        Ok(states)
    }

    /// Restore node states taken with [FrozenGraph::snapshot_states]
    pub(crate) fn restore_states(&mut self, states: &IndexMap<NodeId, Vec<u8>>) -> Result<(), ComputeError> {
        for (id, bytes) in states.iter() {
            let node = self.nodes.get_mut(id).ok_or(ComputeError::UnknownNode(*id))?;
            node.restore(bytes)?;
        }
        Ok(())
    }
}

/// Invalid graph construction
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("The graph can not be modified after the streaming context started")]
    Frozen,
    #[error("Node name \"{0}\" is already in use")]
    NonUniqueName(String),
    #[error("Node {0} is not part of this graph")]
    UnknownNode(NodeId),
    #[error("Streams passed to node \"{0}\" belong to a different graph")]
    ForeignStream(String),
    #[error("{what} of node \"{name}\" is {value:?}, which is not a positive multiple of {base:?}")]
    InvalidDuration {
        name: String,
        what: &'static str,
        value: Duration,
        base: Duration,
    },
    #[error("Node \"{name}\" combines streams with slides {left:?} and {right:?}")]
    IncompatibleSlides {
        name: String,
        left: Duration,
        right: Duration,
    },
    #[error("The graph has no output node, nothing would ever be computed")]
    NoOutputs,
    #[error("Node \"{0}\" requires a checkpoint directory")]
    CheckpointRequired(String),
    #[error(transparent)]
    State(#[from] StateError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::*;
    use crate::testing::{test_config, TestHarness};

    fn graph() -> Graph {
        Graph::new(Duration::from_secs(1), Arc::new(StateStore::new()))
    }

    #[test]
    fn names_must_be_unique() {
        let g = graph();
        let (source, _queue) = g.queue_stream::<i32>("numbers").unwrap();
        source.map("double", |x| x * 2).unwrap();
        assert!(matches!(
            source.map("double", |x| x * 3),
            Err(GraphError::NonUniqueName(_))
        ));
    }

    #[test]
    fn frozen_graph_rejects_nodes() {
        let g = graph();
        let (source, _queue) = g.queue_stream::<i32>("numbers").unwrap();
        source.foreach_batch("out", |_, _| Ok(())).unwrap();
        g.freeze(&test_config(None)).unwrap();
        assert!(g.is_frozen());
        assert!(matches!(source.map("late", |x| x), Err(GraphError::Frozen)));
        assert!(matches!(g.queue_stream::<i32>("other"), Err(GraphError::Frozen)));
    }

    #[test]
    fn graph_without_outputs_is_rejected() {
        let g = graph();
        let (source, _queue) = g.queue_stream::<i32>("numbers").unwrap();
        source.map("noop", |x| x).unwrap();
        assert!(matches!(
            g.freeze(&test_config(None)),
            Err(GraphError::NoOutputs)
        ));
    }

    #[test]
    fn window_must_be_multiple_of_batch_interval() {
        let g = graph();
        let (source, _queue) = g.queue_stream::<i32>("numbers").unwrap();
        let err = source
            .window("win", Duration::from_millis(1500), Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, GraphError::InvalidDuration { what: "window", .. }));
    }

    #[test]
    fn retention_covers_downstream_windows() {
        let g = graph();
        let (source, _queue) = g.queue_stream::<i32>("numbers").unwrap();
        let mapped = source.map("mapped", |x| x + 1).unwrap();
        mapped
            .window("win", Duration::from_secs(4), Duration::from_secs(2))
            .unwrap()
            .foreach_batch("out", |_, _| Ok(()))
            .unwrap();
        let frozen = g.freeze(&test_config(None)).unwrap();
        // the window reads three batches before its own time
        assert_eq!(frozen.retention(&mapped.id()), Duration::from_secs(4));
        assert_eq!(frozen.retention(&source.id()), Duration::from_secs(4));
        assert_eq!(frozen.max_retention(), Duration::from_secs(4));
    }

    #[test]
    fn descriptor_diff_names_changed_node() {
        let build = |factor: u64| {
            let g = graph();
            let (source, _queue) = g.queue_stream::<i32>("numbers").unwrap();
            source
                .window("win", Duration::from_secs(factor), Duration::from_secs(1))
                .unwrap()
                .foreach_batch("out", |_, _| Ok(()))
                .unwrap();
            g.descriptor()
        };
        assert_eq!(build(2).diff(&build(2)), None);
        let diff = build(2).diff(&build(3)).unwrap();
        assert!(diff.contains("win"), "{diff}");
    }

    #[test]
    fn rematerializing_stateless_node_is_deterministic() {
        let mut harness = TestHarness::new(test_config(None));
        let (source, queue) = harness.graph().queue_stream::<String>("lines").unwrap();
        let words = source
            .flat_map("words", |line: String| {
                line.split(' ').map(str::to_string).collect::<Vec<_>>()
            })
            .unwrap();
        let counts = words
            .map("pairs", |w| (w, 1u32))
            .unwrap()
            .reduce_by_key("counts", |a, b| a + b)
            .unwrap();
        counts.foreach_batch("out", |_, _| Ok(())).unwrap();
        queue.push(vec!["a b a".to_string(), "c".to_string()]);
        harness.freeze().unwrap();

        let t = harness.time_of(1);
        let mut first = harness.materialize::<(String, u32)>(counts.id(), t).unwrap().collect();
        harness.uncache(counts.id(), t);
        harness.uncache(words.id(), t);
        let mut second = harness.materialize::<(String, u32)>(counts.id(), t).unwrap().collect();
        first.sort();
        second.sort();
        assert_eq!(first, second);
        assert_eq!(
            first,
            vec![("a".to_string(), 2), ("b".to_string(), 1), ("c".to_string(), 1)]
        );
    }
}
