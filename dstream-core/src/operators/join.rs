use std::sync::Arc;

use indexmap::IndexMap;

use crate::dataset::{erase, hash_partition, Dataset, ErasedDataset};
use crate::executor::run_partitions;
use crate::graph::{ComputeContext, ComputeError, ComputeNode, DStream, GraphError, NodeDescriptor, NodeKind};
use crate::types::{BatchTime, Data, Key, NodeId};

struct JoinNode<K, V, W> {
    descriptor: NodeDescriptor,
    left: NodeId,
    right: NodeId,
    _types: std::marker::PhantomData<fn() -> (K, V, W)>,
}

fn join_partition<K: Key, V: Data, W: Data>(left: &[(K, V)], right: &[(K, W)]) -> Vec<(K, (V, W))> {
    let mut by_key: IndexMap<&K, Vec<&W>> = IndexMap::new();
    for (k, w) in right.iter() {
        by_key.entry(k).or_default().push(w);
    }
    let mut out = Vec::new();
    for (k, v) in left.iter() {
        if let Some(matches) = by_key.get(k) {
            out.extend(matches.iter().map(|w| (k.clone(), (v.clone(), (*w).clone()))));
        }
    }
    out
}

impl<K: Key, V: Data, W: Data> ComputeNode for JoinNode<K, V, W> {
    fn descriptor(&self) -> &NodeDescriptor {
        &self.descriptor
    }

    fn compute(
        &mut self,
        time: BatchTime,
        ctx: &mut ComputeContext<'_>,
    ) -> Result<Option<ErasedDataset>, ComputeError> {
        let partitions = ctx.env.num_partitions;
        // co-partition both sides so matching keys meet in the same task
        let left = Arc::new(hash_partition(
            ctx.input::<(K, V)>(self.left, time)?.iter().cloned(),
            partitions,
        ));
        let right = Arc::new(hash_partition(
            ctx.input::<(K, W)>(self.right, time)?.iter().cloned(),
            partitions,
        ));
        let joined = run_partitions(
            ctx.executor(),
            left.len(),
            Arc::new(move |i: usize| join_partition(&left[i], &right[i])),
        )?;
        Ok(Some(erase(Dataset::from_partitions(joined))))
    }
}

/// Inner join of two keyed streams
pub trait Join<K, V>: super::sealed::Sealed {
    /// For every BatchTime, pair each value of a key in this stream with each
    /// value of the same key in `other`. Both streams must have the same slide.
    fn join<W: Data>(&self, name: &str, other: &DStream<(K, W)>) -> Result<DStream<(K, (V, W))>, GraphError>;
}

impl<K: Key, V: Data> Join<K, V> for DStream<(K, V)> {
    fn join<W: Data>(&self, name: &str, other: &DStream<(K, W)>) -> Result<DStream<(K, (V, W))>, GraphError> {
        if !self.graph().same_graph(other.graph()) {
            return Err(GraphError::ForeignStream(name.to_string()));
        }
        if self.slide() != other.slide() {
            return Err(GraphError::IncompatibleSlides {
                name: name.to_string(),
                left: self.slide(),
                right: other.slide(),
            });
        }
        let left = self.id();
        let right = other.id();
        self.graph().add_node(
            NodeDescriptor::new(name, NodeKind::Join, vec![left, right], self.slide()),
            move |descriptor, _| {
                Ok(Box::new(JoinNode::<K, V, W> {
                    descriptor,
                    left,
                    right,
                    _types: std::marker::PhantomData,
                }) as Box<dyn ComputeNode>)
            },
        )
    }
}
