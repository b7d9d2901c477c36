//! Record by record transformations
use std::sync::Arc;

use crate::dataset::{erase, ErasedDataset};
use crate::executor::map_partitions;
use crate::graph::{ComputeContext, ComputeError, ComputeNode, DStream, GraphError, NodeDescriptor, NodeKind};
use crate::types::{BatchTime, Data};

type PartitionFn<I, O> = Arc<dyn Fn(&[I]) -> Vec<O> + Send + Sync>;

/// Applies a function to every partition of its upstream's dataset
struct PartitionMapNode<I, O> {
    descriptor: NodeDescriptor,
    func: PartitionFn<I, O>,
}

impl<I: Data, O: Data> ComputeNode for PartitionMapNode<I, O> {
    fn descriptor(&self) -> &NodeDescriptor {
        &self.descriptor
    }

    fn compute(
        &mut self,
        time: BatchTime,
        ctx: &mut ComputeContext<'_>,
    ) -> Result<Option<ErasedDataset>, ComputeError> {
        let input = ctx.input::<I>(self.descriptor.upstreams[0], time)?;
        let output = map_partitions(ctx.executor(), &input, Arc::clone(&self.func))?;
        Ok(Some(erase(output)))
    }
}

fn partition_map<I: Data, O: Data>(
    stream: &DStream<I>,
    name: &str,
    kind: NodeKind,
    func: PartitionFn<I, O>,
) -> Result<DStream<O>, GraphError> {
    stream.graph().add_node(
        NodeDescriptor::new(name, kind, vec![stream.id()], stream.slide()),
        move |descriptor, _| Ok(Box::new(PartitionMapNode { descriptor, func }) as Box<dyn ComputeNode>),
    )
}

/// Apply a function to every record in a stream
pub trait Map<V>: super::sealed::Sealed {
    /// Map transforms every record of every batch into a different value by
    /// applying the given function. The function may be invoked more than once
    /// for the same record, e.g. when a partition is recomputed.
    fn map<O: Data>(
        &self,
        name: &str,
        mapper: impl Fn(V) -> O + Send + Sync + 'static,
    ) -> Result<DStream<O>, GraphError>;
}

impl<V: Data> Map<V> for DStream<V> {
    fn map<O: Data>(
        &self,
        name: &str,
        mapper: impl Fn(V) -> O + Send + Sync + 'static,
    ) -> Result<DStream<O>, GraphError> {
        let func: PartitionFn<V, O> =
            Arc::new(move |part: &[V]| part.iter().cloned().map(&mapper).collect::<Vec<O>>());
        partition_map(self, name, NodeKind::Map, func)
    }
}

/// Turn every record into any number of records
pub trait FlatMap<V>: super::sealed::Sealed {
    /// Apply a function to every record and emit all records of the returned
    /// iterator in order
    fn flat_map<O: Data, I: IntoIterator<Item = O>>(
        &self,
        name: &str,
        mapper: impl Fn(V) -> I + Send + Sync + 'static,
    ) -> Result<DStream<O>, GraphError>;
}

impl<V: Data> FlatMap<V> for DStream<V> {
    fn flat_map<O: Data, I: IntoIterator<Item = O>>(
        &self,
        name: &str,
        mapper: impl Fn(V) -> I + Send + Sync + 'static,
    ) -> Result<DStream<O>, GraphError> {
        let func: PartitionFn<V, O> = Arc::new(move |part: &[V]| {
            part.iter()
                .cloned()
                .flat_map(&mapper)
                .collect::<Vec<O>>()
        });
        partition_map(self, name, NodeKind::FlatMap, func)
    }
}

/// Retain only some records of a stream
pub trait Filter<V>: super::sealed::Sealed {
    /// Filters every batch based on a given predicate.
    ///
    /// Records for which the predicate returns `true` are retained, all others
    /// are discarded.
    fn filter(
        &self,
        name: &str,
        predicate: impl Fn(&V) -> bool + Send + Sync + 'static,
    ) -> Result<DStream<V>, GraphError>;
}

impl<V: Data> Filter<V> for DStream<V> {
    fn filter(
        &self,
        name: &str,
        predicate: impl Fn(&V) -> bool + Send + Sync + 'static,
    ) -> Result<DStream<V>, GraphError> {
        let func: PartitionFn<V, V> = Arc::new(move |part: &[V]| {
            part.iter()
                .filter(|x| predicate(x))
                .cloned()
                .collect::<Vec<V>>()
        });
        partition_map(self, name, NodeKind::Filter, func)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_config, TestHarness};

    #[test]
    fn test_map() {
        let mut harness = TestHarness::new(test_config(None));
        let (source, queue) = harness.graph().queue_stream::<&str>("words").unwrap();
        let lengths = source.map("get-len", |x| x.len()).unwrap();
        let sink = harness.collect("sink", &lengths);
        queue.push(vec!["hello", "world", "foo"]);
        queue.push(vec!["bar"]);
        harness.run_batches(2).unwrap();

        assert_eq!(sink.drain_batch(harness.time_of(1)), vec![5, 5, 3]);
        assert_eq!(sink.drain_batch(harness.time_of(2)), vec![3]);
    }

    #[test]
    fn test_flat_map_keeps_order() {
        let mut harness = TestHarness::new(test_config(None));
        let (source, queue) = harness.graph().queue_stream::<u32>("numbers").unwrap();
        let repeated = source
            .flat_map("repeat", |x: u32| std::iter::repeat(x).take(x as usize))
            .unwrap();
        let sink = harness.collect("sink", &repeated);
        queue.push(vec![1, 0, 3]);
        harness.run_batches(1).unwrap();
        assert_eq!(sink.drain_batch(harness.time_of(1)), vec![1, 3, 3, 3]);
    }

    #[test]
    fn test_filter() {
        let mut harness = TestHarness::new(test_config(None));
        let (source, queue) = harness.graph().queue_stream::<i32>("numbers").unwrap();
        let small = source.filter("small", |x| *x <= 42).unwrap();
        let sink = harness.collect("sink", &small);
        queue.push((0..100).collect());
        harness.run_batches(1).unwrap();
        assert_eq!(
            sink.drain_batch(harness.time_of(1)),
            (0..=42).collect::<Vec<i32>>()
        );
    }
}
