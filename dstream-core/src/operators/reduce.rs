//! Per-batch aggregations
use std::sync::Arc;

use indexmap::IndexMap;

use crate::dataset::{erase, hash_partition, Dataset, ErasedDataset};
use crate::executor::{map_partitions, BatchExecutor, ExecutorError};
use crate::graph::{ComputeContext, ComputeError, ComputeNode, DStream, GraphError, NodeDescriptor, NodeKind};
use crate::types::{BatchTime, Data, Key};

pub(crate) type CombineFn<V> = Arc<dyn Fn(V, V) -> V + Send + Sync>;

/// Combine `value` into the entry of `key`
pub(crate) fn combine_into<K: Key, V: Data>(map: &mut IndexMap<K, V>, key: K, value: V, combine: &CombineFn<V>) {
    match map.get_mut(&key) {
        Some(existing) => *existing = combine(existing.clone(), value),
        None => {
            map.insert(key, value);
        }
    }
}

fn combine_partition<K: Key, V: Data>(part: &[(K, V)], combine: &CombineFn<V>) -> Vec<(K, V)> {
    let mut combined = IndexMap::new();
    for (k, v) in part.iter().cloned() {
        combine_into(&mut combined, k, v, combine);
    }
    combined.into_iter().collect()
}

/// Combine all values per key: first within every partition, then after
/// shuffling the partial results into `num_partitions` partitions by key.
pub(crate) fn combine_by_key<K: Key, V: Data>(
    executor: &dyn BatchExecutor,
    input: &Dataset<(K, V)>,
    combine: CombineFn<V>,
    num_partitions: usize,
) -> Result<Dataset<(K, V)>, ExecutorError> {
    let local = Arc::clone(&combine);
    let partial = map_partitions(
        executor,
        input,
        Arc::new(move |part: &[(K, V)]| combine_partition(part, &local)),
    )?;
    let shuffled = Dataset::from_partitions(hash_partition(partial.iter().cloned(), num_partitions));
    map_partitions(
        executor,
        &shuffled,
        Arc::new(move |part: &[(K, V)]| combine_partition(part, &combine)),
    )
}

struct ReduceByKeyNode<K, V> {
    descriptor: NodeDescriptor,
    combine: CombineFn<V>,
    _keys: std::marker::PhantomData<fn() -> K>,
}

impl<K: Key, V: Data> ComputeNode for ReduceByKeyNode<K, V> {
    fn descriptor(&self) -> &NodeDescriptor {
        &self.descriptor
    }

    fn compute(
        &mut self,
        time: BatchTime,
        ctx: &mut ComputeContext<'_>,
    ) -> Result<Option<ErasedDataset>, ComputeError> {
        let input = ctx.input::<(K, V)>(self.descriptor.upstreams[0], time)?;
        let reduced = combine_by_key(
            ctx.executor(),
            &input,
            Arc::clone(&self.combine),
            ctx.env.num_partitions,
        )?;
        Ok(Some(erase(reduced)))
    }
}

/// Combine the values of every key within one batch
pub trait ReduceByKey<K, V>: super::sealed::Sealed {
    /// Combine all values of each key in a batch with an associative and
    /// commutative function. The output contains one record per key, hash
    /// partitioned by key.
    fn reduce_by_key(
        &self,
        name: &str,
        combine: impl Fn(V, V) -> V + Send + Sync + 'static,
    ) -> Result<DStream<(K, V)>, GraphError>;
}

impl<K: Key, V: Data> ReduceByKey<K, V> for DStream<(K, V)> {
    fn reduce_by_key(
        &self,
        name: &str,
        combine: impl Fn(V, V) -> V + Send + Sync + 'static,
    ) -> Result<DStream<(K, V)>, GraphError> {
        let combine: CombineFn<V> = Arc::new(combine);
        self.graph().add_node(
            NodeDescriptor::new(name, NodeKind::ReduceByKey, vec![self.id()], self.slide()),
            move |descriptor, _| {
                Ok(Box::new(ReduceByKeyNode::<K, V> {
                    descriptor,
                    combine,
                    _keys: std::marker::PhantomData,
                }) as Box<dyn ComputeNode>)
            },
        )
    }
}

struct CountNode<V> {
    descriptor: NodeDescriptor,
    _records: std::marker::PhantomData<fn() -> V>,
}

impl<V: Data> ComputeNode for CountNode<V> {
    fn descriptor(&self) -> &NodeDescriptor {
        &self.descriptor
    }

    fn compute(
        &mut self,
        time: BatchTime,
        ctx: &mut ComputeContext<'_>,
    ) -> Result<Option<ErasedDataset>, ComputeError> {
        let input = ctx.input::<V>(self.descriptor.upstreams[0], time)?;
        Ok(Some(erase(Dataset::from_vec(vec![input.len() as u64]))))
    }
}

/// Count the records of every batch
pub trait Count<V>: super::sealed::Sealed {
    /// A stream with a single record per batch: the number of records in the
    /// batch
    fn count(&self, name: &str) -> Result<DStream<u64>, GraphError>;
}

impl<V: Data> Count<V> for DStream<V> {
    fn count(&self, name: &str) -> Result<DStream<u64>, GraphError> {
        self.graph().add_node(
            NodeDescriptor::new(name, NodeKind::Count, vec![self.id()], self.slide()),
            |descriptor, _| {
                Ok(Box::new(CountNode::<V> {
                    descriptor,
                    _records: std::marker::PhantomData,
                }) as Box<dyn ComputeNode>)
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::LocalExecutor;
    use crate::operators::{FlatMap, Map};
    use crate::testing::{test_config, TestHarness};

    #[test]
    fn combines_across_partitions() {
        let executor = LocalExecutor::new(2, 1);
        let input = Dataset::from_partitions(vec![
            vec![("a", 1), ("b", 1), ("a", 1)],
            vec![("b", 5)],
            vec![("a", 10)],
        ]);
        let sum: CombineFn<i32> = Arc::new(|a: i32, b: i32| a + b);
        let out = combine_by_key(&executor, &input, sum, 4).unwrap();
        assert_eq!(out.num_partitions(), 4);
        let mut records = out.collect();
        records.sort();
        assert_eq!(records, vec![("a", 12), ("b", 6)]);
    }

    #[test]
    fn word_count_scenario() {
        let mut harness = TestHarness::new(test_config(None));
        let (lines, queue) = harness.graph().queue_stream::<String>("lines").unwrap();
        let counts = lines
            .flat_map("words", |line: String| {
                line.split(' ').map(str::to_string).collect::<Vec<_>>()
            })
            .unwrap()
            .map("pairs", |w| (w, 1u32))
            .unwrap()
            .reduce_by_key("counts", |a, b| a + b)
            .unwrap();
        let sink = harness.collect("sink", &counts);
        queue.push(vec!["a b".to_string()]);
        queue.push(vec!["a".to_string()]);
        harness.run_batches(2).unwrap();

        let mut first = sink.drain_batch(harness.time_of(1));
        first.sort();
        assert_eq!(first, vec![("a".to_string(), 1), ("b".to_string(), 1)]);
        assert_eq!(sink.drain_batch(harness.time_of(2)), vec![("a".to_string(), 1)]);
    }

    #[test]
    fn count_emits_one_record_per_batch() {
        let mut harness = TestHarness::new(test_config(None));
        let (source, queue) = harness.graph().queue_stream::<u8>("numbers").unwrap();
        let counted = source.count("count").unwrap();
        let sink = harness.collect("sink", &counted);
        queue.push(vec![1, 2, 3]);
        harness.run_batches(2).unwrap();
        assert_eq!(sink.drain_batch(harness.time_of(1)), vec![3]);
        assert_eq!(sink.drain_batch(harness.time_of(2)), vec![0]);
    }
}
