//! Per-key aggregation over sliding windows.
//!
//! Without an inverse function the window is recomputed from all covered
//! batches on every slide. With an inverse function the node keeps the reduced
//! contribution of every covered upstream batch and its previous window result,
//! and derives the next result by removing expired contributions and adding new
//! ones. Every key counts the contributions it is part of, so keys whose last
//! contribution expired are removed instead of lingering with a neutral value.
use std::collections::BTreeMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::reduce::{combine_by_key, CombineFn};
use super::window::{add_window, check_window, window_times};
use super::ReduceByKey;
use crate::dataset::{erase, hash_partition, Dataset, ErasedDataset};
use crate::graph::{ComputeContext, ComputeError, ComputeNode, DStream, GraphError, NodeDescriptor, NodeKind};
use crate::types::{BatchTime, Data, Key, NodeId, Persistable};

/// Predicate deciding which keys of a window result are emitted
pub type KeyFilter<K, V> = Arc<dyn Fn(&K, &V) -> bool + Send + Sync>;

#[derive(Serialize, Deserialize)]
#[serde(bound(
    serialize = "K: Serialize + Hash + Eq, V: Serialize",
    deserialize = "K: DeserializeOwned + Hash + Eq, V: DeserializeOwned"
))]
struct WindowState<K, V> {
    /// Reduced values of every upstream batch still covered by a window
    contributions: BTreeMap<BatchTime, IndexMap<K, V>>,
    /// Last window result with the number of contributions per key
    last: Option<(BatchTime, IndexMap<K, (V, u32)>)>,
}

impl<K, V> Default for WindowState<K, V> {
    fn default() -> Self {
        Self {
            contributions: BTreeMap::new(),
            last: None,
        }
    }
}

struct IncrementalWindowNode<K, V> {
    descriptor: NodeDescriptor,
    upstream: NodeId,
    upstream_slide: Duration,
    window: Duration,
    slide: Duration,
    reduce: CombineFn<V>,
    inverse: CombineFn<V>,
    filter: Option<KeyFilter<K, V>>,
    state: WindowState<K, V>,
}

impl<K: Key, V: Data> IncrementalWindowNode<K, V> {
    fn add(&self, result: &mut IndexMap<K, (V, u32)>, contribution: &IndexMap<K, V>) {
        for (k, v) in contribution.iter() {
            match result.get_mut(k) {
                Some((acc, count)) => {
                    *acc = (self.reduce)(acc.clone(), v.clone());
                    *count += 1;
                }
                None => {
                    result.insert(k.clone(), (v.clone(), 1));
                }
            }
        }
    }

    fn remove(&self, result: &mut IndexMap<K, (V, u32)>, contribution: &IndexMap<K, V>) {
        for (k, v) in contribution.iter() {
            let expired = match result.get_mut(k) {
                Some((acc, count)) => {
                    *acc = (self.inverse)(acc.clone(), v.clone());
                    *count -= 1;
                    *count == 0
                }
                None => false,
            };
            if expired {
                result.swap_remove(k);
            }
        }
    }

    /// Derive the window at `time` from the previous window, if the previous
    /// window ended one slide earlier and all expired contributions are known
    fn incremental(&self, time: BatchTime, zero: BatchTime) -> Option<IndexMap<K, (V, u32)>> {
        let (last_time, last) = self.state.last.as_ref()?;
        if *last_time + self.slide != time {
            return None;
        }
        let expired: Vec<BatchTime> = window_times(*last_time, zero, self.window, self.upstream_slide)
            .into_iter()
            .filter(|t| *t <= time - self.window)
            .collect();
        let mut result = last.clone();
        for t in expired.iter() {
            self.remove(&mut result, self.state.contributions.get(t)?);
        }
        for t in BatchTime::range_exclusive(*last_time, time, self.upstream_slide) {
            if let Some(c) = self.state.contributions.get(&t) {
                self.add(&mut result, c);
            }
        }
        Some(result)
    }

    fn full(&self, time: BatchTime, zero: BatchTime) -> IndexMap<K, (V, u32)> {
        let mut result = IndexMap::new();
        for t in window_times(time, zero, self.window, self.upstream_slide) {
            if let Some(c) = self.state.contributions.get(&t) {
                self.add(&mut result, c);
            }
        }
        result
    }
}

impl<K, V> ComputeNode for IncrementalWindowNode<K, V>
where
    K: Key + Persistable,
    V: Data + Persistable,
{
    fn descriptor(&self) -> &NodeDescriptor {
        &self.descriptor
    }

    fn dependencies(&self, time: BatchTime, zero: BatchTime) -> Vec<(NodeId, BatchTime)> {
        window_times(time, zero, self.window, self.upstream_slide)
            .into_iter()
            .filter(|t| !self.state.contributions.contains_key(t))
            .map(|t| (self.upstream, t))
            .collect()
    }

    fn lookback(&self) -> Duration {
        self.window.saturating_sub(self.upstream_slide)
    }

    fn requires_checkpointing(&self) -> bool {
        true
    }

    fn compute(
        &mut self,
        time: BatchTime,
        ctx: &mut ComputeContext<'_>,
    ) -> Result<Option<ErasedDataset>, ComputeError> {
        let zero = ctx.zero;
        for t in window_times(time, zero, self.window, self.upstream_slide) {
            if self.state.contributions.contains_key(&t) {
                continue;
            }
            let input = ctx.input::<(K, V)>(self.upstream, t)?;
            let reduced = combine_by_key(
                ctx.executor(),
                &input,
                Arc::clone(&self.reduce),
                ctx.env.num_partitions,
            )?;
            self.state.contributions.insert(t, reduced.collect_map());
        }

        let result = match self.incremental(time, zero) {
            Some(r) => r,
            None => {
                debug!(node = self.descriptor.name, %time, "Recomputing full window");
                self.full(time, zero)
            }
        };
        let output: Vec<(K, V)> = result
            .iter()
            .filter(|(k, (v, _))| self.filter.as_ref().map_or(true, |f| f(k, v)))
            .map(|(k, (v, _))| (k.clone(), v.clone()))
            .collect();
        self.state.last = Some((time, result));
        // the next slide expires everything up to one slide after this threshold
        let threshold = time - self.window;
        self.state.contributions.retain(|t, _| *t > threshold);

        Ok(Some(erase(Dataset::from_partitions(hash_partition(
            output,
            ctx.env.num_partitions,
        )))))
    }

    fn snapshot(&self) -> Result<Option<Vec<u8>>, ComputeError> {
        rmp_serde::to_vec(&self.state)
            .map(Some)
            .map_err(|source| ComputeError::Snapshot {
                node: self.descriptor.name.clone(),
                source,
            })
    }

    fn restore(&mut self, bytes: &[u8]) -> Result<(), ComputeError> {
        self.state = rmp_serde::from_slice(bytes).map_err(|source| ComputeError::Restore {
            node: self.descriptor.name.clone(),
            source,
        })?;
        Ok(())
    }
}

/// Combine the values of every key over a sliding window
pub trait ReduceByKeyAndWindow<K, V>: super::sealed::Sealed {
    /// Reduce all values of each key over the last `window` every `slide`,
    /// recomputing the whole window each time.
    fn reduce_by_key_and_window(
        &self,
        name: &str,
        reduce: impl Fn(V, V) -> V + Send + Sync + 'static,
        window: Duration,
        slide: Duration,
    ) -> Result<DStream<(K, V)>, GraphError>;

    /// Reduce all values of each key over the last `window` every `slide`,
    /// incrementally: values of batches leaving the window are removed with
    /// `inverse`, which must satisfy `inverse(reduce(a, b), b) == a`.
    ///
    /// Only keys passing `filter` are emitted. Requires checkpointing, as the
    /// previous window result must survive restarts.
    fn reduce_by_key_and_window_inverse(
        &self,
        name: &str,
        reduce: impl Fn(V, V) -> V + Send + Sync + 'static,
        inverse: impl Fn(V, V) -> V + Send + Sync + 'static,
        window: Duration,
        slide: Duration,
        filter: Option<KeyFilter<K, V>>,
    ) -> Result<DStream<(K, V)>, GraphError>;
}

impl<K, V> ReduceByKeyAndWindow<K, V> for DStream<(K, V)>
where
    K: Key + Persistable,
    V: Data + Persistable,
{
    fn reduce_by_key_and_window(
        &self,
        name: &str,
        reduce: impl Fn(V, V) -> V + Send + Sync + 'static,
        window: Duration,
        slide: Duration,
    ) -> Result<DStream<(K, V)>, GraphError> {
        let descriptor = NodeDescriptor::new(&format!("{name}/window"), NodeKind::Window, vec![self.id()], slide)
            .with_id(NodeId::derived(NodeId::from_name(name), "window"));
        add_window(self, descriptor, window)?.reduce_by_key(name, reduce)
    }

    fn reduce_by_key_and_window_inverse(
        &self,
        name: &str,
        reduce: impl Fn(V, V) -> V + Send + Sync + 'static,
        inverse: impl Fn(V, V) -> V + Send + Sync + 'static,
        window: Duration,
        slide: Duration,
        filter: Option<KeyFilter<K, V>>,
    ) -> Result<DStream<(K, V)>, GraphError> {
        check_window(name, self, window, slide)?;
        let upstream = self.id();
        let upstream_slide = self.slide();
        let reduce: CombineFn<V> = Arc::new(reduce);
        let inverse: CombineFn<V> = Arc::new(inverse);
        let kind = NodeKind::ReduceByKeyAndWindow { incremental: true };
        self.graph().add_node(
            NodeDescriptor::new(name, kind, vec![upstream], slide).with_window(window),
            move |descriptor, _| {
                Ok(Box::new(IncrementalWindowNode {
                    descriptor,
                    upstream,
                    upstream_slide,
                    window,
                    slide,
                    reduce,
                    inverse,
                    filter,
                    state: WindowState::default(),
                }) as Box<dyn ComputeNode>)
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::operators::Map;
    use crate::testing::{test_config, TestHarness};

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn sorted<T: Ord>(mut v: Vec<T>) -> Vec<T> {
        v.sort();
        v
    }

    /// Builds both window variants over the same input and returns their
    /// outputs per batch
    fn run_both(
        batches: Vec<Vec<(u8, i64)>>,
        window: u64,
        slide: u64,
    ) -> Vec<(Vec<(u8, i64)>, Vec<(u8, i64)>)> {
        let dir = tempfile::tempdir().unwrap();
        let mut harness = TestHarness::new(test_config(Some(dir.path())));
        let (source, queue) = harness.graph().queue_stream::<(u8, i64)>("pairs").unwrap();
        let full = source
            .reduce_by_key_and_window("full", |a, b| a + b, secs(window), secs(slide))
            .unwrap();
        let incremental = source
            .reduce_by_key_and_window_inverse(
                "incremental",
                |a, b| a + b,
                |a, b| a - b,
                secs(window),
                secs(slide),
                None,
            )
            .unwrap();
        let full_sink = harness.collect("full-sink", &full);
        let inc_sink = harness.collect("inc-sink", &incremental);
        let count = batches.len() as u64;
        for b in batches {
            queue.push(b);
        }
        harness.run_batches(count).unwrap();
        full_sink
            .batch_times()
            .into_iter()
            .map(|t| (sorted(full_sink.drain_batch(t)), sorted(inc_sink.drain_batch(t))))
            .collect()
    }

    #[test]
    fn expired_keys_are_removed() {
        let results = run_both(
            vec![vec![(1, 5)], vec![(2, 1)], vec![(2, 1)], vec![]],
            2,
            1,
        );
        let outputs: Vec<Vec<(u8, i64)>> = results.iter().map(|(_, inc)| inc.clone()).collect();
        assert_eq!(
            outputs,
            vec![
                vec![(1, 5)],
                vec![(1, 5), (2, 1)],
                vec![(2, 2)],
                vec![(2, 1)],
            ]
        );
        for (full, inc) in results {
            assert_eq!(full, inc);
        }
    }

    #[test]
    fn filter_hides_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut harness = TestHarness::new(test_config(Some(dir.path())));
        let (source, queue) = harness.graph().queue_stream::<(u8, i64)>("pairs").unwrap();
        let filter: KeyFilter<u8, i64> = Arc::new(|_k: &u8, v: &i64| *v > 1);
        let windowed = source
            .reduce_by_key_and_window_inverse("w", |a, b| a + b, |a, b| a - b, secs(2), secs(1), Some(filter))
            .unwrap();
        let sink = harness.collect("sink", &windowed);
        queue.push(vec![(1, 1), (2, 2)]);
        harness.run_batches(1).unwrap();
        assert_eq!(sink.drain_batch(harness.time_of(1)), vec![(2, 2)]);
    }

    #[test]
    fn inverse_requires_checkpointing() {
        let mut harness = TestHarness::new(test_config(None));
        let (source, _queue) = harness.graph().queue_stream::<(u8, i64)>("pairs").unwrap();
        let windowed = source
            .reduce_by_key_and_window_inverse("w", |a, b| a + b, |a, b| a - b, secs(2), secs(1), None)
            .unwrap();
        harness.collect("sink", &windowed);
        assert!(matches!(
            harness.freeze(),
            Err(GraphError::CheckpointRequired(_))
        ));
    }

    #[test]
    fn window_state_survives_restore() {
        let dir = tempfile::tempdir().unwrap();
        let build = |harness: &mut TestHarness| {
            let (source, queue) = harness.graph().queue_stream::<(u8, i64)>("pairs").unwrap();
            let windowed = source
                .map("id", |x| x)
                .unwrap()
                .reduce_by_key_and_window_inverse("w", |a, b| a + b, |a, b| a - b, secs(3), secs(1), None)
                .unwrap();
            (harness.collect("sink", &windowed), queue)
        };
        let mut first = TestHarness::new(test_config(Some(dir.path())));
        let (_sink, queue) = build(&mut first);
        queue.push(vec![(1, 1)]);
        queue.push(vec![(1, 2)]);
        first.run_batches(2).unwrap();
        let states = first.snapshot_states().unwrap();

        // continues at the third batch without the first two batches' input
        let mut second = TestHarness::new(test_config(Some(dir.path())));
        let (sink, queue) = build(&mut second);
        second.freeze().unwrap();
        second.restore_states(&states).unwrap();
        second.skip_batches(2);
        queue.push(vec![(1, 4)]);
        queue.push(vec![]);
        second.run_batches(2).unwrap();
        assert_eq!(sink.drain_batch(second.time_of(3)), vec![(1, 7)]);
        assert_eq!(sink.drain_batch(second.time_of(4)), vec![(1, 6)]);
    }

    #[test]
    fn window_node_does_not_take_a_user_name() {
        let mut harness = TestHarness::new(test_config(None));
        let (source, queue) = harness.graph().queue_stream::<(u8, i64)>("pairs").unwrap();
        let doubled = source.map("counts-window", |(k, v)| (k, v * 2)).unwrap();
        let counts = source
            .reduce_by_key_and_window("counts", |a, b| a + b, secs(2), secs(1))
            .unwrap();
        harness.collect("doubled-sink", &doubled);
        let sink = harness.collect("sink", &counts);
        queue.push(vec![(1, 1)]);
        queue.push(vec![(1, 2)]);
        harness.run_batches(2).unwrap();
        assert_eq!(sink.drain_batch(harness.time_of(2)), vec![(1, 3)]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]
        #[test]
        fn incremental_equals_full_recomputation(
            batches in prop::collection::vec(
                prop::collection::vec((0u8..6, -50i64..50), 0..8),
                1..12
            ),
            window in 1u64..5,
            slide in 1u64..3,
        ) {
            let window = window * slide;
            for (full, inc) in run_both(batches, window, slide) {
                prop_assert_eq!(full, inc);
            }
        }
    }
}
