use std::time::Duration;

use crate::dataset::{erase, Dataset, ErasedDataset};
use crate::graph::{
    check_multiple, ComputeContext, ComputeError, ComputeNode, DStream, GraphError, NodeDescriptor, NodeKind,
};
use crate::types::{BatchTime, Data, NodeId};

/// Times of the upstream datasets covered by a window ending at `time`.
/// Times at or before the zero time never had a batch and are skipped.
pub(crate) fn window_times(
    time: BatchTime,
    zero: BatchTime,
    window: Duration,
    upstream_slide: Duration,
) -> Vec<BatchTime> {
    let start = (time - window).max(zero);
    BatchTime::range_exclusive(start, time, upstream_slide)
        .filter(|t| t.is_aligned(zero, upstream_slide))
        .collect()
}

/// Validate the window and slide of a windowed node on top of `upstream`
pub(crate) fn check_window<V>(
    name: &str,
    upstream: &DStream<V>,
    window: Duration,
    slide: Duration,
) -> Result<(), GraphError> {
    check_multiple(name, "window", window, upstream.slide())?;
    check_multiple(name, "slide", slide, upstream.slide())
}

struct WindowNode<V> {
    descriptor: NodeDescriptor,
    upstream: NodeId,
    upstream_slide: Duration,
    window: Duration,
    _records: std::marker::PhantomData<fn() -> V>,
}

impl<V: Data> ComputeNode for WindowNode<V> {
    fn descriptor(&self) -> &NodeDescriptor {
        &self.descriptor
    }

    fn dependencies(&self, time: BatchTime, zero: BatchTime) -> Vec<(NodeId, BatchTime)> {
        window_times(time, zero, self.window, self.upstream_slide)
            .into_iter()
            .map(|t| (self.upstream, t))
            .collect()
    }

    fn lookback(&self) -> Duration {
        self.window.saturating_sub(self.upstream_slide)
    }

    fn compute(
        &mut self,
        time: BatchTime,
        ctx: &mut ComputeContext<'_>,
    ) -> Result<Option<ErasedDataset>, ComputeError> {
        let inputs = window_times(time, ctx.zero, self.window, self.upstream_slide)
            .into_iter()
            .map(|t| ctx.input::<V>(self.upstream, t))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(erase(Dataset::union(inputs.iter()))))
    }
}

/// Group batches into sliding windows
pub trait Window<V>: super::sealed::Sealed {
    /// A stream whose dataset at T is the union of this stream's datasets over
    /// the last `window` ending at T. The stream only produces datasets every
    /// `slide`. Both durations must be multiples of this stream's slide.
    fn window(&self, name: &str, window: Duration, slide: Duration) -> Result<DStream<V>, GraphError>;
}

impl<V: Data> Window<V> for DStream<V> {
    fn window(&self, name: &str, window: Duration, slide: Duration) -> Result<DStream<V>, GraphError> {
        let descriptor = NodeDescriptor::new(name, NodeKind::Window, vec![self.id()], slide);
        add_window(self, descriptor, window)
    }
}

/// Add the window node `descriptor` on top of `stream`
pub(crate) fn add_window<V: Data>(
    stream: &DStream<V>,
    descriptor: NodeDescriptor,
    window: Duration,
) -> Result<DStream<V>, GraphError> {
    check_window(&descriptor.name, stream, window, descriptor.slide())?;
    let upstream = stream.id();
    let upstream_slide = stream.slide();
    stream
        .graph()
        .add_node(descriptor.with_window(window), move |descriptor, _| {
            Ok(Box::new(WindowNode::<V> {
                descriptor,
                upstream,
                upstream_slide,
                window,
                _records: std::marker::PhantomData,
            }) as Box<dyn ComputeNode>)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::{Map, ReduceByKey};
    use crate::testing::{test_config, TestHarness};

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn window_times_skip_times_before_start() {
        let zero = BatchTime::from_millis(10_000);
        let times = window_times(BatchTime::from_millis(11_000), zero, secs(3), secs(1));
        assert_eq!(times, vec![BatchTime::from_millis(11_000)]);
        let times = window_times(BatchTime::from_millis(15_000), zero, secs(3), secs(1));
        assert_eq!(
            times,
            vec![
                BatchTime::from_millis(13_000),
                BatchTime::from_millis(14_000),
                BatchTime::from_millis(15_000)
            ]
        );
    }

    #[test]
    fn window_is_union_of_covered_batches() {
        let mut harness = TestHarness::new(test_config(None));
        let (source, queue) = harness.graph().queue_stream::<u32>("numbers").unwrap();
        let windowed = source.window("win", secs(3), secs(2)).unwrap();
        let sink = harness.collect("sink", &windowed);
        for i in 1..=5 {
            queue.push(vec![i]);
        }
        harness.run_batches(5).unwrap();

        // only slide boundaries emit
        assert_eq!(sink.batch_times(), vec![harness.time_of(2), harness.time_of(4)]);
        assert_eq!(sink.drain_batch(harness.time_of(2)), vec![1, 2]);
        assert_eq!(sink.drain_batch(harness.time_of(4)), vec![2, 3, 4]);
    }

    #[test]
    fn windowed_count_scenario() {
        let mut harness = TestHarness::new(test_config(None));
        let (source, queue) = harness.graph().queue_stream::<&str>("words").unwrap();
        let counts = source
            .window("last-two", secs(2), secs(1))
            .unwrap()
            .map("pairs", |w| (w, 1u32))
            .unwrap()
            .reduce_by_key("counts", |a, b| a + b)
            .unwrap();
        let sink = harness.collect("sink", &counts);
        queue.push(vec!["a"]);
        queue.push(vec!["a", "b"]);
        queue.push(vec!["b"]);
        harness.run_batches(3).unwrap();

        fn sorted(mut v: Vec<(&'static str, u32)>) -> Vec<(&'static str, u32)> {
            v.sort();
            v
        }
        assert_eq!(sorted(sink.drain_batch(harness.time_of(2))), vec![("a", 2), ("b", 1)]);
        assert_eq!(sorted(sink.drain_batch(harness.time_of(3))), vec![("a", 1), ("b", 2)]);
    }

    #[test]
    fn slide_must_be_multiple_of_upstream_slide() {
        let harness = TestHarness::new(test_config(None));
        let (source, _queue) = harness.graph().queue_stream::<u32>("numbers").unwrap();
        let coarse = source.window("coarse", secs(4), secs(2)).unwrap();
        assert!(matches!(
            coarse.window("fine", secs(4), secs(3)),
            Err(GraphError::InvalidDuration { what: "slide", .. })
        ));
    }
}
