//! Output nodes run side effects for every batch. A graph without any output node
//! computes nothing.
use std::fmt::Debug;

use crate::dataset::{Dataset, ErasedDataset};
use crate::graph::{ComputeContext, ComputeError, ComputeNode, DStream, GraphError, NodeDescriptor, NodeKind};
use crate::types::{BatchTime, Data};

type BatchAction<V> = Box<dyn FnMut(Dataset<V>, BatchTime) -> eyre::Result<()> + Send>;

struct ForeachBatchNode<V> {
    descriptor: NodeDescriptor,
    action: BatchAction<V>,
}

impl<V: Data> ComputeNode for ForeachBatchNode<V> {
    fn descriptor(&self) -> &NodeDescriptor {
        &self.descriptor
    }

    fn compute(
        &mut self,
        time: BatchTime,
        ctx: &mut ComputeContext<'_>,
    ) -> Result<Option<ErasedDataset>, ComputeError> {
        let input = ctx.input::<V>(self.descriptor.upstreams[0], time)?;
        (self.action)(input, time).map_err(|e| ComputeError::Output {
            output: self.descriptor.name.clone(),
            source: e.into(),
        })?;
        Ok(None)
    }
}

/// Run an action on every dataset of a stream
pub trait ForeachBatch<V>: super::sealed::Sealed {
    /// Register an output which calls `action` with the stream's dataset and
    /// the BatchTime, once per valid BatchTime and in BatchTime order. Batches
    /// without records are passed too.
    ///
    /// An error returned by the action fails the batch's job.
    fn foreach_batch(
        &self,
        name: &str,
        action: impl FnMut(Dataset<V>, BatchTime) -> eyre::Result<()> + Send + 'static,
    ) -> Result<(), GraphError>;
}

impl<V: Data> ForeachBatch<V> for DStream<V> {
    fn foreach_batch(
        &self,
        name: &str,
        action: impl FnMut(Dataset<V>, BatchTime) -> eyre::Result<()> + Send + 'static,
    ) -> Result<(), GraphError> {
        let action: BatchAction<V> = Box::new(action);
        self.graph()
            .add_node::<()>(
                NodeDescriptor::new(name, NodeKind::Output, vec![self.id()], self.slide()),
                move |descriptor, _| Ok(Box::new(ForeachBatchNode { descriptor, action }) as Box<dyn ComputeNode>),
            )
            .map(|_| ())
    }
}

/// Print the head of every batch
pub trait Print<V>: super::sealed::Sealed {
    /// Print up to `num` records of every batch to stdout, headed by the
    /// BatchTime
    fn print(&self, name: &str, num: usize) -> Result<(), GraphError>;
}

fn format_batch<V: Debug>(dataset: &Dataset<V>, time: BatchTime, num: usize) -> String {
    let mut out = format!("-------------------------------------------\nTime: {time}\n-------------------------------------------\n");
    for record in dataset.iter().take(num) {
        out.push_str(&format!("{record:?}\n"));
    }
    if dataset.len() > num {
        out.push_str("...\n");
    }
    out
}

impl<V: Data + Debug> Print<V> for DStream<V> {
    fn print(&self, name: &str, num: usize) -> Result<(), GraphError> {
        self.foreach_batch(name, move |dataset: Dataset<V>, time: BatchTime| {
            println!("{}", format_batch(&dataset, time, num));
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::testing::{test_config, TestHarness};

    #[test]
    fn format_truncates_long_batches() {
        let dataset = Dataset::from_vec(vec![1, 2, 3]);
        let text = format_batch(&dataset, BatchTime::from_millis(2000), 2);
        assert!(text.contains("Time: 2000 ms"), "{text}");
        assert!(text.contains("1\n2\n...\n"), "{text}");
        assert!(!text.contains('3'));
    }

    #[test]
    fn actions_run_in_batch_time_order() {
        let mut harness = TestHarness::new(test_config(None));
        let (source, queue) = harness.graph().queue_stream::<u8>("numbers").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_c = Arc::clone(&seen);
        source
            .foreach_batch("out", move |dataset: Dataset<u8>, time: BatchTime| {
                seen_c.lock().unwrap().push((time, dataset.len()));
                Ok(())
            })
            .unwrap();
        queue.push(vec![1, 2]);
        harness.run_batches(2).unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(harness.time_of(1), 2), (harness.time_of(2), 0)]
        );
    }

    #[test]
    fn failing_action_fails_the_batch() {
        let mut harness = TestHarness::new(test_config(None));
        let (source, _queue) = harness.graph().queue_stream::<u8>("numbers").unwrap();
        source
            .foreach_batch("out", |_, _| Err(eyre::eyre!("sink unavailable")))
            .unwrap();
        let err = harness.run_batches(1).unwrap_err();
        assert!(matches!(err, ComputeError::Output { ref output, .. } if output == "out"));
        assert!(!err.is_fatal());
    }
}
