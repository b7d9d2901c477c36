use crate::dataset::{erase, Dataset, ErasedDataset};
use crate::graph::{ComputeContext, ComputeError, ComputeNode, DStream, GraphError, NodeDescriptor, NodeKind};
use crate::types::{BatchTime, Data};

type TransformFn<I, O> = Box<dyn FnMut(Dataset<I>, BatchTime) -> Dataset<O> + Send>;

struct TransformNode<I, O> {
    descriptor: NodeDescriptor,
    func: TransformFn<I, O>,
}

impl<I: Data, O: Data> ComputeNode for TransformNode<I, O> {
    fn descriptor(&self) -> &NodeDescriptor {
        &self.descriptor
    }

    fn compute(
        &mut self,
        time: BatchTime,
        ctx: &mut ComputeContext<'_>,
    ) -> Result<Option<ErasedDataset>, ComputeError> {
        let input = ctx.input::<I>(self.descriptor.upstreams[0], time)?;
        Ok(Some(erase((self.func)(input, time))))
    }
}

/// Apply an arbitrary dataset to dataset function
pub trait Transform<V>: super::sealed::Sealed {
    /// Invoke `func` once per BatchTime with the whole dataset of the batch.
    ///
    /// The function runs on the scheduler thread and must be deterministic
    /// for the output to be reproducible.
    fn transform<O: Data>(
        &self,
        name: &str,
        func: impl FnMut(Dataset<V>, BatchTime) -> Dataset<O> + Send + 'static,
    ) -> Result<DStream<O>, GraphError>;
}

impl<V: Data> Transform<V> for DStream<V> {
    fn transform<O: Data>(
        &self,
        name: &str,
        func: impl FnMut(Dataset<V>, BatchTime) -> Dataset<O> + Send + 'static,
    ) -> Result<DStream<O>, GraphError> {
        let func: TransformFn<V, O> = Box::new(func);
        self.graph().add_node(
            NodeDescriptor::new(name, NodeKind::Transform, vec![self.id()], self.slide()),
            move |descriptor, _| Ok(Box::new(TransformNode { descriptor, func }) as Box<dyn ComputeNode>),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_config, TestHarness};

    #[test]
    fn transform_sees_batch_time() {
        let mut harness = TestHarness::new(test_config(None));
        let (source, queue) = harness.graph().queue_stream::<u64>("numbers").unwrap();
        let tagged = source
            .transform("tag", |batch: Dataset<u64>, time: BatchTime| {
                batch.map(|x| x + time.as_millis())
            })
            .unwrap();
        let sink = harness.collect("sink", &tagged);
        queue.push(vec![1, 2]);
        harness.run_batches(1).unwrap();

        let t = harness.time_of(1);
        assert_eq!(
            sink.drain_batch(t),
            vec![1 + t.as_millis(), 2 + t.as_millis()]
        );
    }
}
