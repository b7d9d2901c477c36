use crate::dataset::{erase, Dataset, ErasedDataset};
use crate::graph::{ComputeContext, ComputeError, ComputeNode, DStream, GraphError, NodeDescriptor, NodeKind};
use crate::types::{BatchTime, Data};

struct UnionNode<V> {
    descriptor: NodeDescriptor,
    _records: std::marker::PhantomData<fn() -> V>,
}

impl<V: Data> ComputeNode for UnionNode<V> {
    fn descriptor(&self) -> &NodeDescriptor {
        &self.descriptor
    }

    fn compute(
        &mut self,
        time: BatchTime,
        ctx: &mut ComputeContext<'_>,
    ) -> Result<Option<ErasedDataset>, ComputeError> {
        let inputs = self
            .descriptor
            .upstreams
            .iter()
            .map(|u| ctx.input::<V>(*u, time))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(erase(Dataset::union(inputs.iter()))))
    }
}

/// Merge streams of the same type
pub trait Union<V>: super::sealed::Sealed {
    /// Concatenate this stream with `others`. All streams must have the same
    /// slide.
    fn union(&self, name: &str, others: &[&DStream<V>]) -> Result<DStream<V>, GraphError>;
}

impl<V: Data> Union<V> for DStream<V> {
    fn union(&self, name: &str, others: &[&DStream<V>]) -> Result<DStream<V>, GraphError> {
        let mut upstreams = vec![self.id()];
        for other in others {
            if !self.graph().same_graph(other.graph()) {
                return Err(GraphError::ForeignStream(name.to_string()));
            }
            if other.slide() != self.slide() {
                return Err(GraphError::IncompatibleSlides {
                    name: name.to_string(),
                    left: self.slide(),
                    right: other.slide(),
                });
            }
            upstreams.push(other.id());
        }
        self.graph().add_node(
            NodeDescriptor::new(name, NodeKind::Union, upstreams, self.slide()),
            |descriptor, _| {
                Ok(Box::new(UnionNode::<V> {
                    descriptor,
                    _records: std::marker::PhantomData,
                }) as Box<dyn ComputeNode>)
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::operators::Window;
    use crate::testing::{test_config, TestHarness};

    #[test]
    fn union_concatenates_in_argument_order() {
        let mut harness = TestHarness::new(test_config(None));
        let (a, qa) = harness.graph().queue_stream::<u8>("a").unwrap();
        let (b, qb) = harness.graph().queue_stream::<u8>("b").unwrap();
        let both = a.union("both", &[&b]).unwrap();
        let sink = harness.collect("sink", &both);
        qa.push(vec![1, 2]);
        qb.push(vec![3]);
        harness.run_batches(1).unwrap();
        assert_eq!(sink.drain_batch(harness.time_of(1)), vec![1, 2, 3]);
    }

    #[test]
    fn union_rejects_different_slides() {
        let harness = TestHarness::new(test_config(None));
        let (a, _qa) = harness.graph().queue_stream::<u8>("a").unwrap();
        let windowed = a
            .window("windowed", Duration::from_secs(2), Duration::from_secs(2))
            .unwrap();
        assert!(matches!(
            a.union("mixed", &[&windowed]),
            Err(GraphError::IncompatibleSlides { .. })
        ));
    }
}
