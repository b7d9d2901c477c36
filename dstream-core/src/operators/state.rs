//! Per-key state carried across batches
use std::collections::BTreeMap;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::dataset::{erase, hash_partition, Dataset, ErasedDataset};
use crate::graph::{ComputeContext, ComputeError, ComputeNode, DStream, GraphError, NodeDescriptor, NodeKind};
use crate::state::{StateStore, UpdateFn};
use crate::types::{BatchTime, Data, Key, NodeId, Persistable};

/// Serialized form of an [UpdateStateNode]: the current table and the full
/// outputs of earlier retained batches
type StateCheckpoint<K, S> = (Option<BatchTime>, IndexMap<K, S>, Vec<(BatchTime, IndexMap<K, S>)>);

struct UpdateStateNode<K, V, S> {
    descriptor: NodeDescriptor,
    store: Arc<StateStore>,
    /// Table after each retained batch. Serves recomputations and windows
    /// reaching back before the last applied batch.
    history: BTreeMap<BatchTime, Arc<IndexMap<K, S>>>,
    _types: std::marker::PhantomData<fn() -> V>,
}

impl<K, V, S> ComputeNode for UpdateStateNode<K, V, S>
where
    K: Key + Persistable,
    V: Data,
    S: Data + Persistable,
{
    fn descriptor(&self) -> &NodeDescriptor {
        &self.descriptor
    }

    fn dependencies(&self, time: BatchTime, _zero: BatchTime) -> Vec<(NodeId, BatchTime)> {
        if self.history.contains_key(&time) {
            Vec::new()
        } else {
            vec![(self.descriptor.upstreams[0], time)]
        }
    }

    fn requires_checkpointing(&self) -> bool {
        true
    }

    fn compute(
        &mut self,
        time: BatchTime,
        ctx: &mut ComputeContext<'_>,
    ) -> Result<Option<ErasedDataset>, ComputeError> {
        let entries = match self.history.get(&time) {
            // applying a batch twice would count its values twice
            Some(entries) => Arc::clone(entries),
            None => {
                let input = ctx.input::<(K, V)>(self.descriptor.upstreams[0], time)?;
                let mut grouped: IndexMap<K, Vec<V>> = IndexMap::new();
                for (k, v) in input.iter().cloned() {
                    grouped.entry(k).or_default().push(v);
                }
                let entries = self
                    .store
                    .apply_batch::<K, V, S>(&self.descriptor.id, time, grouped)?
                    .entries;
                self.history.insert(time, Arc::clone(&entries));
                entries
            }
        };
        let partitions = hash_partition(
            entries.iter().map(|(k, s)| (k.clone(), s.clone())),
            ctx.env.num_partitions,
        );
        Ok(Some(erase(Dataset::from_partitions(partitions))))
    }

    fn forget_before(&mut self, threshold: BatchTime) {
        self.history.retain(|t, _| *t > threshold);
    }

    fn snapshot(&self) -> Result<Option<Vec<u8>>, ComputeError> {
        let current = self.store.snapshot::<K, S>(&self.descriptor.id)?;
        let earlier: Vec<(BatchTime, &IndexMap<K, S>)> = self
            .history
            .iter()
            .filter(|(t, _)| Some(**t) != current.time)
            .map(|(t, entries)| (*t, entries.as_ref()))
            .collect();
        rmp_serde::to_vec(&(current.time, current.entries.as_ref(), earlier))
            .map(Some)
            .map_err(|source| ComputeError::Snapshot {
                node: self.descriptor.name.clone(),
                source,
            })
    }

    fn restore(&mut self, bytes: &[u8]) -> Result<(), ComputeError> {
        let (time, entries, earlier): StateCheckpoint<K, S> =
            rmp_serde::from_slice(bytes).map_err(|source| ComputeError::Restore {
                node: self.descriptor.name.clone(),
                source,
            })?;
        self.history = earlier
            .into_iter()
            .map(|(t, entries)| (t, Arc::new(entries)))
            .collect();
        if let Some(time) = time {
            self.store.restore(&self.descriptor.id, time, entries)?;
            let restored = self.store.snapshot::<K, S>(&self.descriptor.id)?;
            self.history.insert(time, restored.entries);
        }
        Ok(())
    }
}

/// Maintain arbitrary state per key across all batches
pub trait UpdateStateByKey<K, V>: super::sealed::Sealed {
    /// On every batch, call `update` with the values each key received in the
    /// batch and the key's previous state. Keys without new values but with
    /// existing state are updated with no values. Returning `None` removes the
    /// key's state.
    ///
    /// The output stream contains the full state after every batch. The node's
    /// state can also be read through
    /// [StreamingContext::state_handle](crate::context::StreamingContext::state_handle).
    /// Requires checkpointing.
    fn update_state_by_key<S: Data + Persistable>(
        &self,
        name: &str,
        update: impl Fn(Vec<V>, Option<S>) -> Option<S> + Send + Sync + 'static,
    ) -> Result<DStream<(K, S)>, GraphError>;
}

impl<K, V> UpdateStateByKey<K, V> for DStream<(K, V)>
where
    K: Key + Persistable,
    V: Data,
{
    fn update_state_by_key<S: Data + Persistable>(
        &self,
        name: &str,
        update: impl Fn(Vec<V>, Option<S>) -> Option<S> + Send + Sync + 'static,
    ) -> Result<DStream<(K, S)>, GraphError> {
        let update: UpdateFn<V, S> = Arc::new(update);
        self.graph().add_node(
            NodeDescriptor::new(name, NodeKind::UpdateStateByKey, vec![self.id()], self.slide()),
            move |descriptor, store| {
                store.register::<K, V, S>(descriptor.id, update)?;
                Ok(Box::new(UpdateStateNode::<K, V, S> {
                    descriptor,
                    store: Arc::clone(store),
                    history: BTreeMap::new(),
                    _types: std::marker::PhantomData,
                }) as Box<dyn ComputeNode>)
            },
        )
    }
}
