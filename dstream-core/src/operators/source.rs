//! Source nodes: the only nodes without upstreams.
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::assembler::BatchDescriptor;
use crate::dataset::{erase, Dataset, ErasedDataset};
use crate::graph::{ComputeContext, ComputeError, ComputeNode, DStream, Graph, GraphError, NodeDescriptor, NodeKind};
use crate::receiver::{Receiver, RECEIVED_DATA_DIR};
use crate::storage::{WalError, WalReader};
use crate::types::{BatchTime, Data, Persistable};

/// Batches waiting to be consumed by a queue source. Clones share the queue.
pub struct InputQueue<V> {
    batches: Arc<Mutex<VecDeque<Vec<V>>>>,
}

impl<V> Clone for InputQueue<V> {
    fn clone(&self) -> Self {
        Self {
            batches: Arc::clone(&self.batches),
        }
    }
}

impl<V> std::fmt::Debug for InputQueue<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputQueue")
            .field("len", &self.len())
            .finish()
    }
}

impl<V> Default for InputQueue<V> {
    fn default() -> Self {
        Self {
            batches: Arc::new(Mutex::new(VecDeque::new())),
        }
    }
}

impl<V> InputQueue<V> {
    /// Enqueue the records of one batch
    pub fn push(&self, batch: Vec<V>) {
        #[allow(clippy::unwrap_used)]
        self.batches.lock().unwrap().push_back(batch);
    }

    /// Number of batches not consumed yet
    pub fn len(&self) -> usize {
        #[allow(clippy::unwrap_used)]
        self.batches.lock().unwrap().len()
    }

    /// True if every batch was consumed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pop(&self) -> Option<Vec<V>> {
        #[allow(clippy::unwrap_used)]
        self.batches.lock().unwrap().pop_front()
    }
}

struct QueueSourceNode<V> {
    descriptor: NodeDescriptor,
    queue: InputQueue<V>,
    consumed: BTreeMap<BatchTime, Dataset<V>>,
}

impl<V: Data> ComputeNode for QueueSourceNode<V> {
    fn descriptor(&self) -> &NodeDescriptor {
        &self.descriptor
    }

    fn compute(
        &mut self,
        time: BatchTime,
        _ctx: &mut ComputeContext<'_>,
    ) -> Result<Option<ErasedDataset>, ComputeError> {
        // a queued batch is taken exactly once, later requests see the same data
        let dataset = match self.consumed.get(&time) {
            Some(d) => d.clone(),
            None => {
                let d = self.queue.pop().map(Dataset::from_vec).unwrap_or_default();
                self.consumed.insert(time, d.clone());
                d
            }
        };
        Ok(Some(erase(dataset)))
    }

    fn forget_before(&mut self, threshold: BatchTime) {
        self.consumed.retain(|t, _| *t > threshold);
    }
}

struct ReceiverSourceNode<V> {
    descriptor: NodeDescriptor,
    _records: std::marker::PhantomData<fn() -> V>,
}

impl<V: Data + Persistable> ReceiverSourceNode<V> {
    /// Read a block back from the received data log
    fn read_logged(
        ctx: &ComputeContext<'_>,
        info: &crate::assembler::ReceivedBlockInfo,
    ) -> Result<Option<Vec<V>>, ComputeError> {
        let (Some(handle), Some(root)) = (&info.wal_handle, &ctx.env.wal_root) else {
            return Ok(None);
        };
        let reader = WalReader::new(
            root.join(RECEIVED_DATA_DIR)
                .join(info.block.receiver.to_string()),
        );
        let bytes = reader.read(handle)?;
        let records: Vec<V> = rmp_serde::from_slice(&bytes).map_err(WalError::from)?;
        Ok(Some(records))
    }
}

impl<V: Data + Persistable> ComputeNode for ReceiverSourceNode<V> {
    fn descriptor(&self) -> &NodeDescriptor {
        &self.descriptor
    }

    fn compute(
        &mut self,
        time: BatchTime,
        ctx: &mut ComputeContext<'_>,
    ) -> Result<Option<ErasedDataset>, ComputeError> {
        let id = self.descriptor.id;
        let batch = ctx
            .env
            .assembler
            .get(&time)
            .unwrap_or_else(|| BatchDescriptor::empty(time));

        let blocks = batch.blocks_for(&id);
        let mut partitions = Vec::with_capacity(blocks.len());
        let mut lost = 0;
        for info in blocks {
            if let Some(records) = ctx.env.block_store.get::<V>(&info.block)? {
                partitions.push(records.to_vec());
                continue;
            }
            match Self::read_logged(ctx, info)? {
                Some(records) => partitions.push(records),
                None => {
                    warn!(block = %info.block, %time, "Block is neither replicated nor logged");
                    lost += 1;
                }
            }
        }
        if lost > 0 {
            return Err(ComputeError::SourceDataLoss {
                name: self.descriptor.name.clone(),
                node: id,
                time,
                blocks: lost,
            });
        }
        Ok(Some(erase(Dataset::from_partitions(partitions))))
    }
}

impl Graph {
    /// A stream consuming one queued batch per BatchTime. BatchTimes for which
    /// the queue is empty produce an empty dataset.
    pub fn queue_stream<V: Data>(&self, name: &str) -> Result<(DStream<V>, InputQueue<V>), GraphError> {
        let queue = InputQueue::default();
        let node_queue = queue.clone();
        let batch = self.batch_interval();
        let stream = self.add_node(
            NodeDescriptor::new(name, NodeKind::QueueSource, Vec::new(), batch),
            move |descriptor, _| {
                Ok(Box::new(QueueSourceNode {
                    descriptor,
                    queue: node_queue,
                    consumed: BTreeMap::new(),
                }) as Box<dyn ComputeNode>)
            },
        )?;
        Ok((stream, queue))
    }

    /// A stream fed by the given receivers. Every block a receiver seals
    /// becomes one partition of the dataset of the batch it is allocated to.
    pub fn receiver_stream<V, R>(&self, name: &str, receivers: Vec<R>) -> Result<DStream<V>, GraphError>
    where
        V: Data + Persistable,
        R: Receiver<V>,
    {
        let batch = self.batch_interval();
        let kind = NodeKind::ReceiverSource {
            receivers: receivers.len(),
        };
        let stream: DStream<V> = self.add_node(
            NodeDescriptor::new(name, kind, Vec::new(), batch),
            |descriptor, _| {
                Ok(Box::new(ReceiverSourceNode::<V> {
                    descriptor,
                    _records: std::marker::PhantomData,
                }) as Box<dyn ComputeNode>)
            },
        )?;
        for receiver in receivers {
            self.add_receiver(stream.id(), name, Box::new(receiver))?;
        }
        Ok(stream)
    }
}
