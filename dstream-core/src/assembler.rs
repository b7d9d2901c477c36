//! Groups sealed blocks into per-batch descriptors.
//!
//! Blocks registered with the [BlockAssembler] wait in a per-source queue until
//! the scheduler allocates a BatchTime. Allocating `T` takes every queued block
//! with a seal time `<= T`, so a block belongs to the batch covering the half-open
//! interval `(T - batch_interval, T]` its seal time falls in. A block registered
//! after its batch was allocated stays queued and goes to the next allocated batch.
//!
//! With a tracker log, every addition, allocation and cleanup is logged before it
//! takes effect, so a restarted job can rebuild the exact same batches.
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::storage::{FileWriteAheadLog, WalError, WalReader, WalRecordHandle};
use crate::types::{BatchTime, BlockId, NodeId, ReceiverId};

/// Metadata of a block handed to the assembler by a receiver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedBlockInfo {
    /// Source node the receiver feeds
    pub source: NodeId,
    /// Id of the block in the block store
    pub block: BlockId,
    /// Wall-clock time at which the block was sealed
    pub seal_time: BatchTime,
    /// Number of records in the block
    pub num_records: usize,
    /// Location of the block's records in the write-ahead log, if logged
    pub wal_handle: Option<WalRecordHandle>,
}

/// All blocks making up the input of one BatchTime, per source node
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchDescriptor {
    /// The BatchTime this descriptor was allocated for
    pub time: BatchTime,
    /// Blocks per source node in registration order
    pub blocks: IndexMap<NodeId, Vec<ReceivedBlockInfo>>,
}

impl BatchDescriptor {
    /// Descriptor of a batch without any blocks
    pub fn empty(time: BatchTime) -> Self {
        Self {
            time,
            blocks: IndexMap::new(),
        }
    }

    /// Blocks allocated to `source` in this batch
    pub fn blocks_for(&self, source: &NodeId) -> &[ReceivedBlockInfo] {
        self.blocks.get(source).map(Vec::as_slice).unwrap_or_default()
    }

    /// Total number of records of all blocks
    pub fn num_records(&self) -> usize {
        self.blocks.values().flatten().map(|b| b.num_records).sum()
    }

    /// Ids of all blocks of all sources
    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks.values().flatten().map(|b| b.block)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum TrackerEvent {
    BlockAdded(ReceivedBlockInfo),
    BatchAllocated(BatchDescriptor),
    BatchCleanup(Vec<BatchTime>),
}

#[derive(Debug, Default)]
struct AssemblerInner {
    unallocated: IndexMap<NodeId, VecDeque<ReceivedBlockInfo>>,
    allocated: BTreeMap<BatchTime, BatchDescriptor>,
    last_allocated: Option<BatchTime>,
}

impl AssemblerInner {
    fn apply(&mut self, event: TrackerEvent) {
        match event {
            TrackerEvent::BlockAdded(info) => {
                self.unallocated
                    .entry(info.source)
                    .or_default()
                    .push_back(info);
            }
            TrackerEvent::BatchAllocated(descriptor) => {
                for (source, blocks) in descriptor.blocks.iter() {
                    if let Some(queue) = self.unallocated.get_mut(source) {
                        queue.retain(|queued| !blocks.iter().any(|b| b.block == queued.block));
                    }
                }
                self.last_allocated = Some(descriptor.time);
                self.allocated.insert(descriptor.time, descriptor);
            }
            TrackerEvent::BatchCleanup(times) => {
                for t in times {
                    self.allocated.remove(&t);
                }
            }
        }
    }

    fn take_sealed_until(&mut self, time: BatchTime) -> BatchDescriptor {
        let mut descriptor = BatchDescriptor::empty(time);
        for (source, queue) in self.unallocated.iter_mut() {
            let (ready, waiting): (VecDeque<_>, VecDeque<_>) =
                queue.drain(..).partition(|b| b.seal_time <= time);
            *queue = waiting;
            if !ready.is_empty() {
                descriptor.blocks.insert(*source, ready.into_iter().collect());
            }
        }
        descriptor
    }
}

/// Tracks received blocks and allocates them to batches
#[derive(Debug)]
pub struct BlockAssembler {
    inner: Mutex<AssemblerInner>,
    log: Option<Mutex<FileWriteAheadLog>>,
}

impl Default for BlockAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockAssembler {
    /// An assembler keeping its metadata in memory only
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(AssemblerInner::default()),
            log: None,
        }
    }

    /// An assembler logging all metadata changes to a tracker log in `dir`.
    /// If `recover` is set, the events already in the log are replayed first.
    pub fn with_log(
        dir: impl Into<PathBuf>,
        rolling_interval: Duration,
        recover: bool,
    ) -> Result<Self, AssemblerError> {
        let dir = dir.into();
        let mut inner = AssemblerInner::default();
        if recover {
            let events = WalReader::new(&dir).read_all()?;
            let count = events.len();
            for bytes in events {
                let event: TrackerEvent = rmp_serde::from_slice(&bytes).map_err(WalError::from)?;
                inner.apply(event);
            }
            info!(
                events = count,
                allocated = inner.allocated.len(),
                "Recovered block metadata from tracker log"
            );
        }
        let log = FileWriteAheadLog::open(dir, rolling_interval)?;
        Ok(Self {
            inner: Mutex::new(inner),
            log: Some(Mutex::new(log)),
        })
    }

    /// Register a sealed block. Once this returns, the block is guaranteed to be
    /// part of exactly one future batch.
    pub fn add_block(&self, info: ReceivedBlockInfo) -> Result<(), AssemblerError> {
        let time = info.seal_time;
        let event = TrackerEvent::BlockAdded(info);
        // held while logging so the log order equals the order events are applied in
        #[allow(clippy::unwrap_used)]
        let mut inner = self.inner.lock().unwrap();
        self.write_event(&event, time)?;
        inner.apply(event);
        Ok(())
    }

    /// Allocate all queued blocks sealed at or before `time` to the batch `time`.
    ///
    /// Allocating a time which was already allocated (e.g. replayed from the
    /// tracker log) returns the existing descriptor.
    pub fn allocate(&self, time: BatchTime) -> Result<BatchDescriptor, AssemblerError> {
        #[allow(clippy::unwrap_used)]
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.allocated.get(&time) {
            return Ok(existing.clone());
        }
        if let Some(last) = inner.last_allocated {
            if time <= last {
                return Err(AssemblerError::NotMonotonic { time, last });
            }
        }
        let descriptor = inner.take_sealed_until(time);
        let event = TrackerEvent::BatchAllocated(descriptor.clone());
        if let Err(e) = self.write_event(&event, time) {
            // put the blocks back so they get allocated to the next batch
            for block in descriptor.blocks.into_values().flatten().rev() {
                inner
                    .unallocated
                    .entry(block.source)
                    .or_default()
                    .push_front(block);
            }
            return Err(e);
        }
        debug!(%time, blocks = descriptor.block_ids().count(), "Allocated batch");
        inner.apply(event);
        Ok(descriptor)
    }

    /// The descriptor allocated for `time`, if any
    pub fn get(&self, time: &BatchTime) -> Option<BatchDescriptor> {
        #[allow(clippy::unwrap_used)]
        self.inner.lock().unwrap().allocated.get(time).cloned()
    }

    /// All allocated batches after `time`, in time order
    pub fn allocated_after(&self, time: BatchTime) -> Vec<BatchTime> {
        #[allow(clippy::unwrap_used)]
        let inner = self.inner.lock().unwrap();
        inner
            .allocated
            .range(time..)
            .map(|(t, _)| *t)
            .filter(|t| *t > time)
            .collect()
    }

    /// Lowest block sequence number not yet known for `receiver`, so blocks of a
    /// restarted job never reuse the id of a recovered block
    pub fn next_block_seq(&self, receiver: ReceiverId) -> u64 {
        #[allow(clippy::unwrap_used)]
        let inner = self.inner.lock().unwrap();
        inner
            .unallocated
            .values()
            .flatten()
            .chain(inner.allocated.values().flat_map(|d| d.blocks.values().flatten()))
            .filter(|b| b.block.receiver == receiver)
            .map(|b| b.block.seq + 1)
            .max()
            .unwrap_or(0)
    }

    /// True if blocks are waiting for allocation
    pub fn has_unallocated_blocks(&self) -> bool {
        #[allow(clippy::unwrap_used)]
        let inner = self.inner.lock().unwrap();
        inner.unallocated.values().any(|q| !q.is_empty())
    }

    /// Forget all batches older than `threshold` and clean the tracker log.
    /// Returns the ids of all blocks of the dropped batches.
    pub fn cleanup(&self, threshold: BatchTime) -> Result<Vec<BlockId>, AssemblerError> {
        #[allow(clippy::unwrap_used)]
        let mut inner = self.inner.lock().unwrap();
        let expired: Vec<BatchTime> = inner.allocated.range(..threshold).map(|(t, _)| *t).collect();
        if expired.is_empty() {
            return Ok(Vec::new());
        }
        let blocks: Vec<BlockId> = expired
            .iter()
            .filter_map(|t| inner.allocated.get(t))
            .flat_map(|d| d.block_ids())
            .collect();
        let event = TrackerEvent::BatchCleanup(expired);
        self.write_event(&event, threshold)?;
        inner.apply(event);
        drop(inner);

        if let Some(log) = &self.log {
            #[allow(clippy::unwrap_used)]
            log.lock().unwrap().clean(threshold)?;
        }
        Ok(blocks)
    }

    /// Close the tracker log
    pub fn stop(&self) {
        if let Some(log) = &self.log {
            #[allow(clippy::unwrap_used)]
            log.lock().unwrap().close();
        }
    }

    fn write_event(&self, event: &TrackerEvent, time: BatchTime) -> Result<(), AssemblerError> {
        if let Some(log) = &self.log {
            let bytes = rmp_serde::to_vec(event).map_err(WalError::from)?;
            #[allow(clippy::unwrap_used)]
            log.lock().unwrap().write(&bytes, time)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum AssemblerError {
    #[error("Cannot allocate batch {time} after batch {last}")]
    NotMonotonic { time: BatchTime, last: BatchTime },
    #[error("Tracker log failure")]
    Log(#[from] WalError),
}
