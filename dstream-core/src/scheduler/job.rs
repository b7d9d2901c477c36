use std::time::Duration;

use indexmap::IndexMap;

use crate::assembler::BatchDescriptor;
use crate::types::{BatchTime, NodeId};

/// Lifecycle of one BatchTime within the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    /// Generated and queued, waiting for the job runner
    Pending,
    /// Output actions are being executed
    Computing,
    /// All output actions succeeded
    Completed,
    /// Materializing a node or running an output action failed
    Failed,
}

/// Progress and timing information of one batch
#[derive(Debug, Clone, PartialEq)]
pub struct BatchInfo {
    /// The batch's BatchTime
    pub time: BatchTime,
    /// Current state
    pub state: BatchState,
    /// Number of received records per source node
    pub records_per_source: IndexMap<NodeId, usize>,
    /// Wall-clock time at which the batch was generated
    pub submission_time: BatchTime,
    /// Wall-clock time at which the job runner started the batch
    pub processing_start: Option<BatchTime>,
    /// Wall-clock time at which the batch completed or failed
    pub processing_end: Option<BatchTime>,
    /// Number of batches queued behind this one when it started
    pub backlog: usize,
}

impl BatchInfo {
    pub(crate) fn new(descriptor: &BatchDescriptor, submission_time: BatchTime) -> Self {
        Self {
            time: descriptor.time,
            state: BatchState::Pending,
            records_per_source: descriptor
                .blocks
                .iter()
                .map(|(source, blocks)| (*source, blocks.iter().map(|b| b.num_records).sum()))
                .collect(),
            submission_time,
            processing_start: None,
            processing_end: None,
            backlog: 0,
        }
    }

    /// Total number of received records in this batch
    pub fn num_records(&self) -> usize {
        self.records_per_source.values().sum()
    }

    /// Time the batch waited in the queue before processing started
    pub fn scheduling_delay(&self) -> Option<Duration> {
        self.processing_start.map(|start| start - self.submission_time)
    }

    /// Time spent executing the batch's output actions
    pub fn processing_time(&self) -> Option<Duration> {
        match (self.processing_start, self.processing_end) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Scheduling delay plus processing time
    pub fn total_delay(&self) -> Option<Duration> {
        self.processing_end.map(|end| end - self.submission_time)
    }
}

/// A generated batch handed from the job generator to the job runner
#[derive(Debug, Clone)]
pub(crate) struct JobSet {
    pub(crate) info: BatchInfo,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::ReceivedBlockInfo;
    use crate::types::BlockId;

    #[test]
    fn delays_derive_from_wall_clock_marks() {
        let source = NodeId::from_name("source");
        let mut descriptor = BatchDescriptor::empty(BatchTime::from_millis(1000));
        descriptor.blocks.insert(
            source,
            vec![ReceivedBlockInfo {
                source,
                block: BlockId::new(0, 0),
                seal_time: BatchTime::from_millis(800),
                num_records: 7,
                wal_handle: None,
            }],
        );
        let mut info = BatchInfo::new(&descriptor, BatchTime::from_millis(1000));
        assert_eq!(info.num_records(), 7);
        assert_eq!(info.scheduling_delay(), None);

        info.processing_start = Some(BatchTime::from_millis(1300));
        info.processing_end = Some(BatchTime::from_millis(1800));
        assert_eq!(info.scheduling_delay(), Some(Duration::from_millis(300)));
        assert_eq!(info.processing_time(), Some(Duration::from_millis(500)));
        assert_eq!(info.total_delay(), Some(Duration::from_millis(800)));
    }
}
