//! Receivers ingest records from external sources.
//!
//! A [Receiver] runs on its own thread and pushes records into a
//! [ReceiverSink]. The sink buffers records and a block generator seals the
//! buffer into a block every `block_interval`. Sealed blocks are replicated to the
//! [BlockStore](crate::storage::BlockStore), optionally logged to the
//! write-ahead log, and registered with the
//! [BlockAssembler](crate::assembler::BlockAssembler).
//!
//! # Example
//! ```rust
//! use dstream::receiver::{ReceiveStatus, Receiver, ReceiverSink};
//!
//! /// Emits the numbers 0 to 99 and finishes
//! struct Counter(u64);
//!
//! impl Receiver<u64> for Counter {
//!     fn receive(&mut self, sink: &mut ReceiverSink<u64>) -> eyre::Result<ReceiveStatus> {
//!         if self.0 == 100 {
//!             return Ok(ReceiveStatus::Finished);
//!         }
//!         sink.push(self.0);
//!         self.0 += 1;
//!         Ok(ReceiveStatus::Active)
//!     }
//! }
//! ```
mod block;
mod manager;
mod rate_limit;
mod supervisor;

use thiserror::Error;

pub use block::ReceiverSink;
pub(crate) use manager::{PendingReceiver, ReceiverEnv, ReceiverLogs, ReceiverManager, RECEIVED_DATA_DIR};
pub use rate_limit::RateBus;
pub(crate) use rate_limit::RateLimiter;

use crate::assembler::AssemblerError;
use crate::storage::{BlockStoreError, WalError};
use crate::types::{NodeId, ReceiverId};

/// Acknowledgement capability of a receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reliability {
    /// The receiver acknowledges records to its source only after
    /// [ReceiverSink::store_reliably] returned. Its source replays records which
    /// were never acknowledged.
    Reliable,
    /// The receiver does not acknowledge records. Buffered records are lost if
    /// the receiver fails.
    #[default]
    Unreliable,
}

/// Outcome of a single call to [Receiver::receive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveStatus {
    /// More records may be available right away
    Active,
    /// No records are available right now, the receiver is called again after a
    /// short pause
    Idle,
    /// The source is exhausted and the receiver will not be called again
    Finished,
}

/// A receiver pulls (or is pushed) records from one partition of an external
/// source.
///
/// Errors returned from any method are reported to the monitoring feed and the
/// receiver is restarted after the configured restart delay.
pub trait Receiver<V>: Send + 'static {
    /// Acknowledgement mode of this receiver
    fn reliability(&self) -> Reliability {
        Reliability::Unreliable
    }

    /// Called before the first `receive` and after every restart.
    /// Reliable receivers reconnect to their source's resume point here.
    fn on_start(&mut self) -> eyre::Result<()> {
        Ok(())
    }

    /// Receive records into the sink
    fn receive(&mut self, sink: &mut ReceiverSink<V>) -> eyre::Result<ReceiveStatus>;

    /// Called when the receiver stops, either because it failed, finished, or
    /// the job is shutting down
    fn on_stop(&mut self) {}
}

/// Monitoring counters of a receiver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverInfo {
    /// Id of the receiver
    pub id: ReceiverId,
    /// Name of the source node this receiver feeds
    pub name: String,
    /// Id of the source node this receiver feeds
    pub source: NodeId,
    /// True while the receiver runs
    pub active: bool,
    /// Total records made part of a block
    pub records_received: u64,
    /// Number of failures
    pub errors: u64,
    /// Number of restarts
    pub restarts: u64,
    /// Last error, rendered
    pub last_error: Option<String>,
}

impl ReceiverInfo {
    pub(crate) fn new(id: ReceiverId, name: String, source: NodeId) -> Self {
        Self {
            id,
            name,
            source,
            active: false,
            records_received: 0,
            errors: 0,
            restarts: 0,
            last_error: None,
        }
    }
}

/// Failure storing received data
#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("Failed to replicate block")]
    BlockStore(#[from] BlockStoreError),
    #[error("Failed to log block")]
    Wal(#[from] WalError),
    #[error("Failed to register block")]
    Assembler(#[from] AssemblerError),
    #[error("Receiver has been stopped")]
    Stopped,
    #[error("Could not spawn receiver thread")]
    Spawn(#[source] std::io::Error),
}
