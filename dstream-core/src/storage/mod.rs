//! Storage for received data: replicated in-memory blocks and the write-ahead log
mod block_store;
mod wal;

pub use block_store::{BlockPayload, BlockStore, BlockStoreError};
pub use wal::{FileWriteAheadLog, WalError, WalReader, WalRecordHandle};
