//! dstream is a micro-batch stream processing engine: unbounded input is cut
//! into batches at fixed intervals and every batch is processed as an
//! immutable, partitioned dataset.
pub mod assembler;
pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod context;
pub mod dataset;
pub mod executor;
pub mod graph;
pub mod operators;
pub mod receiver;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod storage;
pub mod types;

pub use config::StreamingConfig;
pub use context::{StopMode, StreamingContext};

#[cfg(test)]
pub(crate) mod testing;
