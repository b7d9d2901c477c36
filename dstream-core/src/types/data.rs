//! Types and traits for data processed in a dstream job

use std::hash::Hash;

use serde::{de::DeserializeOwned, Serialize};

/// Data which may move through a stream.
///
/// Datasets are partitioned and partitions may be processed on any thread of the
/// executor, so data must be shareable across threads.
#[diagnostic::on_unimplemented(
    message = "Type must be `Clone + Send + Sync + 'static` to be used as data"
)]
pub trait Data: Clone + Send + Sync + 'static {}
impl<T: Clone + Send + Sync + 'static> Data for T {}

/// Data usable as the key of a keyed stream
#[diagnostic::on_unimplemented(message = "Type must be `Data + Hash + Eq` to be used as a key")]
pub trait Key: Data + Hash + Eq {}
impl<T: Data + Hash + Eq> Key for T {}

/// Data which can be written to durable storage, i.e. to the write-ahead log or
/// into a checkpoint
pub trait Persistable: Serialize + DeserializeOwned {}
impl<T: Serialize + DeserializeOwned> Persistable for T {}
