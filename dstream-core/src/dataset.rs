//! Materialized batch datasets.
//!
//! A [Dataset] is the immutable, partitioned result of computing one DStream node
//! for one BatchTime. Datasets are cheap to clone, clones share their partitions.
use std::any::Any;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use indexmap::IndexMap;

use crate::types::{Data, Key};

/// Immutable partitioned collection of records
pub struct Dataset<V> {
    partitions: Arc<Vec<Vec<V>>>,
}

impl<V> Clone for Dataset<V> {
    fn clone(&self) -> Self {
        Self {
            partitions: Arc::clone(&self.partitions),
        }
    }
}

impl<V: Debug> Debug for Dataset<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("partitions", &self.partitions)
            .finish()
    }
}

impl<V: PartialEq> PartialEq for Dataset<V> {
    fn eq(&self, other: &Self) -> bool {
        self.partitions == other.partitions
    }
}

impl<V> Default for Dataset<V> {
    fn default() -> Self {
        Self {
            partitions: Arc::new(Vec::new()),
        }
    }
}

impl<V> Dataset<V> {
    /// A dataset without partitions
    pub fn empty() -> Self {
        Self::default()
    }

    /// Create a dataset from the given partitions
    pub fn from_partitions(partitions: Vec<Vec<V>>) -> Self {
        Self {
            partitions: Arc::new(partitions),
        }
    }

    /// Create a dataset with a single partition
    pub fn from_vec(records: Vec<V>) -> Self {
        Self::from_partitions(vec![records])
    }

    /// All partitions of this dataset
    pub fn partitions(&self) -> &[Vec<V>] {
        &self.partitions
    }

    /// Number of partitions
    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    /// Number of records in all partitions
    pub fn len(&self) -> usize {
        self.partitions.iter().map(Vec::len).sum()
    }

    /// True if no partition holds a record
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate all records partition by partition
    pub fn iter(&self) -> impl Iterator<Item = &V> {
        self.partitions.iter().flatten()
    }
}

impl<V: Data> Dataset<V> {
    /// Copy all records into a single vector, partition by partition
    pub fn collect(&self) -> Vec<V> {
        self.iter().cloned().collect()
    }

    /// Concatenate the partitions of all given datasets
    pub fn union<'a>(datasets: impl IntoIterator<Item = &'a Dataset<V>>) -> Self {
        let partitions = datasets
            .into_iter()
            .flat_map(|d| d.partitions.iter().cloned())
            .collect();
        Self::from_partitions(partitions)
    }

    /// Apply a function to every record, keeping the partitioning
    pub fn map<O>(&self, mut mapper: impl FnMut(&V) -> O) -> Dataset<O> {
        Dataset::from_partitions(
            self.partitions
                .iter()
                .map(|p| p.iter().map(&mut mapper).collect())
                .collect(),
        )
    }

    /// Retain the records for which the predicate returns true
    pub fn filter(&self, mut predicate: impl FnMut(&V) -> bool) -> Dataset<V> {
        Dataset::from_partitions(
            self.partitions
                .iter()
                .map(|p| p.iter().filter(|x| predicate(*x)).cloned().collect())
                .collect(),
        )
    }
}

impl<K: Key, V: Data> Dataset<(K, V)> {
    /// Collect a keyed dataset into a map. Later values of duplicate keys win.
    pub fn collect_map(&self) -> IndexMap<K, V> {
        self.iter().cloned().collect()
    }
}

/// A dataset of which the record type was erased so nodes of different types can
/// share a cache
pub(crate) type ErasedDataset = Arc<dyn Any + Send + Sync>;

pub(crate) fn erase<V: Data>(dataset: Dataset<V>) -> ErasedDataset {
    Arc::new(dataset)
}

pub(crate) fn downcast<V: Data>(erased: &ErasedDataset) -> Option<Dataset<V>> {
    erased.downcast_ref::<Dataset<V>>().cloned()
}

/// Stable partition index of a key
pub fn partition_for<K: Hash>(key: &K, num_partitions: usize) -> usize {
    let mut hasher = seahash::SeaHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % num_partitions.max(1) as u64) as usize
}

/// Distribute key-value pairs onto `num_partitions` partitions by key hash
pub(crate) fn hash_partition<K: Hash, V>(
    entries: impl IntoIterator<Item = (K, V)>,
    num_partitions: usize,
) -> Vec<Vec<(K, V)>> {
    let num_partitions = num_partitions.max(1);
    let mut partitions: Vec<Vec<(K, V)>> = (0..num_partitions).map(|_| Vec::new()).collect();
    for (k, v) in entries {
        let idx = partition_for(&k, num_partitions);
        partitions[idx].push((k, v));
    }
    partitions
}
