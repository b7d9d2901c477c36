use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{BlockId, Data};

/// Type erased records of a block
pub type BlockPayload = Arc<dyn Any + Send + Sync>;

/// In-memory block storage spread over several locations.
///
/// Every block is written to `replication` distinct locations. A block is only
/// lost if all locations holding it fail.
#[derive(Debug)]
pub struct BlockStore {
    locations: Vec<Mutex<HashMap<BlockId, BlockPayload>>>,
    replication: usize,
}

impl BlockStore {
    /// Create a store with `num_locations` locations
    pub fn new(num_locations: usize, replication: usize) -> Self {
        Self {
            locations: (0..num_locations.max(1))
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            replication: replication.max(1),
        }
    }

    /// Number of replicas of every block
    pub fn replication(&self) -> usize {
        self.replication
    }

    /// Number of storage locations
    pub fn num_locations(&self) -> usize {
        self.locations.len()
    }

    /// Store the records of a block at `replication` locations, returning the
    /// indices of these locations
    pub fn put<V: Data>(&self, id: BlockId, records: Arc<Vec<V>>) -> Result<Vec<usize>, BlockStoreError> {
        if self.replication > self.locations.len() {
            return Err(BlockStoreError::InsufficientLocations {
                replication: self.replication,
                locations: self.locations.len(),
            });
        }
        let payload: BlockPayload = records;
        let first = (id.seq as usize + id.receiver as usize) % self.locations.len();
        let targets: Vec<usize> = (0..self.replication)
            .map(|i| (first + i) % self.locations.len())
            .collect();
        for idx in targets.iter() {
            self.location(*idx).insert(id, Arc::clone(&payload));
        }
        debug!(block = %id, ?targets, "Stored block");
        Ok(targets)
    }

    /// Read a block from any location still holding it
    pub fn get<V: Data>(&self, id: &BlockId) -> Result<Option<Arc<Vec<V>>>, BlockStoreError> {
        let payload = (0..self.locations.len()).find_map(|i| self.location(i).get(id).cloned());
        match payload {
            Some(p) => p
                .downcast::<Vec<V>>()
                .map(Some)
                .map_err(|_| BlockStoreError::TypeMismatch(*id)),
            None => Ok(None),
        }
    }

    /// True if any location holds the block
    pub fn contains(&self, id: &BlockId) -> bool {
        (0..self.locations.len()).any(|i| self.location(i).contains_key(id))
    }

    /// Drop blocks from all locations
    pub fn remove(&self, ids: &[BlockId]) {
        for i in 0..self.locations.len() {
            let mut location = self.location(i);
            for id in ids {
                location.remove(id);
            }
        }
    }

    /// Simulate the loss of one location, e.g. the crash of the host holding it.
    /// All blocks stored there are dropped.
    pub fn fail_location(&self, idx: usize) {
        if idx < self.locations.len() {
            let mut location = self.location(idx);
            warn!(location = idx, blocks = location.len(), "Dropping block location");
            location.clear();
        }
    }

    /// Number of distinct blocks stored
    pub fn len(&self) -> usize {
        let mut ids: Vec<BlockId> = (0..self.locations.len())
            .flat_map(|i| self.location(i).keys().copied().collect::<Vec<_>>())
            .collect();
        ids.sort();
        ids.dedup();
        ids.len()
    }

    /// True if no block is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn location(&self, idx: usize) -> std::sync::MutexGuard<'_, HashMap<BlockId, BlockPayload>> {
        // PANIC: A poisoned location means a writer panicked mid-insert, the
        // location content is a plain map and stays usable
        self.locations[idx]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Error)]
pub enum BlockStoreError {
    #[error("Cannot store {replication} replicas on {locations} locations")]
    InsufficientLocations { replication: usize, locations: usize },
    #[error("Block {0} holds records of a different type")]
    TypeMismatch(BlockId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replicated_block_survives_single_failure() {
        let store = BlockStore::new(3, 2);
        let id = BlockId::new(0, 1);
        let targets = store.put(id, Arc::new(vec![1, 2, 3])).unwrap();
        assert_eq!(targets.len(), 2);
        store.fail_location(targets[0]);
        let records = store.get::<i32>(&id).unwrap().unwrap();
        assert_eq!(*records, vec![1, 2, 3]);
        store.fail_location(targets[1]);
        assert!(store.get::<i32>(&id).unwrap().is_none());
    }

    #[test]
    fn unreplicated_block_is_lost() {
        let store = BlockStore::new(2, 1);
        let id = BlockId::new(3, 0);
        let targets = store.put(id, Arc::new(vec!["a".to_string()])).unwrap();
        store.fail_location(targets[0]);
        assert!(!store.contains(&id));
    }

    #[test]
    fn rejects_replication_above_locations() {
        let store = BlockStore::new(1, 2);
        assert!(matches!(
            store.put(BlockId::new(0, 0), Arc::new(vec![0u8])),
            Err(BlockStoreError::InsufficientLocations { .. })
        ));
    }

    #[test]
    fn type_mismatch_is_an_error() {
        let store = BlockStore::new(2, 2);
        let id = BlockId::new(0, 0);
        store.put(id, Arc::new(vec![0u8])).unwrap();
        assert!(matches!(
            store.get::<String>(&id),
            Err(BlockStoreError::TypeMismatch(_))
        ));
        store.remove(&[id]);
        assert!(store.is_empty());
    }
}
