//! Per-key state of stateful nodes.
//!
//! Every stateful node owns one table in the [StateStore]. A table is replaced
//! as a whole once per BatchTime by [StateStore::apply_batch], so readers holding
//! a [StateHandle] always observe the values of one fully applied BatchTime.
use std::any::Any;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use indexmap::IndexMap;
use thiserror::Error;
use tracing::debug;

use crate::types::{BatchTime, Data, Key, NodeId};

/// Function computing a key's new state from the values received for it in one
/// batch and its previous state. Returning `None` deletes the key's state.
pub type UpdateFn<V, S> = Arc<dyn Fn(Vec<V>, Option<S>) -> Option<S> + Send + Sync>;

/// Entries of a table as of one BatchTime
#[derive(Debug)]
pub struct StateSnapshot<K, S> {
    /// BatchTime the entries were applied at, `None` if no batch was applied yet
    pub time: Option<BatchTime>,
    /// All entries
    pub entries: Arc<IndexMap<K, S>>,
}

impl<K, S> Clone for StateSnapshot<K, S> {
    fn clone(&self) -> Self {
        Self {
            time: self.time,
            entries: Arc::clone(&self.entries),
        }
    }
}

struct StateTable<K, S> {
    node: NodeId,
    update: Box<dyn Any + Send + Sync>,
    published: RwLock<StateSnapshot<K, S>>,
}

impl<K, S> StateTable<K, S> {
    fn current(&self) -> StateSnapshot<K, S> {
        #[allow(clippy::unwrap_used)]
        self.published.read().unwrap().clone()
    }

    fn publish(&self, snapshot: StateSnapshot<K, S>) {
        #[allow(clippy::unwrap_used)]
        let mut published = self.published.write().unwrap();
        *published = snapshot;
    }
}

/// Holds the tables of all stateful nodes of a graph
#[derive(Default)]
pub struct StateStore {
    tables: RwLock<IndexMap<NodeId, Arc<dyn Any + Send + Sync>>>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        #[allow(clippy::unwrap_used)]
        let tables = self.tables.read().unwrap();
        f.debug_struct("StateStore")
            .field("tables", &tables.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StateStore {
    /// An empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the table of a node with its update function
    pub(crate) fn register<K: Key, V: Data, S: Data>(
        &self,
        node: NodeId,
        update: UpdateFn<V, S>,
    ) -> Result<(), StateError> {
        #[allow(clippy::unwrap_used)]
        let mut tables = self.tables.write().unwrap();
        if tables.contains_key(&node) {
            return Err(StateError::AlreadyRegistered(node));
        }
        let table: StateTable<K, S> = StateTable {
            node,
            update: Box::new(update),
            published: RwLock::new(StateSnapshot {
                time: None,
                entries: Arc::new(IndexMap::new()),
            }),
        };
        tables.insert(node, Arc::new(table));
        Ok(())
    }

    fn table<K: Key, S: Data>(&self, node: &NodeId) -> Result<Arc<StateTable<K, S>>, StateError> {
        #[allow(clippy::unwrap_used)]
        let tables = self.tables.read().unwrap();
        let table = tables.get(node).ok_or(StateError::UnknownNode(*node))?;
        Arc::clone(table)
            .downcast::<StateTable<K, S>>()
            .map_err(|_| StateError::TypeMismatch(*node))
    }

    /// State of `key` in the node's table as of the last applied BatchTime
    pub fn get<K: Key, S: Data>(&self, node: &NodeId, key: &K) -> Result<Option<S>, StateError> {
        Ok(self.table::<K, S>(node)?.current().entries.get(key).cloned())
    }

    /// A read handle to a node's table
    pub fn handle<K: Key, S: Data>(&self, node: &NodeId) -> Result<StateHandle<K, S>, StateError> {
        Ok(StateHandle {
            table: self.table(node)?,
        })
    }

    /// Apply one batch of new values to a node's table.
    ///
    /// The update function is invoked for every key which either has values in
    /// `updates` or an existing entry, first for existing entries in table order,
    /// then for new keys in the order of `updates`. Must be called once per
    /// BatchTime with strictly increasing times.
    pub fn apply_batch<K: Key, V: Data, S: Data>(
        &self,
        node: &NodeId,
        time: BatchTime,
        mut updates: IndexMap<K, Vec<V>>,
    ) -> Result<StateSnapshot<K, S>, StateError> {
        let table = self.table::<K, S>(node)?;
        let update = table
            .update
            .downcast_ref::<UpdateFn<V, S>>()
            .ok_or(StateError::TypeMismatch(*node))?;
        let previous = table.current();
        if let Some(last) = previous.time {
            if time <= last {
                return Err(StateError::AlreadyApplied {
                    node: *node,
                    time,
                    last,
                });
            }
        }

        let mut entries = IndexMap::with_capacity(previous.entries.len());
        for (key, state) in previous.entries.iter() {
            let values = updates.get_mut(key).map(std::mem::take).unwrap_or_default();
            if let Some(next) = update(values, Some(state.clone())) {
                entries.insert(key.clone(), next);
            }
        }
        let removed = previous.entries.len() - entries.len();
        for (key, values) in updates {
            if previous.entries.contains_key(&key) {
                continue;
            }
            if let Some(next) = update(values, None) {
                entries.insert(key, next);
            }
        }
        debug!(node = %table.node, %time, keys = entries.len(), removed, "Applied state batch");

        let snapshot = StateSnapshot {
            time: Some(time),
            entries: Arc::new(entries),
        };
        table.publish(snapshot.clone());
        Ok(snapshot)
    }

    /// Replace a node's table, e.g. with the entries of a checkpoint
    pub(crate) fn restore<K: Key, S: Data>(
        &self,
        node: &NodeId,
        time: BatchTime,
        entries: IndexMap<K, S>,
    ) -> Result<(), StateError> {
        self.table::<K, S>(node)?.publish(StateSnapshot {
            time: Some(time),
            entries: Arc::new(entries),
        });
        Ok(())
    }

    /// The current entries of a node's table
    pub fn snapshot<K: Key, S: Data>(&self, node: &NodeId) -> Result<StateSnapshot<K, S>, StateError> {
        Ok(self.table::<K, S>(node)?.current())
    }
}

/// Snapshot consistent read access to the state of one node
pub struct StateHandle<K, S> {
    table: Arc<StateTable<K, S>>,
}

impl<K, S> Clone for StateHandle<K, S> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
        }
    }
}

impl<K: Hash + Eq, S: Clone> StateHandle<K, S> {
    /// State of `key` as of the last applied BatchTime
    pub fn get(&self, key: &K) -> Option<S> {
        self.table.current().entries.get(key).cloned()
    }

    /// All entries as of the last applied BatchTime
    pub fn snapshot(&self) -> StateSnapshot<K, S> {
        self.table.current()
    }

    /// Number of keys with state
    pub fn len(&self) -> usize {
        self.table.current().entries.len()
    }

    /// True if no key has state
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("No state table for node {0}")]
    UnknownNode(NodeId),
    #[error("State table of node {0} already exists")]
    AlreadyRegistered(NodeId),
    #[error("State table of node {0} holds a different type")]
    TypeMismatch(NodeId),
    #[error("State of node {node} was already applied at {last}, cannot apply {time}")]
    AlreadyApplied {
        node: NodeId,
        time: BatchTime,
        last: BatchTime,
    },
}
