//! Types and traits used across dstream
mod data;
mod time;

use std::fmt::Display;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

pub use data::{Data, Key, Persistable};
pub use time::{interval_millis, is_multiple_of, BatchTime, TimeRange};

/// Uniquely identifies a node in the DStream graph.
///
/// The id is derived from the node's name and is stable between versions, so
/// checkpointed state can be matched with the node after a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    /// Derive the id of a node from its name
    pub fn from_name(name: &str) -> Self {
        let mut hasher = seahash::SeaHasher::new();
        name.hash(&mut hasher);
        Self(hasher.finish())
    }

    /// Id of a node the graph adds on behalf of `parent`. Names never contain
    /// the leading 0xff byte, so this never equals the id of a named node.
    pub(crate) fn derived(parent: NodeId, role: &str) -> Self {
        let mut hasher = seahash::SeaHasher::new();
        hasher.write_u8(0xff);
        hasher.write_u64(parent.0);
        role.hash(&mut hasher);
        Self(hasher.finish())
    }

    /// Raw numeric value of this id
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Identifies one receiver for the lifetime of a job
pub type ReceiverId = u32;

/// Identifies a sealed block of records
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId {
    /// Receiver which produced the block
    pub receiver: ReceiverId,
    /// Sequence number of the block within the receiver's lifetime
    pub seq: u64,
}

impl BlockId {
    /// Create a new BlockId
    pub fn new(receiver: ReceiverId, seq: u64) -> Self {
        Self { receiver, seq }
    }
}

impl Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "input-{}-{}", self.receiver, self.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::NodeId;

    /// this test should break if we somehow break hash stability between versions.
    /// Breaking it would orphan checkpointed state, since the node id names the
    /// state directory.
    #[test]
    fn node_id_is_stable() {
        let a = NodeId::from_name("word-count");
        let b = NodeId::from_name("word-count");
        assert_eq!(a, b);
        assert_ne!(a, NodeId::from_name("word-counts"));
        assert_ne!(NodeId::derived(a, "window"), NodeId::from_name("word-count"));
        assert_eq!(NodeId::derived(a, "window"), NodeId::derived(b, "window"));
        assert_eq!(format!("{a}").len(), 16);
    }
}
