//! Checkpoints: durable snapshots of the graph structure and the state of all
//! stateful nodes, sufficient to resume scheduling after a crash.
//!
//! A checkpoint is written by a [CheckpointStore]. The running job hands
//! checkpoints to a [CheckpointWriter], which writes them on its own thread so
//! the scheduler never waits for storage.
mod fs;
mod writer;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use fs::FileCheckpointStore;
pub use writer::CheckpointWriter;

use crate::graph::GraphDescriptor;
use crate::types::{BatchTime, NodeId};

/// Everything needed to resume a job after the batch `batch_time`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRecord {
    /// Last batch whose state is contained in this checkpoint
    pub batch_time: BatchTime,
    /// Time before the job's first batch. Window and slide boundaries are
    /// relative to this time.
    pub zero_time: BatchTime,
    /// Structure of the graph which produced the checkpoint
    pub graph: GraphDescriptor,
    /// Serialized state of every stateful node
    pub node_states: IndexMap<NodeId, Vec<u8>>,
}

/// Durable storage for checkpoints
pub trait CheckpointStore: Send + 'static {
    /// Write a checkpoint. Either the complete checkpoint becomes visible to
    /// [CheckpointStore::load_latest] or none of it does.
    fn write(&self, record: &CheckpointRecord) -> Result<(), CheckpointError>;

    /// The most recent complete checkpoint, if any
    fn load_latest(&self) -> Result<Option<CheckpointRecord>, CheckpointError>;
}

/// Graph part of a checkpoint, written last
#[derive(Debug, Serialize, Deserialize)]
struct CheckpointMeta {
    batch_time: BatchTime,
    zero_time: BatchTime,
    graph: GraphDescriptor,
    stateful_nodes: Vec<NodeId>,
}

const MAGIC: &[u8; 8] = b"DSTRMCKP";
const HEADER_LEN: usize = MAGIC.len() + 16;

/// Frame a payload with the magic header, its checksum and length
fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&seahash::hash(payload).to_le_bytes());
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Verify a frame written by [encode_frame] and return its payload
fn decode_frame(bytes: &[u8]) -> Result<&[u8], FrameError> {
    if bytes.len() < HEADER_LEN || &bytes[..MAGIC.len()] != MAGIC {
        return Err(FrameError::BadMagic);
    }
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[MAGIC.len()..MAGIC.len() + 8]);
    let checksum = u64::from_le_bytes(word);
    word.copy_from_slice(&bytes[MAGIC.len() + 8..HEADER_LEN]);
    let length = u64::from_le_bytes(word) as usize;
    let payload = &bytes[HEADER_LEN..];
    if payload.len() != length {
        return Err(FrameError::Truncated {
            expected: length,
            actual: payload.len(),
        });
    }
    if seahash::hash(payload) != checksum {
        return Err(FrameError::Checksum);
    }
    Ok(payload)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Missing checkpoint header")]
    BadMagic,
    #[error("Expected {expected} bytes of payload, found {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("Checksum mismatch")]
    Checksum,
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("IO error accessing checkpoint file {path}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to encode checkpoint")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("Failed to decode checkpoint")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("Checkpoint file {path} is corrupt")]
    Corrupt {
        path: std::path::PathBuf,
        #[source]
        source: FrameError,
    },
    #[error("Writing checkpoint {time} failed after {attempts} attempts")]
    WriteFailed {
        time: BatchTime,
        attempts: usize,
        #[source]
        source: Box<CheckpointError>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_detects_corruption() {
        let framed = encode_frame(b"state bytes");
        assert_eq!(decode_frame(&framed).unwrap(), b"state bytes");

        let mut flipped = framed.clone();
        let last = flipped.len() - 1;
        flipped[last] ^= 0xff;
        assert_eq!(decode_frame(&flipped), Err(FrameError::Checksum));

        assert!(matches!(
            decode_frame(&framed[..framed.len() - 3]),
            Err(FrameError::Truncated { .. })
        ));
        assert_eq!(decode_frame(b"not a checkpoint at all"), Err(FrameError::BadMagic));
    }
}
