//! Checkpoints as files below a checkpoint directory:
//!
//! ```text
//! <dir>/graph/checkpoint-<batch time>.meta
//! <dir>/state/<node id>/state-<batch time>.bin
//! ```
//!
//! State files are written first, the meta file last. Every file is written to
//! a temporary name and renamed into place, so a checkpoint is complete exactly
//! if its meta file exists.
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use super::{decode_frame, encode_frame, CheckpointError, CheckpointMeta, CheckpointRecord, CheckpointStore};
use crate::types::{BatchTime, NodeId};

const GRAPH_DIR: &str = "graph";
const STATE_DIR: &str = "state";

/// Stores checkpoints on the local file system, keeping the newest
/// `retention` checkpoints
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
    retention: usize,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CheckpointError + '_ {
    move |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Write `bytes` to `path` atomically
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CheckpointError> {
    let tmp = path.with_extension("tmp");
    {
        use std::io::Write;
        let mut file = std::fs::File::create(&tmp).map_err(io_err(&tmp))?;
        file.write_all(bytes).map_err(io_err(&tmp))?;
        file.sync_all().map_err(io_err(&tmp))?;
    }
    std::fs::rename(&tmp, path).map_err(io_err(path))
}

/// Parse the batch time from a file name like `checkpoint-1000.meta`
fn parse_time(name: &str, prefix: &str, extension: &str) -> Option<BatchTime> {
    name.strip_prefix(prefix)?
        .strip_suffix(extension)?
        .parse::<u64>()
        .ok()
        .map(BatchTime::from_millis)
}

impl FileCheckpointStore {
    /// A store writing below `root`, keeping at most `retention` checkpoints
    pub fn new(root: impl Into<PathBuf>, retention: usize) -> Self {
        Self {
            root: root.into(),
            retention: retention.max(1),
        }
    }

    fn meta_path(&self, time: BatchTime) -> PathBuf {
        self.root
            .join(GRAPH_DIR)
            .join(format!("checkpoint-{}.meta", time.as_millis()))
    }

    fn state_dir(&self, node: &NodeId) -> PathBuf {
        self.root.join(STATE_DIR).join(node.to_string())
    }

    fn state_path(&self, node: &NodeId, time: BatchTime) -> PathBuf {
        self.state_dir(node)
            .join(format!("state-{}.bin", time.as_millis()))
    }

    /// BatchTimes of all complete checkpoints, newest first
    fn checkpoint_times(&self) -> Result<Vec<BatchTime>, CheckpointError> {
        let dir = self.root.join(GRAPH_DIR);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut times = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(io_err(&dir))? {
            let entry = entry.map_err(io_err(&dir))?;
            if let Some(t) = parse_time(&entry.file_name().to_string_lossy(), "checkpoint-", ".meta") {
                times.push(t);
            }
        }
        times.sort_unstable_by(|a, b| b.cmp(a));
        Ok(times)
    }

    fn read_framed(&self, path: &Path) -> Result<Vec<u8>, CheckpointError> {
        let bytes = std::fs::read(path).map_err(io_err(path))?;
        decode_frame(&bytes)
            .map(<[u8]>::to_vec)
            .map_err(|source| CheckpointError::Corrupt {
                path: path.to_path_buf(),
                source,
            })
    }

    fn read(&self, time: BatchTime) -> Result<CheckpointRecord, CheckpointError> {
        let meta: CheckpointMeta = rmp_serde::from_slice(&self.read_framed(&self.meta_path(time))?)?;
        let mut node_states = IndexMap::with_capacity(meta.stateful_nodes.len());
        for node in meta.stateful_nodes {
            let state = self.read_framed(&self.state_path(&node, time))?;
            node_states.insert(node, state);
        }
        Ok(CheckpointRecord {
            batch_time: meta.batch_time,
            zero_time: meta.zero_time,
            graph: meta.graph,
            node_states,
        })
    }

    /// Delete all but the newest `retention` checkpoints
    fn apply_retention(&self) -> Result<(), CheckpointError> {
        let times = self.checkpoint_times()?;
        let Some(oldest_kept) = times.iter().take(self.retention).last().copied() else {
            return Ok(());
        };
        for t in times.iter().skip(self.retention) {
            let path = self.meta_path(*t);
            std::fs::remove_file(&path).map_err(io_err(&path))?;
        }
        // state files are removed after their meta file, so no visible
        // checkpoint ever misses its state
        let state_root = self.root.join(STATE_DIR);
        if !state_root.exists() {
            return Ok(());
        }
        let mut removed = 0;
        for node_dir in std::fs::read_dir(&state_root).map_err(io_err(&state_root))? {
            let node_dir = node_dir.map_err(io_err(&state_root))?.path();
            for file in std::fs::read_dir(&node_dir).map_err(io_err(&node_dir))? {
                let file = file.map_err(io_err(&node_dir))?;
                let name = file.file_name().to_string_lossy().to_string();
                if parse_time(&name, "state-", ".bin").is_some_and(|t| t < oldest_kept) {
                    let path = file.path();
                    std::fs::remove_file(&path).map_err(io_err(&path))?;
                    removed += 1;
                }
            }
        }
        debug!(kept = times.len().min(self.retention), removed, "Applied checkpoint retention");
        Ok(())
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn write(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        let time = record.batch_time;
        for (node, state) in record.node_states.iter() {
            let dir = self.state_dir(node);
            std::fs::create_dir_all(&dir).map_err(io_err(&dir))?;
            write_atomic(&self.state_path(node, time), &encode_frame(state))?;
        }
        let meta = CheckpointMeta {
            batch_time: time,
            zero_time: record.zero_time,
            graph: record.graph.clone(),
            stateful_nodes: record.node_states.keys().copied().collect(),
        };
        let graph_dir = self.root.join(GRAPH_DIR);
        std::fs::create_dir_all(&graph_dir).map_err(io_err(&graph_dir))?;
        write_atomic(&self.meta_path(time), &encode_frame(&rmp_serde::to_vec(&meta)?))?;
        info!(%time, nodes = record.node_states.len(), "Wrote checkpoint");
        self.apply_retention()
    }

    fn load_latest(&self) -> Result<Option<CheckpointRecord>, CheckpointError> {
        for time in self.checkpoint_times()? {
            match self.read(time) {
                Ok(record) => {
                    info!(%time, "Loaded checkpoint");
                    return Ok(Some(record));
                }
                Err(e) => warn!(%time, "Skipping unreadable checkpoint: {e}"),
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::graph::GraphDescriptor;

    fn record(time: u64) -> CheckpointRecord {
        let mut node_states = IndexMap::new();
        node_states.insert(NodeId::from_name("totals"), vec![1, 2, time as u8]);
        CheckpointRecord {
            batch_time: BatchTime::from_millis(time),
            zero_time: BatchTime::ZERO,
            graph: GraphDescriptor {
                batch_interval_ms: Duration::from_secs(1).as_millis() as u64,
                nodes: Vec::new(),
                outputs: Vec::new(),
            },
            node_states,
        }
    }

    #[test]
    fn loads_newest_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), 10);
        assert_eq!(store.load_latest().unwrap(), None);
        store.write(&record(1000)).unwrap();
        store.write(&record(2000)).unwrap();
        assert_eq!(store.load_latest().unwrap(), Some(record(2000)));
    }

    #[test]
    fn skips_corrupt_and_incomplete_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), 10);
        store.write(&record(1000)).unwrap();
        store.write(&record(2000)).unwrap();
        store.write(&record(3000)).unwrap();

        // corrupt the newest state, drop the state of the second newest
        let totals = NodeId::from_name("totals");
        std::fs::write(store.state_path(&totals, BatchTime::from_millis(3000)), b"garbage").unwrap();
        std::fs::remove_file(store.state_path(&totals, BatchTime::from_millis(2000))).unwrap();
        assert_eq!(store.load_latest().unwrap(), Some(record(1000)));
    }

    #[test]
    fn unrenamed_files_are_invisible() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), 10);
        store.write(&record(1000)).unwrap();
        // a crash in the middle of writing leaves only the temporary file
        let pending = store.meta_path(BatchTime::from_millis(2000)).with_extension("tmp");
        std::fs::write(pending, encode_frame(b"partial")).unwrap();
        assert_eq!(store.load_latest().unwrap(), Some(record(1000)));
    }

    #[test]
    fn keeps_only_newest_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), 2);
        for t in 1..=4 {
            store.write(&record(t * 1000)).unwrap();
        }
        assert_eq!(
            store.checkpoint_times().unwrap(),
            vec![BatchTime::from_millis(4000), BatchTime::from_millis(3000)]
        );
        let totals = NodeId::from_name("totals");
        assert!(!store.state_path(&totals, BatchTime::from_millis(2000)).exists());
        assert!(store.state_path(&totals, BatchTime::from_millis(3000)).exists());
    }
}
