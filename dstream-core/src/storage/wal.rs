//! File based write-ahead log.
//!
//! The log is a directory of rolling segment files named `log-<start>-<end>`,
//! where start and end are the BatchTimes (in ms) covered by the segment. Every
//! record is written as a frame of
//!
//! ```text
//! [length: u32 LE][seahash checksum of payload: u64 LE][payload]
//! ```
//!
//! and synced to disk before the write returns.
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::BatchTime;

const FRAME_HEADER_LEN: u64 = 12;
const SEGMENT_PREFIX: &str = "log-";

/// Location of a single record in the log
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WalRecordHandle {
    /// File name of the segment within the log directory
    pub segment: String,
    /// Offset of the record's frame within the segment
    pub offset: u64,
    /// Length of the payload
    pub length: u32,
}

struct Segment {
    end: BatchTime,
    name: String,
    file: File,
    offset: u64,
}

/// An append-only log of opaque records
pub struct FileWriteAheadLog {
    dir: PathBuf,
    rolling_interval: Duration,
    current: Option<Segment>,
}

impl std::fmt::Debug for FileWriteAheadLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWriteAheadLog")
            .field("dir", &self.dir)
            .field("current", &self.current.as_ref().map(|s| &s.name))
            .finish()
    }
}

impl FileWriteAheadLog {
    /// Open the log in `dir`, creating the directory if needed
    pub fn open(dir: impl Into<PathBuf>, rolling_interval: Duration) -> Result<Self, WalError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| WalError::Io(dir.clone(), e))?;
        Ok(Self {
            dir,
            rolling_interval,
            current: None,
        })
    }

    /// A reader sharing this log's directory
    pub fn reader(&self) -> WalReader {
        WalReader {
            dir: self.dir.clone(),
        }
    }

    /// Durably append a record written at `time`
    pub fn write(&mut self, record: &[u8], time: BatchTime) -> Result<WalRecordHandle, WalError> {
        let length =
            u32::try_from(record.len()).map_err(|_| WalError::RecordTooLarge(record.len()))?;
        let dir = self.dir.clone();
        let segment = self.segment_for(time)?;

        let mut frame = Vec::with_capacity(record.len() + FRAME_HEADER_LEN as usize);
        frame.extend_from_slice(&length.to_le_bytes());
        frame.extend_from_slice(&seahash::hash(record).to_le_bytes());
        frame.extend_from_slice(record);

        let path = dir.join(&segment.name);
        segment
            .file
            .write_all(&frame)
            .and_then(|_| segment.file.flush())
            .and_then(|_| segment.file.sync_data())
            .map_err(|e| WalError::Io(path, e))?;

        let handle = WalRecordHandle {
            segment: segment.name.clone(),
            offset: segment.offset,
            length,
        };
        segment.offset += frame.len() as u64;
        Ok(handle)
    }

    /// Delete all segments which only contain records older than `threshold`.
    /// Returns the number of deleted segments.
    pub fn clean(&mut self, threshold: BatchTime) -> Result<usize, WalError> {
        let current = self.current.as_ref().map(|s| s.name.clone());
        let mut deleted = 0;
        for (name, _, end) in list_segments(&self.dir)? {
            if end <= threshold && Some(&name) != current.as_ref() {
                let path = self.dir.join(&name);
                std::fs::remove_file(&path).map_err(|e| WalError::Io(path, e))?;
                deleted += 1;
            }
        }
        if deleted > 0 {
            debug!(dir = ?self.dir, deleted, %threshold, "Cleaned write-ahead log");
        }
        Ok(deleted)
    }

    /// Close the current segment
    pub fn close(&mut self) {
        self.current = None;
    }

    fn segment_for(&mut self, time: BatchTime) -> Result<&mut Segment, WalError> {
        let needs_roll = match &self.current {
            Some(s) => time >= s.end,
            None => true,
        };
        if needs_roll {
            let start = time.floor(self.rolling_interval);
            let end = start + self.rolling_interval;
            let name = format!("{SEGMENT_PREFIX}{}-{}", start.as_millis(), end.as_millis());
            let path = self.dir.join(&name);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| WalError::Io(path.clone(), e))?;
            let offset = file.metadata().map_err(|e| WalError::Io(path, e))?.len();
            info!(segment = name, "Rolling write-ahead log segment");
            self.current = Some(Segment {
                end,
                name,
                file,
                offset,
            });
        }
        self.current.as_mut().ok_or(WalError::Closed)
    }
}

/// Reads records from a write-ahead log directory
#[derive(Debug, Clone)]
pub struct WalReader {
    dir: PathBuf,
}

impl WalReader {
    /// Create a reader for the log in `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Read the record at `handle`
    pub fn read(&self, handle: &WalRecordHandle) -> Result<Vec<u8>, WalError> {
        let path = self.dir.join(&handle.segment);
        let mut file = File::open(&path).map_err(|e| WalError::Io(path.clone(), e))?;
        file.seek(SeekFrom::Start(handle.offset))
            .map_err(|e| WalError::Io(path.clone(), e))?;
        match read_frame(&mut file).map_err(|e| WalError::Io(path.clone(), e))? {
            Some(Frame::Valid(payload)) if payload.len() == handle.length as usize => Ok(payload),
            _ => Err(WalError::Corrupt {
                segment: handle.segment.clone(),
                offset: handle.offset,
            }),
        }
    }

    /// Read all intact records of all segments in time order. A segment is read
    /// up to its first truncated or corrupt frame.
    pub fn read_all(&self) -> Result<Vec<Vec<u8>>, WalError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for (name, _, _) in list_segments(&self.dir)? {
            let path = self.dir.join(&name);
            let mut file = File::open(&path).map_err(|e| WalError::Io(path.clone(), e))?;
            loop {
                match read_frame(&mut file).map_err(|e| WalError::Io(path.clone(), e))? {
                    Some(Frame::Valid(payload)) => records.push(payload),
                    Some(Frame::Invalid) => {
                        warn!(segment = name, "Ignoring corrupt tail of write-ahead log segment");
                        break;
                    }
                    None => break,
                }
            }
        }
        Ok(records)
    }
}

enum Frame {
    Valid(Vec<u8>),
    Invalid,
}

/// Read one frame, returning `None` at a clean end of file
fn read_frame(file: &mut File) -> std::io::Result<Option<Frame>> {
    let mut header = [0u8; FRAME_HEADER_LEN as usize];
    let read = read_up_to(file, &mut header)?;
    if read == 0 {
        return Ok(None);
    }
    if read < header.len() {
        return Ok(Some(Frame::Invalid));
    }
    let (len_bytes, hash_bytes) = header.split_at(4);
    let mut len = [0u8; 4];
    len.copy_from_slice(len_bytes);
    let mut hash = [0u8; 8];
    hash.copy_from_slice(hash_bytes);

    let mut payload = vec![0u8; u32::from_le_bytes(len) as usize];
    if read_up_to(file, &mut payload)? < payload.len() {
        return Ok(Some(Frame::Invalid));
    }
    if seahash::hash(&payload) != u64::from_le_bytes(hash) {
        return Ok(Some(Frame::Invalid));
    }
    Ok(Some(Frame::Valid(payload)))
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// All segments of a log directory as (name, start, end), ordered by start time
fn list_segments(dir: &Path) -> Result<Vec<(String, BatchTime, BatchTime)>, WalError> {
    let entries = std::fs::read_dir(dir).map_err(|e| WalError::Io(dir.to_path_buf(), e))?;
    let mut segments: Vec<(String, BatchTime, BatchTime)> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            let (start, end) = name.strip_prefix(SEGMENT_PREFIX)?.split_once('-')?;
            let start = BatchTime::from_millis(start.parse().ok()?);
            let end = BatchTime::from_millis(end.parse().ok()?);
            Some((name, start, end))
        })
        .collect();
    segments.sort_by_key(|(_, start, _)| *start);
    Ok(segments)
}

#[derive(Debug, Error)]
pub enum WalError {
    #[error("IO error on write-ahead log at {0:?}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("Record of {0} bytes exceeds the maximum frame size")]
    RecordTooLarge(usize),
    #[error("Corrupt record in segment {segment} at offset {offset}")]
    Corrupt { segment: String, offset: u64 },
    #[error("Write-ahead log is closed")]
    Closed,
    #[error("Error encoding write-ahead log record")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("Error decoding write-ahead log record")]
    Decode(#[from] rmp_serde::decode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_by_handle() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = FileWriteAheadLog::open(dir.path(), Duration::from_secs(60)).unwrap();
        let a = wal.write(b"first", BatchTime::from_millis(1000)).unwrap();
        let b = wal.write(b"second", BatchTime::from_millis(2000)).unwrap();
        assert_eq!(a.segment, b.segment);
        assert_eq!(a.segment, "log-0-60000");
        let reader = wal.reader();
        assert_eq!(reader.read(&b).unwrap(), b"second");
        assert_eq!(reader.read(&a).unwrap(), b"first");
    }

    #[test]
    fn rolls_and_cleans_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = FileWriteAheadLog::open(dir.path(), Duration::from_secs(1)).unwrap();
        for t in [500, 1500, 2500] {
            wal.write(format!("{t}").as_bytes(), BatchTime::from_millis(t))
                .unwrap();
        }
        assert_eq!(list_segments(dir.path()).unwrap().len(), 3);
        let deleted = wal.clean(BatchTime::from_millis(2000)).unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(wal.reader().read_all().unwrap(), vec![b"2500".to_vec()]);
    }

    #[test]
    fn truncated_tail_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = FileWriteAheadLog::open(dir.path(), Duration::from_secs(60)).unwrap();
        let handle = wal.write(b"intact", BatchTime::from_millis(10)).unwrap();
        wal.close();
        // simulate a crash in the middle of writing a frame
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join(&handle.segment))
            .unwrap();
        file.write_all(&[200, 0, 0, 0, 1, 2]).unwrap();

        let records = WalReader::new(dir.path()).read_all().unwrap();
        assert_eq!(records, vec![b"intact".to_vec()]);
    }

    #[test]
    fn reopened_log_appends() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = FileWriteAheadLog::open(dir.path(), Duration::from_secs(60)).unwrap();
        wal.write(b"one", BatchTime::from_millis(10)).unwrap();
        drop(wal);
        let mut wal = FileWriteAheadLog::open(dir.path(), Duration::from_secs(60)).unwrap();
        let second = wal.write(b"two", BatchTime::from_millis(20)).unwrap();
        assert_eq!(second.offset, FRAME_HEADER_LEN + 3);
        assert_eq!(
            wal.reader().read_all().unwrap(),
            vec![b"one".to_vec(), b"two".to_vec()]
        );
    }
}
