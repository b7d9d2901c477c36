use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, error};

use super::manager::ReceiverEnv;
use super::{RateLimiter, ReceiverError, ReceiverInfo};
use crate::assembler::ReceivedBlockInfo;
use crate::storage::{FileWriteAheadLog, WalError};
use crate::types::{BatchTime, BlockId, Data, NodeId, Persistable, ReceiverId};

/// Turns buffered records into stored and registered blocks
pub(crate) struct BlockPusher<V> {
    receiver: ReceiverId,
    source: NodeId,
    next_seq: AtomicU64,
    env: Arc<ReceiverEnv>,
    wal: Option<Mutex<FileWriteAheadLog>>,
    info: Arc<Mutex<ReceiverInfo>>,
    _records: PhantomData<fn() -> V>,
}

impl<V> BlockPusher<V>
where
    V: Data + Persistable,
{
    pub(crate) fn new(
        receiver: ReceiverId,
        source: NodeId,
        env: Arc<ReceiverEnv>,
        info: Arc<Mutex<ReceiverInfo>>,
    ) -> Result<Self, ReceiverError> {
        let wal = match env.wal_dir(receiver) {
            Some(dir) => Some(Mutex::new(FileWriteAheadLog::open(
                dir,
                env.wal_rolling_interval,
            )?)),
            None => None,
        };
        let next_seq = AtomicU64::new(env.assembler.next_block_seq(receiver));
        Ok(Self {
            receiver,
            source,
            next_seq,
            env,
            wal,
            info,
            _records: PhantomData,
        })
    }

    /// Seal `records` into a block: log it if the write-ahead log is enabled,
    /// replicate it and register it with the assembler. Empty blocks are skipped.
    pub(crate) fn push_block(&self, records: Vec<V>) -> Result<(), ReceiverError> {
        if records.is_empty() {
            return Ok(());
        }
        let id = BlockId::new(self.receiver, self.next_seq.fetch_add(1, Ordering::Relaxed));
        let seal_time = self.env.clock.now();
        let num_records = records.len();

        let wal_handle = match &self.wal {
            Some(wal) => {
                let bytes = rmp_serde::to_vec(&records).map_err(WalError::from)?;
                #[allow(clippy::unwrap_used)]
                Some(wal.lock().unwrap().write(&bytes, seal_time)?)
            }
            None => None,
        };
        self.env.block_store.put(id, Arc::new(records))?;
        self.env.assembler.add_block(ReceivedBlockInfo {
            source: self.source,
            block: id,
            seal_time,
            num_records,
            wal_handle,
        })?;
        #[allow(clippy::unwrap_used)]
        let mut info = self.info.lock().unwrap();
        info.records_received += num_records as u64;
        debug!(block = %id, num_records, %seal_time, "Pushed block");
        Ok(())
    }

    pub(crate) fn close(&self) {
        if let Some(wal) = &self.wal {
            #[allow(clippy::unwrap_used)]
            wal.lock().unwrap().close();
        }
    }
}

/// Type erased access to a receiver's write-ahead log
pub(crate) trait LogCleanup: Send + Sync {
    /// Delete log segments only holding records older than `threshold`
    fn clean_log(&self, threshold: BatchTime) -> Result<usize, WalError>;
}

impl<V: Data + Persistable> LogCleanup for BlockPusher<V> {
    fn clean_log(&self, threshold: BatchTime) -> Result<usize, WalError> {
        match &self.wal {
            #[allow(clippy::unwrap_used)]
            Some(wal) => wal.lock().unwrap().clean(threshold),
            None => Ok(0),
        }
    }
}

/// Handed to a [Receiver](super::Receiver) to store the records it received
pub struct ReceiverSink<V> {
    buffer: Arc<Mutex<Vec<V>>>,
    pusher: Arc<BlockPusher<V>>,
    limiter: RateLimiter,
    stop: Arc<AtomicBool>,
}

impl<V> std::fmt::Debug for ReceiverSink<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiverSink")
            .field("receiver", &self.pusher.receiver)
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl<V> ReceiverSink<V>
where
    V: Data + Persistable,
{
    pub(crate) fn new(
        buffer: Arc<Mutex<Vec<V>>>,
        pusher: Arc<BlockPusher<V>>,
        limiter: RateLimiter,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            buffer,
            pusher,
            limiter,
            stop,
        }
    }

    /// Buffer a record. It becomes part of the block sealed at the end of the
    /// current block interval. Blocks while the receiver exceeds its rate.
    pub fn push(&mut self, record: V) {
        self.limiter.acquire(&self.stop);
        #[allow(clippy::unwrap_used)]
        self.buffer.lock().unwrap().push(record);
    }

    /// Buffer multiple records
    pub fn push_all(&mut self, records: impl IntoIterator<Item = V>) {
        for r in records {
            self.push(r);
        }
    }

    /// Store records as a block of their own right away. Returns once the block
    /// has been replicated, logged if the write-ahead log is enabled, and
    /// registered for the next batch. A reliable receiver may acknowledge the
    /// records to its source after this returned `Ok`.
    pub fn store_reliably(&mut self, records: Vec<V>) -> Result<(), ReceiverError> {
        for _ in 0..records.len() {
            if !self.limiter.acquire(&self.stop) {
                return Err(ReceiverError::Stopped);
            }
        }
        self.pusher.push_block(records)
    }

    /// True once the job asked the receiver to stop
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Currently effective rate limit in records/sec
    pub fn rate_limit(&self) -> Option<u64> {
        self.limiter.effective_rate()
    }

    /// Drop all buffered but unsealed records, returning how many were dropped
    pub(crate) fn discard_buffer(&self) -> usize {
        #[allow(clippy::unwrap_used)]
        let mut buffer = self.buffer.lock().unwrap();
        let n = buffer.len();
        buffer.clear();
        n
    }
}

/// Periodically seals the records buffered by a receiver into blocks until
/// `stop` is set, then seals whatever is left.
pub(crate) fn spawn_block_generator<V>(
    buffer: Arc<Mutex<Vec<V>>>,
    pusher: Arc<BlockPusher<V>>,
    stop: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>>
where
    V: Data + Persistable,
{
    let interval = pusher.env.block_interval;
    let clock = Arc::clone(&pusher.env.clock);
    // first deadline is fixed before the thread starts
    let mut next = clock.now().floor(interval) + interval;
    std::thread::Builder::new()
        .name(format!("dstream-block-generator-{}", pusher.receiver))
        .spawn(move || {
            let seal = |pusher: &BlockPusher<V>| {
                #[allow(clippy::unwrap_used)]
                let records = std::mem::take(&mut *buffer.lock().unwrap());
                if let Err(e) = pusher.push_block(records) {
                    error!(receiver = pusher.receiver, "Failed to push block: {e:?}");
                    #[allow(clippy::unwrap_used)]
                    let mut info = pusher.info.lock().unwrap();
                    info.errors += 1;
                    info.last_error = Some(e.to_string());
                }
            };
            while clock.wait_till(next, &stop) {
                seal(&pusher);
                next = next + interval;
            }
            seal(&pusher);
            pusher.close();
            debug!(receiver = pusher.receiver, "Block generator stopped");
        })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::types::BatchTime;

    #[test]
    fn generator_seals_blocks_on_interval() {
        let clock = ManualClock::new(BatchTime::from_millis(0));
        let env = ReceiverEnv::for_tests(Arc::new(clock.clone()), None);
        let source = NodeId::from_name("numbers");
        let info = Arc::new(Mutex::new(ReceiverInfo::new(0, "numbers".into(), source)));
        let pusher = Arc::new(
            BlockPusher::<u32>::new(0, source, Arc::clone(&env), Arc::clone(&info)).unwrap(),
        );
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let generator =
            spawn_block_generator(Arc::clone(&buffer), Arc::clone(&pusher), Arc::clone(&stop))
                .unwrap();

        let mut sink = ReceiverSink::new(
            Arc::clone(&buffer),
            Arc::clone(&pusher),
            RateLimiter::new(None, None),
            Arc::clone(&stop),
        );
        sink.push_all([1, 2, 3]);
        clock.advance(Duration::from_millis(200));
        while !env.assembler.has_unallocated_blocks() {
            std::thread::sleep(Duration::from_millis(1));
        }
        sink.push(4);
        stop.store(true, Ordering::Release);
        generator.join().unwrap();

        let batch = env.assembler.allocate(clock.now()).unwrap();
        let blocks = batch.blocks_for(&source);
        assert_eq!(blocks.len(), 2);
        let first = env.block_store.get::<u32>(&blocks[0].block).unwrap().unwrap();
        assert_eq!(*first, vec![1, 2, 3]);
        assert_eq!(info.lock().unwrap().records_received, 4);
    }

    #[test]
    fn reliable_store_registers_before_returning() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(BatchTime::from_millis(500));
        let env = ReceiverEnv::for_tests(Arc::new(clock.clone()), Some(dir.path().to_owned()));
        let source = NodeId::from_name("reliable");
        let info = Arc::new(Mutex::new(ReceiverInfo::new(3, "reliable".into(), source)));
        let pusher = Arc::new(BlockPusher::<String>::new(3, source, Arc::clone(&env), info).unwrap());
        let mut sink = ReceiverSink::new(
            Arc::new(Mutex::new(Vec::new())),
            pusher,
            RateLimiter::new(None, None),
            Arc::new(AtomicBool::new(false)),
        );
        sink.store_reliably(vec!["a".into(), "b".into()]).unwrap();

        let batch = env.assembler.allocate(BatchTime::from_millis(1000)).unwrap();
        let block = &batch.blocks_for(&source)[0];
        assert_eq!(block.seal_time, BatchTime::from_millis(500));
        assert!(block.wal_handle.is_some());
    }
}
