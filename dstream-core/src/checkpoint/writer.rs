use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, warn};

use super::{CheckpointError, CheckpointRecord, CheckpointStore};
use crate::types::BatchTime;

/// How often a checkpoint write is attempted before the job fails
pub const MAX_WRITE_ATTEMPTS: usize = 3;

type OnComplete = Box<dyn FnMut(BatchTime) + Send>;
type OnFatal = Box<dyn FnOnce(CheckpointError) + Send>;

/// Writes checkpoints on a background thread, in submission order.
///
/// After a checkpoint was written `on_complete` is called with its BatchTime.
/// If a checkpoint can not be written within [MAX_WRITE_ATTEMPTS] attempts,
/// `on_fatal` is called and no further checkpoints are written.
pub struct CheckpointWriter {
    tx: Option<flume::Sender<CheckpointRecord>>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for CheckpointWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointWriter")
            .field("running", &self.thread.is_some())
            .finish()
    }
}

impl CheckpointWriter {
    /// Start the writer thread
    pub fn spawn(
        store: impl CheckpointStore,
        retry_delay: Duration,
        on_complete: impl FnMut(BatchTime) + Send + 'static,
        on_fatal: impl FnOnce(CheckpointError) + Send + 'static,
    ) -> std::io::Result<Self> {
        let (tx, rx) = flume::unbounded::<CheckpointRecord>();
        let mut on_complete: OnComplete = Box::new(on_complete);
        let mut on_fatal: Option<OnFatal> = Some(Box::new(on_fatal));
        let thread = std::thread::Builder::new()
            .name("dstream-checkpoint-writer".into())
            .spawn(move || {
                while let Ok(record) = rx.recv() {
                    let time = record.batch_time;
                    match write_with_retries(&store, &record, retry_delay) {
                        Ok(()) => on_complete(time),
                        Err(e) => {
                            error!(%time, "Giving up on checkpoint: {e}");
                            if let Some(f) = on_fatal.take() {
                                f(e);
                            }
                            break;
                        }
                    }
                }
                debug!("Checkpoint writer stopped");
            })?;
        Ok(Self {
            tx: Some(tx),
            thread: Some(thread),
        })
    }

    /// Queue a checkpoint for writing. Returns `false` if the writer stopped
    /// after a fatal error.
    pub fn submit(&self, record: CheckpointRecord) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.send(record).is_ok())
    }

    /// Write all queued checkpoints and stop the writer thread
    pub fn close(&mut self) {
        self.tx.take();
        if let Some(t) = self.thread.take() {
            if t.join().is_err() {
                warn!("Checkpoint writer thread panicked");
            }
        }
    }
}

impl Drop for CheckpointWriter {
    fn drop(&mut self) {
        self.close();
    }
}

fn write_with_retries(
    store: &impl CheckpointStore,
    record: &CheckpointRecord,
    retry_delay: Duration,
) -> Result<(), CheckpointError> {
    let mut attempt = 1;
    loop {
        match store.write(record) {
            Ok(()) => return Ok(()),
            Err(e) if attempt >= MAX_WRITE_ATTEMPTS => {
                return Err(CheckpointError::WriteFailed {
                    time: record.batch_time,
                    attempts: attempt,
                    source: Box::new(e),
                })
            }
            Err(e) => {
                warn!(time = %record.batch_time, attempt, "Checkpoint write failed, retrying: {e}");
                attempt += 1;
                std::thread::sleep(retry_delay);
            }
        }
    }
}
