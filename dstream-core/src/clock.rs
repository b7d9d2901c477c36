//! Wall clocks driving batch and block generation.
//!
//! All timers in dstream go through a [Clock], which allows tests to drive the
//! scheduler deterministically with a [ManualClock].
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::types::BatchTime;

/// Longest time a waiting timer sleeps before re-checking whether it was stopped
const POLL_SLICE: Duration = Duration::from_millis(10);

/// A source of wall-clock time in milliseconds
pub trait Clock: Debug + Send + Sync + 'static {
    /// Current time
    fn now(&self) -> BatchTime;

    /// Block until the clock reaches `target` or `stop` is set.
    /// Returns `true` if the target time was reached.
    fn wait_till(&self, target: BatchTime, stop: &AtomicBool) -> bool;
}

/// The system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> BatchTime {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        BatchTime::from_millis(millis)
    }

    fn wait_till(&self, target: BatchTime, stop: &AtomicBool) -> bool {
        loop {
            if stop.load(Ordering::Acquire) {
                return false;
            }
            let now = self.now();
            if now >= target {
                return true;
            }
            std::thread::sleep((target - now).min(POLL_SLICE));
        }
    }
}

/// A clock which only advances when told to.
///
/// Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    inner: Arc<(Mutex<u64>, Condvar)>,
}

impl ManualClock {
    /// Create a clock starting at the given time
    pub fn new(start: BatchTime) -> Self {
        Self {
            inner: Arc::new((Mutex::new(start.as_millis()), Condvar::new())),
        }
    }

    /// Move the clock forward by `duration`
    pub fn advance(&self, duration: Duration) {
        let (lock, cvar) = &*self.inner;
        #[allow(clippy::unwrap_used)]
        let mut time = lock.lock().unwrap();
        *time += duration.as_millis() as u64;
        cvar.notify_all();
    }

    /// Set the clock to an absolute time. Moving backwards is ignored.
    pub fn set(&self, time: BatchTime) {
        let (lock, cvar) = &*self.inner;
        #[allow(clippy::unwrap_used)]
        let mut current = lock.lock().unwrap();
        *current = (*current).max(time.as_millis());
        cvar.notify_all();
    }
}

impl Clock for ManualClock {
    fn now(&self) -> BatchTime {
        #[allow(clippy::unwrap_used)]
        BatchTime::from_millis(*self.inner.0.lock().unwrap())
    }

    fn wait_till(&self, target: BatchTime, stop: &AtomicBool) -> bool {
        let (lock, cvar) = &*self.inner;
        #[allow(clippy::unwrap_used)]
        let mut time = lock.lock().unwrap();
        loop {
            if stop.load(Ordering::Acquire) {
                return false;
            }
            if *time >= target.as_millis() {
                return true;
            }
            #[allow(clippy::unwrap_used)]
            let (guard, _) = cvar.wait_timeout(time, POLL_SLICE).unwrap();
            time = guard;
        }
    }
}
