//! Ingestion rate limiting and the backpressure rate feed.
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as GovernorLimiter};
use indexmap::IndexMap;
use tokio::sync::watch;
use tracing::debug;

use crate::types::NodeId;

/// Longest a blocked push sleeps before re-checking whether it was stopped
const MAX_WAIT_SLICE: Duration = Duration::from_millis(50);

/// Limits the rate at which one receiver accepts records.
///
/// The effective rate is the lower of the static maximum and the latest rate
/// published by backpressure. Without either, records are never throttled.
pub(crate) struct RateLimiter {
    max_rate: Option<u64>,
    dynamic_rate: Option<u64>,
    limiter: Option<DefaultDirectRateLimiter>,
    feed: Option<watch::Receiver<Option<u64>>>,
    clock: DefaultClock,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("max_rate", &self.max_rate)
            .field("dynamic_rate", &self.dynamic_rate)
            .finish()
    }
}

impl RateLimiter {
    pub(crate) fn new(max_rate: Option<u64>, feed: Option<watch::Receiver<Option<u64>>>) -> Self {
        let mut this = Self {
            max_rate,
            dynamic_rate: None,
            limiter: None,
            feed,
            clock: DefaultClock::default(),
        };
        if let Some(feed) = this.feed.as_mut() {
            this.dynamic_rate = *feed.borrow_and_update();
        }
        this.rebuild();
        this
    }

    /// Currently effective rate in records/sec, `None` if unlimited
    pub(crate) fn effective_rate(&self) -> Option<u64> {
        match (self.max_rate, self.dynamic_rate) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Block until one more record may be accepted. Returns `false` if `stop` was
    /// set while waiting.
    pub(crate) fn acquire(&mut self, stop: &AtomicBool) -> bool {
        self.poll_feed();
        let Some(limiter) = self.limiter.as_ref() else {
            return true;
        };
        loop {
            match limiter.check() {
                Ok(()) => return true,
                Err(not_until) => {
                    if stop.load(Ordering::Acquire) {
                        return false;
                    }
                    let wait = not_until.wait_time_from(self.clock.now());
                    std::thread::sleep(wait.min(MAX_WAIT_SLICE));
                }
            }
        }
    }

    fn poll_feed(&mut self) {
        let Some(feed) = self.feed.as_mut() else {
            return;
        };
        if feed.has_changed().unwrap_or(false) {
            let rate = *feed.borrow_and_update();
            if rate != self.dynamic_rate {
                self.dynamic_rate = rate;
                self.rebuild();
            }
        }
    }

    fn rebuild(&mut self) {
        self.limiter = self.effective_rate().map(|rate| {
            let per_second = NonZeroU32::new(rate.clamp(1, u32::MAX as u64) as u32)
                .unwrap_or(NonZeroU32::MIN);
            GovernorLimiter::direct(Quota::per_second(per_second))
        });
        debug!(rate = ?self.effective_rate(), "Updated receiver rate limit");
    }
}

/// Publishes backpressure rates to the receivers of every source node.
///
/// A source's rate is split evenly over its receivers.
#[derive(Debug, Default)]
pub struct RateBus {
    sources: IndexMap<NodeId, (usize, watch::Sender<Option<u64>>)>,
}

impl RateBus {
    /// Create a bus without sources
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source with `receivers` receivers and an initial rate
    pub fn register(&mut self, source: NodeId, receivers: usize, initial: Option<u64>) {
        let per_receiver = initial.map(|r| split_rate(r, receivers));
        let (tx, _) = watch::channel(per_receiver);
        self.sources.insert(source, (receivers.max(1), tx));
    }

    /// Subscribe to the per-receiver rate of a source
    pub fn subscribe(&self, source: &NodeId) -> Option<watch::Receiver<Option<u64>>> {
        self.sources.get(source).map(|(_, tx)| tx.subscribe())
    }

    /// Publish a new rate for all receivers of a source combined
    pub fn publish(&self, source: &NodeId, rate: u64) {
        if let Some((receivers, tx)) = self.sources.get(source) {
            tx.send_replace(Some(split_rate(rate, *receivers)));
        }
    }

    /// Latest per-receiver rate of a source
    pub fn current(&self, source: &NodeId) -> Option<u64> {
        self.sources.get(source).and_then(|(_, tx)| *tx.borrow())
    }

    /// All registered sources
    pub fn sources(&self) -> impl Iterator<Item = &NodeId> {
        self.sources.keys()
    }
}

fn split_rate(rate: u64, receivers: usize) -> u64 {
    rate.div_ceil(receivers.max(1) as u64).max(1)
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn unlimited_without_rates() {
        let mut limiter = RateLimiter::new(None, None);
        let stop = AtomicBool::new(false);
        assert_eq!(limiter.effective_rate(), None);
        for _ in 0..10_000 {
            assert!(limiter.acquire(&stop));
        }
    }

    #[test]
    fn published_rate_throttles() {
        let mut bus = RateBus::new();
        let source = NodeId::from_name("source");
        bus.register(source, 2, None);
        let mut limiter = RateLimiter::new(Some(1_000_000), bus.subscribe(&source));
        assert_eq!(limiter.effective_rate(), Some(1_000_000));

        bus.publish(&source, 100);
        assert_eq!(bus.current(&source), Some(50));
        let stop = AtomicBool::new(false);
        let start = Instant::now();
        // governor allows a burst of one second worth of records, the next
        // ten have to wait for replenishment
        for _ in 0..60 {
            assert!(limiter.acquire(&stop));
        }
        assert_eq!(limiter.effective_rate(), Some(50));
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn static_maximum_caps_dynamic_rate() {
        let mut bus = RateBus::new();
        let source = NodeId::from_name("source");
        bus.register(source, 1, Some(5000));
        let limiter = RateLimiter::new(Some(100), bus.subscribe(&source));
        assert_eq!(limiter.effective_rate(), Some(100));
    }
}
