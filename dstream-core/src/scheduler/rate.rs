//! Backpressure: estimates the ingestion rate a job can sustain from the
//! timing of completed batches and publishes it to the receivers.
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use super::job::BatchInfo;
use super::listener::{ListenerBus, StreamingEvent};
use crate::config::PidConfig;
use crate::receiver::RateBus;
use crate::types::NodeId;

/// PID controller estimating the sustainable rate of one source.
///
/// The error is the difference between the last estimated rate and the rate at
/// which the last batch was processed. The accumulated scheduling delay acts as
/// the integral term: a growing backlog pushes the rate below the processing
/// rate until the backlog is worked off.
#[derive(Debug, Clone)]
pub struct PidRateEstimator {
    batch_interval_ms: f64,
    gains: PidConfig,
    latest_time: Option<u64>,
    latest_rate: f64,
    latest_error: f64,
}

impl PidRateEstimator {
    /// Create an estimator for batches of `batch_interval_ms`
    pub fn new(batch_interval_ms: u64, gains: PidConfig) -> Self {
        Self {
            batch_interval_ms: batch_interval_ms.max(1) as f64,
            gains,
            latest_time: None,
            latest_rate: 0.0,
            latest_error: 0.0,
        }
    }

    /// Feed the measurements of a completed batch. `time` is the wall-clock time
    /// the batch completed at, all durations are in ms. Returns the new rate in
    /// records/sec, or `None` if the batch carries no usable measurement. The
    /// first usable batch only initializes the estimator.
    pub fn compute(
        &mut self,
        time: u64,
        elements: u64,
        processing_delay: u64,
        scheduling_delay: u64,
    ) -> Option<f64> {
        if self.latest_time.is_some_and(|latest| time <= latest) || elements == 0 || processing_delay == 0 {
            return None;
        }
        let processing_rate = elements as f64 / processing_delay as f64 * 1000.0;
        let Some(latest_time) = self.latest_time.replace(time) else {
            self.latest_rate = processing_rate;
            self.latest_error = 0.0;
            return None;
        };
        let since_update = (time - latest_time) as f64 / 1000.0;
        let error = self.latest_rate - processing_rate;
        let historical_error = scheduling_delay as f64 * processing_rate / self.batch_interval_ms;
        let d_error = (error - self.latest_error) / since_update;
        let rate = (self.latest_rate
            - self.gains.proportional * error
            - self.gains.integral * historical_error
            - self.gains.derivative * d_error)
            .max(self.gains.min_rate);
        debug!(
            rate,
            processing_rate, error, historical_error, "Estimated new ingestion rate"
        );
        self.latest_rate = rate;
        self.latest_error = error;
        Some(rate)
    }
}

/// Runs one estimator per receiver fed source and publishes its rates
pub(crate) struct RateController {
    estimators: IndexMap<NodeId, PidRateEstimator>,
    rates: Arc<RateBus>,
    listener: ListenerBus,
}

impl RateController {
    pub(crate) fn new(rates: Arc<RateBus>, listener: ListenerBus, batch_interval_ms: u64, gains: PidConfig) -> Self {
        let estimators = rates
            .sources()
            .map(|s| (*s, PidRateEstimator::new(batch_interval_ms, gains)))
            .collect();
        Self {
            estimators,
            rates,
            listener,
        }
    }

    pub(crate) fn on_batch_completed(&mut self, info: &BatchInfo) {
        let (Some(end), Some(processing), Some(scheduling)) = (
            info.processing_end,
            info.processing_time(),
            info.scheduling_delay(),
        ) else {
            return;
        };
        for (source, estimator) in self.estimators.iter_mut() {
            let elements = info.records_per_source.get(source).copied().unwrap_or(0);
            if let Some(rate) = estimator.compute(
                end.as_millis(),
                elements as u64,
                processing.as_millis() as u64,
                scheduling.as_millis() as u64,
            ) {
                let rate = rate.round() as u64;
                self.rates.publish(source, rate);
                self.listener.post(StreamingEvent::RateUpdated {
                    source: *source,
                    rate,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::receiver::RateLimiter;
    use crate::scheduler::BatchState;
    use crate::types::BatchTime;

    fn completed(source: NodeId, k: u64, records: usize, processing_ms: u64) -> BatchInfo {
        let submitted = BatchTime::from_millis(k * 1000);
        BatchInfo {
            time: submitted,
            state: BatchState::Completed,
            records_per_source: IndexMap::from([(source, records)]),
            submission_time: submitted,
            processing_start: Some(submitted),
            processing_end: Some(BatchTime::from_millis(k * 1000 + processing_ms)),
            backlog: 0,
        }
    }

    #[test]
    fn completed_batches_throttle_receivers() {
        let source = NodeId::from_name("events");
        let mut bus = RateBus::new();
        bus.register(source, 2, None);
        let bus = Arc::new(bus);
        let mut limiter = RateLimiter::new(Some(10_000), bus.subscribe(&source));
        let mut controller = RateController::new(Arc::clone(&bus), ListenerBus::start(), 1000, PidConfig::default());

        controller.on_batch_completed(&completed(source, 1, 500, 500));
        assert_eq!(bus.current(&source), None);
        // 1000 records/sec sustained, split over both receivers
        controller.on_batch_completed(&completed(source, 2, 500, 500));
        assert_eq!(bus.current(&source), Some(500));

        assert!(limiter.acquire(&AtomicBool::new(false)));
        assert_eq!(limiter.effective_rate(), Some(500));
    }

    /// Simulates a job which can process 1000 records/sec while 2000
    /// records/sec are offered, returning the scheduling delay of every batch
    fn simulate(backpressure: bool, batches: u64) -> Vec<u64> {
        let batch_ms = 1000;
        let capacity = 1000.0;
        let offered = 2000.0;
        let mut estimator = PidRateEstimator::new(batch_ms, PidConfig::default());
        let mut rate: Option<f64> = None;
        let mut previous_end = 0;
        let mut delays = Vec::new();
        for k in 1..=batches {
            let submitted = k * batch_ms;
            let records = rate.map_or(offered, |r: f64| r.min(offered)) as u64;
            let start = submitted.max(previous_end);
            let processing = (records as f64 / capacity * 1000.0) as u64;
            let end = start + processing;
            previous_end = end;
            delays.push(start - submitted);
            if backpressure {
                if let Some(r) = estimator.compute(end, records, processing, start - submitted) {
                    rate = Some(r);
                }
            }
        }
        delays
    }

    #[test]
    fn delay_grows_without_backpressure() {
        let delays = simulate(false, 30);
        assert!(delays.windows(2).all(|w| w[1] > w[0]));
        assert!(delays[29] >= 29_000);
    }

    #[test]
    fn backpressure_stabilizes_delay() {
        let delays = simulate(true, 40);
        let peak = *delays.iter().max().unwrap();
        assert!(peak <= 3000, "{delays:?}");
        assert!(delays[30..].iter().all(|d| *d < 100), "{delays:?}");
    }

    #[test]
    fn first_batch_only_initializes() {
        let mut estimator = PidRateEstimator::new(1000, PidConfig::default());
        assert_eq!(estimator.compute(1000, 500, 500, 0), None);
        // processing as fast as estimated keeps the rate
        let rate = estimator.compute(2000, 500, 500, 0).unwrap();
        assert!((rate - 1000.0).abs() < f64::EPSILON);
        assert_eq!(estimator.compute(2000, 500, 500, 0), None);
        assert_eq!(estimator.compute(3000, 0, 500, 0), None);
    }

    #[test]
    fn rate_never_drops_below_minimum() {
        let mut estimator = PidRateEstimator::new(1000, PidConfig::default());
        estimator.compute(1000, 10, 1000, 0);
        let rate = estimator.compute(2000, 10, 1000, 60_000).unwrap();
        assert_eq!(rate, PidConfig::default().min_rate);
    }
}
