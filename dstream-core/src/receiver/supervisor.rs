//! Runs a receiver and restarts it after failures.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{error, info, warn};

use super::{ReceiveStatus, Receiver, ReceiverInfo, ReceiverSink, Reliability};
use crate::clock::Clock;
use crate::scheduler::{ListenerBus, StreamingEvent};
use crate::types::{Data, Persistable};

/// Pause between two calls of an idle receiver
const IDLE_PAUSE: Duration = Duration::from_millis(10);

pub(crate) struct Supervisor {
    pub(crate) info: Arc<Mutex<ReceiverInfo>>,
    pub(crate) listener: ListenerBus,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) restart_delay: Duration,
    pub(crate) stop: Arc<AtomicBool>,
}

impl Supervisor {
    /// Run the receiver until it finishes or the job stops it
    pub(crate) fn run<V: Data + Persistable>(
        &self,
        mut receiver: Box<dyn Receiver<V>>,
        mut sink: ReceiverSink<V>,
    ) {
        let mut attempt = 0u64;
        'supervise: loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            if attempt > 0 {
                self.update(|i| i.restarts += 1);
                info!(receiver = self.id(), attempt, "Restarting receiver");
            }
            attempt += 1;

            if let Err(e) = receiver.on_start() {
                self.report_error(&e);
                if !self.wait_before_restart() {
                    break 'supervise;
                }
                continue 'supervise;
            }
            self.update(|i| i.active = true);
            self.listener
                .post(StreamingEvent::ReceiverStarted(self.snapshot()));

            loop {
                if self.stop.load(Ordering::Acquire) {
                    receiver.on_stop();
                    break 'supervise;
                }
                match receiver.receive(&mut sink) {
                    Ok(ReceiveStatus::Active) => (),
                    Ok(ReceiveStatus::Idle) => std::thread::sleep(IDLE_PAUSE),
                    Ok(ReceiveStatus::Finished) => {
                        info!(receiver = self.id(), "Receiver finished");
                        receiver.on_stop();
                        break 'supervise;
                    }
                    Err(e) => {
                        receiver.on_stop();
                        if receiver.reliability() == Reliability::Unreliable {
                            let lost = sink.discard_buffer();
                            if lost > 0 {
                                warn!(
                                    receiver = self.id(),
                                    lost, "Unreliable receiver failed, dropping buffered records"
                                );
                            }
                        }
                        self.report_error(&e);
                        if !self.wait_before_restart() {
                            break 'supervise;
                        }
                        continue 'supervise;
                    }
                }
            }
        }
        self.update(|i| i.active = false);
        self.listener
            .post(StreamingEvent::ReceiverStopped(self.snapshot()));
    }

    fn report_error(&self, e: &eyre::Report) {
        error!(receiver = self.id(), "Receiver failed: {e:?}");
        self.update(|i| {
            i.active = false;
            i.errors += 1;
            i.last_error = Some(format!("{e:#}"));
        });
        self.listener
            .post(StreamingEvent::ReceiverError(self.snapshot()));
    }

    /// Returns `false` if the job stopped while waiting
    fn wait_before_restart(&self) -> bool {
        let target = self.clock.now() + self.restart_delay;
        self.clock.wait_till(target, &self.stop)
    }

    fn update(&self, f: impl FnOnce(&mut ReceiverInfo)) {
        #[allow(clippy::unwrap_used)]
        f(&mut self.info.lock().unwrap())
    }

    fn snapshot(&self) -> ReceiverInfo {
        #[allow(clippy::unwrap_used)]
        self.info.lock().unwrap().clone()
    }

    fn id(&self) -> u32 {
        #[allow(clippy::unwrap_used)]
        self.info.lock().unwrap().id
    }
}
