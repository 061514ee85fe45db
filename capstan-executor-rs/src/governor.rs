//! The governor toggles the executor's accepting-work flag based on a
//! fixed set of resource sensors, checked every ten seconds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::sensors::Sensor;

pub const GOVERNOR_INTERVAL: Duration = Duration::from_secs(10);

pub struct Governor {
    sensors: Vec<Box<dyn Sensor>>,
    accepting_work: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl Governor {
    pub fn new(
        sensors: Vec<Box<dyn Sensor>>,
        accepting_work: Arc<AtomicBool>,
        wake: Arc<Notify>,
    ) -> Self {
        Self { sensors, accepting_work, wake }
    }

    /// One governor cycle. At its tail, accepting-work is true only if
    /// every sensor reported ok the last time it was consulted.
    pub fn manage_load(&self) {
        if self.accepting_work.load(Ordering::SeqCst) {
            for sensor in &self.sensors {
                let (ok, message) = sensor.is_ok();
                if !ok {
                    info!(sensor = sensor.name(), "unregistering due to {message}");
                    self.accepting_work.store(false, Ordering::SeqCst);
                    break;
                }
            }
        } else {
            let mut limits = Vec::with_capacity(self.sensors.len());
            let mut reregister = true;
            for sensor in &self.sensors {
                let (ok, message) = sensor.is_ok();
                limits.push(message);
                if !ok {
                    reregister = false;
                    break;
                }
            }
            if reregister {
                info!("re-registering, within limits: {}", limits.join(", "));
                self.accepting_work.store(true, Ordering::SeqCst);
                self.wake.notify_one();
            }
        }
        for sensor in &self.sensors {
            sensor.report_stats();
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval(GOVERNOR_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.manage_load(),
                _ = shutdown.cancelled() => return,
            }
        }
    }
}
