use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::sensors::Sensor;

/// Administrative pause, toggled over the command socket.
pub struct PauseSensor {
    paused: Arc<AtomicBool>,
}

impl PauseSensor {
    pub fn new(paused: Arc<AtomicBool>) -> Self {
        Self { paused }
    }
}

impl Sensor for PauseSensor {
    fn name(&self) -> &'static str {
        "pause"
    }

    fn is_ok(&self) -> (bool, String) {
        if self.paused.load(Ordering::SeqCst) {
            (false, "paused by operator".to_string())
        } else {
            (true, "running".to_string())
        }
    }
}
