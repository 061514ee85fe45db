use parking_lot::Mutex;
use sysinfo::{System, SystemExt};

use crate::metrics;
use crate::sensors::Sensor;

pub struct CpuSensor {
    max_load: f64,
    system: Mutex<System>,
}

impl CpuSensor {
    pub fn new(max_load: f64) -> Self {
        Self { max_load, system: Mutex::new(System::new()) }
    }

    fn load_one(&self) -> f64 {
        self.system.lock().load_average().one
    }
}

impl Sensor for CpuSensor {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn is_ok(&self) -> (bool, String) {
        let load = self.load_one();
        if load > self.max_load {
            (false, format!("high system load {:.2} > {:.2}", load, self.max_load))
        } else {
            (true, format!("{:.2} <= {:.2}", load, self.max_load))
        }
    }

    fn report_stats(&self) {
        metrics::LOAD_AVERAGE.set(self.load_one() * 100.0);
    }
}
