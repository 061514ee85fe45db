use std::path::PathBuf;

use crate::metrics;
use crate::sensors::Sensor;

pub struct HddSensor {
    min_avail_hdd: f64,
    job_dir: PathBuf,
}

impl HddSensor {
    pub fn new(min_avail_hdd: f64, job_dir: PathBuf) -> Self {
        Self { min_avail_hdd, job_dir }
    }

    fn avail_hdd_pct(&self) -> Option<f64> {
        let stat = nix::sys::statvfs::statvfs(&self.job_dir).ok()?;
        let total = stat.blocks();
        if total == 0 {
            return None;
        }
        Some(stat.blocks_available() as f64 / total as f64 * 100.0)
    }
}

impl Sensor for HddSensor {
    fn name(&self) -> &'static str {
        "hdd"
    }

    fn is_ok(&self) -> (bool, String) {
        match self.avail_hdd_pct() {
            Some(avail) if avail < self.min_avail_hdd => {
                (false, format!("low disk {:3.1}% < {}", avail, self.min_avail_hdd))
            }
            Some(avail) => (true, format!("{:3.1}% <= {}", avail, self.min_avail_hdd)),
            // The job dir may not exist yet at startup.
            None => (true, "job dir not measurable".to_string()),
        }
    }

    fn report_stats(&self) {
        if let Some(avail) = self.avail_hdd_pct() {
            metrics::PCT_USED_HDD.set(((100.0 - avail) * 100.0) as i64);
        }
    }
}
