use parking_lot::Mutex;
use sysinfo::{System, SystemExt};

use crate::metrics;
use crate::sensors::Sensor;

const CGROUP_LIMIT_FILE: &str = "/sys/fs/cgroup/memory/memory.limit_in_bytes";
const CGROUP_USAGE_FILE: &str = "/sys/fs/cgroup/memory/memory.usage_in_bytes";

fn read_cgroup_value(path: &str) -> Option<u64> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

pub struct RamSensor {
    min_avail_mem: f64,
    /// Effective cgroup limit; `None` when there is no limit below the
    /// host's total memory.
    cgroup_limit: Option<u64>,
    system: Mutex<System>,
}

impl RamSensor {
    pub fn new(min_avail_mem: f64) -> Self {
        let mut system = System::new();
        system.refresh_memory();
        // A cgroup with no limit reports a number far above the host
        // total; only honor limits below it.
        let cgroup_limit =
            read_cgroup_value(CGROUP_LIMIT_FILE).filter(|limit| *limit < system.total_memory());
        Self { min_avail_mem, cgroup_limit, system: Mutex::new(system) }
    }

    fn avail_mem_pct(&self) -> f64 {
        let mut system = self.system.lock();
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return 100.0;
        }
        system.available_memory() as f64 / total as f64 * 100.0
    }

    fn avail_mem_pct_cgroup(&self) -> Option<f64> {
        let limit = self.cgroup_limit?;
        let usage = read_cgroup_value(CGROUP_USAGE_FILE)?;
        Some(100.0 - usage as f64 / limit as f64 * 100.0)
    }
}

impl Sensor for RamSensor {
    fn name(&self) -> &'static str {
        "ram"
    }

    fn is_ok(&self) -> (bool, String) {
        let avail = self.avail_mem_pct();
        if avail < self.min_avail_mem {
            return (false, format!("low memory {:3.1}% < {}", avail, self.min_avail_mem));
        }
        match self.avail_mem_pct_cgroup() {
            None => (true, format!("{:3.1}% <= {}", avail, self.min_avail_mem)),
            Some(cgroup_avail) if cgroup_avail < self.min_avail_mem => (
                false,
                format!("low memory cgroup {:3.1}% < {}", cgroup_avail, self.min_avail_mem),
            ),
            Some(cgroup_avail) => (
                true,
                format!(
                    "{:3.1}% <= {}, {:3.1}% <= {}",
                    avail, self.min_avail_mem, cgroup_avail, self.min_avail_mem
                ),
            ),
        }
    }

    fn report_stats(&self) {
        metrics::PCT_USED_RAM.set(((100.0 - self.avail_mem_pct()) * 100.0) as i64);
        if let Some(cgroup_avail) = self.avail_mem_pct_cgroup() {
            metrics::PCT_USED_RAM_CGROUP.set(((100.0 - cgroup_avail) * 100.0) as i64);
        }
    }
}
