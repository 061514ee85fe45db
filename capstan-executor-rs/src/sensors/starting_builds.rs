use std::sync::Arc;

use crate::builds::BuildRegistry;
use crate::config::num_cpus;
use crate::metrics;
use crate::sensors::Sensor;

pub struct StartingBuildsSensor {
    registry: Arc<BuildRegistry>,
    max_starting_builds: f64,
    min_starting_builds: usize,
}

impl StartingBuildsSensor {
    pub fn new(registry: Arc<BuildRegistry>, max_load: f64) -> Self {
        Self {
            registry,
            max_starting_builds: max_load * 2.0,
            min_starting_builds: std::cmp::max(num_cpus() / 2, 1),
        }
    }

    fn limit(&self) -> usize {
        let headroom = self.max_starting_builds - self.registry.running() as f64;
        std::cmp::max(headroom.max(0.0) as usize, self.min_starting_builds)
    }
}

impl Sensor for StartingBuildsSensor {
    fn name(&self) -> &'static str {
        "startingbuilds"
    }

    fn is_ok(&self) -> (bool, String) {
        let starting = self.registry.starting();
        let limit = self.limit();
        if starting >= limit {
            (false, format!("too many starting builds {starting} >= {limit}"))
        } else {
            (true, format!("{starting} <= {limit}"))
        }
    }

    fn report_stats(&self) {
        metrics::STARTING_BUILDS.set(self.registry.starting() as i64);
        metrics::RUNNING_BUILDS.set(self.registry.running() as i64);
        metrics::PAUSED_BUILDS.set(self.registry.paused() as i64);
    }
}
