use lazy_static::lazy_static;
use prometheus::{
    register_gauge, register_int_counter, register_int_counter_vec, register_int_gauge, Gauge,
    IntCounter, IntCounterVec, IntGauge, Opts,
};

const NAMESPACE: &str = "capstan";
const SUBSYSTEM: &str = "executor";

const PHASE_LABEL: &str = "phase";
const RESULT_LABEL: &str = "result";

lazy_static! {
    pub static ref LOAD_AVERAGE: Gauge = register_gauge!(Opts::new(
        "load_average",
        "one minute load average, times 100"
    )
    .namespace(NAMESPACE)
    .subsystem(SUBSYSTEM))
    .unwrap();
    pub static ref PCT_USED_RAM: IntGauge = register_int_gauge!(Opts::new(
        "pct_used_ram",
        "used memory percentage, times 100"
    )
    .namespace(NAMESPACE)
    .subsystem(SUBSYSTEM))
    .unwrap();
    pub static ref PCT_USED_RAM_CGROUP: IntGauge = register_int_gauge!(Opts::new(
        "pct_used_ram_cgroup",
        "used cgroup memory percentage, times 100"
    )
    .namespace(NAMESPACE)
    .subsystem(SUBSYSTEM))
    .unwrap();
    pub static ref PCT_USED_HDD: IntGauge = register_int_gauge!(Opts::new(
        "pct_used_hdd",
        "used job filesystem percentage, times 100"
    )
    .namespace(NAMESPACE)
    .subsystem(SUBSYSTEM))
    .unwrap();
    pub static ref STARTING_BUILDS: IntGauge = register_int_gauge!(Opts::new(
        "starting_builds",
        "builds still in their startup phase"
    )
    .namespace(NAMESPACE)
    .subsystem(SUBSYSTEM))
    .unwrap();
    pub static ref RUNNING_BUILDS: IntGauge = register_int_gauge!(Opts::new(
        "running_builds",
        "builds currently executing"
    )
    .namespace(NAMESPACE)
    .subsystem(SUBSYSTEM))
    .unwrap();
    pub static ref PAUSED_BUILDS: IntGauge = register_int_gauge!(Opts::new(
        "paused_builds",
        "builds currently paused"
    )
    .namespace(NAMESPACE)
    .subsystem(SUBSYSTEM))
    .unwrap();
    pub static ref BUILDS_COUNTER: IntCounter = register_int_counter!(Opts::new(
        "builds_total",
        "total number of builds accepted"
    )
    .namespace(NAMESPACE)
    .subsystem(SUBSYSTEM))
    .unwrap();
    pub static ref PHASE_RESULT_COUNTER: IntCounterVec = register_int_counter_vec!(
        Opts::new("phase_result_total", "playbook runs by phase and result")
            .namespace(NAMESPACE)
            .subsystem(SUBSYSTEM),
        &[PHASE_LABEL, RESULT_LABEL]
    )
    .unwrap();
}

pub fn inc_builds() {
    BUILDS_COUNTER.inc();
}

pub fn inc_phase_result(phase: &str, result: &str) {
    PHASE_RESULT_COUNTER.with_label_values(&[phase, result]).inc();
}
