//! Resource sensors consulted by the governor to decide whether the
//! executor should keep accepting work.

pub mod cpu;
pub mod hdd;
pub mod pause;
pub mod ram;
pub mod starting_builds;

pub trait Sensor: Send + Sync {
    fn name(&self) -> &'static str;

    /// `(ok, message)`; the message describes the limit for operators.
    fn is_ok(&self) -> (bool, String);

    /// Export the sensor's current readings as gauges.
    fn report_stats(&self) {}
}
