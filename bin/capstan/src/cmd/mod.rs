pub mod config;

#[cfg(feature = "executor")]
pub mod executor;
#[cfg(feature = "fingergw")]
pub mod fingergw;
