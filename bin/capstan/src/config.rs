use eyre::WrapErr;
use serde::Deserialize;
use std::{fmt, path::Path};

#[cfg(feature = "executor")]
use capstan_executor_rs::Config as ExecutorConfig;
#[cfg(feature = "fingergw")]
use capstan_fingergw_rs::Config as FingergwConfig;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[cfg(feature = "executor")]
    pub executor: Option<ExecutorConfig>,
    #[cfg(feature = "fingergw")]
    pub fingergw: Option<FingergwConfig>,
}

impl Config {
    pub fn from_toml_file<P: AsRef<Path> + fmt::Display>(path: P) -> eyre::Result<Config> {
        capstan_rs::from_toml_file(path).wrap_err("could not parse TOML")
    }
}
