use std::sync::Arc;

use clap::Args;
use eyre::{eyre, Result};

use capstan_fingergw_rs::Service;
use capstan_rs::queue::MemoryQueue;
use capstan_rs::registry::MemoryRegistry;

use crate::config::Config;

#[derive(Debug, Args)]
#[clap(about = "route live log streams to the owning executor")]
pub struct Command {
    #[clap(env, default_value = "capstan.toml")]
    config_file: String,
}

impl Command {
    pub async fn execute(self) -> Result<()> {
        let config = Config::from_toml_file(&self.config_file)?;

        let Some(fingergw_config) = config.fingergw else {
            return Err(eyre!("missing fingergw config from file provided"));
        };

        let queue = Arc::new(MemoryQueue::new());
        let registry = Arc::new(MemoryRegistry::new());

        let service = Service::start(fingergw_config, queue, registry).await?;
        service.join().await;
        Ok(())
    }
}
