use std::sync::Arc;

use clap::Args;
use eyre::{eyre, Result};

use capstan_executor_rs::Service;
use capstan_rs::allocator::StaticAllocator;
use capstan_rs::keystore::PlainKeystore;
use capstan_rs::queue::MemoryQueue;

use crate::config::Config;

#[derive(Debug, Args)]
#[clap(about = "run builds leased from the shared queue")]
pub struct Command {
    #[clap(env, default_value = "capstan.toml")]
    config_file: String,
}

impl Command {
    pub async fn execute(self) -> Result<()> {
        let config = Config::from_toml_file(&self.config_file)?;

        let Some(executor_config) = config.executor else {
            return Err(eyre!("missing executor config from file provided"));
        };

        // Coordination-service-backed implementations of the queue,
        // allocator and keystore contracts plug in here; the in-process
        // ones serve single-node deployments.
        let queue = Arc::new(MemoryQueue::new());
        let allocator = Arc::new(StaticAllocator::new());
        let keystore = Arc::new(PlainKeystore);

        let service = Service::start(executor_config, queue, allocator, keystore).await?;
        service.join().await;
        Ok(())
    }
}
