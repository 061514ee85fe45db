use clap::Args;
use eyre::Result;
use tracing::info;

use crate::config::Config;

#[derive(Debug, Args)]
#[clap(about = "(debug) utility to verify configuration")]
pub struct Command {
    #[clap(env)]
    config_file: String,
}

impl Command {
    pub async fn execute(self) -> Result<()> {
        let config = Config::from_toml_file(&self.config_file)?;

        info!("{:?}", config);

        Ok(())
    }
}
