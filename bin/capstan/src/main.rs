mod cmd;
mod config;

use clap::{Parser, Subcommand};
use eyre::Result;
use std::future::Future;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[clap(author, version, about = "distributed CI build execution", long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[cfg(feature = "executor")]
    Executor(cmd::executor::Command),
    #[cfg(feature = "fingergw")]
    Fingergw(cmd::fingergw::Command),
    Config(cmd::config::Command),
}

fn setup_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_task_until_signal(task: impl Future<Output = Result<()>>) -> Result<()> {
    tokio::select! {
        task = task => task,
        _ = signal::ctrl_c() => {
            tracing::info!("shutting down...");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging();

    match cli.command {
        #[cfg(feature = "executor")]
        Commands::Executor(cmd) => run_task_until_signal(cmd.execute()).await,
        #[cfg(feature = "fingergw")]
        Commands::Fingergw(cmd) => run_task_until_signal(cmd.execute()).await,
        Commands::Config(cmd) => run_task_until_signal(cmd.execute()).await,
    }
}
