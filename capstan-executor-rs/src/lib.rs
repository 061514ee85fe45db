pub mod ansible;
pub mod autohold;
pub mod build;
pub mod builds;
pub mod command_socket;
pub mod config;
pub mod disk_accountant;
pub mod governor;
pub mod jobdir;
pub mod kubectl;
pub mod merger;
pub mod metrics;
pub mod sensors;
pub mod server;
pub mod service;
pub mod ssh_agent;
pub mod streamer;
pub mod update_queue;
pub mod vars;
pub mod watchdog;

pub use config::Config;
pub use service::Service;
pub use streamer::LogStreamer;
