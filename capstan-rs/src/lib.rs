pub mod allocator;
mod config;
mod error;
pub mod finger;
pub mod keystore;
pub mod queue;
pub mod registry;
pub mod sys;
pub mod types;

pub use config::from_toml_file;
pub use error::Error;
