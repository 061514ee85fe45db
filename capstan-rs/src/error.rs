use thiserror::Error;

use crate::allocator::AllocatorError;
use crate::keystore::KeystoreError;
use crate::queue::QueueError;
use crate::registry::RegistryError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Allocator(#[from] AllocatorError),
    #[error(transparent)]
    Keystore(#[from] KeystoreError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("could not parse TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("could not decode JSON: {0}")]
    Json(#[from] serde_json::Error),
}
