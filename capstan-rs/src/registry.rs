//! Zone announcement for finger gateways.
//!
//! Gateways register their listen address under their zone in the shared
//! coordination service; peers in other zones discover them by lookup.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("transient registry failure: {0}")]
    Transient(String),
}

#[async_trait]
pub trait ZoneRegistry: Send + Sync {
    async fn register(&self, zone: &str, addr: SocketAddr) -> Result<(), RegistryError>;
    async fn unregister(&self, zone: &str) -> Result<(), RegistryError>;
    async fn lookup(&self, zone: &str) -> Result<Option<SocketAddr>, RegistryError>;
}

#[derive(Default, Clone)]
pub struct MemoryRegistry {
    zones: Arc<Mutex<HashMap<String, SocketAddr>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ZoneRegistry for MemoryRegistry {
    async fn register(&self, zone: &str, addr: SocketAddr) -> Result<(), RegistryError> {
        self.zones.lock().insert(zone.to_string(), addr);
        Ok(())
    }

    async fn unregister(&self, zone: &str) -> Result<(), RegistryError> {
        self.zones.lock().remove(zone);
        Ok(())
    }

    async fn lookup(&self, zone: &str) -> Result<Option<SocketAddr>, RegistryError> {
        Ok(self.zones.lock().get(zone).copied())
    }
}
