use std::net::SocketAddr;
use std::sync::Arc;

use capstan_rs::queue::BuildQueue;
use capstan_rs::registry::ZoneRegistry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::gateway::Gateway;

pub struct Service {
    local_addr: SocketAddr,
    zone: Option<String>,
    registry: Arc<dyn ZoneRegistry>,
    shutdown: CancellationToken,
}

impl Service {
    pub async fn start(
        config: Config,
        queue: Arc<dyn BuildQueue>,
        registry: Arc<dyn ZoneRegistry>,
    ) -> std::io::Result<Self> {
        let listener =
            TcpListener::bind(SocketAddr::new(config.listen_address, config.port)).await?;
        if let Some(user) = &config.user {
            capstan_rs::sys::drop_privileges(user)?;
        }
        let local_addr = listener.local_addr()?;
        info!(%local_addr, zone = ?config.zone, "finger gateway listening");

        let zone = config.zone.clone();
        if let Some(zone) = &zone {
            registry
                .register(zone, local_addr)
                .await
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
        }

        let shutdown = CancellationToken::new();
        let gateway = Arc::new(Gateway { config, queue, registry: registry.clone() });

        let token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "accepted gateway connection");
                            stream
                        }
                        Err(err) => {
                            warn!(%err, "error accepting gateway connection");
                            continue;
                        }
                    },
                    _ = token.cancelled() => return,
                };
                let gateway = gateway.clone();
                tokio::spawn(async move { gateway.handle(stream).await });
            }
        });

        Ok(Self { local_addr, zone, registry, shutdown })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until [`Service::stop`] is called.
    pub async fn join(&self) {
        self.shutdown.cancelled().await;
    }

    pub async fn stop(&self) {
        if let Some(zone) = &self.zone {
            if let Err(err) = self.registry.unregister(zone).await {
                warn!(zone, %err, "could not unregister zone");
            }
        }
        self.shutdown.cancel();
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
