//! Per-connection request handling: locate the executor owning a build
//! through the shared queue, optionally hop to the gateway registered for
//! the build's zone, and pipe bytes until either side hangs up.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use capstan_rs::finger;
use capstan_rs::queue::BuildQueue;
use capstan_rs::registry::ZoneRegistry;
use capstan_rs::types::WorkerInfo;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::Config;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) struct Gateway {
    pub config: Config,
    pub queue: Arc<dyn BuildQueue>,
    pub registry: Arc<dyn ZoneRegistry>,
}

impl Gateway {
    pub async fn handle(&self, mut client: TcpStream) {
        let build_id = match finger::read_request_line(&mut client).await {
            Ok(line) => line,
            Err(err) => {
                debug!(%err, "could not read request line");
                return;
            }
        };

        if !finger::is_valid_build_id(&build_id) {
            let _ = client
                .write_all(finger::invalid_build_id_msg(&build_id).as_bytes())
                .await;
            return;
        }

        match self.route(&build_id).await {
            Ok(Some(addr)) => {
                if let Err(err) = self.proxy(&mut client, addr, &build_id).await {
                    debug!(build = %build_id, %err, "stream ended with error");
                    let _ = client.write_all(finger::INTERNAL_ERROR_MSG.as_bytes()).await;
                }
            }
            Ok(None) => {
                let _ = client
                    .write_all(finger::not_found_msg(&build_id).as_bytes())
                    .await;
            }
            Err(err) => {
                warn!(build = %build_id, %err, "error locating build");
                let _ = client.write_all(finger::INTERNAL_ERROR_MSG.as_bytes()).await;
            }
        }
    }

    /// Where to connect for this build: the owning executor's streamer,
    /// or the peer gateway registered for the build's zone (one hop).
    async fn route(&self, build_id: &str) -> Result<Option<SocketAddr>, capstan_rs::Error> {
        let Some(request) = self.queue.lookup(build_id).await? else {
            return Ok(None);
        };
        if request.is_terminal() {
            return Ok(None);
        }
        let Some(WorkerInfo { hostname, log_port }) = request.worker_info else {
            return Ok(None);
        };

        if let (Some(our_zone), Some(build_zone)) = (&self.config.zone, &request.zone) {
            if our_zone != build_zone {
                if let Some(peer) = self.registry.lookup(build_zone).await? {
                    debug!(build = %build_id, zone = %build_zone, %peer, "hopping to peer gateway");
                    return Ok(Some(peer));
                }
            }
        }

        let addr = format!("{hostname}:{log_port}");
        let result = match tokio::net::lookup_host(&addr).await {
            Ok(mut addrs) => Ok(addrs.next()),
            Err(err) => {
                warn!(build = %build_id, addr, %err, "could not resolve executor");
                Ok(None)
            }
        };
        result
    }

    /// Open the upstream finger connection and shuttle bytes both ways;
    /// any EOF or error closes both sides. Live streams are interactive,
    /// so there are no retries.
    async fn proxy(
        &self,
        client: &mut TcpStream,
        addr: SocketAddr,
        build_id: &str,
    ) -> std::io::Result<()> {
        let mut upstream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")
            })??;
        upstream.write_all(format!("{build_id}\n").as_bytes()).await?;
        // Client bytes are forwarded upstream, where they are read as a
        // disconnect, matching the protocol on both sides.
        tokio::io::copy_bidirectional(client, &mut upstream).await?;
        Ok(())
    }
}
