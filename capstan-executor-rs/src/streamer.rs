//! The per-executor log streamer: a TCP daemon serving the live console
//! log of any build running on this executor over the finger protocol.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use capstan_rs::finger;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const CHUNK_SIZE: usize = 4096;
const POLL_DELAY: Duration = Duration::from_millis(250);
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(500);
const OPEN_RETRIES: usize = 20;

#[derive(Default)]
struct StreamRegistry {
    active: Mutex<HashMap<String, usize>>,
}

impl StreamRegistry {
    fn enter(self: &Arc<Self>, uuid: &str) -> StreamGuard {
        *self.active.lock().entry(uuid.to_string()).or_insert(0) += 1;
        StreamGuard { registry: self.clone(), uuid: uuid.to_string() }
    }

    fn count(&self, uuid: &str) -> usize {
        self.active.lock().get(uuid).copied().unwrap_or(0)
    }
}

struct StreamGuard {
    registry: Arc<StreamRegistry>,
    uuid: String,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let mut active = self.registry.active.lock();
        if let Some(count) = active.get_mut(&self.uuid) {
            *count -= 1;
            if *count == 0 {
                active.remove(&self.uuid);
            }
        }
    }
}

pub struct LogStreamer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    registry: Arc<StreamRegistry>,
}

impl LogStreamer {
    /// Bind and start serving. Binding `::` serves both address families.
    /// If started as root and `user` is set, privileges are dropped after
    /// the bind.
    pub async fn start(
        addr: SocketAddr,
        jobdir_root: PathBuf,
        user: Option<&str>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        if let Some(user) = user {
            capstan_rs::sys::drop_privileges(user)?;
        }
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let registry = Arc::new(StreamRegistry::default());

        let token = shutdown.clone();
        let streams = registry.clone();
        let root = jobdir_root;
        tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "accepted log stream connection");
                            stream
                        }
                        Err(err) => {
                            warn!(%err, "error accepting log stream connection");
                            continue;
                        }
                    },
                    _ = token.cancelled() => return,
                };
                let root = root.clone();
                let streams = streams.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, &root, &streams).await {
                        debug!(%err, "log stream ended with error");
                    }
                });
            }
        });

        Ok(Self { local_addr, shutdown, registry })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Streams still open for a build; used to verify client hangups are
    /// noticed.
    pub fn active_streams(&self, uuid: &str) -> usize {
        self.registry.count(uuid)
    }

    /// Close the listening socket. In-flight streams run to completion.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for LogStreamer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    jobdir_root: &Path,
    registry: &Arc<StreamRegistry>,
) -> std::io::Result<()> {
    let build_id = finger::read_request_line(&mut stream).await?;

    if !finger::is_valid_build_id(&build_id) {
        stream
            .write_all(finger::invalid_build_id_msg(&build_id).as_bytes())
            .await?;
        return Ok(());
    }

    let Some(job_dir) = resolve_job_dir(jobdir_root, &build_id) else {
        stream
            .write_all(finger::not_found_msg(&build_id).as_bytes())
            .await?;
        return Ok(());
    };

    let _guard = registry.enter(&build_id);
    let log_file = job_dir.join("work").join("logs").join("job-output.txt");
    stream_log(&mut stream, &log_file).await
}

/// The job dir is `<root>/<uuid>`, tolerating a random suffix appended
/// after an underscore.
fn resolve_job_dir(root: &Path, build_id: &str) -> Option<PathBuf> {
    let exact = root.join(build_id);
    if exact.is_dir() {
        return Some(exact);
    }
    let prefix = format!("{build_id}_");
    for entry in std::fs::read_dir(root).ok()?.flatten() {
        let name = entry.file_name();
        if let Some(name) = name.to_str() {
            if name.starts_with(&prefix) && entry.path().is_dir() {
                return Some(entry.path());
            }
        }
    }
    None
}

struct OpenLog {
    file: tokio::fs::File,
    ino: u64,
    /// Bytes streamed from this incarnation of the file.
    pos: u64,
}

async fn open_log(path: &Path) -> Option<OpenLog> {
    for _ in 0..OPEN_RETRIES {
        match tokio::fs::File::open(path).await {
            Ok(file) => {
                let ino = file.metadata().await.ok()?.ino();
                return Some(OpenLog { file, ino, pos: 0 });
            }
            Err(_) => sleep(OPEN_RETRY_DELAY).await,
        }
    }
    None
}

/// Tail-follow: ship whatever is in the file, then poll for growth,
/// client disconnect, rotation, or deletion.
async fn stream_log(stream: &mut TcpStream, path: &Path) -> std::io::Result<()> {
    let mut log = match open_log(path).await {
        Some(log) => log,
        None => return Ok(()),
    };
    let mut chunk = vec![0u8; CHUNK_SIZE];
    loop {
        // Drain all unread data first.
        loop {
            let n = log.file.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            log.pos += n as u64;
            stream.write_all(&chunk[..n]).await?;
        }

        sleep(POLL_DELAY).await;

        // Anything from the client, data or EOF, means it is done with us.
        let mut probe = [0u8; 1024];
        match stream.try_read(&mut probe) {
            Ok(_) => return Ok(()),
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(_) => return Ok(()),
        }

        // Rotation: inode changed or the file shrank. Deletion ends the
        // stream.
        match tokio::fs::metadata(path).await {
            Ok(meta) => {
                if meta.ino() != log.ino || meta.len() < log.pos {
                    log = match open_log(path).await {
                        Some(log) => log,
                        None => return Ok(()),
                    };
                }
            }
            Err(_) => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_job_dir_with_suffix() {
        let base = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(base.path().join("abcd0123_Xy9")).unwrap();
        let found = resolve_job_dir(base.path(), "abcd0123").unwrap();
        assert!(found.ends_with("abcd0123_Xy9"));
        assert_eq!(resolve_job_dir(base.path(), "ffff0000"), None);
    }

    #[test]
    fn test_resolve_job_dir_exact_match_wins() {
        let base = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(base.path().join("abcd0123")).unwrap();
        std::fs::create_dir_all(base.path().join("abcd0123_zz")).unwrap();
        let found = resolve_job_dir(base.path(), "abcd0123").unwrap();
        assert!(found.ends_with("abcd0123"));
    }
}
