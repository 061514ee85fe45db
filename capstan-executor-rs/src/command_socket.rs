//! Administrative command socket: a local UNIX stream socket receiving one
//! ASCII word per connection, newline terminated.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Stop,
    Pause,
    Unpause,
    Graceful,
    Verbose,
    Unverbose,
    Keep,
    Nokeep,
    Repl,
    Norepl,
}

impl Command {
    /// Unknown words yield `None` and are ignored by the listener.
    pub fn parse(word: &str) -> Option<Self> {
        match word {
            "stop" => Some(Self::Stop),
            "pause" => Some(Self::Pause),
            "unpause" => Some(Self::Unpause),
            "graceful" => Some(Self::Graceful),
            "verbose" => Some(Self::Verbose),
            "unverbose" => Some(Self::Unverbose),
            "keep" => Some(Self::Keep),
            "nokeep" => Some(Self::Nokeep),
            "repl" => Some(Self::Repl),
            "norepl" => Some(Self::Norepl),
            _ => None,
        }
    }
}

pub struct CommandSocket {
    path: PathBuf,
    task: JoinHandle<()>,
}

impl CommandSocket {
    /// Bind the socket and start listening. Commands arrive on the returned
    /// channel in the order received; processing is up to the caller.
    pub fn start(path: &Path) -> std::io::Result<(Self, mpsc::UnboundedReceiver<Command>)> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(path)?;
        let (tx, rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            loop {
                let stream = match listener.accept().await {
                    Ok((stream, _)) => stream,
                    Err(err) => {
                        warn!(%err, "error accepting command connection");
                        continue;
                    }
                };
                let mut reader = BufReader::new(stream);
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) => break,
                        Ok(_) => {}
                        Err(err) => {
                            warn!(%err, "error reading command");
                            break;
                        }
                    }
                    let word = line.trim();
                    match Command::parse(word) {
                        Some(command) => {
                            debug!(?command, "received command");
                            if tx.send(command).is_err() {
                                return;
                            }
                        }
                        None => debug!(word, "ignoring unknown command"),
                    }
                }
            }
        });

        Ok((Self { path: path.to_path_buf(), task }, rx))
    }

    pub fn stop(&self) {
        self.task.abort();
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Drop for CommandSocket {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixStream;

    #[test]
    fn test_parse_known_commands() {
        assert_eq!(Command::parse("stop"), Some(Command::Stop));
        assert_eq!(Command::parse("graceful"), Some(Command::Graceful));
        assert_eq!(Command::parse("nokeep"), Some(Command::Nokeep));
        assert_eq!(Command::parse("flush"), None);
        assert_eq!(Command::parse(""), None);
    }

    #[tokio::test]
    async fn test_commands_arrive_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("executor.socket");
        let (socket, mut rx) = CommandSocket::start(&path).unwrap();

        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream.write_all(b"pause\nbogus\nunpause\n").await.unwrap();
        drop(stream);

        assert_eq!(rx.recv().await, Some(Command::Pause));
        assert_eq!(rx.recv().await, Some(Command::Unpause));
        socket.stop();
    }
}
