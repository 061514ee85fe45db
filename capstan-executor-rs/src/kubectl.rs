//! Per-build kubectl port-forwards for nodes reached through a cluster.
//! Tracked per build and torn down with it.

use std::path::Path;
use std::process::Stdio;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

const FORWARD_START_TIMEOUT: Duration = Duration::from_secs(10);

pub struct KubePortForward {
    pub context: String,
    pub pod: String,
    /// Local port picked by kubectl.
    pub local_port: u16,
    pgid: Option<i32>,
    /// Held so the forward outlives this function; kill_on_drop backstops
    /// the explicit group kill.
    _child: tokio::process::Child,
}

impl KubePortForward {
    /// Start `kubectl port-forward` for the console port of one pod and
    /// parse the local port from its first output line.
    pub async fn start(
        kube_config: &Path,
        context: &str,
        namespace: &str,
        pod: &str,
        remote_port: u16,
    ) -> std::io::Result<Self> {
        let mut command = Command::new("kubectl");
        command
            .arg("--kubeconfig")
            .arg(kube_config)
            .arg("--context")
            .arg(context)
            .arg("-n")
            .arg(namespace)
            .arg("port-forward")
            .arg(format!("pod/{pod}"))
            .arg(format!(":{remote_port}"))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid()
                    .map(|_| ())
                    .map_err(std::io::Error::from)
            });
        }
        let mut child = command.spawn()?;
        let pgid = child.id().map(|pid| pid as i32);

        // kubectl announces "Forwarding from 127.0.0.1:NNNN -> MMMM".
        let local_port = match child.stdout.take() {
            Some(stdout) => {
                let mut lines = BufReader::new(stdout).lines();
                match timeout(FORWARD_START_TIMEOUT, lines.next_line()).await {
                    Ok(Ok(Some(line))) => parse_forward_port(&line).ok_or_else(|| {
                        std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            format!("unparseable port-forward output: {line}"),
                        )
                    })?,
                    _ => {
                        if let Some(pgid) = pgid {
                            let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
                        }
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "kubectl port-forward did not start",
                        ));
                    }
                }
            }
            None => 0,
        };
        debug!(pod, local_port, "kubectl port-forward established");
        Ok(Self {
            context: context.to_string(),
            pod: pod.to_string(),
            local_port,
            pgid,
            _child: child,
        })
    }

    pub fn stop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            if let Err(err) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                if err != nix::errno::Errno::ESRCH {
                    warn!(pod = %self.pod, %err, "could not stop port-forward");
                }
            }
        }
    }
}

impl Drop for KubePortForward {
    fn drop(&mut self) {
        self.stop();
    }
}

fn parse_forward_port(line: &str) -> Option<u16> {
    // "Forwarding from 127.0.0.1:35001 -> 19885"
    let rest = line.strip_prefix("Forwarding from ")?;
    let (addr, _) = rest.split_once(" -> ")?;
    addr.rsplit_once(':')?.1.parse().ok()
}
