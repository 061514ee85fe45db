//! A per-build `ssh-agent`, isolated from every other build through its
//! own `SSH_AUTH_SOCK`.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SshAgentError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("ssh-agent produced unparseable output")]
    BadAgentOutput,
    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
}

pub struct SshAgent {
    env: HashMap<String, String>,
    pid: Option<i32>,
}

impl SshAgent {
    pub async fn start() -> Result<Self, SshAgentError> {
        let output = Command::new("ssh-agent").output().await?;
        if !output.status.success() {
            return Err(SshAgentError::CommandFailed {
                command: "ssh-agent".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        let mut env = HashMap::new();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            for part in line.split(';') {
                if let Some((key, value)) = part.trim().split_once('=') {
                    if key == "SSH_AUTH_SOCK" || key == "SSH_AGENT_PID" {
                        env.insert(key.to_string(), value.to_string());
                    }
                }
            }
        }
        let pid = env
            .get("SSH_AGENT_PID")
            .and_then(|p| p.parse().ok())
            .ok_or(SshAgentError::BadAgentOutput)?;
        if !env.contains_key("SSH_AUTH_SOCK") {
            return Err(SshAgentError::BadAgentOutput);
        }
        debug!(pid, "started ssh agent");
        Ok(Self { env, pid: Some(pid) })
    }

    /// Environment to inject into subprocesses using this agent.
    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    fn ssh_add(&self) -> Command {
        let mut command = Command::new("ssh-add");
        command.envs(&self.env);
        command
    }

    pub async fn add(&self, key_path: &Path) -> Result<(), SshAgentError> {
        let output = self.ssh_add().arg(key_path).output().await?;
        if !output.status.success() {
            return Err(SshAgentError::CommandFailed {
                command: format!("ssh-add {}", key_path.display()),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }

    /// Add key material without it touching the filesystem.
    pub async fn add_data(&self, name: &str, key_data: &str) -> Result<(), SshAgentError> {
        let mut child = self
            .ssh_add()
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(key_data.as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(SshAgentError::CommandFailed {
                command: format!("ssh-add - ({name})"),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }

    pub async fn remove(&self, key_path: &Path) -> Result<(), SshAgentError> {
        let output = self.ssh_add().arg("-d").arg(key_path).output().await?;
        if !output.status.success() {
            return Err(SshAgentError::CommandFailed {
                command: format!("ssh-add -d {}", key_path.display()),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }

    /// Public keys currently held by the agent.
    pub async fn list(&self) -> Result<Vec<String>, SshAgentError> {
        let output = self.ssh_add().arg("-L").output().await?;
        // ssh-add -L exits 1 with "The agent has no identities."
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| !line.is_empty() && !line.starts_with("The agent has no"))
            .map(str::to_string)
            .collect())
    }

    pub fn stop(&mut self) {
        if let Some(pid) = self.pid.take() {
            debug!(pid, "stopping ssh agent");
            if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                if err != nix::errno::Errno::ESRCH {
                    warn!(pid, %err, "could not stop ssh agent");
                }
            }
        }
    }
}

impl Drop for SshAgent {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ssh_agent_available() -> bool {
        std::process::Command::new("ssh-agent")
            .arg("-h")
            .output()
            .map(|_| true)
            .unwrap_or(false)
            || which("ssh-agent")
    }

    fn which(program: &str) -> bool {
        std::env::var_os("PATH")
            .map(|paths| {
                std::env::split_paths(&paths).any(|dir| dir.join(program).is_file())
            })
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_agent_lifecycle() {
        if !ssh_agent_available() {
            eprintln!("ssh-agent not installed, skipping");
            return;
        }
        let mut agent = SshAgent::start().await.unwrap();
        assert!(agent.env().contains_key("SSH_AUTH_SOCK"));
        assert!(agent.list().await.unwrap().is_empty());
        agent.stop();
    }
}
