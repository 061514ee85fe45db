//! Playbook preparation and execution.
//!
//! Every `ansible-playbook` invocation runs under a sandbox wrapper in its
//! own process group, with stdout interpreted line by line: `RESULT`
//! prefixed lines are control messages, everything else is truncated and
//! logged, and the exit code is mapped onto the build result taxonomy.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use capstan_rs::types::PlaybookSpec;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::builds::BuildHandle;
use crate::config::Config;
use crate::jobdir::{JobDir, JobDirPlaybook};
use crate::watchdog::Watchdog;

/// Lines kept from the head of ansible's output for exit-code forensics.
const BUFFER_LINES_FOR_SYNTAX: usize = 200;
const MAX_LOG_LINE: usize = 1024;
const MAX_FATAL_LOG_LINE: usize = 8192;

#[derive(Debug, Error)]
pub enum AnsibleError {
    #[error("playbook `{0}` not found")]
    PlaybookNotFound(String),
    #[error("refusing untrusted playbook: plugin dir `{0}` present")]
    PluginDir(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Normal,
    Timeout,
    Aborted,
    Unreachable,
}

#[derive(Debug, Clone, Copy)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub code: Option<i32>,
}

impl RunOutcome {
    pub fn ok(&self) -> bool {
        self.status == RunStatus::Normal && self.code == Some(0)
    }
}

/// Locate a playbook inside its checkout, tolerating a missing extension.
pub fn find_playbook(checkout: &Path, path: &str, trusted: bool) -> Result<PathBuf, AnsibleError> {
    if !trusted {
        block_plugin_dirs(checkout)?;
    }
    let candidate = checkout.join(path);
    if candidate.is_file() {
        return Ok(candidate);
    }
    for extension in ["yaml", "yml"] {
        let with_extension = checkout.join(format!("{path}.{extension}"));
        if with_extension.is_file() {
            return Ok(with_extension);
        }
    }
    Err(AnsibleError::PlaybookNotFound(path.to_string()))
}

/// Plugin directories anywhere under an untrusted checkout are a sandbox
/// escape vector; refuse the whole tree.
pub fn block_plugin_dirs(root: &Path) -> Result<(), AnsibleError> {
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if name.ends_with("_plugins") {
                    return Err(AnsibleError::PluginDir(path.display().to_string()));
                }
            }
            stack.push(path);
        }
    }
    Ok(())
}

/// Write the merged `ansible.cfg` for one playbook, restricting plugin
/// lookups to what the executor installed and pointing the output callback
/// at the console log.
pub fn write_ansible_config(
    playbook: &JobDirPlaybook,
    jobdir: &JobDir,
    config: &Config,
) -> std::io::Result<()> {
    let action_plugins = if playbook.trusted { "actiontrusted" } else { "actiongeneral" };
    let mut cfg = std::fs::File::create(&playbook.ansible_cfg)?;
    writeln!(cfg, "[defaults]")?;
    writeln!(cfg, "inventory = {}", playbook.inventory.display())?;
    writeln!(cfg, "local_tmp = {}", jobdir.tmp_root.display())?;
    writeln!(cfg, "retry_files_enabled = False")?;
    writeln!(cfg, "gathering = smart")?;
    writeln!(cfg, "fact_caching = jsonfile")?;
    writeln!(cfg, "fact_caching_connection = {}", jobdir.fact_cache.display())?;
    writeln!(cfg, "library = {}/library", jobdir.ansible_root.display())?;
    writeln!(cfg, "lookup_plugins = {}/lookup", jobdir.ansible_root.display())?;
    writeln!(cfg, "filter_plugins = {}/filter", jobdir.ansible_root.display())?;
    writeln!(cfg, "action_plugins = {}/{}", jobdir.ansible_root.display(), action_plugins)?;
    writeln!(cfg, "callback_plugins = {}/callback", jobdir.ansible_root.display())?;
    writeln!(cfg, "stdout_callback = capstan_stream")?;
    writeln!(cfg, "roles_path = {}", playbook.roles_root.display())?;
    if !playbook.trusted {
        writeln!(cfg, "command_warnings = False")?;
    }
    writeln!(cfg)?;
    writeln!(cfg, "[ssh_connection]")?;
    writeln!(
        cfg,
        "control_path_dir = {}",
        jobdir.ansible_cache_root.join("cp").display()
    )?;
    writeln!(
        cfg,
        "ssh_args = -o ControlMaster=auto -o ControlPersist=60s \
         -o UserKnownHostsFile={}",
        jobdir.known_hosts.display()
    )?;
    writeln!(cfg, "pipelining = True")?;
    Ok(())
}

/// Append one timestamped line to the console log.
pub fn log_line(job_output: &Path, line: &str) {
    let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.6f");
    let entry = format!("{stamp} | {line}\n");
    if let Ok(mut file) = std::fs::OpenOptions::new().append(true).open(job_output) {
        let _ = file.write_all(entry.as_bytes());
    }
}

/// Framing header/footer around each playbook run in the console log.
pub fn emit_playbook_banner(
    jobdir: &JobDir,
    spec: &PlaybookSpec,
    phase: &str,
    step: &str,
    result: Option<&str>,
) {
    let trusted = if spec.trusted { "trusted" } else { "untrusted" };
    let line = match result {
        Some(result) => format!(
            "{} {}: [{} : {}/{}@{}] result: {}",
            phase.to_uppercase(),
            step,
            trusted,
            spec.project,
            spec.path,
            spec.branch,
            result
        ),
        None => format!(
            "{} {}: [{} : {}/{}@{}]",
            phase.to_uppercase(),
            step,
            trusted,
            spec.project,
            spec.path,
            spec.branch
        ),
    };
    log_line(&jobdir.job_output_file, &line);
}

/// Failures in the final post playbook often hide log-upload errors; pull
/// the last playbook's JSON output into the text log so it is visible.
pub fn log_final_playbook_error(jobdir: &JobDir) {
    let json_output = jobdir.job_output_file.with_extension("json");
    let Ok(data) = std::fs::read_to_string(&json_output) else {
        debug!(path = %json_output.display(), "json logfile is missing");
        return;
    };
    let Ok(output) = serde_json::from_str::<serde_json::Value>(&data) else {
        warn!(path = %json_output.display(), "could not decode json logfile");
        return;
    };
    let Some(last_playbook) = output.as_array().and_then(|entries| entries.last()) else {
        return;
    };
    // YAML reads better than a stringified nested map.
    if let Ok(yaml) = serde_yaml::to_string(last_playbook) {
        for line in yaml.lines() {
            log_line(&jobdir.job_output_file, line);
        }
    }
}

fn truncate_output_line(line: &str) -> String {
    let limit = if line.starts_with("fatal") { MAX_FATAL_LOG_LINE } else { MAX_LOG_LINE };
    if line.len() <= limit {
        return line.trim_end().to_string();
    }
    let mut end = limit;
    while end > 0 && !line.is_char_boundary(end) {
        end -= 1;
    }
    line[..end].trim_end().to_string()
}

/// Wrap the ansible invocation in the configured sandbox.
pub fn wrap_command(config: &Config, jobdir: &JobDir, trusted: bool, argv: Vec<String>) -> Vec<String> {
    if config.wrapper == "nullwrap" {
        return argv;
    }
    let (ro_paths, rw_paths) = if trusted {
        (&config.trusted_ro_paths, &config.trusted_rw_paths)
    } else {
        (&config.untrusted_ro_paths, &config.untrusted_rw_paths)
    };
    let mut wrapped = vec![
        "bwrap".to_string(),
        "--die-with-parent".to_string(),
        "--unshare-pid".to_string(),
        "--proc".to_string(),
        "/proc".to_string(),
        "--dev".to_string(),
        "/dev".to_string(),
    ];
    for system_path in ["/usr", "/lib", "/lib64", "/bin", "/sbin", "/etc"] {
        if Path::new(system_path).exists() {
            wrapped.extend(["--ro-bind".to_string(), system_path.to_string(), system_path.to_string()]);
        }
    }
    for path in ro_paths {
        let path = path.display().to_string();
        wrapped.extend(["--ro-bind".to_string(), path.clone(), path]);
    }
    for fixed in [&jobdir.ansible_root, &jobdir.trusted_root, &jobdir.untrusted_root] {
        let path = fixed.display().to_string();
        wrapped.extend(["--ro-bind".to_string(), path.clone(), path]);
    }
    for path in rw_paths {
        let path = path.display().to_string();
        wrapped.extend(["--bind".to_string(), path.clone(), path]);
    }
    for fixed in [&jobdir.work_root, &jobdir.ansible_cache_root] {
        let path = fixed.display().to_string();
        wrapped.extend(["--bind".to_string(), path.clone(), path]);
    }
    wrapped.push("--chdir".to_string());
    wrapped.push(jobdir.work_root.display().to_string());
    wrapped.extend(argv);
    wrapped
}

pub struct AnsibleRunner<'a> {
    pub config: &'a Config,
    pub jobdir: &'a JobDir,
    pub handle: &'a Arc<BuildHandle>,
    /// Per-build agent environment plus anything else to inject.
    pub env: Vec<(String, String)>,
    pub verbose: bool,
}

impl AnsibleRunner<'_> {
    fn base_env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("CAPSTAN_JOBDIR".to_string(), self.jobdir.root.display().to_string()),
            (
                "CAPSTAN_JOB_OUTPUT".to_string(),
                self.jobdir.job_output_file.display().to_string(),
            ),
            (
                "CAPSTAN_JOB_LOG_CONFIG".to_string(),
                self.jobdir.logging_json.display().to_string(),
            ),
            (
                "CAPSTAN_CONSOLE_PORT".to_string(),
                self.config.log_console_port.to_string(),
            ),
            ("HOME".to_string(), self.jobdir.work_root.display().to_string()),
            ("TMP".to_string(), self.jobdir.tmp_root.display().to_string()),
        ];
        env.extend(self.env.iter().cloned());
        env
    }

    /// Run one `ansible-playbook` invocation and interpret its exit.
    pub async fn run_playbook(
        &self,
        playbook: &JobDirPlaybook,
        timeout: Option<Duration>,
        cleanup: bool,
    ) -> Result<RunOutcome, AnsibleError> {
        if self.handle.is_aborted() && !cleanup {
            return Ok(RunOutcome { status: RunStatus::Aborted, code: None });
        }
        let playbook_path = playbook
            .playbook_path
            .clone()
            .ok_or_else(|| AnsibleError::PlaybookNotFound(playbook.root.display().to_string()))?;

        let mut argv = vec![self.config.ansible_command.clone()];
        argv.push(if self.verbose { "-vvv".to_string() } else { "-v".to_string() });
        argv.push(playbook_path.display().to_string());
        let argv = wrap_command(self.config, self.jobdir, playbook.trusted, argv);

        debug!(build = %self.handle.uuid, ?argv, "ansible command");
        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .current_dir(&self.jobdir.work_root)
            .env("ANSIBLE_CONFIG", &playbook.ansible_cfg)
            .envs(self.base_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // A fresh session makes pid == pgid, so one SIGKILL reaches every
        // descendant.
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid()
                    .map(|_| ())
                    .map_err(std::io::Error::from)
            });
        }

        let mut child = command.spawn()?;
        let pgid = child.id().map(|pid| pid as i32);
        self.handle.set_process_group(pgid);

        let watchdog = timeout.map(|timeout| {
            let handle = self.handle.clone();
            let uuid = handle.uuid.clone();
            Watchdog::start(timeout, move || {
                warn!(build = %uuid, "ansible timeout exceeded");
                handle.kill_process_group();
            })
        });

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stderr_task = stderr.map(|stderr| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("ansible stderr: {}", truncate_output_line(&line));
                }
            })
        });

        let mut syntax_buffer: Vec<String> = Vec::new();
        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            let mut idx = 0usize;
            while let Ok(Some(line)) = lines.next_line().await {
                // RESULT lines are control messages, not output.
                if line.starts_with("RESULT") {
                    continue;
                }
                idx += 1;
                if idx < BUFFER_LINES_FOR_SYNTAX {
                    syntax_buffer.push(line.clone());
                }
                debug!("ansible output: {}", truncate_output_line(&line));
            }
        }
        debug!(build = %self.handle.uuid, "ansible output terminated");

        let status = child.wait().await?;
        if let Some(task) = stderr_task {
            let _ = task.await;
        }
        self.handle.set_process_group(None);

        let timed_out = watchdog.as_ref().map(|w| w.timed_out()).unwrap_or(false);
        if let Some(watchdog) = watchdog {
            watchdog.stop();
        }

        use std::os::unix::process::ExitStatusExt;
        let code = status.code().or_else(|| status.signal().map(|sig| -sig));
        debug!(build = %self.handle.uuid, ?code, "ansible exit code");

        if timed_out {
            return Ok(RunOutcome { status: RunStatus::Timeout, code });
        }
        if code == Some(3) || self.jobdir.job_unreachable_file.exists() {
            // Network trouble between here and the nodes; the scheduler
            // will retry.
            return Ok(RunOutcome { status: RunStatus::Unreachable, code });
        }
        match code {
            Some(-9) => return Ok(RunOutcome { status: RunStatus::Aborted, code }),
            Some(1) => {
                self.write_buffer_from_marker(&syntax_buffer, "ERROR!", None);
            }
            Some(4) => {
                log_line(&self.jobdir.job_output_file, "ANSIBLE PARSE ERROR");
                for line in &syntax_buffer {
                    log_line(&self.jobdir.job_output_file, line);
                }
            }
            Some(250) => {
                self.write_buffer_from_marker(
                    &syntax_buffer,
                    "ERROR! Unexpected Exception",
                    Some("UNEXPECTED ANSIBLE ERROR"),
                );
            }
            Some(2) => {
                // Winrm file-transfer failures surface as exit 2 without
                // ansible noticing the host is gone.
                if syntax_buffer
                    .iter()
                    .any(|line| line.contains("FATAL ERROR DURING FILE TRANSFER"))
                {
                    return Ok(RunOutcome { status: RunStatus::Unreachable, code });
                }
                self.write_buffer_from_marker(&syntax_buffer, "ERROR!", None);
            }
            _ => {}
        }

        if self.handle.is_aborted() && !cleanup {
            return Ok(RunOutcome { status: RunStatus::Aborted, code });
        }
        Ok(RunOutcome { status: RunStatus::Normal, code })
    }

    fn write_buffer_from_marker(
        &self,
        syntax_buffer: &[String],
        marker: &str,
        header: Option<&str>,
    ) {
        if let Some(header) = header {
            log_line(&self.jobdir.job_output_file, header);
        }
        let mut found_marker = false;
        for line in syntax_buffer {
            if line.starts_with(marker) {
                found_marker = true;
            }
            if !found_marker {
                continue;
            }
            log_line(&self.jobdir.job_output_file, line);
        }
    }
}
