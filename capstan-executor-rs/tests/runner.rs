//! Exit-code interpretation of the ansible runner, driven with stub
//! commands in place of `ansible-playbook`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use capstan_executor_rs::ansible::{AnsibleRunner, RunOutcome, RunStatus};
use capstan_executor_rs::builds::BuildHandle;
use capstan_executor_rs::jobdir::JobDir;
use capstan_executor_rs::Config;

fn write_stub(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut permissions = std::fs::metadata(path).unwrap().permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(path, permissions).unwrap();
}

struct RunResult {
    outcome: RunOutcome,
    job_output: String,
}

async fn run_stub(body: &str, timeout: Option<Duration>, mark_unreachable: bool) -> RunResult {
    let tmp = tempfile::tempdir().unwrap();
    let stub = tmp.path().join("stub.sh");
    write_stub(&stub, body);

    let mut jobdir = JobDir::new(tmp.path(), false, "abcd0123").unwrap();
    {
        let playbook = jobdir.add_playbook().unwrap();
        playbook.playbook_path = Some(tmp.path().join("noop.yaml"));
    }
    if mark_unreachable {
        std::fs::write(&jobdir.job_unreachable_file, "node1\n").unwrap();
    }

    let mut config = Config::default();
    config.wrapper = "nullwrap".to_string();
    config.ansible_command = stub.display().to_string();

    let handle = Arc::new(BuildHandle::new("abcd0123"));
    let runner = AnsibleRunner {
        config: &config,
        jobdir: &jobdir,
        handle: &handle,
        env: Vec::new(),
        verbose: false,
    };
    let outcome = runner
        .run_playbook(&jobdir.playbooks[0], timeout, false)
        .await
        .unwrap();
    let job_output = std::fs::read_to_string(&jobdir.job_output_file).unwrap();
    RunResult { outcome, job_output }
}

#[tokio::test]
async fn test_exit_zero_is_success() {
    let result = run_stub("exit 0", None, false).await;
    assert_eq!(result.outcome.status, RunStatus::Normal);
    assert_eq!(result.outcome.code, Some(0));
    assert!(result.outcome.ok());
}

#[tokio::test]
async fn test_exit_one_surfaces_error_lines() {
    let body = "echo preamble\necho 'ERROR! task failed'\necho trailing\nexit 1";
    let result = run_stub(body, None, false).await;
    assert_eq!(result.outcome.status, RunStatus::Normal);
    assert_eq!(result.outcome.code, Some(1));
    assert!(!result.outcome.ok());
    // Everything from the ERROR! marker lands in the console log, the
    // preamble does not.
    assert!(result.job_output.contains("ERROR! task failed"));
    assert!(result.job_output.contains("trailing"));
    assert!(!result.job_output.contains("preamble"));
}

#[tokio::test]
async fn test_exit_three_is_unreachable() {
    let result = run_stub("exit 3", None, false).await;
    assert_eq!(result.outcome.status, RunStatus::Unreachable);
}

#[tokio::test]
async fn test_unreachable_marker_file() {
    let result = run_stub("exit 0", None, true).await;
    assert_eq!(result.outcome.status, RunStatus::Unreachable);
}

#[tokio::test]
async fn test_exit_four_writes_buffer_verbatim() {
    let body = "echo 'RESULT control line'\necho 'yaml: is: broken'\nexit 4";
    let result = run_stub(body, None, false).await;
    assert_eq!(result.outcome.status, RunStatus::Normal);
    assert_eq!(result.outcome.code, Some(4));
    assert!(result.job_output.contains("ANSIBLE PARSE ERROR"));
    assert!(result.job_output.contains("yaml: is: broken"));
    // RESULT lines are control messages, never output.
    assert!(!result.job_output.contains("RESULT control line"));
}

#[tokio::test]
async fn test_exit_two_file_transfer_is_unreachable() {
    let body = "echo 'FATAL ERROR DURING FILE TRANSFER'\nexit 2";
    let result = run_stub(body, None, false).await;
    assert_eq!(result.outcome.status, RunStatus::Unreachable);
}

#[tokio::test]
async fn test_exit_two_parse_errors_logged() {
    let body = "echo 'ERROR! missing role'\nexit 2";
    let result = run_stub(body, None, false).await;
    assert_eq!(result.outcome.status, RunStatus::Normal);
    assert_eq!(result.outcome.code, Some(2));
    assert!(result.job_output.contains("ERROR! missing role"));
}

#[tokio::test]
async fn test_exit_250_unexpected_error() {
    let body = "echo 'ERROR! Unexpected Exception: boom'\nexit 250";
    let result = run_stub(body, None, false).await;
    assert_eq!(result.outcome.status, RunStatus::Normal);
    assert_eq!(result.outcome.code, Some(250));
    assert!(result.job_output.contains("UNEXPECTED ANSIBLE ERROR"));
    assert!(result.job_output.contains("Unexpected Exception: boom"));
}

#[tokio::test]
async fn test_watchdog_kills_process_group() {
    let started = std::time::Instant::now();
    let result = run_stub("sleep 600", Some(Duration::from_secs(1)), false).await;
    assert_eq!(result.outcome.status, RunStatus::Timeout);
    // The whole group dies promptly, not after the sleep finishes.
    assert!(started.elapsed() < Duration::from_secs(30));
}

#[tokio::test]
async fn test_aborted_before_start() {
    let tmp = tempfile::tempdir().unwrap();
    let stub = tmp.path().join("stub.sh");
    write_stub(&stub, "exit 0");
    let mut jobdir = JobDir::new(tmp.path(), false, "abcd0123").unwrap();
    {
        let playbook = jobdir.add_playbook().unwrap();
        playbook.playbook_path = Some(tmp.path().join("noop.yaml"));
    }
    let mut config = Config::default();
    config.wrapper = "nullwrap".to_string();
    config.ansible_command = stub.display().to_string();

    let handle = Arc::new(BuildHandle::new("abcd0123"));
    handle.abort(None);
    let runner = AnsibleRunner {
        config: &config,
        jobdir: &jobdir,
        handle: &handle,
        env: Vec::new(),
        verbose: false,
    };
    let outcome = runner
        .run_playbook(&jobdir.playbooks[0], None, false)
        .await
        .unwrap();
    assert_eq!(outcome.status, RunStatus::Aborted);
}
