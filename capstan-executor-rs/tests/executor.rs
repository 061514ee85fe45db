//! End-to-end executor tests: a real git upstream, a stub ansible
//! command, and the in-process queue and allocator.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use capstan_executor_rs::{Config, Service};
use capstan_rs::allocator::StaticAllocator;
use capstan_rs::keystore::PlainKeystore;
use capstan_rs::queue::{BuildQueue, MemoryQueue};
use capstan_rs::types::{
    AutoholdRequest, BuildParams, BuildRequest, BuildRequestState, Node, NodeSet,
    PlaybookSpec, ProjectSpec, ResultKind,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

const PROJECT: &str = "demo/project";
const CONNECTION: &str = "gerrit";

fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

fn git(dir: &Path, args: &[&str]) {
    let output = std::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", "test")
        .env("GIT_AUTHOR_EMAIL", "test@example.com")
        .env("GIT_COMMITTER_NAME", "test")
        .env("GIT_COMMITTER_EMAIL", "test@example.com")
        .output()
        .expect("git invocation failed");
    assert!(
        output.status.success(),
        "git {:?}: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Create the upstream repository with a run playbook on `master`.
fn make_upstream(base: &Path) -> PathBuf {
    let repo = base.join(PROJECT);
    std::fs::create_dir_all(repo.join("playbooks")).unwrap();
    std::fs::write(repo.join("playbooks/run.yaml"), "- hosts: all\n").unwrap();
    std::fs::write(repo.join("playbooks/post.yaml"), "- hosts: all\n").unwrap();
    git(&repo, &["init", "-q"]);
    git(&repo, &["checkout", "-q", "-b", "master"]);
    git(&repo, &["add", "."]);
    git(&repo, &["commit", "-q", "-m", "initial"]);
    base.to_path_buf()
}

fn write_stub_ansible(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;
    let script = format!("#!/bin/sh\n{body}\n");
    std::fs::write(path, script).unwrap();
    let mut permissions = std::fs::metadata(path).unwrap().permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(path, permissions).unwrap();
}

struct Harness {
    queue: MemoryQueue,
    allocator: StaticAllocator,
    service: Service,
    job_dir: PathBuf,
    _tmp: tempfile::TempDir,
}

async fn start_executor(stub_body: &str, keep_jobdir: bool) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let upstream = make_upstream(&tmp.path().join("upstream"));

    let stub = tmp.path().join("ansible-stub.sh");
    write_stub_ansible(&stub, stub_body);

    let job_dir = tmp.path().join("builds");
    let mut config = Config::default();
    config.host = "127.0.0.1".parse().unwrap();
    config.finger_port = 0;
    config.job_dir = job_dir.clone();
    config.merger_dir = tmp.path().join("merger");
    config.command_socket = tmp.path().join("executor.socket");
    config.wrapper = "nullwrap".to_string();
    config.ansible_command = stub.display().to_string();
    config.disk_limit_per_job = -1;
    config.max_load_avg = 1000.0;
    config.min_avail_mem = 0.0;
    config.min_avail_hdd = 0.0;
    config.keep_jobdir = keep_jobdir;
    config
        .sources
        .insert(CONNECTION.to_string(), format!("file://{}", upstream.display()));

    let queue = MemoryQueue::new();
    let allocator = StaticAllocator::new();
    let service = Service::start(
        config,
        Arc::new(queue.clone()),
        Arc::new(allocator.clone()),
        Arc::new(PlainKeystore),
    )
    .await
    .unwrap();

    Harness { queue, allocator, service, job_dir, _tmp: tmp }
}

fn request(uuid: &str) -> BuildRequest {
    BuildRequest {
        uuid: uuid.to_string(),
        tenant: "acme".to_string(),
        pipeline: "gate".to_string(),
        job_name: "unit".to_string(),
        build_set_uuid: "bs01".to_string(),
        event_id: "ev01".to_string(),
        zone: None,
        state: BuildRequestState::Requested,
        worker_info: None,
        attempts: 1,
        max_attempts: 3,
        sequence: 0,
    }
}

fn params() -> BuildParams {
    BuildParams {
        projects: vec![ProjectSpec {
            connection: CONNECTION.to_string(),
            name: PROJECT.to_string(),
            canonical_name: PROJECT.to_string(),
            override_branch: None,
            override_checkout: None,
            default_branch: "master".to_string(),
        }],
        run_playbooks: vec![PlaybookSpec {
            connection: CONNECTION.to_string(),
            project: PROJECT.to_string(),
            branch: "master".to_string(),
            path: "playbooks/run".to_string(),
            trusted: false,
            roles: Vec::new(),
            secrets: Vec::new(),
        }],
        refname: Some("refs/heads/master".to_string()),
        ..Default::default()
    }
}

async fn await_result(
    results: &mut tokio::sync::mpsc::UnboundedReceiver<capstan_rs::types::BuildCompletedEvent>,
) -> capstan_rs::types::BuildCompletedEvent {
    timeout(Duration::from_secs(60), results.recv())
        .await
        .expect("timed out waiting for completion event")
        .expect("result stream closed")
}

#[tokio::test]
async fn test_build_success() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    let harness = start_executor("exit 0", false).await;
    let mut results = harness.queue.subscribe_results("acme", "gate");

    harness.queue.submit(request("aa00aa00aa00"), params());
    let event = await_result(&mut results).await;
    assert_eq!(event.uuid, "aa00aa00aa00");
    assert_eq!(event.result.result, Some(ResultKind::Success));
    assert!(!event.result.held);

    // The request reached COMPLETED with our worker info attached.
    let request = harness
        .queue
        .lookup("aa00aa00aa00")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.state, BuildRequestState::Completed);
    let worker_info = request.worker_info.unwrap();
    assert_eq!(worker_info.log_port, harness.service.log_port());

    // Job dir cleaned up.
    assert!(!harness.job_dir.join("aa00aa00aa00").exists());
    harness.service.stop();
}

#[tokio::test]
async fn test_build_failure_with_autohold() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    // Fail only the run playbook; setup and freeze still succeed.
    let harness =
        start_executor("case \"$2\" in */playbooks/run*) exit 1;; esac\nexit 0", false).await;
    harness.allocator.add_hold_request(AutoholdRequest {
        id: "hold-01".to_string(),
        tenant: "acme".to_string(),
        project: PROJECT.to_string(),
        job: "unit".to_string(),
        ref_filter: "refs/heads/master".to_string(),
        max_count: 1,
        current_count: 0,
        node_expiration: None,
    });
    let nodeset = NodeSet { nodes: vec![Node::new("node1", "small")], groups: Vec::new() };
    harness.allocator.add_allocation("req-1", nodeset.clone());
    harness.allocator.add_allocation("req-2", nodeset);

    let mut results = harness.queue.subscribe_results("acme", "gate");

    let mut first_params = params();
    first_params.node_request_id = Some("req-1".to_string());
    harness.queue.submit(request("bb00bb00bb00"), first_params);
    let event = await_result(&mut results).await;
    assert_eq!(event.result.result, Some(ResultKind::Failure));
    assert!(event.result.held, "first failing build should be held");
    assert_eq!(harness.allocator.held(), vec![("hold-01".to_string(), "bb00bb00bb00".to_string())]);
    assert_eq!(harness.allocator.returned_count(), 0);

    // The hold is exhausted; the next failure returns its nodes.
    let mut second_params = params();
    second_params.node_request_id = Some("req-2".to_string());
    harness.queue.submit(request("cc00cc00cc00"), second_params);
    let event = await_result(&mut results).await;
    assert_eq!(event.result.result, Some(ResultKind::Failure));
    assert!(!event.result.held);
    assert_eq!(harness.allocator.returned_count(), 1);
    harness.service.stop();
}

#[tokio::test]
async fn test_cancel_kills_build() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    let harness =
        start_executor("case \"$2\" in */playbooks/run*) sleep 600;; esac\nexit 0", false)
            .await;
    let mut results = harness.queue.subscribe_results("acme", "gate");

    harness.queue.submit(request("dd00dd00dd00"), params());

    // Wait until the run playbook is underway, then cancel.
    let mut running = false;
    for _ in 0..100 {
        if let Some(req) = harness.queue.lookup("dd00dd00dd00").await.unwrap() {
            if req.state == BuildRequestState::Running && req.worker_info.is_some() {
                running = true;
            }
        }
        if running {
            break;
        }
        sleep(Duration::from_millis(200)).await;
    }
    assert!(running);
    sleep(Duration::from_secs(2)).await;
    harness.queue.request_cancel("dd00dd00dd00");

    let event = await_result(&mut results).await;
    assert_eq!(event.result.result, Some(ResultKind::Aborted));
    harness.service.stop();
}

#[tokio::test]
async fn test_job_timeout() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    let harness =
        start_executor("case \"$2\" in */playbooks/run*) sleep 600;; esac\nexit 0", false)
            .await;
    let mut results = harness.queue.subscribe_results("acme", "gate");

    let mut timed_params = params();
    timed_params.timeout = Some(2);
    harness.queue.submit(request("ee00ee00ee00"), timed_params);

    let event = await_result(&mut results).await;
    assert_eq!(event.result.result, Some(ResultKind::TimedOut));
    harness.service.stop();
}

#[tokio::test]
async fn test_pause_and_resume() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    let body = r#"case "$2" in
*/playbooks/run*)
    printf '{"data": {"capstan": {"pause": true}}}' > "$CAPSTAN_JOBDIR/work/results.json"
    ;;
esac
exit 0"#;
    let harness = start_executor(body, false).await;
    let mut results = harness.queue.subscribe_results("acme", "gate");

    harness.queue.submit(request("ff00ff00ff00"), params());

    // The build parks itself in PAUSED after a successful run phase.
    let mut paused = false;
    for _ in 0..150 {
        if let Some(req) = harness.queue.lookup("ff00ff00ff00").await.unwrap() {
            if req.state == BuildRequestState::Paused {
                paused = true;
                break;
            }
        }
        sleep(Duration::from_millis(200)).await;
    }
    assert!(paused, "build never paused");

    harness.queue.request_resume("ff00ff00ff00");
    let event = await_result(&mut results).await;
    assert_eq!(event.result.result, Some(ResultKind::Success));
    harness.service.stop();
}

#[tokio::test]
async fn test_basic_stream_during_build() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    // The run playbook waits for a flag file, then logs the token line.
    let body = r#"case "$2" in
*/playbooks/run*)
    while [ ! -f "$CAPSTAN_JOBDIR/work/flag" ]; do sleep 0.1; done
    printf '%s | Debug Test Token String\n' "$(date '+%Y-%m-%d %H:%M:%S.%6N')" >> "$CAPSTAN_JOB_OUTPUT"
    ;;
esac
exit 0"#;
    let harness = start_executor(body, true).await;
    let mut results = harness.queue.subscribe_results("acme", "gate");

    harness.queue.submit(request("abcdef012345"), params());

    // Connect to the streamer once the job dir exists.
    let jobdir = harness.job_dir.join("abcdef012345");
    for _ in 0..150 {
        if jobdir.join("work/logs/job-output.txt").exists() {
            break;
        }
        sleep(Duration::from_millis(200)).await;
    }
    let mut stream =
        TcpStream::connect(("127.0.0.1", harness.service.log_port())).await.unwrap();
    stream.write_all(b"abcdef012345\n").await.unwrap();

    // Wait for the run playbook to start, then release it.
    sleep(Duration::from_secs(1)).await;
    std::fs::write(jobdir.join("work/flag"), b"go").unwrap();

    let event = await_result(&mut results).await;
    assert_eq!(event.result.result, Some(ResultKind::Success));

    // Collect the stream until it matches the kept log file.
    let log_file = jobdir.join("work/logs/job-output.txt");
    let expected = std::fs::read(&log_file).unwrap();
    let mut collected: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    let deadline = std::time::Instant::now() + Duration::from_secs(30);
    while collected.len() < expected.len() && std::time::Instant::now() < deadline {
        match timeout(Duration::from_millis(500), stream.read(&mut chunk)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => collected.extend_from_slice(&chunk[..n]),
            Ok(Err(_)) => break,
            Err(_) => {}
        }
    }
    assert_eq!(collected, expected);
    let text = String::from_utf8(collected).unwrap();
    assert!(
        text.lines().any(|line| line.ends_with("| Debug Test Token String")),
        "token line missing from {text:?}"
    );
    harness.service.stop();
}
