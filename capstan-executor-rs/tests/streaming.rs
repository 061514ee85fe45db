//! Log streamer integration tests: real sockets, real files.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use capstan_executor_rs::streamer::LogStreamer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

const BUILD_UUID: &str = "abcdef012345";

fn make_job_dir(root: &Path, uuid: &str) -> PathBuf {
    let logs = root.join(uuid).join("work").join("logs");
    std::fs::create_dir_all(&logs).unwrap();
    logs.join("job-output.txt")
}

async fn start_streamer(root: &Path) -> LogStreamer {
    LogStreamer::start("[::]:0".parse().unwrap(), root.to_path_buf(), None)
        .await
        .unwrap()
}

async fn request_stream(port: u16, uuid: &str) -> TcpStream {
    let mut stream = TcpStream::connect(("::1", port)).await.unwrap();
    stream.write_all(format!("{uuid}\n").as_bytes()).await.unwrap();
    stream
}

async fn read_until_close(mut stream: TcpStream) -> Vec<u8> {
    let mut data = Vec::new();
    timeout(Duration::from_secs(30), stream.read_to_end(&mut data))
        .await
        .expect("stream did not close")
        .unwrap();
    data
}

#[tokio::test]
async fn test_start_stop_ipv4_and_ipv6() {
    let root = tempfile::tempdir().unwrap();
    let streamer = start_streamer(root.path()).await;
    let port = streamer.local_addr().port();

    // Both families connect while running.
    TcpStream::connect(SocketAddr::new("::1".parse().unwrap(), port))
        .await
        .unwrap();
    TcpStream::connect(SocketAddr::new("127.0.0.1".parse().unwrap(), port))
        .await
        .unwrap();

    streamer.stop();
    sleep(Duration::from_millis(100)).await;

    assert!(TcpStream::connect(SocketAddr::new("::1".parse().unwrap(), port))
        .await
        .is_err());
    assert!(
        TcpStream::connect(SocketAddr::new("127.0.0.1".parse().unwrap(), port))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_basic_stream() {
    let root = tempfile::tempdir().unwrap();
    let log_file = make_job_dir(root.path(), BUILD_UUID);
    let streamer = start_streamer(root.path()).await;

    let stream = request_stream(streamer.local_addr().port(), BUILD_UUID).await;

    // Lines arrive while the job is still running.
    capstan_executor_rs::ansible::log_line(&log_file, "Debug Test Token String");
    sleep(Duration::from_millis(600)).await;
    // Job ends; the jobdir is deleted and the stream closes.
    let expected = std::fs::read(&log_file).unwrap();
    std::fs::remove_dir_all(root.path().join(BUILD_UUID)).unwrap();

    let data = read_until_close(stream).await;
    assert_eq!(data, expected);

    let text = String::from_utf8(data).unwrap();
    assert!(has_token_line(&text), "no token line in {text:?}");
}

// One line must match the timestamped token format exactly.
fn has_token_line(text: &str) -> bool {
    text.lines().any(|line| {
        let Some((stamp, message)) = line.split_once(" | ") else {
            return false;
        };
        if message != "Debug Test Token String" {
            return false;
        }
        let bytes = stamp.as_bytes();
        // YYYY-MM-DD HH:MM:SS.ffffff
        bytes.len() == 26
            && bytes[4] == b'-'
            && bytes[7] == b'-'
            && bytes[10] == b' '
            && bytes[13] == b':'
            && bytes[16] == b':'
            && bytes[19] == b'.'
            && stamp
                .char_indices()
                .all(|(i, c)| matches!(i, 4 | 7 | 10 | 13 | 16 | 19) || c.is_ascii_digit())
            && stamp[20..].len() == 6
    })
}

#[tokio::test]
async fn test_client_connects_before_first_write() {
    let root = tempfile::tempdir().unwrap();
    let log_file = make_job_dir(root.path(), BUILD_UUID);
    let streamer = start_streamer(root.path()).await;

    // The file exists but is empty; the client gets 0 bytes, not an
    // error line.
    let mut stream = request_stream(streamer.local_addr().port(), BUILD_UUID).await;
    sleep(Duration::from_millis(600)).await;
    let mut probe = [0u8; 64];
    let pending = timeout(Duration::from_millis(200), stream.read(&mut probe)).await;
    assert!(pending.is_err(), "no bytes expected before the first write");

    std::fs::write(&log_file, b"first bytes\n").unwrap();
    // Wait for delivery before tearing down the jobdir.
    sleep(Duration::from_millis(600)).await;
    std::fs::remove_dir_all(root.path().join(BUILD_UUID)).unwrap();

    let data = read_until_close(stream).await;
    assert_eq!(data, b"first bytes\n");
}

#[tokio::test]
async fn test_unicode_at_read_boundary() {
    let root = tempfile::tempdir().unwrap();
    let log_file = make_job_dir(root.path(), BUILD_UUID);

    // 1023 ASCII bytes, then a three-byte Euro sign straddling the
    // 1024-byte mark.
    let mut content = "a".repeat(1023);
    content.push('\u{20ac}');
    std::fs::write(&log_file, &content).unwrap();

    let streamer = start_streamer(root.path()).await;
    let stream = request_stream(streamer.local_addr().port(), BUILD_UUID).await;
    sleep(Duration::from_millis(600)).await;
    std::fs::remove_dir_all(root.path().join(BUILD_UUID)).unwrap();

    let data = read_until_close(stream).await;
    let decoded = String::from_utf8(data).expect("stream must decode cleanly");
    assert_eq!(decoded, content);
    assert_eq!(decoded.chars().count(), 1024);
}

#[tokio::test]
async fn test_log_rotation_mid_stream() {
    let root = tempfile::tempdir().unwrap();
    let log_file = make_job_dir(root.path(), BUILD_UUID);
    std::fs::write(&log_file, b"before rotation\n").unwrap();

    let streamer = start_streamer(root.path()).await;
    let stream = request_stream(streamer.local_addr().port(), BUILD_UUID).await;
    sleep(Duration::from_millis(600)).await;

    // Replace the file; the streamer notices the inode change and
    // resumes from the start of the new file.
    let rotated = log_file.with_extension("txt.1");
    std::fs::rename(&log_file, &rotated).unwrap();
    std::fs::write(&log_file, b"after rotation\n").unwrap();
    sleep(Duration::from_millis(900)).await;
    std::fs::remove_dir_all(root.path().join(BUILD_UUID)).unwrap();

    let data = read_until_close(stream).await;
    assert_eq!(data, b"before rotation\nafter rotation\n");
}

#[tokio::test]
async fn test_client_hangup_clears_registry() {
    let root = tempfile::tempdir().unwrap();
    let log_file = make_job_dir(root.path(), BUILD_UUID);
    std::fs::write(&log_file, b"some output\n").unwrap();

    let streamer = start_streamer(root.path()).await;
    let mut stream = request_stream(streamer.local_addr().port(), BUILD_UUID).await;
    let mut buffer = [0u8; 64];
    let n = stream.read(&mut buffer).await.unwrap();
    assert!(n > 0);
    assert_eq!(streamer.active_streams(BUILD_UUID), 1);

    drop(stream);

    let mut cleared = false;
    for _ in 0..120 {
        if streamer.active_streams(BUILD_UUID) == 0 {
            cleared = true;
            break;
        }
        sleep(Duration::from_millis(250)).await;
    }
    assert!(cleared, "stream registry did not drain after hangup");

    // The log file is untouched; the build would continue unaffected.
    assert_eq!(std::fs::read(&log_file).unwrap(), b"some output\n");
}

#[tokio::test]
async fn test_invalid_build_id() {
    let root = tempfile::tempdir().unwrap();
    let streamer = start_streamer(root.path()).await;

    let stream = request_stream(streamer.local_addr().port(), "not-hex!").await;
    let data = read_until_close(stream).await;
    assert_eq!(data, b"Build ID not-hex! is not valid");
}

#[tokio::test]
async fn test_unknown_build_id() {
    let root = tempfile::tempdir().unwrap();
    let streamer = start_streamer(root.path()).await;

    let stream = request_stream(streamer.local_addr().port(), "0123456789ab").await;
    let data = read_until_close(stream).await;
    assert_eq!(data, b"Build ID 0123456789ab not found");
}

#[tokio::test]
async fn test_job_dir_with_random_suffix() {
    let root = tempfile::tempdir().unwrap();
    let suffixed = format!("{BUILD_UUID}_k3x");
    let log_file = make_job_dir(root.path(), &suffixed);
    std::fs::write(&log_file, b"suffixed\n").unwrap();

    let streamer = start_streamer(root.path()).await;
    let stream = request_stream(streamer.local_addr().port(), BUILD_UUID).await;
    sleep(Duration::from_millis(600)).await;
    std::fs::remove_dir_all(root.path().join(&suffixed)).unwrap();

    let data = read_until_close(stream).await;
    assert_eq!(data, b"suffixed\n");
}
