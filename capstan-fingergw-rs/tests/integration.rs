//! Zone-aware routing tests: one fake executor streamer, three gateways.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use capstan_fingergw_rs::{Config, Service};
use capstan_rs::queue::{BuildQueue, MemoryQueue};
use capstan_rs::registry::{MemoryRegistry, ZoneRegistry};
use capstan_rs::types::{
    BuildParams, BuildRequest, BuildRequestState, WorkerInfo,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const BUILD_UUID: &str = "abcdef012345";

/// A stand-in for an executor's log streamer: answers any request with a
/// fixed payload.
async fn fake_finger_server(payload: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { return };
            tokio::spawn(async move {
                let mut line = Vec::new();
                let mut byte = [0u8; 1];
                while let Ok(1) = stream.read(&mut byte).await {
                    if byte[0] == b'\n' {
                        break;
                    }
                    line.push(byte[0]);
                }
                let _ = stream.write_all(payload).await;
            });
        }
    });
    addr
}

async fn running_request(queue: &MemoryQueue, zone: &str, streamer: SocketAddr) {
    let mut request = BuildRequest {
        uuid: BUILD_UUID.to_string(),
        tenant: "acme".to_string(),
        pipeline: "gate".to_string(),
        job_name: "unit".to_string(),
        build_set_uuid: "bs01".to_string(),
        event_id: "ev01".to_string(),
        zone: Some(zone.to_string()),
        state: BuildRequestState::Requested,
        worker_info: None,
        attempts: 1,
        max_attempts: 3,
        sequence: 0,
    };
    queue.submit(request.clone(), BuildParams::default());
    assert!(queue.lock(&request, false).await.unwrap());
    request.state = BuildRequestState::Running;
    request.worker_info = Some(WorkerInfo {
        hostname: streamer.ip().to_string(),
        log_port: streamer.port(),
    });
    queue.update(&request).await.unwrap();
}

async fn fetch(gateway: SocketAddr, uuid: &str) -> Vec<u8> {
    let mut stream = TcpStream::connect(gateway).await.unwrap();
    stream.write_all(format!("{uuid}\n").as_bytes()).await.unwrap();
    let mut data = Vec::new();
    timeout(Duration::from_secs(10), stream.read_to_end(&mut data))
        .await
        .expect("gateway did not close the stream")
        .unwrap();
    data
}

fn gateway_config(zone: Option<&str>) -> Config {
    Config {
        listen_address: "127.0.0.1".parse().unwrap(),
        port: 0,
        user: None,
        zone: zone.map(str::to_string),
    }
}

#[tokio::test]
async fn test_zoned_routing() {
    let executor = fake_finger_server(b"live log bytes").await;
    let queue = MemoryQueue::new();
    running_request(&queue, "eu-central", executor).await;
    let registry = MemoryRegistry::new();

    let unzoned = Service::start(
        gateway_config(None),
        Arc::new(queue.clone()),
        Arc::new(registry.clone()),
    )
    .await
    .unwrap();
    let us_west = Service::start(
        gateway_config(Some("us-west")),
        Arc::new(queue.clone()),
        Arc::new(registry.clone()),
    )
    .await
    .unwrap();

    // Before the eu-central gateway registers, the us-west gateway serves
    // the stream itself: one hop.
    assert_eq!(fetch(us_west.local_addr(), BUILD_UUID).await, b"live log bytes");

    // Once a gateway is registered for the build's zone, other zones
    // forward to it instead of connecting directly.
    let peer = fake_finger_server(b"via peer gateway").await;
    registry.register("eu-central", peer).await.unwrap();
    assert_eq!(fetch(us_west.local_addr(), BUILD_UUID).await, b"via peer gateway");

    // A real eu-central gateway takes over the registration and relays
    // from the executor: two hops end to end.
    let eu_central = Service::start(
        gateway_config(Some("eu-central")),
        Arc::new(queue.clone()),
        Arc::new(registry.clone()),
    )
    .await
    .unwrap();
    assert_eq!(
        registry.lookup("eu-central").await.unwrap(),
        Some(eu_central.local_addr())
    );
    assert_eq!(fetch(us_west.local_addr(), BUILD_UUID).await, b"live log bytes");

    // The unzoned gateway never hops into a zone.
    assert_eq!(fetch(unzoned.local_addr(), BUILD_UUID).await, b"live log bytes");

    // A gateway in the build's own zone serves directly.
    assert_eq!(fetch(eu_central.local_addr(), BUILD_UUID).await, b"live log bytes");

    eu_central.stop().await;
    assert_eq!(registry.lookup("eu-central").await.unwrap(), None);
    us_west.stop().await;
    unzoned.stop().await;
}

#[tokio::test]
async fn test_error_lines() {
    let queue = MemoryQueue::new();
    let registry = MemoryRegistry::new();
    let gateway = Service::start(
        gateway_config(None),
        Arc::new(queue.clone()),
        Arc::new(registry),
    )
    .await
    .unwrap();

    assert_eq!(
        fetch(gateway.local_addr(), "nothex!").await,
        b"Build ID nothex! is not valid"
    );
    assert_eq!(
        fetch(gateway.local_addr(), "0123456789ab").await,
        b"Build ID 0123456789ab not found"
    );
    gateway.stop().await;
}

#[tokio::test]
async fn test_terminal_build_not_streamed() {
    let executor = fake_finger_server(b"stale").await;
    let queue = MemoryQueue::new();
    running_request(&queue, "eu-central", executor).await;

    // Drive the request to COMPLETED; streaming must now refuse.
    let mut request = queue.lookup(BUILD_UUID).await.unwrap().unwrap();
    request.state = BuildRequestState::Completed;
    queue.update(&request).await.unwrap();

    let registry = MemoryRegistry::new();
    let gateway = Service::start(
        gateway_config(None),
        Arc::new(queue.clone()),
        Arc::new(registry),
    )
    .await
    .unwrap();
    assert_eq!(
        fetch(gateway.local_addr(), BUILD_UUID).await,
        format!("Build ID {BUILD_UUID} not found").as_bytes()
    );
    gateway.stop().await;
}
