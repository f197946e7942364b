//! Acceptor and session-loop tests over loopback TCP, with a stub intake so
//! no database is needed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use portway_bridge::config::ServerConfig;
use portway_bridge::error::BridgeError;
use portway_bridge::registry::ConnectionRegistry;
use portway_bridge::server::{JobIntake, TcpServer};
use portway_proto::{read_frame, write_frame, FrameHeader, FrameType, MAX_FRAME_SIZE};

/// Intake stub that records staged payloads.
struct RecordingIntake {
    staged: tokio::sync::Mutex<Vec<(u16, Vec<u8>)>>,
}

impl RecordingIntake {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            staged: tokio::sync::Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl JobIntake for RecordingIntake {
    async fn stage(&self, client_port: u16, payload: Vec<u8>) -> Result<i64, BridgeError> {
        let mut staged = self.staged.lock().await;
        staged.push((client_port, payload));
        Ok(staged.len() as i64)
    }
}

fn test_config(read_timeout: Duration, max_connections: usize) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_owned(),
        port: 0,
        read_timeout,
        keep_alive: false,
        max_connections,
        ..ServerConfig::default()
    }
}

struct Harness {
    addr: std::net::SocketAddr,
    registry: Arc<ConnectionRegistry>,
    intake: Arc<RecordingIntake>,
    cancel: CancellationToken,
    server: tokio::task::JoinHandle<Result<(), BridgeError>>,
}

impl Harness {
    async fn start(config: ServerConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let intake = RecordingIntake::new();
        let cancel = CancellationToken::new();

        let server = TcpServer::bind(config, Arc::clone(&registry), intake.clone())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let server = tokio::spawn(server.run(cancel.clone()));

        Self {
            addr,
            registry,
            intake,
            cancel,
            server,
        }
    }

    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.server.await;
    }
}

#[tokio::test]
async fn quiet_socket_receives_ping() {
    let harness = Harness::start(test_config(Duration::from_millis(100), 16)).await;

    let mut client = TcpStream::connect(harness.addr).await.unwrap();

    // Say nothing; the server's read deadline expires and it probes us.
    let frame = timeout(Duration::from_secs(2), read_frame(&mut client))
        .await
        .expect("no ping within the probe window")
        .unwrap();
    assert_eq!(frame.frame_type, FrameType::Ping);

    // The probe does not evict: the connection stays registered.
    assert_eq!(harness.registry.count(), 1);

    harness.stop().await;
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let harness = Harness::start(test_config(Duration::from_secs(5), 16)).await;

    let mut client = TcpStream::connect(harness.addr).await.unwrap();
    write_frame(&mut client, FrameType::Ping, &[]).await.unwrap();

    let frame = timeout(Duration::from_secs(2), read_frame(&mut client))
        .await
        .expect("no pong")
        .unwrap();
    assert_eq!(frame.frame_type, FrameType::Pong);

    harness.stop().await;
}

#[tokio::test]
async fn request_frames_are_staged_with_the_source_port() {
    let harness = Harness::start(test_config(Duration::from_secs(5), 16)).await;

    let mut client = TcpStream::connect(harness.addr).await.unwrap();
    let client_port = client.local_addr().unwrap().port();

    write_frame(&mut client, FrameType::Request, b"\xDE\xAD\xBE\xEF")
        .await
        .unwrap();

    // Staging is asynchronous to the write; poll briefly.
    let mut staged = Vec::new();
    for _ in 0..50 {
        staged = harness.intake.staged.lock().await.clone();
        if !staged.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(staged.len(), 1);
    assert_eq!(staged[0].0, client_port);
    assert_eq!(staged[0].1, b"\xDE\xAD\xBE\xEF");

    harness.stop().await;
}

#[tokio::test]
async fn oversize_frame_drops_only_that_connection() {
    let harness = Harness::start(test_config(Duration::from_secs(5), 16)).await;

    let mut victim = TcpStream::connect(harness.addr).await.unwrap();
    let mut bystander = TcpStream::connect(harness.addr).await.unwrap();

    // Wait for both sessions to register before poisoning one.
    for _ in 0..50 {
        if harness.registry.count() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(harness.registry.count(), 2);

    // Header declaring a payload one byte over the cap.
    let mut header = FrameHeader::new(FrameType::Request, 0).encode();
    let oversize = (MAX_FRAME_SIZE as u32) + 1;
    header[2..6].copy_from_slice(&oversize.to_be_bytes());
    victim.write_all(&header).await.unwrap();

    // The server rejects the header and closes the session; our next read
    // sees EOF.
    let result = timeout(Duration::from_secs(2), read_frame(&mut victim))
        .await
        .expect("connection not closed");
    assert!(result.is_err());

    for _ in 0..50 {
        if harness.registry.count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(harness.registry.count(), 1);

    // The bystander still gets service.
    write_frame(&mut bystander, FrameType::Ping, &[]).await.unwrap();
    let frame = timeout(Duration::from_secs(2), read_frame(&mut bystander))
        .await
        .expect("bystander lost service")
        .unwrap();
    assert_eq!(frame.frame_type, FrameType::Pong);

    harness.stop().await;
}

#[tokio::test]
async fn connection_cap_rejects_overflow() {
    let harness = Harness::start(test_config(Duration::from_secs(5), 1)).await;

    let mut first = TcpStream::connect(harness.addr).await.unwrap();
    for _ in 0..50 {
        if harness.registry.count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(harness.registry.count(), 1);

    // The second connection is accepted at the OS level and immediately
    // closed without registration.
    let mut second = TcpStream::connect(harness.addr).await.unwrap();
    let result = timeout(Duration::from_secs(2), read_frame(&mut second))
        .await
        .expect("overflow connection not closed");
    assert!(result.is_err());
    assert_eq!(harness.registry.count(), 1);

    // The first connection is unaffected.
    write_frame(&mut first, FrameType::Ping, &[]).await.unwrap();
    let frame = read_frame(&mut first).await.unwrap();
    assert_eq!(frame.frame_type, FrameType::Pong);

    harness.stop().await;
}

#[tokio::test]
async fn shutdown_unregisters_sessions() {
    let harness = Harness::start(test_config(Duration::from_secs(5), 16)).await;

    let mut clients = Vec::new();
    for _ in 0..4 {
        clients.push(TcpStream::connect(harness.addr).await.unwrap());
    }
    for _ in 0..50 {
        if harness.registry.count() == 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(harness.registry.count(), 4);

    let registry = Arc::clone(&harness.registry);
    harness.stop().await;

    // Every read loop observed the cancellation and unregistered itself.
    assert_eq!(registry.count(), 0);
}
