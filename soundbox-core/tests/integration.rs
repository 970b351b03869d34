//! Integration tests — full connection lifecycle, command round-trips,
//! and the chunked file-transfer protocol over a real TCP connection on
//! localhost, with a scripted device on the far end.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use soundbox_core::{
    Authenticator, Command, ConnectionHandler, ConnectionRegistry, DeviceClass, DeviceDirectory,
    EngineConfig, EngineContext, Frame, NotificationSink, PACKAGE_DATA_SIZE, TransferStatus,
    derive_token, time_bucket,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const SECRET_KEY: &str = "s3cr3t";
const API_KEY: &str = "apik3y";

// ── Helpers ──────────────────────────────────────────────────────

struct StaticDirectory {
    known: Vec<String>,
}

#[async_trait]
impl DeviceDirectory for StaticDirectory {
    async fn is_known(&self, serial: &str) -> bool {
        self.known.iter().any(|s| s == serial)
    }

    async fn record_offline(&self, _serial: &str) {}
}

#[derive(Default)]
struct CountingSink {
    online: AtomicU32,
    offline: AtomicU32,
    progress: AtomicU32,
    complete: AtomicU32,
    failed: AtomicU32,
}

#[async_trait]
impl NotificationSink for CountingSink {
    async fn device_online(&self, _serial: &str) {
        self.online.fetch_add(1, Ordering::SeqCst);
    }
    async fn device_offline(&self, _serial: &str) {
        self.offline.fetch_add(1, Ordering::SeqCst);
    }
    async fn download_progress(&self, _serial: &str, _percent: f32) {
        self.progress.fetch_add(1, Ordering::SeqCst);
    }
    async fn transfer_complete(&self, _serial: &str) {
        self.complete.fetch_add(1, Ordering::SeqCst);
    }
    async fn transfer_failed(&self, _serial: &str) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }
}

fn base_config() -> EngineConfig {
    EngineConfig {
        secret_key: SECRET_KEY.into(),
        api_key: API_KEY.into(),
        reply_timeout_secs: 2,
        retry_limit: 2,
        ..Default::default()
    }
}

/// Spin up an accept loop on an OS-assigned port wired to `ctx`, like
/// the production acceptor but without owning the port via the config.
async fn spawn_acceptor(ctx: EngineContext) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            ConnectionHandler::spawn(stream, ctx.clone());
        }
    });
    addr
}

async fn start_engine(
    config: EngineConfig,
    known: &[&str],
    sink: Arc<CountingSink>,
) -> (SocketAddr, EngineContext) {
    let ctx = EngineContext {
        config: Arc::new(config),
        registry: Arc::new(ConnectionRegistry::new()),
        auth: Arc::new(Authenticator::new(SECRET_KEY, API_KEY)),
        directory: Arc::new(StaticDirectory {
            known: known.iter().map(|s| s.to_string()).collect(),
        }),
        notify: sink,
    };
    let addr = spawn_acceptor(ctx.clone()).await;
    (addr, ctx)
}

/// A scripted sound box. Frames are read and written by hand because a
/// real device parses package frames by their fixed size, not by the
/// length field (which carries the package index there).
struct FakeDevice {
    stream: TcpStream,
}

impl FakeDevice {
    async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
        }
    }

    async fn send(&mut self, frame: &Frame) {
        self.stream
            .write_all(&frame.encode().unwrap())
            .await
            .unwrap();
    }

    /// Perform the login handshake and return the server's ack payload.
    async fn login(&mut self, serial: &str) -> Vec<u8> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        let token = derive_token(SECRET_KEY, serial, time_bucket(now));
        let mut payload = serial.as_bytes().to_vec();
        payload.extend_from_slice(token.as_bytes());
        payload.push(DeviceClass::WifiTest as u8);
        self.send(&Frame::new(Command::Login, payload)).await;

        let ack = self.recv().await;
        assert_eq!(ack.command, Command::Login);
        ack.payload
    }

    /// Read one frame whose length field is a real payload length.
    async fn recv(&mut self) -> Frame {
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], 0x7E);
        let len = ((header[2] as usize) << 8) | header[3] as usize;
        let mut rest = vec![0u8; len + 1];
        self.stream.read_exact(&mut rest).await.unwrap();
        assert_eq!(rest.pop(), Some(0xEF));
        Frame::new(Command::try_from(header[1]).unwrap(), rest)
    }

    /// Read one package frame. The length field carries the package
    /// index, so the caller supplies the payload size it expects.
    async fn recv_package(&mut self, payload_len: usize) -> (u16, Vec<u8>) {
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], 0x7E);
        assert_eq!(header[1], Command::FileTransProc as u8);
        let index = u16::from_be_bytes([header[2], header[3]]);
        let mut rest = vec![0u8; payload_len + 1];
        self.stream.read_exact(&mut rest).await.unwrap();
        assert_eq!(rest.pop(), Some(0xEF));
        (index, rest)
    }

    /// True once the server has closed the socket.
    async fn closed(&mut self) -> bool {
        let mut byte = [0u8; 1];
        matches!(self.stream.read(&mut byte).await, Ok(0) | Err(_))
    }
}

/// Poll until `predicate` holds or the deadline passes.
async fn wait_for(mut predicate: impl FnMut() -> bool) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}

// ── Login handshake ──────────────────────────────────────────────

#[tokio::test]
async fn login_handshake_acks_with_server_token() {
    let sink = Arc::new(CountingSink::default());
    let (addr, ctx) = start_engine(base_config(), &["DEV00001"], sink.clone()).await;

    let mut device = FakeDevice::connect(addr).await;
    let ack = device.login("DEV00001").await;

    // The ack token uses the API key; allow the neighboring buckets in
    // case the handshake straddled a boundary.
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    let bucket = time_bucket(now);
    let candidates: Vec<Vec<u8>> = [bucket - 10, bucket, bucket + 10]
        .iter()
        .map(|b| derive_token(API_KEY, "DEV00001", *b).into_bytes())
        .collect();
    assert!(candidates.contains(&ack));

    wait_for(|| ctx.registry.is_online("DEV00001")).await;
    assert_eq!(sink.online.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_serial_is_disconnected() {
    let sink = Arc::new(CountingSink::default());
    let (addr, ctx) = start_engine(base_config(), &["DEV00001"], sink).await;

    let mut device = FakeDevice::connect(addr).await;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    let token = derive_token(SECRET_KEY, "STRANGER", time_bucket(now));
    let mut payload = b"STRANGER".to_vec();
    payload.extend_from_slice(token.as_bytes());
    payload.push(DeviceClass::WifiTest as u8);
    device.send(&Frame::new(Command::Login, payload)).await;

    assert!(device.closed().await);
    assert!(!ctx.registry.is_online("STRANGER"));
}

#[tokio::test]
async fn unauthenticated_connection_times_out() {
    let config = EngineConfig {
        login_timeout_secs: 1,
        ..base_config()
    };
    let sink = Arc::new(CountingSink::default());
    let (addr, _ctx) = start_engine(config, &["DEV00001"], sink).await;

    let mut device = FakeDevice::connect(addr).await;
    let closed = tokio::time::timeout(Duration::from_secs(5), device.closed())
        .await
        .expect("login watchdog did not fire");
    assert!(closed);
}

#[tokio::test]
async fn duplicate_login_evicts_older_connection() {
    let sink = Arc::new(CountingSink::default());
    let (addr, ctx) = start_engine(base_config(), &["DEV00001"], sink).await;

    let mut first = FakeDevice::connect(addr).await;
    first.login("DEV00001").await;
    wait_for(|| ctx.registry.is_online("DEV00001")).await;

    let mut second = FakeDevice::connect(addr).await;
    second.login("DEV00001").await;

    // The older socket is closed; the serial stays online through the
    // newer connection.
    assert!(first.closed().await);
    wait_for(|| ctx.registry.is_online("DEV00001")).await;
    assert_eq!(ctx.registry.count(), 1);
}

// ── Command round-trips ──────────────────────────────────────────

#[tokio::test]
async fn volume_command_round_trip() {
    let sink = Arc::new(CountingSink::default());
    let (addr, ctx) = start_engine(base_config(), &["DEV00001"], sink).await;

    let mut device = FakeDevice::connect(addr).await;
    device.login("DEV00001").await;
    wait_for(|| ctx.registry.is_online("DEV00001")).await;
    let handler = ctx.registry.lookup("DEV00001").unwrap();

    let call = tokio::spawn(async move { handler.set_volume(0x0F).await });

    let frame = device.recv().await;
    assert_eq!(frame.command, Command::Volume);
    assert_eq!(frame.payload, vec![0x00, 0x0F]);
    device.send(&frame).await;

    assert!(call.await.unwrap());
}

#[tokio::test]
async fn read_files_list_returns_count() {
    let sink = Arc::new(CountingSink::default());
    let (addr, ctx) = start_engine(base_config(), &["DEV00001"], sink).await;

    let mut device = FakeDevice::connect(addr).await;
    device.login("DEV00001").await;
    wait_for(|| ctx.registry.is_online("DEV00001")).await;
    let handler = ctx.registry.lookup("DEV00001").unwrap();

    let call = tokio::spawn(async move { handler.read_files_list().await });

    let frame = device.recv().await;
    assert_eq!(frame.command, Command::ReadFilesList);
    // 300 files: a count the historical OR-combine could not report.
    device
        .send(&Frame::new(Command::ReadFilesList, vec![0x01, 0x2C]))
        .await;

    assert_eq!(call.await.unwrap(), Some(300));
}

#[tokio::test]
async fn unanswered_command_reports_failure() {
    let config = EngineConfig {
        reply_timeout_secs: 1,
        retry_limit: 1,
        ..base_config()
    };
    let sink = Arc::new(CountingSink::default());
    let (addr, ctx) = start_engine(config, &["DEV00001"], sink).await;

    let mut device = FakeDevice::connect(addr).await;
    device.login("DEV00001").await;
    wait_for(|| ctx.registry.is_online("DEV00001")).await;
    let handler = ctx.registry.lookup("DEV00001").unwrap();

    // The device swallows the frame and never answers.
    let ok = tokio::time::timeout(Duration::from_secs(10), handler.play())
        .await
        .expect("retry budget did not bound the wait");
    assert!(!ok);
    let _ = device.recv().await;
}

#[tokio::test]
async fn heartbeat_is_echoed() {
    let sink = Arc::new(CountingSink::default());
    let (addr, ctx) = start_engine(base_config(), &["DEV00001"], sink).await;

    let mut device = FakeDevice::connect(addr).await;
    device.login("DEV00001").await;
    wait_for(|| ctx.registry.is_online("DEV00001")).await;

    device.send(&Frame::empty(Command::Heartbeat)).await;
    let echo = device.recv().await;
    assert_eq!(echo.command, Command::Heartbeat);
    assert!(echo.payload.is_empty());
}

#[tokio::test]
async fn silent_device_is_evicted_by_heartbeat_watchdog() {
    let config = EngineConfig {
        heartbeat_delay_secs: 1,
        heartbeat_period_secs: 1,
        heartbeat_max_missed: 1,
        ..base_config()
    };
    let sink = Arc::new(CountingSink::default());
    let (addr, ctx) = start_engine(config, &["DEV00001"], sink.clone()).await;

    let mut device = FakeDevice::connect(addr).await;
    device.login("DEV00001").await;
    wait_for(|| ctx.registry.is_online("DEV00001")).await;

    let closed = tokio::time::timeout(Duration::from_secs(10), device.closed())
        .await
        .expect("heartbeat watchdog did not fire");
    assert!(closed);
    wait_for(|| !ctx.registry.is_online("DEV00001")).await;
    assert_eq!(sink.offline.load(Ordering::SeqCst), 1);
}

// ── File transfer ────────────────────────────────────────────────

#[tokio::test]
async fn file_transfer_delivers_five_packages() {
    let sink = Arc::new(CountingSink::default());
    let (addr, ctx) = start_engine(base_config(), &["DEV00001"], sink.clone()).await;

    let mut device = FakeDevice::connect(addr).await;
    device.login("DEV00001").await;
    wait_for(|| ctx.registry.is_online("DEV00001")).await;

    let content: Vec<u8> = (0..5000).map(|i| (i * 31) as u8).collect();
    let completion = ctx
        .registry
        .enqueue_transfer("DEV00001", &content)
        .expect("device is online");

    // Announce: file number 1, five packages.
    let announce = device.recv().await;
    assert_eq!(announce.command, Command::FileTransReq);
    assert_eq!(announce.payload, vec![0x01, 0x00, 0x05]);
    device
        .send(&Frame::new(Command::FileTransReq, vec![0x00, 0x00]))
        .await;

    // Five packages, each acked by its index.
    let mut received = Vec::new();
    for i in 1u16..=5 {
        let data_len = if i < 5 {
            PACKAGE_DATA_SIZE
        } else {
            5000 - 4 * PACKAGE_DATA_SIZE
        };
        let (index, mut payload) = device.recv_package(data_len + 1).await;
        assert_eq!(index, i);
        let check = payload.pop().unwrap();
        assert_eq!(
            check,
            payload.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
        );
        received.extend_from_slice(&payload);
        device
            .send(&Frame::new(Command::FileTransReq, index.to_be_bytes().to_vec()))
            .await;
    }
    assert_eq!(received, content);

    // End-of-file report for file 1, then the all-done report.
    let eof = device.recv().await;
    assert_eq!(eof.command, Command::FileTransRpt);
    assert_eq!(eof.payload, vec![0x00, 0x01]);
    device.send(&eof).await;

    let done = device.recv().await;
    assert_eq!(done.command, Command::FileTransRpt);
    assert_eq!(done.payload, vec![0x00, 0x00]);
    device.send(&done).await;

    assert_eq!(completion.await.unwrap(), TransferStatus::Success);
    assert_eq!(sink.progress.load(Ordering::SeqCst), 5);
    assert_eq!(sink.complete.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn transfer_error_frame_fails_the_job() {
    let config = EngineConfig {
        reply_timeout_secs: 1,
        retry_limit: 1,
        ..base_config()
    };
    let sink = Arc::new(CountingSink::default());
    let (addr, ctx) = start_engine(config, &["DEV00001"], sink.clone()).await;

    let mut device = FakeDevice::connect(addr).await;
    device.login("DEV00001").await;
    wait_for(|| ctx.registry.is_online("DEV00001")).await;

    let completion = ctx
        .registry
        .enqueue_transfer("DEV00001", b"payload")
        .expect("device is online");

    let announce = device.recv().await;
    assert_eq!(announce.command, Command::FileTransReq);
    device
        .send(&Frame::new(Command::FileTransErr, vec![0x01]))
        .await;

    let status = tokio::time::timeout(Duration::from_secs(10), completion)
        .await
        .expect("transfer did not settle")
        .unwrap();
    assert_eq!(status, TransferStatus::Failed);
    wait_for(|| sink.failed.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn closing_the_connection_fails_queued_transfers() {
    let config = EngineConfig {
        reply_timeout_secs: 1,
        retry_limit: 1,
        ..base_config()
    };
    let sink = Arc::new(CountingSink::default());
    let (addr, ctx) = start_engine(config, &["DEV00001"], sink).await;

    let mut device = FakeDevice::connect(addr).await;
    device.login("DEV00001").await;
    wait_for(|| ctx.registry.is_online("DEV00001")).await;
    let handler = ctx.registry.lookup("DEV00001").unwrap();

    let first = handler.enqueue_transfer(b"first").unwrap();
    let second = handler.enqueue_transfer(b"second").unwrap();
    handler.close();

    let first = tokio::time::timeout(Duration::from_secs(10), first)
        .await
        .expect("first job did not settle")
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(10), second)
        .await
        .expect("second job did not settle")
        .unwrap();
    assert_eq!(first, TransferStatus::Failed);
    assert_eq!(second, TransferStatus::Failed);
    wait_for(|| !ctx.registry.is_online("DEV00001")).await;
    drop(device);
}
