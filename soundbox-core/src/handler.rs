//! Per-connection protocol engine.
//!
//! A handler owns one device socket and runs four cooperating loops —
//! receive/framing, inbound dispatch, outbound send, file delivery —
//! plus a login watchdog and a heartbeat watchdog, all sharing one
//! cancellation token. Triggering that token is the single source of
//! truth for "this connection is closing": every loop observes it and
//! exits without further I/O, and a teardown task unwinds the shared
//! state (pending tokens, registry entry, last-seen persistence).
//!
//! Lifecycle: `Unauthenticated → Online` on a valid login frame,
//! `→ Closed` on socket error, heartbeat overflow, duplicate-login
//! eviction, or an explicit close. `Closed` is terminal; a handler is
//! never reused.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::command::{Command, DeviceClass};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::external::{DeviceDirectory, NotificationSink};
use crate::frame::{Frame, FrameDecoder};
use crate::registry::ConnectionRegistry;
use crate::retry::Retry;
use crate::token::{PendingRegistry, RequestToken, TokenStatus};
use crate::transfer::{TransferCompletion, TransferJob};

// ── EngineContext ────────────────────────────────────────────────

/// Everything a connection needs from the rest of the process.
#[derive(Clone)]
pub struct EngineContext {
    pub config: Arc<EngineConfig>,
    pub registry: Arc<ConnectionRegistry>,
    pub auth: Arc<Authenticator>,
    pub directory: Arc<dyn DeviceDirectory>,
    pub notify: Arc<dyn NotificationSink>,
}

// ── Outbound ─────────────────────────────────────────────────────

/// One frame queued for the send loop, pre-encoded, optionally carrying
/// the token whose status tracks the send.
#[derive(Debug)]
struct Outbound {
    command: Command,
    bytes: Vec<u8>,
    token: Option<Arc<RequestToken>>,
}

impl Outbound {
    fn new(frame: &Frame, token: Option<Arc<RequestToken>>) -> Result<Self, EngineError> {
        Ok(Self {
            command: frame.command,
            bytes: frame.encode()?,
            token,
        })
    }

    /// A package frame: the length field carries the package index.
    fn package(index: u16, payload: Vec<u8>, token: Arc<RequestToken>) -> Self {
        let frame = Frame::new(Command::FileTransProc, payload);
        Self {
            command: frame.command,
            bytes: frame.encode_with_index(index),
            token: Some(token),
        }
    }
}

// ── ConnectionHandler ────────────────────────────────────────────

/// One live device connection.
pub struct ConnectionHandler {
    peer: SocketAddr,
    serial: RwLock<String>,
    device_class: RwLock<Option<DeviceClass>>,
    cancel: CancellationToken,
    outbox: mpsc::Sender<Outbound>,
    transfers: mpsc::Sender<TransferJob>,
    pending: PendingRegistry,
    heartbeat: Retry,
    delivered_files: AtomicU32,
    ctx: EngineContext,
}

impl ConnectionHandler {
    /// Take ownership of an accepted socket and start the connection's
    /// task group. The handler is not registered until login succeeds.
    pub fn spawn(stream: TcpStream, ctx: EngineContext) -> Arc<Self> {
        let peer = stream
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let (read_half, write_half) = stream.into_split();

        let depth = ctx.config.queue_depth;
        let (outbox_tx, outbox_rx) = mpsc::channel(depth);
        let (transfer_tx, transfer_rx) = mpsc::channel(depth);
        let (inbound_tx, inbound_rx) = mpsc::channel(depth);

        let handler = Arc::new(Self {
            peer,
            serial: RwLock::new(String::new()),
            device_class: RwLock::new(None),
            cancel: CancellationToken::new(),
            outbox: outbox_tx,
            transfers: transfer_tx,
            pending: PendingRegistry::new(),
            heartbeat: Retry::new(
                ctx.config.heartbeat_max_missed,
                ctx.config.heartbeat_period(),
            ),
            delivered_files: AtomicU32::new(0),
            ctx,
        });

        info!(peer = %peer, "device connected");
        tokio::spawn(Arc::clone(&handler).receive_loop(read_half, inbound_tx));
        tokio::spawn(Arc::clone(&handler).inbound_loop(inbound_rx));
        tokio::spawn(Arc::clone(&handler).outbound_loop(write_half, outbox_rx));
        tokio::spawn(Arc::clone(&handler).delivery_loop(transfer_rx));
        tokio::spawn(Arc::clone(&handler).login_watchdog());
        tokio::spawn(Arc::clone(&handler).heartbeat_watchdog());
        tokio::spawn(Arc::clone(&handler).teardown());
        handler
    }

    // ── Accessors ────────────────────────────────────────────────

    /// Serial number; empty until login completes.
    pub fn serial(&self) -> String {
        self.serial.read().unwrap().clone()
    }

    pub fn device_class(&self) -> Option<DeviceClass> {
        *self.device_class.read().unwrap()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn delivered_files(&self) -> u32 {
        self.delivered_files.load(Ordering::Acquire)
    }

    /// Close the connection. Idempotent; cascades through every loop.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Passive liveness query for the supervisor: has the heartbeat
    /// watchdog already run out of patience?
    pub fn heartbeat_lapsed(&self) -> bool {
        self.heartbeat.is_overflow()
    }

    fn display_name(&self) -> String {
        let serial = self.serial();
        if serial.is_empty() {
            format!("@{}", self.peer)
        } else {
            serial
        }
    }

    // ── Receive loop ─────────────────────────────────────────────

    async fn receive_loop(
        self: Arc<Self>,
        read_half: OwnedReadHalf,
        inbound_tx: mpsc::Sender<Frame>,
    ) {
        let mut frames = FramedRead::new(read_half, FrameDecoder);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = frames.next() => match next {
                    Some(Ok(frame)) => {
                        if inbound_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        warn!(device = %self.display_name(), %err, "socket read failed");
                        break;
                    }
                    None => {
                        debug!(device = %self.display_name(), "peer closed the connection");
                        break;
                    }
                },
            }
        }
        self.cancel.cancel();
    }

    // ── Inbound dispatch loop ────────────────────────────────────

    async fn inbound_loop(self: Arc<Self>, mut inbound_rx: mpsc::Receiver<Frame>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = inbound_rx.recv() => match frame {
                    Some(frame) => self.dispatch(frame).await,
                    None => break,
                },
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, frame: Frame) {
        // Any inbound traffic proves the device alive.
        self.heartbeat.reset();
        debug!(
            device = %self.display_name(),
            command = %frame.command,
            len = frame.payload.len(),
            "recv",
        );
        match frame.command {
            Command::Login => self.handle_login(frame.payload).await,
            Command::Heartbeat => {
                self.send_frame(Frame::empty(Command::Heartbeat)).await;
            }
            Command::FileTransErr => {
                self.pending.fail(Command::FileTransErr, &frame.payload);
            }
            other => {
                self.pending.resolve(other, &frame.payload);
            }
        }
    }

    async fn handle_login(self: &Arc<Self>, payload: Vec<u8>) {
        if !self.serial().is_empty() {
            // Already online; the firmware occasionally re-sends login.
            return;
        }
        let login = match self.ctx.auth.verify(&payload) {
            Ok(login) => login,
            Err(err) => {
                warn!(peer = %self.peer, %err, "login rejected");
                self.close();
                return;
            }
        };
        if !self.ctx.directory.is_known(&login.serial).await {
            warn!(serial = %login.serial, peer = %self.peer, "login from unprovisioned serial");
            self.close();
            return;
        }

        *self.serial.write().unwrap() = login.serial.clone();
        *self.device_class.write().unwrap() = Some(login.device_class);
        self.ctx.registry.insert(&login.serial, Arc::clone(self));
        info!(
            serial = %login.serial,
            peer = %self.peer,
            class = %login.device_class,
            online = self.ctx.registry.count(),
            "device logged in",
        );
        self.ctx.notify.device_online(&login.serial).await;

        let ack = Frame::new(Command::Login, self.ctx.auth.ack_token(&login.serial));
        self.send_frame(ack).await;
    }

    // ── Outbound send loop ───────────────────────────────────────

    async fn outbound_loop(
        self: Arc<Self>,
        mut write_half: OwnedWriteHalf,
        mut outbox_rx: mpsc::Receiver<Outbound>,
    ) {
        let send_timeout = self.ctx.config.send_timeout();
        loop {
            let out = tokio::select! {
                _ = self.cancel.cancelled() => break,
                out = outbox_rx.recv() => match out {
                    Some(out) => out,
                    None => break,
                },
            };
            if let Some(token) = &out.token {
                token.advance(TokenStatus::Sending);
            }
            match tokio::time::timeout(send_timeout, write_half.write_all(&out.bytes)).await {
                Ok(Ok(())) => {
                    debug!(
                        device = %self.display_name(),
                        command = %out.command,
                        len = out.bytes.len(),
                        "sent",
                    );
                    if let Some(token) = &out.token {
                        token.advance(TokenStatus::Sent);
                    }
                }
                Ok(Err(err)) => {
                    warn!(device = %self.display_name(), %err, "socket write failed");
                    if let Some(token) = &out.token {
                        token.fail(&[]);
                    }
                    break;
                }
                Err(_) => {
                    warn!(device = %self.display_name(), "socket write timed out");
                    if let Some(token) = &out.token {
                        token.fail(&[]);
                    }
                    break;
                }
            }
        }
        self.cancel.cancel();
    }

    // ── File delivery loop ───────────────────────────────────────

    async fn delivery_loop(self: Arc<Self>, mut transfer_rx: mpsc::Receiver<TransferJob>) {
        loop {
            let mut job = tokio::select! {
                _ = self.cancel.cancelled() => break,
                job = transfer_rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            let serial = self.serial();
            if self.deliver(&mut job).await {
                self.delivered_files.fetch_add(1, Ordering::AcqRel);
                job.succeed();
                info!(serial = %serial, "file transfer complete");
                self.ctx.notify.transfer_complete(&serial).await;
                if transfer_rx.is_empty() && !self.report_all_done().await {
                    warn!(serial = %serial, "all-files-complete report unacknowledged");
                }
            } else {
                job.fail();
                warn!(serial = %serial, "file transfer failed");
                self.ctx.notify.transfer_failed(&serial).await;
            }
        }
        // Connection is closing: release every waiter still queued.
        transfer_rx.close();
        while let Ok(mut job) = transfer_rx.try_recv() {
            job.fail();
        }
    }

    /// Run the chunked delivery protocol for one job. Any step
    /// exhausting its retries fails the whole job.
    async fn deliver(&self, job: &mut TransferJob) -> bool {
        let serial = self.serial();
        let file_no = (self.delivered_files() + 1) as u8;
        let count = job.package_count();
        debug!(serial = %serial, file_no, packages = count, "starting file transfer");

        // Announce the file: index plus package count.
        let announce = Frame::new(
            Command::FileTransReq,
            vec![file_no, (count >> 8) as u8, count as u8],
        );
        if !self
            .reliable_step(&announce, None, Command::FileTransReq, vec![0x00, 0x00])
            .await
        {
            return false;
        }

        // Push the packages in order, each acked by its index.
        let mut index: u16 = 0;
        while let Some(package) = job.pop_package() {
            index += 1;
            self.ctx
                .notify
                .download_progress(&serial, 100.0 * f32::from(index) / f32::from(count))
                .await;
            let frame = Frame::new(Command::FileTransProc, package);
            if !self
                .reliable_step(
                    &frame,
                    Some(index),
                    Command::FileTransReq,
                    vec![(index >> 8) as u8, index as u8],
                )
                .await
            {
                return false;
            }
        }

        // End-of-file report for this file index.
        let report = Frame::new(Command::FileTransRpt, vec![0x00, file_no]);
        self.reliable_step(&report, None, Command::FileTransRpt, vec![0x00, file_no])
            .await
    }

    /// The `[0x00, 0x00]` sentinel report: every queued file delivered.
    async fn report_all_done(&self) -> bool {
        let report = Frame::new(Command::FileTransRpt, vec![0x00, 0x00]);
        self.reliable_step(&report, None, Command::FileTransRpt, vec![0x00, 0x00])
            .await
    }

    /// Send one transfer-protocol frame and wait for its validated
    /// acknowledgement, resending up to the retry limit.
    async fn reliable_step(
        &self,
        frame: &Frame,
        package_index: Option<u16>,
        expect: Command,
        expect_reply: Vec<u8>,
    ) -> bool {
        let config = &self.ctx.config;
        let resend = Retry::new(config.retry_limit, config.reply_timeout());
        loop {
            if self.cancel.is_cancelled() || !resend.attempt() {
                return false;
            }
            let token = RequestToken::new(
                expect,
                Some(Command::FileTransErr),
                Some(expect_reply.clone()),
            );
            self.pending.register(Arc::clone(&token));
            let out = match package_index {
                Some(index) => Outbound::package(index, frame.payload.clone(), Arc::clone(&token)),
                None => match Outbound::new(frame, Some(Arc::clone(&token))) {
                    Ok(out) => out,
                    Err(_) => return false,
                },
            };
            if self.outbox.send(out).await.is_err() {
                return false;
            }
            token
                .wait_sent(&Retry::new(config.retry_limit, config.send_timeout()))
                .await;
            token
                .wait_replied(&Retry::new(config.retry_limit, config.reply_timeout()))
                .await;
            if token.check_reply(None) {
                return true;
            }
            debug!(
                device = %self.display_name(),
                command = %frame.command,
                "transfer step unacknowledged, retrying",
            );
        }
    }

    // ── Watchdogs ────────────────────────────────────────────────

    async fn login_watchdog(self: Arc<Self>) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(self.ctx.config.login_timeout()) => {
                if self.serial().is_empty() {
                    warn!(peer = %self.peer, "login timeout");
                    self.cancel.cancel();
                }
            }
        }
    }

    async fn heartbeat_watchdog(self: Arc<Self>) {
        let start = tokio::time::Instant::now() + self.ctx.config.heartbeat_delay();
        let mut ticks = tokio::time::interval_at(start, self.ctx.config.heartbeat_period());
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticks.tick() => {
                    if !self.heartbeat.attempt() {
                        warn!(device = %self.display_name(), "heartbeat lapsed, closing");
                        self.cancel.cancel();
                        return;
                    }
                }
            }
        }
    }

    // ── Teardown ─────────────────────────────────────────────────

    async fn teardown(self: Arc<Self>) {
        self.cancel.cancelled().await;
        self.pending.cancel_all();
        let serial = self.serial();
        // An evicted duplicate must not report the device offline; the
        // serial is still online through its replacement.
        if !serial.is_empty() && self.ctx.registry.remove_if(&serial, &self) {
            self.ctx.directory.record_offline(&serial).await;
            self.ctx.notify.device_offline(&serial).await;
        }
        info!(device = %self.display_name(), peer = %self.peer, "device disconnected");
    }

    // ── Outbound helpers ─────────────────────────────────────────

    async fn send_frame(&self, frame: Frame) -> bool {
        match Outbound::new(&frame, None) {
            Ok(out) => self.outbox.send(out).await.is_ok(),
            Err(_) => false,
        }
    }

    /// Send `command` and wait for the device's echo, returning the
    /// reply payload. `None` means the device never answered within the
    /// retry budget — an ordinary outcome, not an error.
    async fn request(&self, command: Command, payload: Vec<u8>) -> Option<Vec<u8>> {
        let token = RequestToken::new(command, None, None);
        self.pending.register(Arc::clone(&token));
        let out = match Outbound::new(&Frame::new(command, payload), Some(Arc::clone(&token))) {
            Ok(out) => out,
            Err(_) => return None,
        };
        if self.outbox.send(out).await.is_err() {
            return None;
        }
        let retry = Retry::new(self.ctx.config.retry_limit, self.ctx.config.reply_timeout());
        if token.wait_replied(&retry).await == TokenStatus::Replied {
            token.reply()
        } else {
            None
        }
    }

    /// A request whose reply is only valid when it echoes the request
    /// payload byte for byte.
    async fn request_echoed(&self, command: Command, payload: Vec<u8>) -> bool {
        let expected = payload.clone();
        self.request(command, payload)
            .await
            .is_some_and(|reply| reply == expected)
    }

    // ── Public command API — playback ────────────────────────────

    pub async fn play(&self) -> bool {
        self.request(Command::Play, Vec::new()).await.is_some()
    }

    pub async fn pause(&self) -> bool {
        self.request(Command::Pause, Vec::new()).await.is_some()
    }

    pub async fn next(&self) -> bool {
        self.request(Command::Next, Vec::new()).await.is_some()
    }

    pub async fn previous(&self) -> bool {
        self.request(Command::Previous, Vec::new()).await.is_some()
    }

    /// Volume range is device-defined (historically 0–30).
    pub async fn set_volume(&self, volume: u8) -> bool {
        self.request(Command::Volume, vec![0x00, volume])
            .await
            .is_some()
    }

    pub async fn fast_forward(&self, seconds: u16) -> bool {
        self.request(Command::FastForward, seconds.to_be_bytes().to_vec())
            .await
            .is_some()
    }

    pub async fn fast_backward(&self, seconds: u16) -> bool {
        self.request(Command::FastBackward, seconds.to_be_bytes().to_vec())
            .await
            .is_some()
    }

    /// Jump to the playlist entry at `index` (1-based on the device).
    pub async fn play_index(&self, index: u16) -> bool {
        self.request_echoed(Command::PlayIndex, index.to_be_bytes().to_vec())
            .await
    }

    /// Number of files in the device playlist, or `None` when the
    /// device does not answer.
    pub async fn read_files_list(&self) -> Option<u16> {
        let reply = self.request(Command::ReadFilesList, Vec::new()).await?;
        match reply.as_slice() {
            [hi, lo] => Some(u16::from_be_bytes([*hi, *lo])),
            _ => None,
        }
    }

    pub async fn delete_file(&self, index: u16) -> bool {
        self.request_echoed(Command::DeleteFile, index.to_be_bytes().to_vec())
            .await
    }

    // ── Public command API — scheduling ──────────────────────────

    /// Install a cron-style alarm; `entry` is the device-encoded rule.
    pub async fn set_timing_alarm(&self, entry: Vec<u8>) -> bool {
        self.request(Command::SetTimingAlarm, entry).await.is_some()
    }

    /// Install a one-shot delayed action.
    pub async fn set_timing_after(&self, entry: Vec<u8>) -> bool {
        self.request(Command::SetTimingAfter, entry).await.is_some()
    }

    pub async fn query_timing_mode(&self) -> Option<Vec<u8>> {
        self.request(Command::QueryTimingMode, Vec::new()).await
    }

    pub async fn query_timing_set(&self) -> Option<Vec<u8>> {
        self.request(Command::QueryTimingSet, Vec::new()).await
    }

    pub async fn loop_while(&self, window: Vec<u8>) -> bool {
        self.request(Command::LoopWhile, window).await.is_some()
    }

    // ── Public command API — device lifecycle ────────────────────

    pub async fn reboot(&self) -> bool {
        self.request(Command::Reboot, Vec::new()).await.is_some()
    }

    pub async fn factory_reset(&self) -> bool {
        self.request(Command::FactoryReset, Vec::new()).await.is_some()
    }

    // ── Public command API — file transfer ───────────────────────

    /// Queue a file for chunked delivery. Returns the completion handle,
    /// or `None` when the transfer queue is full or the connection is
    /// closing (the job was not accepted).
    pub fn enqueue_transfer(&self, content: &[u8]) -> Option<TransferCompletion> {
        let (job, completion) = TransferJob::new(content);
        match self.transfers.try_send(job) {
            Ok(()) => Some(completion),
            Err(_) => None,
        }
    }

    /// Self-fetch path for cellular devices: hand over the short opaque
    /// token the device resolves against the HTTP surface.
    pub async fn request_self_fetch(&self, file_token: &[u8]) -> bool {
        self.request(Command::FileTransReqCell, file_token.to_vec())
            .await
            .is_some()
    }
}

impl std::fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("peer", &self.peer)
            .field("serial", &self.serial())
            .field("closed", &self.is_closed())
            .finish()
    }
}
