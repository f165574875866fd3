//! The duplex bridge engine.
//!
//! Connects the TUN device, the TCP transport, and the crypto channel.
//! Each session runs four tasks:
//!
//! - a TUN reader (read packet, wrap, queue for sending),
//! - a socket reader (decode frames, dispatch by type),
//! - a single writer that owns the socket write half and drains a bounded
//!   channel (all outbound frames funnel through it, so frames never
//!   interleave on the wire),
//! - a 1-second tick driving client auth attempts, keepalive, re-auth, and
//!   periodic statistics.
//!
//! The first task to end decides the session's fate; the rest are aborted,
//! session keys are cleared, and the client reconnects (the server goes
//! back to accepting).

use crate::config::{Config, Mode};
use crate::crypto::CryptoChannel;
use crate::error::{VpnError, VpnResult};
use crate::frame::{
    encode_frame, Frame, FrameDecoder, PacketType, HEADER_IV_SIZE, HMAC_SIZE, KEEPALIVE_MAGIC,
};
use crate::stats::BridgeStats;
use crate::transport;
use crate::tun::{TunDevice, TunReader, TunWriter};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinError;
use tokio::time::MissedTickBehavior;

/// Coarse timer driving auth retries, keepalive, and re-auth checks.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Client retries the handshake this often while unauthenticated.
const AUTH_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Minimum spacing between keepalive probes.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// A connection with no traffic for this long is probed.
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(120);

/// Socket read chunk size; frames are reassembled by the decoder.
const SOCKET_READ_BUF: usize = 4096;

/// Outbound frame channel depth. Bounded so a stalled socket applies
/// backpressure to the TUN reader instead of growing memory.
const OUTBOUND_CHANNEL_SIZE: usize = 1024;

/// How often the tick task logs a statistics snapshot.
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Sentinel for "never happened" in the session clock.
const NEVER_MS: u64 = u64::MAX;

/// Monotonic per-session timestamps, stored as millis since session start
/// for lock-free access from every task.
struct SessionClock {
    start: Instant,
    last_activity_ms: AtomicU64,
    last_keepalive_ms: AtomicU64,
    last_auth_attempt_ms: AtomicU64,
}

impl SessionClock {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            last_keepalive_ms: AtomicU64::new(0),
            last_auth_attempt_ms: AtomicU64::new(NEVER_MS),
        }
    }

    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn touch_activity(&self) {
        self.last_activity_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    fn touch_keepalive(&self) {
        self.last_keepalive_ms
            .store(self.now_ms(), Ordering::Relaxed);
    }

    fn touch_auth_attempt(&self) {
        self.last_auth_attempt_ms
            .store(self.now_ms(), Ordering::Relaxed);
    }

    fn since(&self, stamp: &AtomicU64) -> Duration {
        let stamp = stamp.load(Ordering::Relaxed);
        if stamp == NEVER_MS {
            return Duration::MAX;
        }
        Duration::from_millis(self.now_ms().saturating_sub(stamp))
    }

    fn since_activity(&self) -> Duration {
        self.since(&self.last_activity_ms)
    }

    fn since_keepalive(&self) -> Duration {
        self.since(&self.last_keepalive_ms)
    }

    fn since_auth_attempt(&self) -> Duration {
        self.since(&self.last_auth_attempt_ms)
    }
}

/// A keepalive probe goes out when the last probe is old enough and the
/// connection is no longer healthy (no traffic within the liveness window).
fn keepalive_ready(since_keepalive: Duration, since_activity: Duration) -> bool {
    let healthy = since_activity < LIVENESS_TIMEOUT;
    since_keepalive >= KEEPALIVE_INTERVAL && !healthy
}

/// Sanity check before injecting a decrypted payload into the TUN device:
/// the version nibble and minimum header length must match IPv4 or IPv6.
fn looks_like_ip_packet(packet: &[u8]) -> bool {
    match packet.first().map(|b| b >> 4) {
        Some(4) => packet.len() >= 20,
        Some(6) => packet.len() >= 40,
        _ => false,
    }
}

/// What the socket reader should do with a dispatched frame.
#[derive(Debug)]
enum FrameOutcome {
    /// Nothing further (handled, dropped, or counted internally).
    Ignore,
    /// Queue this frame for the writer task (handshake responses).
    Respond(Bytes),
    /// Inject this plaintext packet into the TUN device.
    WriteTun(Vec<u8>),
}

/// Per-session shared context for the forwarding tasks.
#[derive(Clone)]
struct Session {
    mode: Mode,
    enable_keepalive: bool,
    crypto: Option<Arc<CryptoChannel>>,
    stats: Arc<BridgeStats>,
    clock: Arc<SessionClock>,
    auth_in_progress: Arc<AtomicBool>,
    outbound_tx: mpsc::Sender<Bytes>,
}

impl Session {
    /// Authenticated state; plaintext mode is always "authenticated".
    fn is_authenticated(&self) -> bool {
        self.crypto.as_ref().is_none_or(|c| c.is_authenticated())
    }

    /// Dispatch one inbound frame by type.
    fn handle_frame(&self, frame: &Frame) -> FrameOutcome {
        match frame.packet_type() {
            None => {
                log::warn!(
                    "dropping frame with unknown type 0x{:02x} ({} bytes)",
                    frame.header.packet_type,
                    frame.payload.len()
                );
                self.stats.dropped_packets.fetch_add(1, Ordering::Relaxed);
                FrameOutcome::Ignore
            }
            Some(PacketType::AuthRequest) => self.on_auth_request(frame),
            Some(PacketType::AuthSuccess) | Some(PacketType::AuthResponse) => {
                self.on_auth_response(frame);
                FrameOutcome::Ignore
            }
            Some(PacketType::AuthFailed) => {
                log::warn!("peer rejected authentication");
                self.stats.auth_failures.fetch_add(1, Ordering::Relaxed);
                self.auth_in_progress.store(false, Ordering::SeqCst);
                FrameOutcome::Ignore
            }
            Some(PacketType::Data) => self.on_data(frame),
            Some(PacketType::Keepalive) => {
                // Liveness was already updated by the socket read itself.
                log::debug!("keepalive received");
                FrameOutcome::Ignore
            }
        }
    }

    fn on_auth_request(&self, frame: &Frame) -> FrameOutcome {
        if self.mode != Mode::Server {
            log::warn!("client received AUTH_REQUEST, dropping");
            self.stats.dropped_packets.fetch_add(1, Ordering::Relaxed);
            return FrameOutcome::Ignore;
        }
        let Some(crypto) = &self.crypto else {
            log::warn!("AUTH_REQUEST received but encryption is disabled, dropping");
            self.stats.dropped_packets.fetch_add(1, Ordering::Relaxed);
            return FrameOutcome::Ignore;
        };

        match crypto.handle_auth_request(frame) {
            Ok(response) => {
                log::info!("authentication successful (server)");
                FrameOutcome::Respond(response)
            }
            Err(e) => {
                // Fail silently: no response frame keeps the oracle small.
                log::warn!("authentication failed: {}", e);
                self.stats.auth_failures.fetch_add(1, Ordering::Relaxed);
                FrameOutcome::Ignore
            }
        }
    }

    fn on_auth_response(&self, frame: &Frame) {
        if self.mode != Mode::Client {
            log::warn!("server received auth response, dropping");
            self.stats.dropped_packets.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let Some(crypto) = &self.crypto else {
            log::warn!("auth response received but encryption is disabled, dropping");
            self.stats.dropped_packets.fetch_add(1, Ordering::Relaxed);
            return;
        };

        match crypto.handle_auth_response(frame) {
            Ok(()) => {
                self.auth_in_progress.store(false, Ordering::SeqCst);
                log::info!("authentication successful (client)");
            }
            Err(e) => {
                log::warn!("authentication response rejected: {}", e);
                self.stats.auth_failures.fetch_add(1, Ordering::Relaxed);
                self.auth_in_progress.store(false, Ordering::SeqCst);
            }
        }
    }

    fn on_data(&self, frame: &Frame) -> FrameOutcome {
        let plaintext = match &self.crypto {
            Some(crypto) => {
                if !crypto.is_authenticated() {
                    log::warn!("data packet before authentication, dropping");
                    self.stats.dropped_packets.fetch_add(1, Ordering::Relaxed);
                    return FrameOutcome::Ignore;
                }
                match crypto.unwrap(frame) {
                    Ok(plaintext) => plaintext,
                    Err(e) => {
                        log::warn!("dropping undecryptable data packet: {}", e);
                        self.stats.dropped_packets.fetch_add(1, Ordering::Relaxed);
                        return FrameOutcome::Ignore;
                    }
                }
            }
            None => frame.payload.to_vec(),
        };

        if plaintext == KEEPALIVE_MAGIC {
            log::debug!("keepalive received");
            return FrameOutcome::Ignore;
        }

        if !looks_like_ip_packet(&plaintext) {
            log::warn!("dropping non-IP payload ({} bytes)", plaintext.len());
            self.stats.dropped_packets.fetch_add(1, Ordering::Relaxed);
            return FrameOutcome::Ignore;
        }

        FrameOutcome::WriteTun(plaintext)
    }

    /// One pass of the periodic work: re-auth, client auth retry, keepalive.
    ///
    /// Returns false when the outbound channel is gone and the session is
    /// over.
    async fn tick(&self) -> bool {
        if let Some(crypto) = &self.crypto {
            if crypto.is_authenticated() && crypto.needs_reauth() {
                log::info!("session aged past the re-auth interval, clearing keys");
                crypto.clear_session();
            }

            if self.mode == Mode::Client
                && !crypto.is_authenticated()
                && self.clock.since_auth_attempt() >= AUTH_RETRY_INTERVAL
            {
                match crypto.create_auth_request() {
                    Ok(frame) => {
                        if self.outbound_tx.send(frame).await.is_err() {
                            return false;
                        }
                        self.clock.touch_auth_attempt();
                        self.auth_in_progress.store(true, Ordering::SeqCst);
                        log::info!("authentication request sent");
                    }
                    Err(e) => log::error!("failed to build auth request: {}", e),
                }
            }
        }

        if self.keepalive_due() {
            return self.send_keepalive().await;
        }

        true
    }

    /// Whether probing is enabled, the session is authenticated, and the
    /// timers say a probe is overdue.
    fn keepalive_due(&self) -> bool {
        self.enable_keepalive
            && self.is_authenticated()
            && keepalive_ready(self.clock.since_keepalive(), self.clock.since_activity())
    }

    /// Emit one keepalive probe. Returns false when the outbound channel is
    /// gone.
    async fn send_keepalive(&self) -> bool {
        let frame = match &self.crypto {
            Some(crypto) => match crypto.wrap(&KEEPALIVE_MAGIC) {
                Ok(frame) => frame,
                Err(e) => {
                    log::warn!("failed to build keepalive: {}", e);
                    return true;
                }
            },
            None => encode_frame(
                PacketType::Keepalive,
                &[0u8; HEADER_IV_SIZE],
                &[0u8; HMAC_SIZE],
                &[],
            ),
        };
        if self.outbound_tx.send(frame).await.is_err() {
            return false;
        }
        self.clock.touch_keepalive();
        log::debug!("keepalive sent");
        true
    }
}

/// The bridge: owns the configuration, crypto channel, and statistics, and
/// drives sessions until stopped.
pub struct Bridge {
    config: Config,
    crypto: Option<Arc<CryptoChannel>>,
    stats: Arc<BridgeStats>,
    stop_tx: watch::Sender<bool>,
}

impl Bridge {
    /// Build a bridge from a validated configuration.
    pub fn new(config: Config) -> VpnResult<Self> {
        let crypto = if config.enable_encryption {
            let psk = config
                .psk
                .as_deref()
                .ok_or_else(|| VpnError::config("encryption enabled without a PSK"))?;
            Some(Arc::new(CryptoChannel::new(psk.as_bytes())?))
        } else {
            log::warn!("running without encryption, for debugging only");
            None
        };

        Ok(Self {
            config,
            crypto,
            stats: Arc::new(BridgeStats::new()),
            stop_tx: watch::Sender::new(false),
        })
    }

    /// Request shutdown. Idempotent; all session tasks observe it within
    /// one tick.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Traffic counters (cumulative across sessions).
    pub fn stats(&self) -> &Arc<BridgeStats> {
        &self.stats
    }

    /// Whether the current session has completed the handshake.
    pub fn is_authenticated(&self) -> bool {
        self.crypto.as_ref().is_none_or(|c| c.is_authenticated())
    }

    /// Log a statistics snapshot.
    pub fn print_statistics(&self) {
        log::info!("statistics: {}", self.stats.snapshot());
    }

    /// Zero all statistics counters.
    pub fn reset_statistics(&self) {
        self.stats.reset();
    }

    /// Run the bridge until [`stop`](Self::stop) is called or an
    /// unrecoverable error occurs. Consumes the TUN device; its halves are
    /// reused across sessions.
    pub async fn run(&self, tun: TunDevice) -> VpnResult<()> {
        let (tun_reader, tun_writer) = tun.split()?;
        let tun_reader = Arc::new(Mutex::new(tun_reader));
        let tun_writer = Arc::new(Mutex::new(tun_writer));

        let result = match self.config.mode {
            Mode::Server => self.run_server(&tun_reader, &tun_writer).await,
            Mode::Client => self.run_client(&tun_reader, &tun_writer).await,
        };

        self.print_statistics();
        result
    }

    async fn run_server(
        &self,
        tun_reader: &Arc<Mutex<TunReader>>,
        tun_writer: &Arc<Mutex<TunWriter>>,
    ) -> VpnResult<()> {
        let listener = transport::listen(self.config.port)?;
        let mut stop_rx = self.stop_tx.subscribe();

        loop {
            if *stop_rx.borrow() {
                return Ok(());
            }

            let accepted = tokio::select! {
                _ = stop_rx.wait_for(|stopped| *stopped) => return Ok(()),
                accepted = transport::accept_one(&listener) => accepted,
            };
            let (stream, _peer) = accepted?;

            let reason = self.run_session(stream, tun_reader, tun_writer).await;
            self.end_session(&reason);
            log::info!("waiting for a new client connection");
        }
    }

    async fn run_client(
        &self,
        tun_reader: &Arc<Mutex<TunReader>>,
        tun_writer: &Arc<Mutex<TunWriter>>,
    ) -> VpnResult<()> {
        let host = self
            .config
            .remote_host
            .clone()
            .ok_or_else(|| VpnError::config("client mode requires a remote host"))?;
        let mut stop_rx = self.stop_tx.subscribe();

        loop {
            if *stop_rx.borrow() {
                return Ok(());
            }

            match transport::connect(&host, self.config.port).await {
                Ok(stream) => {
                    let reason = self.run_session(stream, tun_reader, tun_writer).await;
                    self.end_session(&reason);
                    if *stop_rx.borrow() {
                        return Ok(());
                    }
                    log::warn!(
                        "session ended ({}), reconnecting in {:?}",
                        reason,
                        self.config.reconnect_interval
                    );
                }
                Err(e) => {
                    log::warn!(
                        "connect to {}:{} failed ({}), retrying in {:?}",
                        host,
                        self.config.port,
                        e,
                        self.config.reconnect_interval
                    );
                }
            }

            tokio::select! {
                _ = stop_rx.wait_for(|stopped| *stopped) => return Ok(()),
                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
            }
        }
    }

    /// Run one connection to completion. Returns the reason the session
    /// ended.
    async fn run_session(
        &self,
        stream: TcpStream,
        tun_reader: &Arc<Mutex<TunReader>>,
        tun_writer: &Arc<Mutex<TunWriter>>,
    ) -> String {
        let (read_half, write_half) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::channel::<Bytes>(OUTBOUND_CHANNEL_SIZE);

        let session = Session {
            mode: self.config.mode,
            enable_keepalive: self.config.enable_keepalive,
            crypto: self.crypto.clone(),
            stats: self.stats.clone(),
            clock: Arc::new(SessionClock::new()),
            auth_in_progress: Arc::new(AtomicBool::new(false)),
            outbound_tx,
        };

        let mut writer_task = tokio::spawn(write_loop(
            write_half,
            outbound_rx,
            session.clock.clone(),
        ));
        let mut socket_task = tokio::spawn(socket_read_loop(
            read_half,
            session.clone(),
            tun_writer.clone(),
        ));
        let mut tun_task = tokio::spawn(tun_read_loop(tun_reader.clone(), session.clone()));
        let mut tick_task = tokio::spawn(tick_loop(session.clone()));

        // Whichever task ends first decides the session's fate; its handle
        // is consumed by the select, so only the remaining three are
        // aborted and awaited afterwards.
        let mut stop_rx = self.stop_tx.subscribe();
        let (reason, remaining) = tokio::select! {
            _ = stop_rx.wait_for(|stopped| *stopped) => (
                "stop requested".to_string(),
                vec![
                    ("writer", writer_task),
                    ("socket reader", socket_task),
                    ("tun reader", tun_task),
                    ("tick", tick_task),
                ],
            ),
            r = &mut writer_task => (
                describe_task_end("writer", r),
                vec![
                    ("socket reader", socket_task),
                    ("tun reader", tun_task),
                    ("tick", tick_task),
                ],
            ),
            r = &mut socket_task => (
                describe_task_end("socket reader", r),
                vec![
                    ("writer", writer_task),
                    ("tun reader", tun_task),
                    ("tick", tick_task),
                ],
            ),
            r = &mut tun_task => (
                describe_task_end("tun reader", r),
                vec![
                    ("writer", writer_task),
                    ("socket reader", socket_task),
                    ("tick", tick_task),
                ],
            ),
            r = &mut tick_task => (
                describe_task_end("tick", r),
                vec![
                    ("writer", writer_task),
                    ("socket reader", socket_task),
                    ("tun reader", tun_task),
                ],
            ),
        };
        log::debug!("session ending: {}", reason);

        for (_, handle) in &remaining {
            handle.abort();
        }
        // Await the survivors so the TUN half locks are released before the
        // next session starts (aborted tasks resolve as cancelled).
        for (name, handle) in remaining {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    log::warn!("{} task failed during teardown: {}", name, e);
                }
            }
        }

        reason
    }

    /// Session epilogue: keys zeroized, in-flight state discarded.
    fn end_session(&self, reason: &str) {
        if let Some(crypto) = &self.crypto {
            crypto.clear_session();
        }
        log::info!("session closed: {}", reason);
        self.print_statistics();
    }
}

/// Render a finished task's result as a session-end reason.
fn describe_task_end(name: &str, result: Result<Option<String>, JoinError>) -> String {
    match result {
        Ok(Some(reason)) => reason,
        Ok(None) => format!("{} task ended", name),
        Err(e) if e.is_panic() => format!("{} task panicked", name),
        Err(_) => format!("{} task cancelled", name),
    }
}

/// Writer task: the only socket sender. Batches queued frames and writes
/// each fully before the next, so frames never interleave.
async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut outbound_rx: mpsc::Receiver<Bytes>,
    clock: Arc<SessionClock>,
) -> Option<String> {
    let mut batch: Vec<Bytes> = Vec::with_capacity(64);
    loop {
        let count = outbound_rx.recv_many(&mut batch, 64).await;
        if count == 0 {
            return None;
        }
        for frame in batch.drain(..) {
            if let Err(e) = write_half.write_all(&frame).await {
                return Some(format!("socket write error: {}", e));
            }
        }
        clock.touch_activity();
    }
}

/// Socket reader task: chunked reads through the frame decoder, then
/// per-frame dispatch.
async fn socket_read_loop(
    mut read_half: OwnedReadHalf,
    session: Session,
    tun_writer: Arc<Mutex<TunWriter>>,
) -> Option<String> {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; SOCKET_READ_BUF];

    loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) => return Some("connection closed by peer".to_string()),
            Ok(n) => n,
            Err(e) => return Some(format!("socket read error: {}", e)),
        };
        session.clock.touch_activity();
        decoder.feed(&buf[..n]);

        loop {
            let frame = match decoder.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                // Oversized or malformed framing desynchronizes the
                // stream; the connection must close.
                Err(e) => return Some(format!("fatal framing error: {}", e)),
            };

            match session.handle_frame(&frame) {
                FrameOutcome::Ignore => {}
                FrameOutcome::Respond(response) => {
                    if session.outbound_tx.send(response).await.is_err() {
                        return None;
                    }
                }
                FrameOutcome::WriteTun(packet) => {
                    let mut writer = tun_writer.lock().await;
                    match writer.write_packet(&packet).await {
                        Ok(()) => {
                            session
                                .stats
                                .socket_to_tun_packets
                                .fetch_add(1, Ordering::Relaxed);
                            session
                                .stats
                                .socket_to_tun_bytes
                                .fetch_add(packet.len() as u64, Ordering::Relaxed);
                        }
                        Err(e) => {
                            log::warn!("TUN write failed, dropping packet: {}", e);
                            session.stats.dropped_packets.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
        }
    }
}

/// TUN reader task: one packet per read, wrapped and queued for the writer.
async fn tun_read_loop(tun_reader: Arc<Mutex<TunReader>>, session: Session) -> Option<String> {
    let mut reader = tun_reader.lock().await;
    let mut buf = vec![0u8; reader.buffer_size()];

    loop {
        let n = match reader.read_packet(&mut buf).await {
            Ok(0) => return Some("TUN device closed".to_string()),
            Ok(n) => n,
            Err(e) => return Some(format!("TUN read error: {}", e)),
        };
        let packet = &buf[..n];

        let frame = match &session.crypto {
            Some(crypto) => {
                if !crypto.is_authenticated() {
                    log::debug!("dropping TUN packet before authentication ({} bytes)", n);
                    session.stats.dropped_packets.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                match crypto.wrap(packet) {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::warn!("failed to wrap TUN packet: {}", e);
                        session.stats.dropped_packets.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                }
            }
            None => encode_frame(
                PacketType::Data,
                &[0u8; HEADER_IV_SIZE],
                &[0u8; HMAC_SIZE],
                packet,
            ),
        };

        if session.outbound_tx.send(frame).await.is_err() {
            return None;
        }
        session
            .stats
            .tun_to_socket_packets
            .fetch_add(1, Ordering::Relaxed);
        session
            .stats
            .tun_to_socket_bytes
            .fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Tick task: auth retries, keepalive, re-auth, periodic statistics.
async fn tick_loop(session: Session) -> Option<String> {
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_stats_log = Instant::now();

    loop {
        interval.tick().await;

        if !session.tick().await {
            return None;
        }

        if last_stats_log.elapsed() >= STATS_LOG_INTERVAL {
            log::info!("statistics: {}", session.stats.snapshot());
            last_stats_log = Instant::now();
        }
    }
}
