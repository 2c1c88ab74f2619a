//! The relay pump: a single-threaded loop moving bytes between the local TCP client and the
//! session's relay stream.
//!
//! TCP to peer: the client is read in chunks only while the session has send credit left (bytes
//! sent but not completed stay under `max_inflight`) and no chunk is being held. A chunk read while
//! there's no relay stream is held while one is requested, and dropped if none shows up within the
//! open window.
//!
//! Peer to TCP: received bytes are written to the client right away if possible. Whatever the
//! client can't take goes into a bounded [`BackpressureBuffer`], and anything arriving while the
//! buffer isn't empty is appended behind it, so the client always sees bytes in arrival order. The
//! client's writability is only watched while the buffer holds something.

use std::{
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chownat_session_sm::{BackpressureBuffer, Role, StreamRequest};
use tokio::{net::TcpStream, select};
use tracing::{debug, info, warn};

use crate::{
    gateway::{Admission, TcpGateway},
    session::{SessionManager, SessionNotice},
    transport::{EventReceiver, TransportEvent},
    utils::{earliest, readable_if_some, sleep_until_if_some, writable_if_some},
};

pub const DEFAULT_CHUNK_SIZE: usize = 4096;
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;
pub const DEFAULT_MAX_INFLIGHT: usize = 256 * 1024;
pub const DEFAULT_OPEN_WINDOW: Duration = Duration::from_millis(5000);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1000);

const INITIAL_OPEN_BACKOFF: Duration = Duration::from_millis(100);
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// What to do when the backpressure buffer can't take all the bytes that arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Drop the bytes that don't fit and count them.
    #[default]
    DropNewest,

    /// Drop the bytes that don't fit, disconnect the client and discard the buffer.
    DisconnectClient,
}

/// What happens to the backpressure buffer when there's no client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferRetention {
    /// Discard the buffer when the client leaves, and drop bytes arriving while there's no client.
    #[default]
    Discard,

    /// Keep the buffer for the next client, and buffer bytes arriving while there's no client.
    KeepForNextClient,
}

/// (connector only) What to do when the session closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectPolicy {
    #[default]
    Never,

    Limited { delay: Duration, max_attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    /// The most bytes read from the client at once.
    pub chunk_size: usize,

    /// The bound of the backpressure buffer.
    pub buffer_size: usize,

    /// Client reads pause while more than this many bytes are sent but not completed.
    pub max_inflight: usize,

    pub overflow: OverflowPolicy,
    pub retention: BufferRetention,

    /// How long a chunk waits for a relay stream before being dropped.
    pub open_window: Duration,

    pub reconnect: ReconnectPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_inflight: DEFAULT_MAX_INFLIGHT,
            overflow: OverflowPolicy::default(),
            retention: BufferRetention::default(),
            open_window: DEFAULT_OPEN_WINDOW,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Counters of what the relay did, shared with whoever wants to look at them while it runs.
#[derive(Debug, Default)]
pub struct RelayStats {
    clients_accepted: AtomicU64,
    clients_rejected: AtomicU64,
    bytes_to_peer: AtomicU64,
    bytes_to_client: AtomicU64,
    dropped_overflow: AtomicU64,
    dropped_no_client: AtomicU64,
    dropped_no_stream: AtomicU64,
    discarded_stale: AtomicU64,
    failed_send_bytes: AtomicU64,
    sessions_closed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub clients_accepted: u64,
    pub clients_rejected: u64,
    pub bytes_to_peer: u64,
    pub bytes_to_client: u64,

    /// Bytes from the peer dropped because the backpressure buffer was full.
    pub dropped_overflow: u64,

    /// Bytes from the peer dropped because there was no client.
    pub dropped_no_client: u64,

    /// Bytes from the client dropped because no relay stream opened in time.
    pub dropped_no_stream: u64,

    /// Bytes from the peer that arrived on a stream other than the relay stream.
    pub discarded_stale: u64,

    /// Bytes handed to the relay stream that couldn't be written to the peer.
    pub failed_send_bytes: u64,

    /// Times the session closed, whether it connected before or not.
    pub sessions_closed: u64,
}

impl RelayStats {
    fn add(counter: &AtomicU64, amount: usize) {
        counter.fetch_add(amount as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            clients_accepted: self.clients_accepted.load(Ordering::Relaxed),
            clients_rejected: self.clients_rejected.load(Ordering::Relaxed),
            bytes_to_peer: self.bytes_to_peer.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
            dropped_overflow: self.dropped_overflow.load(Ordering::Relaxed),
            dropped_no_client: self.dropped_no_client.load(Ordering::Relaxed),
            dropped_no_stream: self.dropped_no_stream.load(Ordering::Relaxed),
            discarded_stale: self.discarded_stale.load(Ordering::Relaxed),
            failed_send_bytes: self.failed_send_bytes.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
        }
    }
}

/// Why [`RelayPump::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    /// The shutdown signal fired.
    Shutdown,

    /// The connector's session closed and the reconnect policy doesn't allow another attempt.
    SessionEnded,

    /// Nothing can post transport events anymore.
    EventsClosed,
}

/// A chunk read from the client while there was no relay stream to send it on.
struct HeldChunk {
    data: Vec<u8>,
    deadline: Instant,
    retry_at: Option<Instant>,
    backoff: Duration,
}

pub struct RelayPump {
    config: RelayConfig,
    gateway: TcpGateway,
    session: SessionManager,
    events: EventReceiver,
    buffer: BackpressureBuffer,
    stats: Arc<RelayStats>,
    held: Option<HeldChunk>,
    reconnect_at: Option<Instant>,
    reconnect_attempts: u32,
}

impl RelayPump {
    pub fn new(config: RelayConfig, gateway: TcpGateway, session: SessionManager, events: EventReceiver) -> Self {
        Self {
            buffer: BackpressureBuffer::new(config.buffer_size),
            config,
            gateway,
            session,
            events,
            stats: Arc::new(RelayStats::default()),
            held: None,
            reconnect_at: None,
            reconnect_attempts: 0,
        }
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        Arc::clone(&self.stats)
    }

    /// Runs the relay until `shutdown` completes (or the session ends for good), then tears the
    /// session down gracefully.
    pub async fn run<F>(mut self, shutdown: F) -> RelayExit
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut read_buf = vec![0u8; self.config.chunk_size.max(1)];

        let exit = match self.connect_session() {
            Some(exit) => exit,
            None => self.run_loop(&mut shutdown, &mut read_buf).await,
        };

        self.shutdown().await;
        info!(stats = ?self.stats.snapshot(), ?exit, "Relay stopped");
        exit
    }

    async fn run_loop<F>(&mut self, shutdown: &mut Pin<&mut F>, read_buf: &mut [u8]) -> RelayExit
    where
        F: Future<Output = ()>,
    {
        loop {
            let wants_input = self.wants_client_input();
            let wants_flush = !self.buffer.is_empty();
            let timer = self.next_timer();
            let readable = self.gateway.client_stream().filter(|_| wants_input);
            let writable = self.gateway.client_stream().filter(|_| wants_flush);

            select! {
                biased;
                _ = shutdown.as_mut() => {
                    info!("Shutdown requested");
                    break RelayExit::Shutdown;
                }
                accepted = self.gateway.accept() => match accepted {
                    Ok((stream, address)) => self.on_client_accepted(stream, address),
                    Err(error) => warn!(%error, "Failed to accept client"),
                },
                event = self.events.recv() => match event {
                    Some(event) => {
                        if let Some(exit) = self.on_transport_event(event) {
                            break exit;
                        }
                    }
                    None => break RelayExit::EventsClosed,
                },
                result = readable_if_some(readable) => match result {
                    Ok(()) => self.read_from_client(read_buf),
                    Err(error) => {
                        warn!(%error, "Client socket failed");
                        self.disconnect_client();
                    }
                },
                result = writable_if_some(writable) => match result {
                    Ok(()) => self.flush_to_client(),
                    Err(error) => {
                        warn!(%error, "Client socket failed");
                        self.disconnect_client();
                    }
                },
                _ = sleep_until_if_some(timer) => {
                    if let Some(exit) = self.on_timer() {
                        break exit;
                    }
                }
            }
        }
    }

    /// Starts a connection attempt, going through the closed session path if it can't be made.
    fn connect_session(&mut self) -> Option<RelayExit> {
        match self.session.connect() {
            SessionNotice::Closed => self.on_session_closed(),
            _ => None,
        }
    }

    fn wants_client_input(&self) -> bool {
        self.gateway.has_client() && self.held.is_none() && self.session.inflight_bytes() < self.config.max_inflight
    }

    fn next_timer(&self) -> Option<Instant> {
        let held = self.held.as_ref().and_then(|h| earliest(Some(h.deadline), h.retry_at));
        earliest(self.reconnect_at, held)
    }

    fn on_client_accepted(&mut self, stream: TcpStream, address: SocketAddr) {
        match self.gateway.admit(stream, address) {
            Admission::Accepted => {
                RelayStats::add(&self.stats.clients_accepted, 1);
                if !self.buffer.is_empty() {
                    debug!(len = self.buffer.len(), "Flushing retained bytes to the new client");
                }
            }
            Admission::Rejected => {
                let rejected = self.gateway.rejected_count();
                self.stats.clients_rejected.store(rejected, Ordering::Relaxed);
            }
        }
    }

    fn read_from_client(&mut self, buf: &mut [u8]) {
        match self.gateway.read_chunk(buf) {
            Ok(None) => {}
            Ok(Some(0)) => {
                info!("Client closed its side of the connection");
                self.disconnect_client();
            }
            Ok(Some(len)) => self.forward(&buf[..len]),
            Err(error) => {
                warn!(%error, "Reading from client failed");
                self.disconnect_client();
            }
        }
    }

    fn forward(&mut self, chunk: &[u8]) {
        match self.session.send(chunk) {
            Ok(()) => RelayStats::add(&self.stats.bytes_to_peer, chunk.len()),
            Err(error) => {
                debug!(%error, len = chunk.len(), "Holding chunk until a relay stream is open");
                self.held = Some(HeldChunk {
                    data: chunk.to_vec(),
                    deadline: Instant::now() + self.config.open_window,
                    retry_at: None,
                    backoff: INITIAL_OPEN_BACKOFF,
                });
                self.request_stream();
            }
        }
    }

    fn request_stream(&mut self) {
        match self.session.ensure_stream() {
            StreamRequest::AlreadyOpen => self.send_held_chunk(),
            StreamRequest::Open | StreamRequest::Pending | StreamRequest::AwaitPeer => {}
            StreamRequest::NotConnected => debug!(state = ?self.session.state(), "No connection to open a relay stream on yet"),
        }
    }

    fn send_held_chunk(&mut self) {
        let Some(held) = self.held.take() else {
            return;
        };

        match self.session.send(&held.data) {
            Ok(()) => {
                debug!(len = held.data.len(), "Sent held chunk");
                RelayStats::add(&self.stats.bytes_to_peer, held.data.len());
            }
            Err(_) => self.held = Some(held),
        }
    }

    fn on_timer(&mut self) -> Option<RelayExit> {
        let now = Instant::now();

        if self.reconnect_at.is_some_and(|at| at <= now) {
            self.reconnect_at = None;
            info!(attempt = self.reconnect_attempts, "Reconnecting");
            self.session.reset();
            if let Some(exit) = self.connect_session() {
                return Some(exit);
            }
        }

        if let Some(held) = &mut self.held {
            if held.deadline <= now {
                let len = held.data.len();
                self.held = None;
                RelayStats::add(&self.stats.dropped_no_stream, len);
                warn!(len, window = ?self.config.open_window, "No relay stream opened in time, dropping chunk");
            } else if held.retry_at.is_some_and(|at| at <= now) {
                held.retry_at = None;
                self.request_stream();
            }
        }

        None
    }

    fn on_stream_open_failed(&mut self) {
        if let Some(held) = &mut self.held {
            let retry_at = Instant::now() + held.backoff;
            debug!(backoff = ?held.backoff, "Retrying stream open later");
            held.retry_at = Some(retry_at.min(held.deadline));
            held.backoff = (held.backoff * 2).min(self.config.open_window);
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) -> Option<RelayExit> {
        let mut delivery = None;
        let notice = self.session.handle_event(event, |data| {
            delivery = Some(deliver(&mut self.gateway, &mut self.buffer, &self.config, &self.stats, data));
        });

        match delivery {
            Some(ClientDelivery::Overflowed) if self.config.overflow == OverflowPolicy::DisconnectClient => {
                warn!(bound = self.buffer.max_bytes(), "Backpressure buffer overflowed, disconnecting client");
                let discarded = self.buffer.clear();
                RelayStats::add(&self.stats.dropped_overflow, discarded);
                self.disconnect_client();
            }
            Some(ClientDelivery::ClientFailed(error)) => {
                warn!(%error, "Writing to client failed");
                self.disconnect_client();
            }
            _ => {}
        }

        match notice {
            SessionNotice::Nothing => {}
            SessionNotice::Connected => {
                self.reconnect_attempts = 0;
                if self.held.is_some() {
                    self.request_stream();
                }
            }
            SessionNotice::StreamReady => self.send_held_chunk(),
            SessionNotice::StreamOpenFailed => self.on_stream_open_failed(),
            SessionNotice::StreamLost => {
                if self.held.is_some() || self.session.role().is_connector() {
                    self.request_stream();
                }
            }
            SessionNotice::SendFailed { len } => RelayStats::add(&self.stats.failed_send_bytes, len),
            SessionNotice::Discarded { len } => RelayStats::add(&self.stats.discarded_stale, len),
            SessionNotice::Closed => return self.on_session_closed(),
        }

        None
    }

    fn on_session_closed(&mut self) -> Option<RelayExit> {
        RelayStats::add(&self.stats.sessions_closed, 1);

        match self.session.role() {
            Role::Listener => {
                self.session.reset();
                self.connect_session()
            }
            Role::Connector => match self.config.reconnect {
                ReconnectPolicy::Limited { delay, max_attempts } if self.reconnect_attempts < max_attempts => {
                    self.reconnect_attempts += 1;
                    info!(attempt = self.reconnect_attempts, max_attempts, ?delay, "Session closed, reconnecting later");
                    self.reconnect_at = Some(Instant::now() + delay);
                    None
                }
                _ => {
                    warn!("Session closed, not reconnecting");
                    Some(RelayExit::SessionEnded)
                }
            },
        }
    }

    fn flush_to_client(&mut self) {
        match flush_buffer(|bytes| self.gateway.write_some(bytes), &mut self.buffer) {
            Ok(flushed) => RelayStats::add(&self.stats.bytes_to_client, flushed),
            Err(error) => {
                warn!(%error, "Writing to client failed");
                self.disconnect_client();
            }
        }
    }

    /// Closes the client, discarding its unsent input, and finishes the relay stream. A connector
    /// opens the next one right away, so the peer can talk first to whoever connects next.
    fn disconnect_client(&mut self) {
        let Some(address) = self.gateway.close_client() else {
            return;
        };

        info!(%address, stream = ?self.session.stream_state(), "Client disconnected");
        if let Some(held) = self.held.take() {
            debug!(len = held.data.len(), "Discarding client input that was never sent");
        }

        self.session.close_stream();
        if self.session.role().is_connector() {
            self.request_stream();
        }

        if self.config.retention == BufferRetention::Discard {
            let discarded = self.buffer.clear();
            if discarded != 0 {
                debug!(discarded, "Discarded buffered bytes of the departed client");
            }
        }
    }

    async fn shutdown(&mut self) {
        if let Some(address) = self.gateway.close_client() {
            info!(%address, "Closing client");
        }

        if !self.session.teardown() {
            return;
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE_PERIOD;
        loop {
            select! {
                event = self.events.recv() => match event {
                    Some(event) => {
                        if self.session.handle_event(event, |_| {}) == SessionNotice::Closed {
                            break;
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("Connection didn't finish closing in time");
                    break;
                }
            }
        }
    }
}

enum ClientDelivery {
    Done,
    Overflowed,
    ClientFailed(io::Error),
}

fn deliver(
    gateway: &mut TcpGateway,
    buffer: &mut BackpressureBuffer,
    config: &RelayConfig,
    stats: &RelayStats,
    data: &[u8],
) -> ClientDelivery {
    if !gateway.has_client() {
        match config.retention {
            BufferRetention::Discard => {
                debug!(len = data.len(), "No client, dropping bytes");
                RelayStats::add(&stats.dropped_no_client, data.len());
            }
            BufferRetention::KeepForNextClient => {
                let outcome = buffer.push(data);
                RelayStats::add(&stats.dropped_overflow, outcome.dropped);
            }
        }

        return ClientDelivery::Done;
    }

    match write_or_buffer(|bytes| gateway.write_some(bytes), buffer, data) {
        Ok(delivered) => {
            RelayStats::add(&stats.bytes_to_client, delivered.written);
            if delivered.buffered != 0 {
                debug!(buffered = delivered.buffered, pending = buffer.len(), "Client is slow, buffering");
            }

            if delivered.dropped == 0 {
                return ClientDelivery::Done;
            }

            RelayStats::add(&stats.dropped_overflow, delivered.dropped);
            warn!(dropped = delivered.dropped, bound = buffer.max_bytes(), "Backpressure buffer full, dropping bytes");
            ClientDelivery::Overflowed
        }
        Err(error) => ClientDelivery::ClientFailed(error),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Delivered {
    written: usize,
    buffered: usize,
    dropped: usize,
}

/// Writes `data` with `write` if nothing is buffered, and buffers whatever wasn't written.
fn write_or_buffer<W>(write: W, buffer: &mut BackpressureBuffer, data: &[u8]) -> io::Result<Delivered>
where
    W: FnOnce(&[u8]) -> io::Result<Option<usize>>,
{
    let mut written = 0;
    if buffer.is_empty() && !data.is_empty() {
        written = write(data)?.unwrap_or(0);
    }

    let outcome = buffer.push(&data[written..]);
    Ok(Delivered {
        written,
        buffered: outcome.accepted,
        dropped: outcome.dropped,
    })
}

/// Writes buffered bytes with `write` until the buffer is empty or `write` can't take more.
/// Returns how many bytes were written.
fn flush_buffer<W>(mut write: W, buffer: &mut BackpressureBuffer) -> io::Result<usize>
where
    W: FnMut(&[u8]) -> io::Result<Option<usize>>,
{
    let mut flushed = 0;
    while !buffer.is_empty() {
        match write(buffer.front())? {
            None | Some(0) => break,
            Some(len) => {
                buffer.consume(len);
                flushed += len;
            }
        }
    }

    Ok(flushed)
}
