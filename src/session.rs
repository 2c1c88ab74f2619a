use chownat_session_sm::{
    ConnectedAction, Role, Session, SessionState, StreamOpened, StreamOrigin, StreamPolicy, StreamRequest, StreamState, Teardown,
};
use tracing::{debug, info, warn};

use crate::{
    error::SendError,
    transport::{ConnectionHandle, Dial, EventSender, StreamHandle, TransportEvent, CLOSE_CODE_BUSY, CLOSE_CODE_NORMAL},
};

/// What the relay needs to know after the session processed a transport event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionNotice {
    Nothing,

    /// A connection was established.
    Connected,

    /// A relay stream is open and ready for sending.
    StreamReady,

    /// A locally requested stream couldn't be opened.
    StreamOpenFailed,

    /// The relay stream ended.
    StreamLost,

    /// `len` bytes couldn't be written to the peer.
    SendFailed { len: usize },

    /// `len` bytes arrived on a stream that isn't the relay stream and were discarded.
    Discarded { len: usize },

    /// The session is now `Closed`.
    Closed,
}

/// Drives a [`Session`] with quinn-backed handles: performs the I/O the state machine asks for,
/// and keeps track of the bytes sent but not yet completed on the relay stream.
pub struct SessionManager {
    session: Session<ConnectionHandle, StreamHandle>,
    dialer: Option<Box<dyn Dial>>,
    events: EventSender,
    inflight_bytes: usize,
}

impl SessionManager {
    /// Creates a session manager. A connector needs a `dialer`, a listener gets its connections
    /// from an accept loop posting to the same event queue as `events`.
    pub fn new(role: Role, stream_policy: StreamPolicy, dialer: Option<Box<dyn Dial>>, events: EventSender) -> Self {
        Self {
            session: Session::new(role, stream_policy),
            dialer,
            events,
            inflight_bytes: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.session.role()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn stream_state(&self) -> StreamState {
        self.session.stream_state()
    }

    /// Whether [`send`](Self::send) currently has a stream to send on.
    pub fn is_sendable(&self) -> bool {
        self.session.sendable_stream().is_some()
    }

    /// Bytes handed to the relay stream whose send hasn't completed yet.
    pub fn inflight_bytes(&self) -> usize {
        self.inflight_bytes
    }

    /// Starts connecting (connector) or waiting for an incoming connection (listener). Does
    /// nothing unless the session is `Idle`. Returns [`SessionNotice::Closed`] if the attempt
    /// failed right away.
    pub fn connect(&mut self) -> SessionNotice {
        if !self.session.connect() {
            debug!(state = ?self.session.state(), "Ignoring connect request, session isn't idle");
            return SessionNotice::Nothing;
        }

        match self.session.role() {
            Role::Connector => match &self.dialer {
                Some(dialer) => dialer.dial(&self.events),
                None => {
                    warn!("Connector has no way to dial out");
                    self.session.on_connect_failed();
                    return SessionNotice::Closed;
                }
            },
            Role::Listener => info!("Waiting for an incoming connection"),
        }

        SessionNotice::Nothing
    }

    /// Moves a `Closed` session back to `Idle`, so it can [`connect`](Self::connect) again.
    pub fn reset(&mut self) -> bool {
        self.inflight_bytes = 0;
        self.session.reset()
    }

    /// Sends bytes to the peer on the relay stream. On failure nothing was sent.
    pub fn send(&mut self, data: &[u8]) -> Result<(), SendError> {
        let stream = self.session.sendable_stream().ok_or(SendError::NoStream)?;
        let stream_id = stream.id();

        match stream.send(data.to_vec()) {
            Ok(()) => {
                self.inflight_bytes += data.len();
                Ok(())
            }
            Err(error) => {
                warn!(stream_id, "Relay stream writer is gone, considering the stream closed");
                self.session.on_stream_closed(stream_id);
                self.inflight_bytes = 0;
                Err(error)
            }
        }
    }

    /// Makes sure a relay stream exists or is on its way. A connector asks the transport for a new
    /// stream, a listener has to wait for the peer to open one.
    pub fn ensure_stream(&mut self) -> StreamRequest {
        let request = self.session.request_stream();
        if request != StreamRequest::Open {
            return request;
        }

        let opened = self.session.connection().is_some_and(|connection| connection.open_stream());
        if !opened {
            warn!("Connection is gone, couldn't request a relay stream");
            self.session.on_stream_open_failed();
            return StreamRequest::NotConnected;
        }

        debug!("Requested a new relay stream");
        request
    }

    /// Finishes the relay stream gracefully, keeping the connection.
    pub fn close_stream(&mut self) {
        if let Some(stream) = self.session.close_stream() {
            info!(stream_id = stream.id(), "Finishing relay stream");
            stream.finish();
            self.inflight_bytes = 0;
        }
    }

    /// Finishes the relay stream and closes the connection. Returns whether a connection is now
    /// shutting down, in which case a [`SessionNotice::Closed`] follows once it's gone. Calling
    /// this again does nothing.
    pub fn teardown(&mut self) -> bool {
        let state = self.session.state();
        let Some(Teardown { connection, stream }) = self.session.teardown() else {
            debug!(?state, "Nothing to tear down");
            return false;
        };

        if let Some(stream) = stream {
            stream.finish();
        }

        info!(connection_id = connection.id(), remote = %connection.remote_address(), "Closing connection");
        connection.close(CLOSE_CODE_NORMAL, b"Shutting down");
        self.inflight_bytes = 0;
        true
    }

    /// Feeds a transport event into the session. Bytes received on the relay stream are passed to
    /// `deliver`, and every delivery is acknowledged exactly once, whether it was used or not.
    pub fn handle_event<F>(&mut self, event: TransportEvent, deliver: F) -> SessionNotice
    where
        F: FnOnce(&[u8]),
    {
        match event {
            TransportEvent::Connected(connection) => self.on_connected(connection),
            TransportEvent::ConnectFailed { reason } => {
                if self.session.on_connect_failed() {
                    warn!(%reason, "Connection attempt failed");
                    SessionNotice::Closed
                } else {
                    debug!(%reason, "Ignoring failure of a connection attempt nobody waits for");
                    SessionNotice::Nothing
                }
            }
            TransportEvent::StreamOpened(stream) => self.on_stream_opened(stream, StreamOrigin::Local),
            TransportEvent::PeerStreamStarted(stream) => self.on_stream_opened(stream, StreamOrigin::Peer),
            TransportEvent::StreamOpenFailed { connection_id, reason } => {
                if self.session.connection().is_some_and(|c| c.id() == connection_id) {
                    warn!(connection_id, %reason, "Couldn't open relay stream");
                    self.session.on_stream_open_failed();
                    SessionNotice::StreamOpenFailed
                } else {
                    SessionNotice::Nothing
                }
            }
            TransportEvent::Received { stream_id, data, ack } => {
                let len = data.len();
                let notice = if self.session.state() == SessionState::Connected && self.session.is_active_stream(stream_id) {
                    deliver(&data);
                    SessionNotice::Nothing
                } else {
                    debug!(stream_id, len, "Discarding bytes from a stream that isn't the relay stream");
                    SessionNotice::Discarded { len }
                };

                ack.complete(len);
                notice
            }
            TransportEvent::StreamClosed { stream_id, reason } => match self.session.on_stream_closed(stream_id) {
                Some(_stream) => {
                    match reason {
                        None => info!(stream_id, "Peer finished the relay stream"),
                        Some(reason) => warn!(stream_id, %reason, "Relay stream closed"),
                    }

                    self.inflight_bytes = 0;
                    SessionNotice::StreamLost
                }
                None => SessionNotice::Nothing,
            },
            TransportEvent::SendComplete { stream_id, len, result } => {
                let active = self.session.is_active_stream(stream_id);
                if active {
                    self.inflight_bytes = self.inflight_bytes.saturating_sub(len);
                }

                match result {
                    Ok(()) => SessionNotice::Nothing,
                    Err(reason) => {
                        if active {
                            warn!(stream_id, len, %reason, "Send failed, closing relay stream");
                            self.session.on_stream_closed(stream_id);
                            self.inflight_bytes = 0;
                        } else {
                            debug!(stream_id, len, %reason, "Send failed on a stale stream");
                        }

                        SessionNotice::SendFailed { len }
                    }
                }
            }
            TransportEvent::ShutdownComplete { connection_id, reason } => {
                if self.session.on_shutdown_complete(connection_id) {
                    info!(connection_id, %reason, "Connection closed");
                    self.inflight_bytes = 0;
                    SessionNotice::Closed
                } else {
                    debug!(connection_id, %reason, "Unrelated connection closed");
                    SessionNotice::Nothing
                }
            }
        }
    }

    fn on_connected(&mut self, connection: ConnectionHandle) -> SessionNotice {
        let connection_id = connection.id();
        let remote = connection.remote_address();

        match self.session.on_connected(connection) {
            ConnectedAction::OpenStream => {
                info!(connection_id, %remote, "Connected, opening relay stream");
                self.inflight_bytes = 0;
                let opened = self.session.connection().is_some_and(|c| c.open_stream());
                if !opened {
                    self.session.on_stream_open_failed();
                }

                SessionNotice::Connected
            }
            ConnectedAction::AwaitStream => {
                info!(connection_id, %remote, "Connected, waiting for the peer's relay stream");
                self.inflight_bytes = 0;
                SessionNotice::Connected
            }
            ConnectedAction::Refuse(connection) => {
                warn!(connection_id, %remote, state = ?self.session.state(), "Refusing unexpected connection");
                connection.close(CLOSE_CODE_BUSY, b"Busy");
                SessionNotice::Nothing
            }
        }
    }

    fn on_stream_opened(&mut self, stream: StreamHandle, origin: StreamOrigin) -> SessionNotice {
        let stream_id = stream.id();
        let quic_id = stream.quic_id();

        match self.session.on_stream_opened(stream, origin) {
            StreamOpened::Accepted => {
                info!(stream_id, ?quic_id, ?origin, "Relay stream open");
                self.inflight_bytes = 0;
                SessionNotice::StreamReady
            }
            StreamOpened::Replaced(previous) => {
                info!(stream_id, ?quic_id, previous = previous.id(), "Replacing relay stream with a newer one");
                previous.finish();
                self.inflight_bytes = 0;
                SessionNotice::StreamReady
            }
            StreamOpened::Refused(stream) => {
                warn!(stream_id, ?quic_id, ?origin, state = ?self.session.state(), "Refusing stream");
                stream.finish();
                SessionNotice::Nothing
            }
        }
    }
}
