//! A sans-IO implementation of the chownat session lifecycle.
//!
//! The [`Session`] tracks one transport connection and at most one relay stream on it. It never
//! performs any I/O itself: the user feeds it the events the transport reports, and the session
//! answers with what should be done (open a stream, shut a stream down, refuse a connection).
//! The actual connection and stream handles are opaque to the state machine, it only needs to
//! tell them apart through [`Handle::handle_id`].
//!
//! This crate also holds the [`BackpressureBuffer`] used by the relay, and the rendezvous wire
//! format in [`rendezvous`].

mod backpressure;
pub mod rendezvous;
mod state;

pub use crate::backpressure::*;
pub use crate::state::*;

/// A transport handle the session can tell apart from others of the same kind.
pub trait Handle {
    /// An identifier unique among all handles of this kind created during the process lifetime.
    fn handle_id(&self) -> u64;
}

/// The possible outcomes of feeding a new connection into the session.
#[derive(Debug, PartialEq, Eq)]
pub enum ConnectedAction<C> {
    /// (connector only) Open the relay stream on the new connection.
    OpenStream,

    /// (listener only) Wait for the peer to open the relay stream.
    AwaitStream,

    /// The session wasn't expecting a connection. It is handed back so it can be closed.
    Refuse(C),
}

/// The possible answers to [`Session::request_stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRequest {
    /// A stream is already open, go ahead and use it.
    AlreadyOpen,

    /// Open a stream on [`Session::connection`].
    Open,

    /// A stream open was already requested and hasn't completed yet.
    Pending,

    /// (listener only) Streams are opened by the peer, wait for it to do so.
    AwaitPeer,

    /// There is no connection to open a stream on.
    NotConnected,
}

/// The possible outcomes of feeding a new stream into the session.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamOpened<S> {
    /// The stream is now the session's relay stream.
    Accepted,

    /// The stream is now the session's relay stream. The previous one is handed back so it can be
    /// shut down.
    Replaced(S),

    /// The session didn't take the stream. It is handed back so it can be shut down.
    Refused(S),
}

/// The handles a teardown takes out of the session, to be shut down gracefully.
#[derive(Debug, PartialEq, Eq)]
pub struct Teardown<C, S> {
    pub connection: C,
    pub stream: Option<S>,
}

#[derive(Debug)]
pub struct Session<C, S> {
    role: Role,
    stream_policy: StreamPolicy,
    state: SessionState,
    stream_state: StreamState,
    connection: Option<C>,
    connection_id: Option<u64>,
    stream: Option<S>,
    stream_requested: bool,
}

impl<C: Handle, S: Handle> Session<C, S> {
    pub fn new(role: Role, stream_policy: StreamPolicy) -> Self {
        Self {
            role,
            stream_policy,
            state: SessionState::Idle,
            stream_state: StreamState::NoStream,
            connection: None,
            connection_id: None,
            stream: None,
            stream_requested: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn stream_policy(&self) -> StreamPolicy {
        self.stream_policy
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stream_state(&self) -> StreamState {
        self.stream_state
    }

    pub fn connection(&self) -> Option<&C> {
        self.connection.as_ref()
    }

    pub fn stream(&self) -> Option<&S> {
        self.stream.as_ref()
    }

    pub fn is_stream_requested(&self) -> bool {
        self.stream_requested
    }

    /// Returns the relay stream if the session is connected and the stream is open.
    pub fn sendable_stream(&self) -> Option<&S> {
        match (self.state, self.stream_state) {
            (SessionState::Connected, StreamState::StreamOpen) => self.stream.as_ref(),
            _ => None,
        }
    }

    /// Returns whether `stream_id` identifies the current relay stream.
    pub fn is_active_stream(&self, stream_id: u64) -> bool {
        self.stream.as_ref().is_some_and(|s| s.handle_id() == stream_id)
    }

    /// Moves an `Idle` session to `Connecting`. Returns false, changing nothing, in any other state.
    pub fn connect(&mut self) -> bool {
        if self.state != SessionState::Idle {
            return false;
        }

        self.state = SessionState::Connecting;
        true
    }

    /// Moves a `Closed` session back to `Idle`. Returns false, changing nothing, in any other state.
    pub fn reset(&mut self) -> bool {
        if self.state != SessionState::Closed {
            return false;
        }

        self.state = SessionState::Idle;
        self.stream_state = StreamState::NoStream;
        true
    }

    /// The transport finished its handshake on `connection`.
    pub fn on_connected(&mut self, connection: C) -> ConnectedAction<C> {
        if self.state != SessionState::Connecting {
            return ConnectedAction::Refuse(connection);
        }

        self.state = SessionState::Connected;
        self.stream_state = StreamState::NoStream;
        self.connection_id = Some(connection.handle_id());
        self.connection = Some(connection);

        match self.role {
            Role::Connector => {
                self.stream_requested = true;
                ConnectedAction::OpenStream
            }
            Role::Listener => ConnectedAction::AwaitStream,
        }
    }

    /// A connection attempt failed before the handshake finished. Returns whether the session was
    /// waiting for it, in which case it is now `Closed`.
    pub fn on_connect_failed(&mut self) -> bool {
        if self.state != SessionState::Connecting {
            return false;
        }

        self.state = SessionState::Closed;
        true
    }

    /// Asks the session for a relay stream, for when there's data to send and no stream to send
    /// it on.
    pub fn request_stream(&mut self) -> StreamRequest {
        if self.state != SessionState::Connected {
            return StreamRequest::NotConnected;
        }

        if self.stream_state == StreamState::StreamOpen {
            return StreamRequest::AlreadyOpen;
        }

        if self.role.is_listener() {
            return StreamRequest::AwaitPeer;
        }

        if self.stream_requested {
            return StreamRequest::Pending;
        }

        self.stream_requested = true;
        StreamRequest::Open
    }

    /// A locally requested stream failed to open.
    pub fn on_stream_open_failed(&mut self) {
        self.stream_requested = false;
    }

    /// A stream was opened, either locally or by the peer.
    pub fn on_stream_opened(&mut self, stream: S, origin: StreamOrigin) -> StreamOpened<S> {
        if origin == StreamOrigin::Local {
            self.stream_requested = false;
        }

        if self.state != SessionState::Connected {
            return StreamOpened::Refused(stream);
        }

        if self.stream_state != StreamState::StreamOpen {
            self.stream = Some(stream);
            self.stream_state = StreamState::StreamOpen;
            return StreamOpened::Accepted;
        }

        match self.stream_policy {
            StreamPolicy::RejectConcurrent => StreamOpened::Refused(stream),
            StreamPolicy::ReplaceExisting => match self.stream.replace(stream) {
                Some(previous) => StreamOpened::Replaced(previous),
                None => StreamOpened::Accepted,
            },
        }
    }

    /// The stream identified by `stream_id` closed on the transport's side (the peer finished it,
    /// it was reset, or a send on it failed). If that was the relay stream, it is handed back and
    /// the stream state becomes `StreamClosed`. Events for any other stream are ignored.
    pub fn on_stream_closed(&mut self, stream_id: u64) -> Option<S> {
        if !self.is_active_stream(stream_id) {
            return None;
        }

        self.stream_state = StreamState::StreamClosed;
        self.stream.take()
    }

    /// Takes the relay stream out of the session so it can be shut down locally.
    pub fn close_stream(&mut self) -> Option<S> {
        let stream = self.stream.take();
        if stream.is_some() {
            self.stream_state = StreamState::StreamClosed;
        }

        stream
    }

    /// Requests a local teardown. If there is a connection, it is taken out of the session (along
    /// with the relay stream, if any) to be shut down gracefully, and the session waits in
    /// `Closing` for [`on_shutdown_complete`](Self::on_shutdown_complete). Calling this again
    /// before or after the shutdown completes returns `None`.
    pub fn teardown(&mut self) -> Option<Teardown<C, S>> {
        match self.state {
            SessionState::Connected => {
                self.state = SessionState::Closing;
                self.stream_requested = false;
                let stream = self.stream.take();
                if stream.is_some() {
                    self.stream_state = StreamState::StreamClosed;
                }

                self.connection.take().map(|connection| Teardown { connection, stream })
            }
            SessionState::Connecting => {
                self.state = SessionState::Closed;
                None
            }
            SessionState::Idle | SessionState::Closing | SessionState::Closed => None,
        }
    }

    /// The transport reported that a connection finished shutting down. Returns whether it was the
    /// session's connection, in which case the session is now `Closed` and holds no handles.
    pub fn on_shutdown_complete(&mut self, connection_id: u64) -> bool {
        if self.connection_id != Some(connection_id) {
            return false;
        }

        self.state = SessionState::Closed;
        if self.stream.take().is_some() || self.stream_state == StreamState::StreamOpen {
            self.stream_state = StreamState::StreamClosed;
        }

        self.connection = None;
        self.connection_id = None;
        self.stream_requested = false;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    struct TestHandle(u64);

    impl Handle for TestHandle {
        fn handle_id(&self) -> u64 {
            self.0
        }
    }

    type TestSession = Session<TestHandle, TestHandle>;

    fn connected(role: Role, policy: StreamPolicy) -> TestSession {
        let mut session = TestSession::new(role, policy);
        assert!(session.connect());
        session.on_connected(TestHandle(1));
        session
    }

    #[test]
    fn test_connect_only_from_idle() {
        let mut session = TestSession::new(Role::Connector, StreamPolicy::default());
        assert_eq!(session.state(), SessionState::Idle);

        assert!(session.connect());
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(!session.connect());
        assert_eq!(session.state(), SessionState::Connecting);

        assert_eq!(session.on_connected(TestHandle(1)), ConnectedAction::OpenStream);
        assert_eq!(session.state(), SessionState::Connected);
        assert!(!session.connect());
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.connection(), Some(&TestHandle(1)));
    }

    #[test]
    fn test_connector_opens_stream_on_connect() {
        let mut session = connected(Role::Connector, StreamPolicy::default());
        assert!(session.is_stream_requested());
        assert_eq!(session.request_stream(), StreamRequest::Pending);

        assert_eq!(session.on_stream_opened(TestHandle(10), StreamOrigin::Local), StreamOpened::Accepted);
        assert!(!session.is_stream_requested());
        assert_eq!(session.stream_state(), StreamState::StreamOpen);
        assert_eq!(session.sendable_stream(), Some(&TestHandle(10)));
        assert_eq!(session.request_stream(), StreamRequest::AlreadyOpen);
    }

    #[test]
    fn test_listener_awaits_peer_stream() {
        let mut session = TestSession::new(Role::Listener, StreamPolicy::default());
        assert!(session.connect());
        assert_eq!(session.on_connected(TestHandle(1)), ConnectedAction::AwaitStream);
        assert_eq!(session.request_stream(), StreamRequest::AwaitPeer);
        assert_eq!(session.sendable_stream(), None);

        assert_eq!(session.on_stream_opened(TestHandle(4), StreamOrigin::Peer), StreamOpened::Accepted);
        assert_eq!(session.sendable_stream(), Some(&TestHandle(4)));
    }

    #[test]
    fn test_unexpected_connection_is_refused() {
        let mut session = TestSession::new(Role::Listener, StreamPolicy::default());
        assert_eq!(session.on_connected(TestHandle(1)), ConnectedAction::Refuse(TestHandle(1)));
        assert_eq!(session.state(), SessionState::Idle);

        let mut session = connected(Role::Listener, StreamPolicy::default());
        assert_eq!(session.on_connected(TestHandle(2)), ConnectedAction::Refuse(TestHandle(2)));
        assert_eq!(session.connection(), Some(&TestHandle(1)));
    }

    #[test]
    fn test_last_stream_wins() {
        let mut session = connected(Role::Listener, StreamPolicy::ReplaceExisting);
        assert_eq!(session.on_stream_opened(TestHandle(4), StreamOrigin::Peer), StreamOpened::Accepted);
        assert_eq!(
            session.on_stream_opened(TestHandle(8), StreamOrigin::Peer),
            StreamOpened::Replaced(TestHandle(4))
        );
        assert_eq!(session.sendable_stream(), Some(&TestHandle(8)));

        // A late close of the replaced stream doesn't affect the new one.
        assert_eq!(session.on_stream_closed(4), None);
        assert_eq!(session.stream_state(), StreamState::StreamOpen);
    }

    #[test]
    fn test_first_stream_wins() {
        let mut session = connected(Role::Listener, StreamPolicy::RejectConcurrent);
        assert_eq!(session.on_stream_opened(TestHandle(4), StreamOrigin::Peer), StreamOpened::Accepted);
        assert_eq!(
            session.on_stream_opened(TestHandle(8), StreamOrigin::Peer),
            StreamOpened::Refused(TestHandle(8))
        );
        assert_eq!(session.sendable_stream(), Some(&TestHandle(4)));

        // Once the first stream closes, a new one is taken.
        assert_eq!(session.on_stream_closed(4), Some(TestHandle(4)));
        assert_eq!(session.stream_state(), StreamState::StreamClosed);
        assert_eq!(session.on_stream_opened(TestHandle(12), StreamOrigin::Peer), StreamOpened::Accepted);
    }

    #[test]
    fn test_stream_refused_when_not_connected() {
        let mut session = TestSession::new(Role::Listener, StreamPolicy::default());
        assert_eq!(
            session.on_stream_opened(TestHandle(4), StreamOrigin::Peer),
            StreamOpened::Refused(TestHandle(4))
        );
        assert_eq!(session.stream_state(), StreamState::NoStream);
    }

    #[test]
    fn test_stream_closed_and_reopened() {
        let mut session = connected(Role::Connector, StreamPolicy::default());
        session.on_stream_opened(TestHandle(10), StreamOrigin::Local);

        assert_eq!(session.on_stream_closed(10), Some(TestHandle(10)));
        assert_eq!(session.stream_state(), StreamState::StreamClosed);
        assert_eq!(session.sendable_stream(), None);
        assert_eq!(session.on_stream_closed(10), None);

        assert_eq!(session.request_stream(), StreamRequest::Open);
        assert_eq!(session.request_stream(), StreamRequest::Pending);
        session.on_stream_open_failed();
        assert_eq!(session.request_stream(), StreamRequest::Open);
        assert_eq!(session.on_stream_opened(TestHandle(14), StreamOrigin::Local), StreamOpened::Accepted);
        assert_eq!(session.sendable_stream(), Some(&TestHandle(14)));
    }

    #[test]
    fn test_close_stream_locally() {
        let mut session = connected(Role::Listener, StreamPolicy::default());
        assert_eq!(session.close_stream(), None);
        assert_eq!(session.stream_state(), StreamState::NoStream);

        session.on_stream_opened(TestHandle(4), StreamOrigin::Peer);
        assert_eq!(session.close_stream(), Some(TestHandle(4)));
        assert_eq!(session.stream_state(), StreamState::StreamClosed);
        assert_eq!(session.close_stream(), None);
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let mut session = connected(Role::Connector, StreamPolicy::default());
        session.on_stream_opened(TestHandle(10), StreamOrigin::Local);

        let teardown = session.teardown();
        assert_eq!(
            teardown,
            Some(Teardown {
                connection: TestHandle(1),
                stream: Some(TestHandle(10)),
            })
        );
        assert_eq!(session.state(), SessionState::Closing);
        assert_eq!(session.teardown(), None);
        assert_eq!(session.state(), SessionState::Closing);

        assert!(session.on_shutdown_complete(1));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.teardown(), None);
        assert!(!session.on_shutdown_complete(1));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.connection(), None);
        assert_eq!(session.stream(), None);
    }

    #[test]
    fn test_teardown_while_connecting() {
        let mut session = TestSession::new(Role::Connector, StreamPolicy::default());
        session.connect();
        assert_eq!(session.teardown(), None);
        assert_eq!(session.state(), SessionState::Closed);

        // The connection that was in flight is refused when it arrives.
        assert_eq!(session.on_connected(TestHandle(3)), ConnectedAction::Refuse(TestHandle(3)));
    }

    #[test]
    fn test_shutdown_complete_from_peer() {
        let mut session = connected(Role::Listener, StreamPolicy::default());
        session.on_stream_opened(TestHandle(4), StreamOrigin::Peer);

        assert!(!session.on_shutdown_complete(99));
        assert_eq!(session.state(), SessionState::Connected);

        assert!(session.on_shutdown_complete(1));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.stream_state(), StreamState::StreamClosed);
        assert_eq!(session.sendable_stream(), None);
        assert_eq!(session.request_stream(), StreamRequest::NotConnected);
    }

    #[test]
    fn test_reset_after_close() {
        let mut session = TestSession::new(Role::Connector, StreamPolicy::default());
        assert!(!session.reset());

        session.connect();
        assert!(session.on_connect_failed());
        assert!(!session.on_connect_failed());
        assert_eq!(session.state(), SessionState::Closed);

        assert!(session.reset());
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.stream_state(), StreamState::NoStream);
        assert!(session.connect());
    }
}
