/// Which side of the transport connection this peer is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Initiates the transport connection and opens the relay stream once connected.
    Connector,

    /// Waits for an incoming transport connection and accepts the relay stream the peer opens.
    Listener,
}

impl Role {
    pub fn is_connector(&self) -> bool {
        matches!(self, Self::Connector)
    }

    pub fn is_listener(&self) -> bool {
        matches!(self, Self::Listener)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum SessionState {
    /// No connection, and none is being attempted.
    #[default]
    Idle,

    /// A connection was requested (connector) or is being waited for (listener), but the
    /// transport handshake hasn't finished yet.
    Connecting,

    /// The transport handshake finished and the session holds a connection.
    Connected,

    /// A local teardown was requested and the transport hasn't yet reported the shutdown as
    /// complete.
    Closing,

    /// The connection is gone. The session may be [`reset`](crate::Session::reset) to `Idle`.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum StreamState {
    /// No relay stream was opened on the current connection yet.
    #[default]
    NoStream,

    /// A relay stream is open and usable for sending.
    StreamOpen,

    /// The relay stream was closed, either by the peer, by a failed send, or locally.
    StreamClosed,
}

/// What to do when a stream arrives while another one is already open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum StreamPolicy {
    /// The last stream wins: the new stream replaces the tracked one, which is handed back to
    /// be shut down.
    #[default]
    ReplaceExisting,

    /// The first stream wins: the new stream is handed back to be shut down.
    RejectConcurrent,
}

/// Where a stream came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamOrigin {
    /// Opened by this peer in answer to [`Session::request_stream`](crate::Session::request_stream).
    Local,

    /// Started by the remote peer.
    Peer,
}
