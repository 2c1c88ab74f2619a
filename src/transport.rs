//! The glue between quinn and the relay.
//!
//! Every connection and stream is driven by its own task. Those tasks never touch the session or
//! the relay directly: they report what happens as [`TransportEvent`]s on a single queue that only
//! the relay pump drains, and they take commands through the channel-backed [`ConnectionHandle`]
//! and [`StreamHandle`].
//!
//! All tasks are spawned with `spawn_local`, so a task that spawns another and then posts an event
//! without yielding is guaranteed to have that event queued before anything the new task posts.

use std::{
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
};

use chownat_session_sm::Handle;
use quinn::{Connection, Endpoint, RecvStream, SendStream, StreamId, VarInt};
use tokio::{
    select,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{endpoint::SERVER_NAME, error::SendError};

/// How many bytes a stream reader delivers per [`TransportEvent::Received`] at most.
pub const RECEIVE_CHUNK_SIZE: usize = 4096;

/// The application error code used when closing a connection on purpose.
pub const CLOSE_CODE_NORMAL: u32 = 0;

/// The application error code used when refusing a connection the session didn't expect.
pub const CLOSE_CODE_BUSY: u32 = 1;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

fn next_handle_id() -> u64 {
    NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed)
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

pub fn event_queue() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

#[derive(Debug)]
pub enum TransportEvent {
    /// A connection finished its handshake.
    Connected(ConnectionHandle),

    /// An outgoing connection attempt failed.
    ConnectFailed { reason: String },

    /// A stream requested through [`ConnectionHandle::open_stream`] is open.
    StreamOpened(StreamHandle),

    /// A stream requested through [`ConnectionHandle::open_stream`] couldn't be opened.
    StreamOpenFailed { connection_id: u64, reason: String },

    /// The peer started a stream.
    PeerStreamStarted(StreamHandle),

    /// Bytes arrived on a stream. The stream won't deliver anything else until `ack` is completed.
    Received { stream_id: u64, data: Vec<u8>, ack: ReceiveAck },

    /// A stream's receiving side ended. `reason` is `None` if the peer finished it normally.
    StreamClosed { stream_id: u64, reason: Option<String> },

    /// A [`StreamHandle::send`] completed, successfully or not.
    SendComplete {
        stream_id: u64,
        len: usize,
        result: Result<(), String>,
    },

    /// A connection is gone, along with all its streams.
    ShutdownComplete { connection_id: u64, reason: String },
}

/// The flow-control acknowledgment for a [`TransportEvent::Received`] delivery.
#[derive(Debug)]
pub struct ReceiveAck {
    sender: oneshot::Sender<usize>,
}

impl ReceiveAck {
    pub fn channel() -> (Self, oneshot::Receiver<usize>) {
        let (sender, receiver) = oneshot::channel();
        (Self { sender }, receiver)
    }

    /// Tells the stream `consumed` bytes were taken, letting it read more from the network.
    pub fn complete(self, consumed: usize) {
        let _ = self.sender.send(consumed);
    }
}

#[derive(Debug)]
pub enum ConnectionCommand {
    OpenStream,
    Close { code: u32, reason: &'static [u8] },
}

/// A reference to a connection driven by its own task.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: u64,
    remote_address: SocketAddr,
    commands: mpsc::UnboundedSender<ConnectionCommand>,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote_address
    }

    /// Asks for a new bidirectional stream. The outcome is reported as a
    /// [`TransportEvent::StreamOpened`] or [`TransportEvent::StreamOpenFailed`]. Returns false if
    /// the connection's task is already gone.
    pub fn open_stream(&self) -> bool {
        self.commands.send(ConnectionCommand::OpenStream).is_ok()
    }

    /// Closes the connection. Completion is reported as a [`TransportEvent::ShutdownComplete`].
    pub fn close(&self, code: u32, reason: &'static [u8]) {
        let _ = self.commands.send(ConnectionCommand::Close { code, reason });
    }

    /// Creates a handle with no task behind it, returning the receiving end of its commands.
    #[cfg(test)]
    pub fn detached(remote_address: SocketAddr) -> (Self, mpsc::UnboundedReceiver<ConnectionCommand>) {
        let (commands, receiver) = mpsc::unbounded_channel();
        let handle = Self {
            id: next_handle_id(),
            remote_address,
            commands,
        };

        (handle, receiver)
    }
}

impl Handle for ConnectionHandle {
    fn handle_id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug)]
pub enum StreamRequest {
    Send(Vec<u8>),
    Finish,
}

/// A reference to a bidirectional stream whose sending side is driven by its own task.
#[derive(Debug)]
pub struct StreamHandle {
    id: u64,
    quic_id: Option<StreamId>,
    requests: mpsc::UnboundedSender<StreamRequest>,
}

impl StreamHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn quic_id(&self) -> Option<StreamId> {
        self.quic_id
    }

    /// Queues bytes to be written on the stream. Completion is reported as a
    /// [`TransportEvent::SendComplete`].
    pub fn send(&self, data: Vec<u8>) -> Result<(), SendError> {
        self.requests
            .send(StreamRequest::Send(data))
            .map_err(|_| SendError::StreamClosed)
    }

    /// Finishes the sending side of the stream once everything queued before was written.
    pub fn finish(&self) {
        let _ = self.requests.send(StreamRequest::Finish);
    }

    /// Creates a handle with no task behind it, returning the receiving end of its requests.
    #[cfg(test)]
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<StreamRequest>) {
        let (requests, receiver) = mpsc::unbounded_channel();
        let handle = Self {
            id: next_handle_id(),
            quic_id: None,
            requests,
        };

        (handle, receiver)
    }
}

impl Handle for StreamHandle {
    fn handle_id(&self) -> u64 {
        self.id
    }
}

/// Starts outgoing connections.
pub trait Dial {
    /// Starts connecting. The outcome is reported as a [`TransportEvent::Connected`] or
    /// [`TransportEvent::ConnectFailed`].
    fn dial(&self, events: &EventSender);
}

pub struct QuicDialer {
    endpoint: Endpoint,
    peer: SocketAddr,
}

impl QuicDialer {
    pub fn new(endpoint: Endpoint, peer: SocketAddr) -> Self {
        Self { endpoint, peer }
    }
}

impl Dial for QuicDialer {
    fn dial(&self, events: &EventSender) {
        info!(peer = %self.peer, "Connecting");
        let connecting = match self.endpoint.connect(self.peer, SERVER_NAME) {
            Ok(c) => c,
            Err(error) => {
                let _ = events.send(TransportEvent::ConnectFailed { reason: error.to_string() });
                return;
            }
        };

        let events = events.clone();
        tokio::task::spawn_local(async move {
            let event = match connecting.await {
                Ok(connection) => TransportEvent::Connected(spawn_connection_driver(connection, &events)),
                Err(error) => TransportEvent::ConnectFailed { reason: error.to_string() },
            };

            let _ = events.send(event);
        });
    }
}

/// Accepts incoming connections on `endpoint` until it is closed, reporting each one that finishes
/// its handshake as a [`TransportEvent::Connected`].
pub fn spawn_accept_loop(endpoint: Endpoint, events: EventSender) -> JoinHandle<()> {
    tokio::task::spawn_local(async move {
        while let Some(connecting) = endpoint.accept().await {
            let remote = connecting.remote_address();
            info!(%remote, "Incoming connection");

            let events = events.clone();
            tokio::task::spawn_local(async move {
                match connecting.await {
                    Ok(connection) => {
                        let handle = spawn_connection_driver(connection, &events);
                        let _ = events.send(TransportEvent::Connected(handle));
                    }
                    Err(error) => warn!(%remote, %error, "Failed to accept incoming connection"),
                }
            });
        }

        debug!("Endpoint stopped accepting connections");
    })
}

pub fn spawn_connection_driver(connection: Connection, events: &EventSender) -> ConnectionHandle {
    let (commands, receiver) = mpsc::unbounded_channel();
    let handle = ConnectionHandle {
        id: next_handle_id(),
        remote_address: connection.remote_address(),
        commands,
    };

    tokio::task::spawn_local(drive_connection(handle.id, connection, receiver, events.clone()));
    handle
}

async fn drive_connection(
    connection_id: u64,
    connection: Connection,
    mut commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    events: EventSender,
) {
    let mut has_handle = true;

    let error = loop {
        select! {
            biased;
            command = commands.recv(), if has_handle => match command {
                Some(ConnectionCommand::OpenStream) => {
                    let connection = connection.clone();
                    let events = events.clone();
                    tokio::task::spawn_local(async move {
                        let event = match open_announced_stream(&connection).await {
                            Ok((send, recv)) => TransportEvent::StreamOpened(spawn_stream_tasks(send, recv, &events)),
                            Err(reason) => TransportEvent::StreamOpenFailed { connection_id, reason },
                        };

                        let _ = events.send(event);
                    });
                }
                Some(ConnectionCommand::Close { code, reason }) => {
                    debug!(connection_id, code, "Closing connection");
                    connection.close(VarInt::from_u32(code), reason);
                }
                None => {
                    has_handle = false;
                    connection.close(VarInt::from_u32(CLOSE_CODE_NORMAL), b"Session dropped");
                }
            },
            accepted = connection.accept_bi() => match accepted {
                Ok((send, recv)) => {
                    let handle = spawn_stream_tasks(send, recv, &events);
                    let _ = events.send(TransportEvent::PeerStreamStarted(handle));
                }
                Err(error) => break error,
            },
        }
    };

    let _ = events.send(TransportEvent::ShutdownComplete {
        connection_id,
        reason: error.to_string(),
    });
}

/// Opens a bidirectional stream and makes the peer aware of it right away. quinn only tells the
/// peer about a stream once a frame is sent on it, and an empty write queues a frame with no data.
async fn open_announced_stream(connection: &Connection) -> Result<(SendStream, RecvStream), String> {
    let (mut send, recv) = connection.open_bi().await.map_err(|error| error.to_string())?;
    send.write(&[]).await.map_err(|error| error.to_string())?;
    Ok((send, recv))
}

fn spawn_stream_tasks(send: SendStream, recv: RecvStream, events: &EventSender) -> StreamHandle {
    let (requests, receiver) = mpsc::unbounded_channel();
    let handle = StreamHandle {
        id: next_handle_id(),
        quic_id: Some(send.id()),
        requests,
    };

    tokio::task::spawn_local(write_stream(handle.id, send, receiver, events.clone()));
    tokio::task::spawn_local(read_stream(handle.id, recv, events.clone()));
    handle
}

async fn read_stream(stream_id: u64, mut recv: RecvStream, events: EventSender) {
    let mut buf = vec![0u8; RECEIVE_CHUNK_SIZE];

    let reason = loop {
        match recv.read(&mut buf).await {
            Ok(Some(len)) => {
                let (ack, acked) = ReceiveAck::channel();
                let data = buf[..len].to_vec();
                if events.send(TransportEvent::Received { stream_id, data, ack }).is_err() {
                    return;
                }

                // Nothing more is read, and so no more flow control credit is given to the peer,
                // until the delivery is acknowledged.
                if acked.await.is_err() {
                    let _ = recv.stop(VarInt::from_u32(CLOSE_CODE_NORMAL));
                    return;
                }
            }
            Ok(None) => break None,
            Err(error) => break Some(error.to_string()),
        }
    };

    let _ = events.send(TransportEvent::StreamClosed { stream_id, reason });
}

async fn write_stream(
    stream_id: u64,
    mut send: SendStream,
    mut requests: mpsc::UnboundedReceiver<StreamRequest>,
    events: EventSender,
) {
    while let Some(request) = requests.recv().await {
        let data = match request {
            StreamRequest::Send(data) => data,
            StreamRequest::Finish => break,
        };

        let len = data.len();
        if let Err(error) = send.write_all(&data).await {
            let reason = error.to_string();
            let _ = events.send(TransportEvent::SendComplete {
                stream_id,
                len,
                result: Err(reason.clone()),
            });

            // Fail whatever else was queued, so every send gets exactly one completion.
            requests.close();
            while let Ok(request) = requests.try_recv() {
                if let StreamRequest::Send(data) = request {
                    let _ = events.send(TransportEvent::SendComplete {
                        stream_id,
                        len: data.len(),
                        result: Err(reason.clone()),
                    });
                }
            }

            return;
        }

        let _ = events.send(TransportEvent::SendComplete {
            stream_id,
            len,
            result: Ok(()),
        });
    }

    if let Err(error) = send.finish().await {
        debug!(stream_id, %error, "Finishing stream failed");
    }
}
