use std::{
    future::Future,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::{Duration, Instant},
};

use chownat_session_sm::rendezvous::{self as wire, ReplyError};
use tokio::{net::UdpSocket, select};
use tracing::{debug, info, warn};

use crate::{error::RendezvousError, utils::sleep_until_if_some};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    /// Sends the request and waits for the acknowledgment.
    Initiator,

    /// Waits for a request and acknowledges it.
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RendezvousConfig {
    /// How long to wait for the handshake to complete. `None` waits forever.
    pub timeout: Option<Duration>,

    /// (initiator only) How often to send the request again while waiting for the reply.
    /// `None` sends it only once.
    pub resend_interval: Option<Duration>,
}

/// A completed rendezvous: the control socket it ran on, and the confirmed peer address.
#[derive(Debug)]
pub struct Handshake {
    pub socket: UdpSocket,
    pub peer: SocketAddr,
}

/// Runs the rendezvous handshake.
///
/// The responder binds `control_port` and waits for a request, only taking requests coming from
/// `peer_address` unless it is unspecified. The initiator sends its request from an ephemeral port
/// to `peer_address:control_port`.
pub async fn perform_handshake(
    role: HandshakeRole,
    peer_address: IpAddr,
    control_port: u16,
    config: &RendezvousConfig,
) -> Result<Handshake, RendezvousError> {
    let unspecified = match peer_address {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };

    match role {
        HandshakeRole::Responder => {
            let socket = UdpSocket::bind(SocketAddr::new(unspecified, control_port)).await?;
            info!(local = %socket.local_addr()?, "Waiting for rendezvous request");
            respond(socket, peer_address, config.timeout).await
        }
        HandshakeRole::Initiator => {
            let socket = UdpSocket::bind(SocketAddr::new(unspecified, 0)).await?;
            let peer = SocketAddr::new(peer_address, control_port);
            info!(local = %socket.local_addr()?, %peer, "Sending rendezvous request");
            initiate(socket, peer, config).await
        }
    }
}

/// Waits on `socket` for a rendezvous request and acknowledges it. Datagrams that aren't a request,
/// or that come from an address other than `expected_peer` (if specified), are ignored.
pub async fn respond(socket: UdpSocket, expected_peer: IpAddr, timeout: Option<Duration>) -> Result<Handshake, RendezvousError> {
    let peer = with_timeout(timeout, async {
        let mut buf = [0u8; wire::MAX_DATAGRAM_SIZE];
        loop {
            let (len, from) = socket.recv_from(&mut buf).await?;

            if !expected_peer.is_unspecified() && from.ip() != expected_peer {
                warn!(%from, expected = %expected_peer, "Ignoring datagram from unexpected address");
                continue;
            }

            if !wire::is_request(&buf[..len]) {
                debug!(%from, len, "Ignoring datagram that isn't a rendezvous request");
                continue;
            }

            info!(%from, "Received rendezvous request, acknowledging");
            socket.send_to(&wire::ACKNOWLEDGMENT, from).await?;
            break Ok::<_, RendezvousError>(from);
        }
    })
    .await?;

    Ok(Handshake { socket, peer })
}

/// Sends a rendezvous request to `peer` and waits for its acknowledgment. Datagrams from any other
/// address are ignored, but anything other than an acknowledgment from `peer` is a failure.
pub async fn initiate(socket: UdpSocket, peer: SocketAddr, config: &RendezvousConfig) -> Result<Handshake, RendezvousError> {
    with_timeout(config.timeout, async {
        socket.send_to(&wire::REQUEST, peer).await?;
        let mut next_resend = config.resend_interval.map(|interval| Instant::now() + interval);
        let mut buf = [0u8; wire::MAX_DATAGRAM_SIZE];

        loop {
            select! {
                result = socket.recv_from(&mut buf) => {
                    let (len, from) = result?;
                    if from != peer {
                        warn!(%from, %peer, "Ignoring datagram from unexpected address");
                        continue;
                    }

                    break match wire::check_reply(&buf[..len]) {
                        Ok(()) => Ok::<(), RendezvousError>(()),
                        Err(ReplyError::Empty) => Err(RendezvousError::EmptyReply),
                        Err(ReplyError::Unexpected) => Err(RendezvousError::UnexpectedReply(buf[..len].to_vec())),
                    };
                }
                _ = sleep_until_if_some(next_resend) => {
                    debug!(%peer, "No reply yet, sending rendezvous request again");
                    socket.send_to(&wire::REQUEST, peer).await?;
                    next_resend = config.resend_interval.map(|interval| Instant::now() + interval);
                }
            }
        }
    })
    .await?;

    info!(%peer, "Rendezvous complete");
    Ok(Handshake { socket, peer })
}

async fn with_timeout<T, F>(timeout: Option<Duration>, future: F) -> Result<T, RendezvousError>
where
    F: Future<Output = Result<T, RendezvousError>>,
{
    match timeout {
        Some(duration) => tokio::time::timeout(duration, future)
            .await
            .map_err(|_| RendezvousError::Timeout(duration))?,
        None => future.await,
    }
}
