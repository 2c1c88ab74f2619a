//! End-to-end relay tests: two full peers on loopback, from rendezvous to QUIC to TCP.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use chownat_session_sm::{Role, StreamPolicy};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
    sync::oneshot,
    task::{JoinHandle, LocalSet},
};

use crate::{
    endpoint::make_endpoint,
    gateway::TcpGateway,
    relay::{RelayConfig, RelayExit, RelayPump, RelayStats},
    rendezvous::{initiate, respond, RendezvousConfig},
    session::SessionManager,
    transport::{event_queue, spawn_accept_loop, Dial, QuicDialer},
};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const TIMEOUT: Duration = Duration::from_secs(20);

struct Peer {
    address: SocketAddr,
    stats: Arc<RelayStats>,
    endpoint: quinn::Endpoint,
    shutdown: oneshot::Sender<()>,
    pump: JoinHandle<RelayExit>,
}

impl Peer {
    async fn start(role: Role, socket: std::net::UdpSocket, quic_peer: SocketAddr) -> Self {
        let endpoint = make_endpoint(socket, role).unwrap();
        let gateway = TcpGateway::bind(SocketAddr::new(LOCALHOST, 0)).await.unwrap();
        let address = gateway.local_addr().unwrap();

        let (events, receiver) = event_queue();
        let dialer: Option<Box<dyn Dial>> = match role {
            Role::Connector => Some(Box::new(QuicDialer::new(endpoint.clone(), quic_peer))),
            Role::Listener => {
                spawn_accept_loop(endpoint.clone(), events.clone());
                None
            }
        };

        let session = SessionManager::new(role, StreamPolicy::default(), dialer, events);
        let pump = RelayPump::new(RelayConfig::default(), gateway, session, receiver);
        let stats = pump.stats();

        let (shutdown, signal) = oneshot::channel::<()>();
        let pump = tokio::task::spawn_local(pump.run(async move {
            let _ = signal.await;
        }));

        Self {
            address,
            stats,
            endpoint,
            shutdown,
            pump,
        }
    }

    async fn connect_client(&self) -> TcpStream {
        let client = TcpStream::connect(self.address).await.unwrap();
        wait_until(|| self.stats.snapshot().clients_accepted != 0).await;
        client
    }

    async fn stop(self) -> RelayExit {
        let _ = self.shutdown.send(());
        let exit = tokio::time::timeout(TIMEOUT, self.pump).await.unwrap().unwrap();
        self.endpoint.close(0u32.into(), b"");
        exit
    }
}

async fn wait_until<F: FnMut() -> bool>(mut condition: F) {
    tokio::time::timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Condition not met in time");
}

/// Runs the rendezvous on two loopback sockets, returning (listener, connector) handshakes.
async fn rendezvous() -> (crate::rendezvous::Handshake, crate::rendezvous::Handshake) {
    let responder = UdpSocket::bind(SocketAddr::new(LOCALHOST, 0)).await.unwrap();
    let responder_addr = responder.local_addr().unwrap();
    let initiator = UdpSocket::bind(SocketAddr::new(LOCALHOST, 0)).await.unwrap();

    let config = RendezvousConfig {
        timeout: Some(TIMEOUT),
        resend_interval: Some(Duration::from_millis(200)),
    };

    let (responded, initiated) = tokio::join!(respond(responder, LOCALHOST, config.timeout), initiate(initiator, responder_addr, &config));
    (responded.unwrap(), initiated.unwrap())
}

#[tokio::test]
async fn test_relays_both_directions_over_reused_control_sockets() {
    LocalSet::new()
        .run_until(async {
            let (listener_handshake, connector_handshake) = rendezvous().await;
            let listener_peer = listener_handshake.peer;
            let connector_peer = connector_handshake.peer;

            let listener = Peer::start(Role::Listener, listener_handshake.socket.into_std().unwrap(), listener_peer).await;
            let connector = Peer::start(Role::Connector, connector_handshake.socket.into_std().unwrap(), connector_peer).await;

            let mut near = connector.connect_client().await;
            let mut far = listener.connect_client().await;

            let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();
            near.write_all(&payload).await.unwrap();

            let mut received = vec![0u8; payload.len()];
            tokio::time::timeout(TIMEOUT, far.read_exact(&mut received)).await.unwrap().unwrap();
            assert_eq!(received, payload);

            far.write_all(b"pong").await.unwrap();
            let mut reply = [0u8; 4];
            tokio::time::timeout(TIMEOUT, near.read_exact(&mut reply)).await.unwrap().unwrap();
            assert_eq!(&reply, b"pong");

            assert_eq!(connector.stats.snapshot().bytes_to_peer, 100_000);
            assert_eq!(listener.stats.snapshot().bytes_to_client, 100_000);

            assert_eq!(connector.stop().await, RelayExit::Shutdown);
            assert_eq!(listener.stop().await, RelayExit::Shutdown);
        })
        .await;
}

#[tokio::test]
async fn test_listener_side_can_talk_first() {
    LocalSet::new()
        .run_until(async {
            let (listener_handshake, connector_handshake) = rendezvous().await;
            let listener_peer = listener_handshake.peer;
            let connector_peer = connector_handshake.peer;

            let listener = Peer::start(Role::Listener, listener_handshake.socket.into_std().unwrap(), listener_peer).await;
            let connector = Peer::start(Role::Connector, connector_handshake.socket.into_std().unwrap(), connector_peer).await;

            let mut near = connector.connect_client().await;
            let mut far = listener.connect_client().await;

            // Like an SSH server, the far side sends its banner before hearing anything.
            far.write_all(b"SSH-2.0-banner\r\n").await.unwrap();
            let mut banner = [0u8; 16];
            tokio::time::timeout(TIMEOUT, near.read_exact(&mut banner)).await.unwrap().unwrap();
            assert_eq!(&banner, b"SSH-2.0-banner\r\n");

            near.write_all(b"SSH-2.0-client\r\n").await.unwrap();
            let mut reply = [0u8; 16];
            tokio::time::timeout(TIMEOUT, far.read_exact(&mut reply)).await.unwrap().unwrap();
            assert_eq!(&reply, b"SSH-2.0-client\r\n");

            assert_eq!(listener.stats.snapshot().dropped_no_stream, 0);
            assert_eq!(connector.stop().await, RelayExit::Shutdown);
            assert_eq!(listener.stop().await, RelayExit::Shutdown);
        })
        .await;
}

#[tokio::test]
async fn test_listener_survives_connector_restart() {
    LocalSet::new()
        .run_until(async {
            let listener_socket = std::net::UdpSocket::bind(SocketAddr::new(LOCALHOST, 0)).unwrap();
            let listener_addr = listener_socket.local_addr().unwrap();
            let listener = Peer::start(Role::Listener, listener_socket, listener_addr).await;
            let mut far = listener.connect_client().await;

            for round in 0u8..2 {
                // A connection arriving while the listener still holds the previous one is refused.
                wait_until(|| listener.stats.snapshot().sessions_closed == round as u64).await;

                let socket = std::net::UdpSocket::bind(SocketAddr::new(LOCALHOST, 0)).unwrap();
                let connector = Peer::start(Role::Connector, socket, listener_addr).await;
                let mut near = connector.connect_client().await;

                let message = [b'a' + round; 16];
                near.write_all(&message).await.unwrap();
                let mut received = [0u8; 16];
                tokio::time::timeout(TIMEOUT, far.read_exact(&mut received)).await.unwrap().unwrap();
                assert_eq!(received, message);

                assert_eq!(connector.stop().await, RelayExit::Shutdown);
            }

            assert_eq!(listener.stop().await, RelayExit::Shutdown);
        })
        .await;
}
