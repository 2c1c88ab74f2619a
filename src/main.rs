use std::{
    env,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    process::exit,
};

use args::{ArgumentsError, ArgumentsRequest, StartupArguments};
use chownat_session_sm::Role;
use error::Error;
use gateway::TcpGateway;
use quinn::VarInt;
use relay::{RelayExit, RelayPump};
use rendezvous::HandshakeRole;
use session::SessionManager;
use tokio::task::LocalSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use transport::{Dial, QuicDialer, CLOSE_CODE_NORMAL};

mod args;
mod endpoint;
mod error;
mod gateway;
mod relay;
mod rendezvous;
mod session;
mod transport;
mod utils;

#[cfg(test)]
mod tests;

fn main() {
    let arguments = match args::parse_arguments(env::args()) {
        Err(err) => {
            eprintln!("{err}\n\nType 'chownat --help' for a help menu");
            exit(1);
        }
        Ok(arguments) => arguments,
    };

    let startup_args = match arguments {
        ArgumentsRequest::Version => {
            println!("{}", args::get_version_string());
            return;
        }
        ArgumentsRequest::Help => {
            println!("{}", args::get_help_string());
            return;
        }
        ArgumentsRequest::Run(startup_args) => startup_args,
    };

    init_logging(startup_args.verbose);

    let runtime_result = tokio::runtime::Builder::new_current_thread().enable_all().build();

    let result = match runtime_result {
        Ok(runtime) => LocalSet::new().block_on(&runtime, async_main(startup_args)),
        Err(err) => {
            eprintln!("Failed to start Tokio runtime: {err}");
            exit(1);
        }
    };

    match result {
        Ok(exit_reason) => info!(?exit_reason, "Finished"),
        Err(error) => {
            error!(%error, "Program finished with error");
            exit(1);
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn unspecified_like(address: IpAddr) -> IpAddr {
    match address {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

async fn async_main(startup_args: StartupArguments) -> Result<RelayExit, Error> {
    let (role, handshake_role, peer_address) = match (startup_args.is_server, startup_args.remote_address) {
        (true, address) => (
            Role::Listener,
            HandshakeRole::Responder,
            address.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        ),
        (false, Some(address)) => (Role::Connector, HandshakeRole::Initiator, address),
        (false, None) => return Err(ArgumentsError::MissingRemoteAddress.into()),
    };

    let gateway = TcpGateway::bind(startup_args.listen_address).await?;
    info!(address = %gateway.local_addr()?, ?role, "Relaying local TCP clients");

    let handshake = rendezvous::perform_handshake(
        handshake_role,
        peer_address,
        startup_args.control_port,
        &startup_args.rendezvous,
    )
    .await?;

    let (socket, quic_peer) = if startup_args.reuse_control_socket {
        (handshake.socket.into_std()?, handshake.peer)
    } else {
        let bind_port = match role {
            Role::Listener => startup_args.quic_port,
            Role::Connector => 0,
        };

        let local = SocketAddr::new(unspecified_like(handshake.peer.ip()), bind_port);
        let socket = std::net::UdpSocket::bind(local)?;
        (socket, SocketAddr::new(handshake.peer.ip(), startup_args.quic_port))
    };

    let endpoint = endpoint::make_endpoint(socket, role)?;
    info!(local = %endpoint.local_addr()?, "QUIC endpoint ready");

    let (events, event_receiver) = transport::event_queue();
    let dialer: Option<Box<dyn Dial>> = match role {
        Role::Connector => Some(Box::new(QuicDialer::new(endpoint.clone(), quic_peer))),
        Role::Listener => {
            transport::spawn_accept_loop(endpoint.clone(), events.clone());
            None
        }
    };

    let session = SessionManager::new(role, startup_args.stream_policy, dialer, events);
    let pump = RelayPump::new(startup_args.relay, gateway, session, event_receiver);

    let exit_reason = pump
        .run(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                warn!(%error, "Couldn't listen for Ctrl-C, running until the session ends");
                std::future::pending::<()>().await;
            }
        })
        .await;

    endpoint.close(VarInt::from_u32(CLOSE_CODE_NORMAL), b"Shutting down");
    endpoint.wait_idle().await;
    Ok(exit_reason)
}
