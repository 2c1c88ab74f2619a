use std::{sync::Arc, time::Duration};

use chownat_session_sm::Role;
use quinn::{ClientConfig, Endpoint, EndpointConfig, IdleTimeout, ServerConfig, TokioRuntime, TransportConfig, VarInt};

use crate::error::EndpointError;

pub const KEEPALIVE_INTERVAL_PERIOD_MILLIS: u64 = 1000;
pub const MAX_IDLE_TIMEOUT_MILLIS: u32 = 4000;

/// The application-layer protocol both peers negotiate.
pub const ALPN_PROTOCOL: &[u8] = b"chow";

/// The name the connector asks for. The listener's certificate is self-signed for it, although
/// the connector doesn't validate it anyway.
pub const SERVER_NAME: &str = "localhost";

/// Bidirectional streams the peer may have open at once. Only one is used as the relay stream,
/// but a replacement may arrive before the previous one is fully closed.
pub const MAX_CONCURRENT_BIDI_STREAMS: u32 = 4;

/// Creates a QUIC endpoint on `socket`, configured as a client for the connector or a server for
/// the listener.
pub fn make_endpoint(socket: std::net::UdpSocket, role: Role) -> Result<Endpoint, EndpointError> {
    let runtime = Arc::new(TokioRuntime);

    let server_config = match role {
        Role::Listener => Some(configure_server()?),
        Role::Connector => None,
    };

    let mut endpoint = Endpoint::new(EndpointConfig::default(), server_config, socket, runtime)?;

    if role == Role::Connector {
        endpoint.set_default_client_config(configure_client());
    }

    Ok(endpoint)
}

fn transport_config() -> TransportConfig {
    let mut transport_config = TransportConfig::default();
    transport_config.max_concurrent_uni_streams(0_u8.into());
    transport_config.max_concurrent_bidi_streams(VarInt::from_u32(MAX_CONCURRENT_BIDI_STREAMS));
    transport_config.keep_alive_interval(Some(Duration::from_millis(KEEPALIVE_INTERVAL_PERIOD_MILLIS)));
    transport_config.max_idle_timeout(Some(IdleTimeout::from(VarInt::from_u32(MAX_IDLE_TIMEOUT_MILLIS))));
    transport_config
}

pub fn configure_client() -> ClientConfig {
    let mut crypto = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(SkipServerVerification::new())
        .with_no_client_auth();
    crypto.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let mut client_config = ClientConfig::new(Arc::new(crypto));
    client_config.transport_config(Arc::new(transport_config()));

    client_config
}

pub fn configure_server() -> Result<ServerConfig, EndpointError> {
    let cert = rcgen::generate_simple_self_signed(vec![SERVER_NAME.into()]).map_err(|e| EndpointError::Certificate(e.to_string()))?;
    let cert_der = cert.serialize_der().map_err(|e| EndpointError::Certificate(e.to_string()))?;
    let priv_key = rustls::PrivateKey(cert.serialize_private_key_der());
    let cert_chain = vec![rustls::Certificate(cert_der)];

    let mut crypto = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(cert_chain, priv_key)?;
    crypto.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let mut server_config = ServerConfig::with_crypto(Arc::new(crypto));
    server_config.transport_config(Arc::new(transport_config()));

    Ok(server_config)
}

struct SkipServerVerification;

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}
