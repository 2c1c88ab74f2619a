use std::{io, net::SocketAddr, time::Duration};

use thiserror::Error;

use crate::args::ArgumentsError;

/// Errors that end the program.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid arguments: {0}")]
    Arguments(#[from] ArgumentsError),

    #[error("rendezvous failed: {0}")]
    Rendezvous(#[from] RendezvousError),

    #[error("couldn't set up the QUIC endpoint: {0}")]
    Endpoint(#[from] EndpointError),

    #[error("couldn't open the local TCP relay endpoint at {address}: {source}")]
    Gateway { address: SocketAddr, source: io::Error },

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum RendezvousError {
    #[error("no rendezvous completed within {0:?}")]
    Timeout(Duration),

    #[error("the peer replied with {0:?} instead of an acknowledgment")]
    UnexpectedReply(Vec<u8>),

    #[error("the peer replied with an empty datagram")]
    EmptyReply,

    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("couldn't generate a certificate: {0}")]
    Certificate(String),

    #[error("invalid TLS configuration: {0}")]
    Tls(#[from] rustls::Error),

    #[error("couldn't bind the endpoint: {0}")]
    Io(#[from] io::Error),
}

/// Why bytes handed to the session couldn't be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The session has no open relay stream.
    #[error("no relay stream is open")]
    NoStream,

    /// The relay stream's writer is gone, so the stream is now considered closed.
    #[error("the relay stream closed")]
    StreamClosed,
}
