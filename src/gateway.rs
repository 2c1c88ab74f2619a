use std::{
    io::{self, ErrorKind},
    net::SocketAddr,
};

use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    Rejected,
}

struct ActiveClient {
    stream: TcpStream,
    address: SocketAddr,
}

/// The local TCP endpoint of the relay. Serves one client at a time.
pub struct TcpGateway {
    listener: TcpListener,
    client: Option<ActiveClient>,
    rejected: u64,
}

impl TcpGateway {
    pub async fn bind(address: SocketAddr) -> Result<Self, Error> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| Error::Gateway { address, source })?;

        Ok(Self {
            listener,
            client: None,
            rejected: 0,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Waits for an incoming connection. This is cancel safe.
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept().await
    }

    /// Makes `stream` the active client, or closes it right away if there already is one.
    pub fn admit(&mut self, stream: TcpStream, address: SocketAddr) -> Admission {
        if let Some(active) = &self.client {
            self.rejected += 1;
            warn!(%address, active = %active.address, rejected = self.rejected, "Rejecting client, another one is active");
            return Admission::Rejected;
        }

        if let Err(error) = stream.set_nodelay(true) {
            warn!(%address, %error, "Couldn't disable Nagle's algorithm on client socket");
        }

        info!(%address, "Client connected");
        self.client = Some(ActiveClient { stream, address });
        Admission::Accepted
    }

    /// How many clients were turned away because another one was active.
    pub fn rejected_count(&self) -> u64 {
        self.rejected
    }

    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }

    pub fn client_stream(&self) -> Option<&TcpStream> {
        self.client.as_ref().map(|c| &c.stream)
    }

    /// Reads whatever the client sent, without waiting. Returns `Ok(None)` if nothing is available
    /// yet, and `Ok(Some(0))` once the client closed its side.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let client = self.client.as_ref().ok_or(ErrorKind::NotConnected)?;
        would_block_to_none(client.stream.try_read(buf))
    }

    /// Writes as much of `data` to the client as it takes without waiting. Returns `Ok(None)` if
    /// it can't take anything right now.
    pub fn write_some(&mut self, data: &[u8]) -> io::Result<Option<usize>> {
        let client = self.client.as_ref().ok_or(ErrorKind::NotConnected)?;
        would_block_to_none(client.stream.try_write(data))
    }

    /// Drops the active client, closing its socket. Returns its address, if there was one.
    pub fn close_client(&mut self) -> Option<SocketAddr> {
        self.client.take().map(|c| c.address)
    }
}

fn would_block_to_none(result: io::Result<usize>) -> io::Result<Option<usize>> {
    match result {
        Ok(len) => Ok(Some(len)),
        Err(error) if error.kind() == ErrorKind::WouldBlock => Ok(None),
        Err(error) => Err(error),
    }
}
