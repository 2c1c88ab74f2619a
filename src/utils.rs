use std::{io, time::Instant};

use tokio::net::TcpStream;

/// Sleeps until the provided instant if `Some`, or never finishes if `None`.
pub async fn sleep_until_if_some(until: Option<Instant>) {
    match until {
        Some(v) => tokio::time::sleep_until(tokio::time::Instant::from_std(v)).await,
        None => std::future::pending().await,
    }
}

/// Waits for the stream to become readable if `Some`, or never finishes if `None`.
pub async fn readable_if_some(stream: Option<&TcpStream>) -> io::Result<()> {
    match stream {
        Some(s) => s.readable().await,
        None => std::future::pending().await,
    }
}

/// Waits for the stream to become writable if `Some`, or never finishes if `None`.
pub async fn writable_if_some(stream: Option<&TcpStream>) -> io::Result<()> {
    match stream {
        Some(s) => s.writable().await,
        None => std::future::pending().await,
    }
}

/// Returns the earliest of two optional instants.
pub fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}
