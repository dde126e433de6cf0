use crate::error::Result;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream carrying Diameter frames between two nodes.
/// TCP today; SCTP or in-memory streams in tests plug in the same way.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Get remote peer address
    fn peer_addr(&self) -> Result<SocketAddr>;

    /// Get local address
    fn local_addr(&self) -> Result<SocketAddr>;

    /// `local -> remote`, for logs
    fn describe(&self) -> String {
        match (self.local_addr(), self.peer_addr()) {
            (Ok(local), Ok(remote)) => format!("{local} -> {remote}"),
            _ => "unconnected".to_string(),
        }
    }
}

impl Transport for tokio::net::TcpStream {
    fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(tokio::net::TcpStream::peer_addr(self)?)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(tokio::net::TcpStream::local_addr(self)?)
    }
}

impl Transport for tokio::io::DuplexStream {
    fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 0)))
    }
}
