use crate::connection::TcpConnection;
use dpa_core::{DpaError, Result};
use dpa_shared::ConnectionId;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// TCP client for outbound Diameter peer connections
pub struct TcpClient {
    peer_addr: String,
    connect_timeout: Duration,
}

impl TcpClient {
    /// Create new TCP client
    pub fn new(peer_addr: String, connect_timeout: Duration) -> Self {
        Self {
            peer_addr,
            connect_timeout,
        }
    }

    /// Establish the connection and start its reader/writer tasks
    pub async fn connect(&self, id: ConnectionId) -> Result<Arc<TcpConnection>> {
        debug!("Connecting to {}", self.peer_addr);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.peer_addr))
            .await
            .map_err(|_| DpaError::NetworkError(format!("Connect to {} timed out", self.peer_addr)))??;
        stream.set_nodelay(true)?;
        info!("Connected to {}", self.peer_addr);

        // Nothing is expected before our CER is answered
        let (connection, _unowned) = TcpConnection::spawn(id, stream);
        Ok(connection)
    }
}
