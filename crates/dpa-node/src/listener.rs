use crate::connection::TcpConnection;
use crate::node::LocalNode;
use dpa_core::Result;
use dpa_peer_runtime::{DiameterConnection, Node};
use dpa_shared::DiameterMessage;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// TCP server accepting Diameter connections from remote peers
pub struct TcpServer {
    listener: TcpListener,
    node: Arc<LocalNode>,
}

impl TcpServer {
    /// Bind with SO_REUSEADDR so a restarted node gets its port back at once
    pub fn bind(addr: SocketAddr, node: Arc<LocalNode>) -> Result<Self> {
        let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;

        // Convert to std socket, then to tokio listener
        socket.set_nonblocking(true)?;
        let listener = TcpListener::from_std(socket.into())?;
        Ok(Self { listener, node })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop; ends when `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) {
        info!("DPA listening on {:?}", self.listener.local_addr());

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((socket, addr)) => {
                    debug!("New connection from {}", addr);
                    if let Err(e) = socket.set_nodelay(true) {
                        warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                    }
                    let (connection, unowned) =
                        TcpConnection::spawn(self.node.next_connection_id(), socket);

                    // Spawn connection handler
                    let node = self.node.clone();
                    tokio::spawn(Self::handle_connection(node, connection, unowned));
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
        info!("DPA listener stopped");
    }

    /// The first message must be a CER; its Origin-Host picks the peer
    async fn handle_connection(
        node: Arc<LocalNode>,
        connection: Arc<TcpConnection>,
        mut unowned: mpsc::UnboundedReceiver<DiameterMessage>,
    ) {
        let first = tokio::time::timeout(node.request_timeout(), unowned.recv()).await;
        let cer = match first {
            Ok(Some(message)) if message.is_cer() => message,
            Ok(Some(message)) => {
                warn!(
                    transport = %connection.description(),
                    command_code = message.command_code,
                    "First message is not a CER, closing"
                );
                connection.close();
                return;
            }
            Ok(None) => return,
            Err(_) => {
                warn!(transport = %connection.description(), "No CER received, closing");
                connection.close();
                return;
            }
        };

        let Some(host) = cer.origin_host() else {
            warn!(transport = %connection.description(), "CER without Origin-Host, closing");
            connection.close();
            return;
        };
        let peer = match node.peer_for_cer(&host) {
            Ok(peer) => peer,
            Err(e) => {
                error!(peer = %host, error = %e, "No peer for inbound CER");
                connection.close();
                return;
            }
        };
        // A rejected candidate is closed by the peer itself
        if let Err(e) = peer.r_conn_cer(cer, connection).await {
            debug!(peer = %peer, error = %e, "Inbound connection not adopted");
            return;
        }

        // Read after the CER but before the peer took the connection over
        while let Ok(message) = unowned.try_recv() {
            if let Err(e) = peer.receive(message).await {
                debug!(peer = %peer, error = %e, "Early message rejected");
            }
        }
    }
}
