use crate::peer::Peer;
use dpa_peer_core::PeerState;
use tracing::{debug, warn};

/// Deferred restart of a peer after a connection failure
#[derive(Debug, Clone)]
pub struct ReconnectTask {
    peer: Peer,
}

impl ReconnectTask {
    pub fn new(peer: Peer) -> Self {
        Self { peer }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub async fn run(self) {
        if !self.peer.node().is_started() {
            debug!(peer = %self.peer, "Node stopped, reconnect skipped");
            return;
        }
        if self.peer.is_stopped() {
            debug!(peer = %self.peer, "Peer stopped, reconnect skipped");
            return;
        }
        if self.peer.state() != PeerState::Closed {
            // Remote reconnected in the meantime
            return;
        }
        if let Err(e) = self.peer.start().await {
            warn!(peer = %self.peer, error = %e, "Reconnect failed");
        }
    }
}
