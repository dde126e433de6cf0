use crate::peer::PeerCommand;
use dpa_core::Result;
use dpa_peer_core::FsmEvent;
use dpa_shared::{ConnectionId, DiameterMessage};
use std::fmt;
use tokio::sync::mpsc;

/// One transport connection to a remote node.
///
/// Implementations must not block: `write` queues the frame and returns,
/// `close` may be called any number of times.
pub trait DiameterConnection: Send + Sync + fmt::Debug {
    fn id(&self) -> ConnectionId;

    /// Route inbound messages and the close notification to `owner`
    fn set_owner(&self, owner: Option<PeerLink>);

    fn write(&self, message: &DiameterMessage) -> Result<()>;

    fn close(&self);

    fn is_open(&self) -> bool;
}

/// Callback channel from a connection to the peer that owns it
#[derive(Clone)]
pub struct PeerLink {
    tx: mpsc::UnboundedSender<PeerCommand>,
}

impl PeerLink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<PeerCommand>) -> Self {
        Self { tx }
    }

    /// Hand a decoded message to the peer
    pub fn deliver(&self, message: DiameterMessage) {
        let _ = self.tx.send(PeerCommand::Event {
            event: FsmEvent::Receive(message),
            done: None,
        });
    }

    /// The connection went away underneath the peer
    pub fn closed(&self, connection: ConnectionId) {
        let _ = self.tx.send(PeerCommand::Event {
            event: FsmEvent::PeerDisc(connection),
            done: None,
        });
    }
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink").field("closed", &self.tx.is_closed()).finish()
    }
}
