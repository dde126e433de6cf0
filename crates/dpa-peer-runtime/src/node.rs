use crate::connection::DiameterConnection;
use crate::peer::Peer;
use crate::reconnect::ReconnectTask;
use async_trait::async_trait;
use dpa_core::Result;
use dpa_shared::DiameterMessage;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// The local Diameter node as seen by its peers.
///
/// Everything except `connect` is called from a peer's actor task and must
/// return without waiting on that peer.
#[async_trait]
pub trait Node: Send + Sync + 'static {
    /// Local DiameterIdentity, sent as Origin-Host and used for elections
    fn identity(&self) -> &str;

    fn realm(&self) -> &str;

    /// Add Host-IP-Address, Vendor-Id, Product-Name and application AVPs to a CER/CEA
    fn add_capabilities(&self, message: &mut DiameterMessage);

    /// Open an outbound connection to `peer`
    async fn connect(&self, peer: &Peer) -> Result<Arc<dyn DiameterConnection>>;

    /// Run `task` once the reconnect backoff has elapsed
    fn schedule_reconnect(&self, task: ReconnectTask);

    fn reconnect_delay(&self) -> Duration;

    /// Age after which an unanswered request is given up
    fn request_timeout(&self) -> Duration;

    fn is_started(&self) -> bool;

    /// Application request, or application answer with its request attached
    fn handle(&self, message: DiameterMessage);

    fn handle_expired(&self, request: DiameterMessage) {
        warn!(
            command_code = request.command_code,
            hop_by_hop_id = request.hop_by_hop_id,
            "Request expired without answer"
        );
    }
}
