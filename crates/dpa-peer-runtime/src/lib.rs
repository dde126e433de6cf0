//! Actor runtime around [`dpa_peer_core::PeerFsm`].
//!
//! Each [`Peer`] owns one task that applies its events strictly in arrival
//! order; the task carries out the state machine's actions against the
//! [`Node`] and its [`DiameterConnection`]s.

pub mod connection;
pub mod ids;
pub mod node;
pub mod peer;
mod peer_actor;
pub mod pending;
pub mod reconnect;

#[cfg(test)]
mod mock;

pub use connection::{DiameterConnection, PeerLink};
pub use ids::IdGenerator;
pub use node::Node;
pub use peer::Peer;
pub use pending::{PendingRequest, PendingRequests};
pub use reconnect::ReconnectTask;
pub use dpa_peer_core::PeerState;
