//! Sans-IO Diameter peer state machine (RFC 6733 §5.6).
//!
//! [`PeerFsm::step`] consumes one [`FsmEvent`] and returns the [`FsmAction`]s
//! the runtime must carry out. The core never touches sockets, clocks or tasks.

pub mod fsm;
pub mod types;

pub use fsm::PeerFsm;
pub use types::{AttemptId, Control, FsmAction, FsmEvent, PeerState};
