use std::fmt;
use std::time::Duration;
pub use dpa_shared::{ConnectionId, DiameterMessage};

/// Sequence number of an outbound connection attempt
pub type AttemptId = u64;

// RFC 6733 Sec 5.6 Peer State Machine
// I-Open/R-Open are merged into Open, Wait-I-CEA is WaitCea.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    Closed,
    WaitConnAck,      // outbound connect in progress
    WaitCea,          // CER sent on the initiated connection, waiting for CEA
    WaitConnAckElect, // remote CER accepted while our own connect is still in progress
    WaitReturns,      // election lost, waiting for the winner's CEA
    Open,
    Closing,          // DPR sent, waiting for DPA
}

impl PeerState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Closed => "Closed",
            Self::WaitConnAck => "Wait-Conn-Ack",
            Self::WaitCea => "Wait-I-CEA",
            Self::WaitConnAckElect => "Wait-Conn-Ack-Elect",
            Self::WaitReturns => "Wait-Returns",
            Self::Open => "Open",
            Self::Closing => "Closing",
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Input of the state machine
#[derive(Debug)]
pub enum FsmEvent {
    /// Administrative start
    Start,
    /// Administrative stop
    Stop,
    /// Outbound connection established
    ConnAck { attempt: AttemptId, connection: ConnectionId },
    /// Outbound connection failed
    ConnNack { attempt: AttemptId },
    /// CER received on a connection accepted from the remote
    RConnCer { cer: DiameterMessage, connection: ConnectionId },
    /// Any message received on one of the peer's connections
    Receive(DiameterMessage),
    /// A connection was closed underneath the peer
    PeerDisc(ConnectionId),
    /// Periodic watchdog check
    WatchdogTick { idle_threshold: Duration },
    /// Periodic check for a wait state (or Closing) held longer than `limit`
    Timeout { limit: Duration },
}

impl FsmEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::ConnAck { .. } => "rcvConnAck",
            Self::ConnNack { .. } => "rcvConnNack",
            Self::RConnCer { .. } => "rConnCER",
            Self::Receive(msg) if msg.is_cea() => "rcvCEA",
            Self::Receive(msg) if msg.is_dpr() => "rcvDPR",
            Self::Receive(msg) if msg.is_dpa() => "rcvDPA",
            Self::Receive(msg) if msg.is_request => "rcvRequest",
            Self::Receive(_) => "rcvAnswer",
            Self::PeerDisc(_) => "disc",
            Self::WatchdogTick { .. } => "watchdog",
            Self::Timeout { .. } => "timeout",
        }
    }
}

/// Control message the runtime has to build and write
#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    Cer,
    /// Answer to the carried CER
    Cea(DiameterMessage),
    Dwr,
    /// Answer to the carried DWR
    Dwa(DiameterMessage),
    /// DPR with the given Disconnect-Cause
    Dpr(u32),
    /// Answer to the carried DPR
    Dpa(DiameterMessage),
}

impl Control {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cer => "CER",
            Self::Cea(_) => "CEA",
            Self::Dwr => "DWR",
            Self::Dwa(_) => "DWA",
            Self::Dpr(_) => "DPR",
            Self::Dpa(_) => "DPA",
        }
    }
}

/// Output of the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum FsmAction {
    /// Start an outbound connection attempt off the event path
    Connect { attempt: AttemptId },
    /// Write a control message on a connection
    Send { connection: ConnectionId, control: Control },
    /// Close a connection (idempotent)
    Disconnect(ConnectionId),
    /// Hand an application request to the node
    Deliver(DiameterMessage),
    /// Pair an application answer with its pending request and hand it to the node
    DeliverAnswer(DiameterMessage),
    /// Ask the node's timer service for a reconnect after the backoff
    ScheduleReconnect,
    /// Forget every request still waiting for an answer
    DropPending,
    /// Peer entered Open
    NotifyUp,
    /// Peer left Open
    NotifyDown,
    Log(String),
}
