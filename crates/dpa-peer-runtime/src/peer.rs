use crate::connection::DiameterConnection;
use crate::ids::IdGenerator;
use crate::node::Node;
use crate::peer_actor::PeerActor;
use crate::pending::PendingRequests;
use dpa_core::{DpaError, Result};
use dpa_peer_core::{AttemptId, FsmEvent, PeerFsm, PeerState};
use dpa_shared::DiameterMessage;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};

const DEFAULT_PORT: u16 = 3868;

/// Input of a peer's actor task
pub(crate) enum PeerCommand {
    Event {
        event: FsmEvent,
        done: Option<oneshot::Sender<Result<()>>>,
    },
    /// Inbound connection whose first message was a CER naming this peer
    Candidate {
        cer: DiameterMessage,
        connection: Arc<dyn DiameterConnection>,
        done: oneshot::Sender<Result<()>>,
    },
    /// Outbound attempt completed
    Connected {
        attempt: AttemptId,
        connection: Arc<dyn DiameterConnection>,
    },
    Write {
        request: DiameterMessage,
        done: oneshot::Sender<Result<()>>,
    },
    SetHost(String),
}

#[derive(Debug)]
struct PeerAddress {
    address: Option<String>,
    port: u16,
}

/// State readable without going through the actor
pub(crate) struct PeerShared {
    host: OnceLock<String>,
    address: RwLock<PeerAddress>,
    state: watch::Receiver<PeerState>,
    stopped: AtomicBool,
    pub(crate) pending: PendingRequests,
    pub(crate) ids: IdGenerator,
    pub(crate) node: Arc<dyn Node>,
}

impl PeerShared {
    pub(crate) fn set_stopped(&self, stopped: bool) {
        self.stopped.store(stopped, Ordering::Relaxed);
    }
}

/// Handle to one remote Diameter node.
///
/// Cheap to clone; every clone talks to the same actor task.
#[derive(Clone)]
pub struct Peer {
    shared: Arc<PeerShared>,
    tx: mpsc::UnboundedSender<PeerCommand>,
}

impl Peer {
    /// Create the peer and spawn its actor on the current runtime
    pub fn spawn(node: Arc<dyn Node>, host: Option<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(PeerState::Closed);

        let host_cell = OnceLock::new();
        if let Some(host) = &host {
            let _ = host_cell.set(host.clone());
        }
        let core = PeerFsm::new(node.identity(), host);

        let peer = Self {
            shared: Arc::new(PeerShared {
                host: host_cell,
                address: RwLock::new(PeerAddress { address: None, port: DEFAULT_PORT }),
                state: state_rx,
                stopped: AtomicBool::new(true),
                pending: PendingRequests::new(),
                ids: IdGenerator::new(),
                node,
            }),
            tx,
        };

        let actor = PeerActor::new(core, peer.clone(), rx, state_tx);
        tokio::spawn(actor.run());
        peer
    }

    // --- Events ---

    /// Administrative start; the peer must know its host
    pub async fn start(&self) -> Result<()> {
        if self.host().is_none() {
            return Err(DpaError::HostNotSet);
        }
        self.apply(FsmEvent::Start).await
    }

    /// Administrative stop: no reconnect until the next `start`
    pub async fn stop(&self) -> Result<()> {
        self.apply(FsmEvent::Stop).await
    }

    /// Message read from one of this peer's connections
    pub async fn receive(&self, message: DiameterMessage) -> Result<()> {
        self.apply(FsmEvent::Receive(message)).await
    }

    /// Inbound connection announced by `cer`; the host is learned from it if unknown
    pub async fn r_conn_cer(
        &self,
        cer: DiameterMessage,
        connection: Arc<dyn DiameterConnection>,
    ) -> Result<()> {
        if self.host().is_none() {
            if let Some(origin_host) = cer.origin_host() {
                self.set_host(&origin_host)?;
            }
        }
        self.request(|done| PeerCommand::Candidate { cer, connection, done }).await
    }

    pub async fn peer_disc(&self, connection: dpa_shared::ConnectionId) -> Result<()> {
        self.apply(FsmEvent::PeerDisc(connection)).await
    }

    /// Watchdog check: expires stale requests and stuck states, then sends a DWR when idle for `tw`
    pub async fn send_dwr_if_needed(&self, tw: Duration) -> Result<()> {
        let node = &self.shared.node;
        let limit = node.request_timeout();
        for request in self.shared.pending.take_expired(Instant::now(), limit) {
            node.handle_expired(request);
        }
        // A handshake or disconnect the remote never finishes ends here
        self.apply(FsmEvent::Timeout { limit }).await?;
        self.apply(FsmEvent::WatchdogTick { idle_threshold: tw }).await
    }

    /// Write an application message; requests are tracked until answered
    pub async fn send(&self, mut message: DiameterMessage) -> Result<()> {
        if !self.is_open() {
            return Err(DpaError::PeerNotOpen(self.host().unwrap_or("<unknown>").to_string()));
        }

        let tracked = message.is_request;
        if tracked {
            if message.hop_by_hop_id == 0 {
                message.hop_by_hop_id = self.shared.ids.next_hop_by_hop();
            }
            if message.end_to_end_id == 0 {
                message.end_to_end_id = self.shared.ids.next_end_to_end();
            }
            // Registered before the write so an immediate answer finds it
            self.shared.pending.insert(message.clone(), Instant::now());
        }

        let hop_by_hop_id = message.hop_by_hop_id;
        let result = self.request(|done| PeerCommand::Write { request: message, done }).await;
        if result.is_err() && tracked {
            self.shared.pending.remove(hop_by_hop_id);
        }
        result
    }

    // --- Accessors ---

    pub fn is_open(&self) -> bool {
        self.state() == PeerState::Open
    }

    pub fn state(&self) -> PeerState {
        *self.shared.state.borrow()
    }

    /// Administratively stopped (never started, or stopped since)
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Relaxed)
    }

    pub fn host(&self) -> Option<&str> {
        self.shared.host.get().map(String::as_str)
    }

    /// The host can only be set once
    pub fn set_host(&self, host: &str) -> Result<()> {
        if let Some(current) = self.shared.host.get() {
            if current == host {
                return Ok(());
            }
            return Err(DpaError::HostAlreadySet(current.clone()));
        }
        if self.shared.host.set(host.to_string()).is_err() {
            return Err(DpaError::HostAlreadySet(self.host().unwrap_or_default().to_string()));
        }
        self.post(PeerCommand::SetHost(host.to_string()))
    }

    pub fn set_address(&self, address: &str, port: u16) {
        let mut current = self.shared.address.write();
        current.address = Some(address.to_string());
        current.port = port;
    }

    pub fn port(&self) -> u16 {
        self.shared.address.read().port
    }

    /// `address:port` to connect to; the host doubles as address when none is set
    pub fn connect_addr(&self) -> Option<String> {
        let current = self.shared.address.read();
        let address = current.address.as_deref().or(self.host())?;
        Some(format!("{}:{}", address, current.port))
    }

    pub fn node(&self) -> &Arc<dyn Node> {
        &self.shared.node
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.shared.pending
    }

    /// Resolve once the peer reaches `state`
    pub async fn wait_for_state(&self, state: PeerState) -> Result<()> {
        let mut rx = self.shared.state.clone();
        rx.wait_for(|current| *current == state)
            .await
            .map(|_| ())
            .map_err(|_| DpaError::InternalError("peer actor stopped".to_string()))
    }

    // --- Plumbing ---

    pub(crate) fn shared(&self) -> &PeerShared {
        &self.shared
    }

    pub(crate) fn post(&self, command: PeerCommand) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| DpaError::InternalError("peer actor stopped".to_string()))
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<PeerCommand> {
        self.tx.clone()
    }

    async fn apply(&self, event: FsmEvent) -> Result<()> {
        self.request(|done| PeerCommand::Event { event, done: Some(done) }).await
    }

    async fn request(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<()>>) -> PeerCommand,
    ) -> Result<()> {
        let (done, applied) = oneshot::channel();
        self.post(command(done))?;
        applied
            .await
            .unwrap_or_else(|_| Err(DpaError::InternalError("peer actor stopped".to_string())))
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.host().unwrap_or("<unknown>"), self.state())
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("host", &self.host())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockConnection, MockNode};
    use dpa_shared::{
        Avp, AVP_DISCONNECT_CAUSE, AVP_ORIGIN_HOST, CMD_CER, CMD_DPR, CMD_DWR,
        DISCONNECT_CAUSE_REBOOTING, RESULT_CODE_SUCCESS,
    };
    use tokio::time::timeout;

    const REMOTE: &str = "hss.example.com";

    async fn reach(peer: &Peer, state: PeerState) {
        timeout(Duration::from_secs(2), peer.wait_for_state(state))
            .await
            .expect("state not reached")
            .unwrap();
    }

    fn answer_to(request: &DiameterMessage, connection: u64) -> DiameterMessage {
        let mut answer = request.create_answer(RESULT_CODE_SUCCESS);
        answer.connection = Some(connection);
        answer
    }

    /// Start the peer and complete the CER/CEA exchange on the first mock connection
    async fn open_peer(node: &Arc<MockNode>) -> (Peer, Arc<MockConnection>) {
        let peer = Peer::spawn(node.clone(), Some(REMOTE.to_string()));
        tokio_test::assert_ok!(peer.start().await);
        reach(&peer, PeerState::WaitCea).await;

        let conn = node.connection(0);
        let cer = conn.written()[0].clone();
        peer.receive(answer_to(&cer, conn.id())).await.unwrap();
        assert!(peer.is_open());
        (peer, conn)
    }

    #[tokio::test]
    async fn test_start_sends_cer_and_opens() {
        dpa_logging::init_test();
        let node = MockNode::new("dra.example.com");
        let (peer, conn) = open_peer(&node).await;

        let cer = &conn.written()[0];
        assert!(cer.is_cer());
        assert_eq!(cer.origin_host().as_deref(), Some("dra.example.com"));
        assert!(conn.has_owner());
        assert_eq!(peer.to_string(), "hss.example.com (Open)");
    }

    #[tokio::test]
    async fn test_start_without_host_fails() {
        let node = MockNode::new("dra.example.com");
        let peer = Peer::spawn(node, None);
        assert!(matches!(peer.start().await, Err(DpaError::HostNotSet)));
        assert_eq!(peer.state(), PeerState::Closed);
    }

    #[tokio::test]
    async fn test_host_set_once() {
        let node = MockNode::new("dra.example.com");
        let peer = Peer::spawn(node, None);
        peer.set_host(REMOTE).unwrap();
        peer.set_host(REMOTE).unwrap();
        assert!(matches!(peer.set_host("other.example.com"), Err(DpaError::HostAlreadySet(_))));
        assert_eq!(peer.host(), Some(REMOTE));
    }

    #[tokio::test]
    async fn test_address_and_port() {
        let node = MockNode::new("dra.example.com");
        let peer = Peer::spawn(node, Some(REMOTE.to_string()));
        assert_eq!(peer.port(), 3868);
        assert_eq!(peer.connect_addr().as_deref(), Some("hss.example.com:3868"));

        peer.set_address("10.0.0.7", 3869);
        assert_eq!(peer.port(), 3869);
        assert_eq!(peer.connect_addr().as_deref(), Some("10.0.0.7:3869"));
    }

    #[tokio::test]
    async fn test_connect_failure_schedules_reconnect() {
        let node = MockNode::new("dra.example.com");
        node.fail_connects(true);
        let peer = Peer::spawn(node.clone(), Some(REMOTE.to_string()));
        peer.start().await.unwrap();

        timeout(Duration::from_secs(2), async {
            while node.reconnects().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(peer.state(), PeerState::Closed);
        assert!(!peer.is_stopped());
    }

    #[tokio::test]
    async fn test_send_tracks_request_until_answer() {
        let node = MockNode::new("dra.example.com");
        let (peer, conn) = open_peer(&node).await;

        peer.send(DiameterMessage::request(272, 4)).await.unwrap();
        assert_eq!(peer.pending().len(), 1);

        let request = conn.written().last().cloned().unwrap();
        assert_ne!(request.hop_by_hop_id, 0);
        peer.receive(answer_to(&request, conn.id())).await.unwrap();

        assert!(peer.pending().is_empty());
        let handled = node.handled();
        let answer = handled.last().unwrap();
        assert!(!answer.is_request);
        assert_eq!(answer.request.as_deref().map(|r| r.hop_by_hop_id), Some(request.hop_by_hop_id));
    }

    #[tokio::test]
    async fn test_send_requires_open() {
        let node = MockNode::new("dra.example.com");
        let peer = Peer::spawn(node, Some(REMOTE.to_string()));
        let result = peer.send(DiameterMessage::request(272, 4)).await;
        assert!(matches!(result, Err(DpaError::PeerNotOpen(_))));
        assert!(peer.pending().is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_releases_pending_entry() {
        let node = MockNode::new("dra.example.com");
        let (peer, conn) = open_peer(&node).await;
        conn.fail_writes(true);

        let result = peer.send(DiameterMessage::request(272, 4)).await;
        assert!(result.is_err());
        assert!(peer.pending().is_empty());
    }

    #[tokio::test]
    async fn test_application_request_reaches_node() {
        let node = MockNode::new("dra.example.com");
        let (peer, conn) = open_peer(&node).await;

        let mut ccr = DiameterMessage::request(272, 4);
        ccr.connection = Some(conn.id());
        peer.receive(ccr).await.unwrap();
        assert!(node.handled().iter().any(|m| m.is_request && m.command_code == 272));
    }

    #[tokio::test]
    async fn test_stop_sends_dpr_then_closes_without_reconnect() {
        let node = MockNode::new("dra.example.com");
        let (peer, conn) = open_peer(&node).await;

        peer.stop().await.unwrap();
        assert_eq!(peer.state(), PeerState::Closing);
        let dpr = conn.written().last().cloned().unwrap();
        assert_eq!(dpr.command_code, CMD_DPR);
        assert_eq!(dpr.disconnect_cause(), Some(DISCONNECT_CAUSE_REBOOTING));

        peer.receive(answer_to(&dpr, conn.id())).await.unwrap();
        assert_eq!(peer.state(), PeerState::Closed);
        assert!(!conn.is_open());
        assert!(node.reconnects().is_empty());
        assert!(peer.is_stopped());
    }

    #[tokio::test]
    async fn test_remote_dpr_answered() {
        let node = MockNode::new("dra.example.com");
        let (peer, conn) = open_peer(&node).await;

        let mut dpr = DiameterMessage::request(CMD_DPR, 0);
        dpr.add_avp(Avp::u32(AVP_DISCONNECT_CAUSE, DISCONNECT_CAUSE_REBOOTING));
        dpr.connection = Some(conn.id());
        peer.receive(dpr).await.unwrap();

        assert!(conn.written().last().unwrap().is_dpa());
        assert_eq!(peer.state(), PeerState::Closed);
        assert_eq!(node.reconnects().len(), 1);
    }

    #[tokio::test]
    async fn test_inbound_cer_learns_host_and_answers() {
        let node = MockNode::new("dra.example.com");
        let peer = Peer::spawn(node.clone(), None);
        let conn = MockConnection::new(40);

        let mut cer = DiameterMessage::request(CMD_CER, 0);
        cer.add_avp(Avp::string(AVP_ORIGIN_HOST, REMOTE));
        cer.connection = Some(40);
        peer.r_conn_cer(cer, conn.clone()).await.unwrap();

        assert_eq!(peer.host(), Some(REMOTE));
        assert!(peer.is_open());
        assert!(conn.has_owner());
        let cea = &conn.written()[0];
        assert!(cea.is_cea());
        assert_eq!(cea.result_code(), Some(RESULT_CODE_SUCCESS));
    }

    #[tokio::test]
    async fn test_second_inbound_cer_closed_when_open() {
        let node = MockNode::new("dra.example.com");
        let (peer, _conn) = open_peer(&node).await;
        let intruder = MockConnection::new(99);

        let mut cer = DiameterMessage::request(CMD_CER, 0);
        cer.add_avp(Avp::string(AVP_ORIGIN_HOST, REMOTE));
        let result = peer.r_conn_cer(cer, intruder.clone()).await;

        assert!(matches!(result, Err(DpaError::UnexpectedEvent { .. })));
        assert!(!intruder.is_open());
        assert!(peer.is_open());
    }

    #[tokio::test]
    async fn test_transport_loss_drops_pending_and_reconnects() {
        let node = MockNode::new("dra.example.com");
        let (peer, conn) = open_peer(&node).await;
        peer.send(DiameterMessage::request(272, 4)).await.unwrap();

        conn.remote_close();
        reach(&peer, PeerState::Closed).await;
        // The close notification is applied before the transition is published
        assert!(peer.pending().is_empty());
        assert_eq!(node.reconnects().len(), 1);
    }

    #[tokio::test]
    async fn test_watchdog_sends_dwr_and_expires_requests() {
        let node = MockNode::new("dra.example.com");
        node.set_request_timeout(Duration::ZERO);
        let (peer, conn) = open_peer(&node).await;
        peer.send(DiameterMessage::request(272, 4)).await.unwrap();

        peer.send_dwr_if_needed(Duration::ZERO).await.unwrap();
        let dwr = conn.written().last().cloned().unwrap();
        assert!(dwr.is_dwr());
        assert_eq!(dwr.command_code, CMD_DWR);
        assert_eq!(node.expired().len(), 1);
        assert!(peer.pending().is_empty());

        // Still no DWA on the next idle check: the peer is closed
        peer.send_dwr_if_needed(Duration::ZERO).await.unwrap();
        assert_eq!(peer.state(), PeerState::Closed);
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_unmatched_answer_routed_without_request() {
        let node = MockNode::new("dra.example.com");
        let (peer, conn) = open_peer(&node).await;
        peer.send(DiameterMessage::request(272, 4)).await.unwrap();
        let request = conn.written().last().cloned().unwrap();

        let mut stray = DiameterMessage::new(272, false);
        stray.hop_by_hop_id = request.hop_by_hop_id.wrapping_add(1);
        stray.connection = Some(conn.id());
        peer.receive(stray.clone()).await.unwrap();

        let handled = node.handled();
        let routed = handled.last().unwrap();
        assert!(!routed.is_request);
        assert_eq!(routed.hop_by_hop_id, stray.hop_by_hop_id);
        assert!(routed.request.is_none());
        // The outstanding request is still waiting for its own answer
        assert_eq!(peer.pending().len(), 1);
        assert!(peer.is_open());
    }

    #[tokio::test]
    async fn test_unanswered_cer_times_out() {
        let node = MockNode::new("dra.example.com");
        node.set_request_timeout(Duration::ZERO);
        let peer = Peer::spawn(node.clone(), Some(REMOTE.to_string()));
        peer.start().await.unwrap();
        reach(&peer, PeerState::WaitCea).await;
        let conn = node.connection(0);

        peer.send_dwr_if_needed(Duration::from_secs(30)).await.unwrap();
        assert_eq!(peer.state(), PeerState::Closed);
        assert!(!conn.is_open());
        assert_eq!(node.reconnects().len(), 1);
    }
}
