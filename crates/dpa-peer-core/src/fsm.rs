use super::types::*;
use dpa_core::{DpaError, Result};
use dpa_shared::{DISCONNECT_CAUSE_REBOOTING, RESULT_CODE_SUCCESS};
use std::time::{Duration, Instant};

/// Peer state machine for one remote Diameter node.
///
/// Owns the two connection slots (`initiated`: we connected, `accepted`: the
/// remote connected to us), the administrative-stop flag and the watchdog
/// bookkeeping. Undefined transitions return [`DpaError::UnexpectedEvent`]
/// and leave the machine untouched.
#[derive(Debug)]
pub struct PeerFsm {
    local_identity: String,
    remote_host: Option<String>,
    state: PeerState,
    initiated: Option<ConnectionId>,
    accepted: Option<ConnectionId>,
    // CER received on `accepted`, answered once the election is settled
    accepted_cer: Option<DiameterMessage>,
    connecting: Option<AttemptId>,
    last_attempt: AttemptId,
    stopped: bool,
    wait_for_dwa: bool,
    last_message: Option<Instant>,
    // When the current state was entered
    state_since: Option<Instant>,
}

impl PeerFsm {
    pub fn new(local_identity: impl Into<String>, remote_host: Option<String>) -> Self {
        Self {
            local_identity: local_identity.into(),
            remote_host,
            state: PeerState::Closed,
            initiated: None,
            accepted: None,
            accepted_cer: None,
            connecting: None,
            last_attempt: 0,
            stopped: true,
            wait_for_dwa: false,
            last_message: None,
            state_since: None,
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == PeerState::Open
    }

    pub fn remote_host(&self) -> Option<&str> {
        self.remote_host.as_deref()
    }

    /// The remote host can be set once; setting the same value again is allowed.
    pub fn set_remote_host(&mut self, host: &str) -> Result<()> {
        match &self.remote_host {
            Some(current) if current != host => Err(DpaError::HostAlreadySet(current.clone())),
            Some(_) => Ok(()),
            None => {
                self.remote_host = Some(host.to_string());
                Ok(())
            }
        }
    }

    pub fn initiated(&self) -> Option<ConnectionId> {
        self.initiated
    }

    pub fn accepted(&self) -> Option<ConnectionId> {
        self.accepted
    }

    /// Connection used for traffic: the initiated one when both exist
    pub fn connection(&self) -> Option<ConnectionId> {
        self.initiated.or(self.accepted)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn is_waiting_for_dwa(&self) -> bool {
        self.wait_for_dwa
    }

    pub fn last_message(&self) -> Option<Instant> {
        self.last_message
    }

    pub fn state_since(&self) -> Option<Instant> {
        self.state_since
    }

    // ★ Core Logic: transition function
    pub fn step(&mut self, event: FsmEvent, now: Instant) -> Result<Vec<FsmAction>> {
        let mut actions = Vec::new();
        let before = self.state;

        match event {
            FsmEvent::Start => self.on_start(&mut actions)?,
            FsmEvent::Stop => self.on_stop(&mut actions),
            FsmEvent::ConnAck { attempt, connection } => {
                self.on_conn_ack(attempt, connection, now, &mut actions)
            }
            FsmEvent::ConnNack { attempt } => self.on_conn_nack(attempt, now, &mut actions),
            FsmEvent::RConnCer { cer, connection } => {
                self.on_r_conn_cer(cer, connection, now, &mut actions)?
            }
            FsmEvent::Receive(message) => self.on_receive(message, now, &mut actions)?,
            FsmEvent::PeerDisc(connection) => self.on_disc(connection, now, &mut actions),
            FsmEvent::WatchdogTick { idle_threshold } => {
                self.on_watchdog(idle_threshold, now, &mut actions)
            }
            FsmEvent::Timeout { limit } => self.on_timeout(limit, now, &mut actions),
        }

        if self.state != before {
            self.state_since = Some(now);
        }
        Ok(actions)
    }

    fn unexpected(&self, event: &str) -> DpaError {
        DpaError::UnexpectedEvent {
            state: self.state.to_string(),
            event: event.to_string(),
        }
    }

    // --- 1. Administrative events ---

    fn on_start(&mut self, actions: &mut Vec<FsmAction>) -> Result<()> {
        if self.state != PeerState::Closed {
            return Err(self.unexpected("start"));
        }
        self.stopped = false;
        self.initiated = None;
        self.accepted = None;

        // I-Snd-Conn-Req: the attempt runs outside the event path
        self.last_attempt += 1;
        self.connecting = Some(self.last_attempt);
        actions.push(FsmAction::Connect { attempt: self.last_attempt });
        self.state = PeerState::WaitConnAck;
        Ok(())
    }

    fn on_stop(&mut self, actions: &mut Vec<FsmAction>) {
        self.stopped = true;
        match (self.state, self.connection()) {
            (PeerState::Open, Some(connection)) => {
                actions.push(FsmAction::Send {
                    connection,
                    control: Control::Dpr(DISCONNECT_CAUSE_REBOOTING),
                });
                actions.push(FsmAction::NotifyDown);
                self.state = PeerState::Closing;
            }
            (PeerState::Closing, _) | (PeerState::Closed, _) => {}
            _ => self.teardown(actions),
        }
    }

    // --- 2. Outbound connection results ---

    fn on_conn_ack(
        &mut self,
        attempt: AttemptId,
        connection: ConnectionId,
        now: Instant,
        actions: &mut Vec<FsmAction>,
    ) {
        if self.connecting != Some(attempt) {
            // Attempt was abandoned (stop, election, teardown): nobody owns it
            actions.push(FsmAction::Log(format!(
                "Closing connection {connection} from abandoned attempt {attempt}"
            )));
            actions.push(FsmAction::Disconnect(connection));
            return;
        }
        self.connecting = None;
        self.initiated = Some(connection);
        actions.push(FsmAction::Send { connection, control: Control::Cer });

        if self.state == PeerState::WaitConnAckElect {
            if self.elect(actions) {
                self.win_election(now, actions);
            } else {
                self.state = PeerState::WaitReturns;
            }
        } else {
            self.state = PeerState::WaitCea;
        }
    }

    fn on_conn_nack(&mut self, attempt: AttemptId, now: Instant, actions: &mut Vec<FsmAction>) {
        if self.connecting != Some(attempt) {
            actions.push(FsmAction::Log(format!("Ignoring failure of abandoned attempt {attempt}")));
            return;
        }
        self.connecting = None;

        if self.state == PeerState::WaitConnAckElect {
            // Only the remote's connection is left: answer its CER on it
            self.win_election(now, actions);
        } else {
            self.initiated = None;
            self.close(actions);
        }
    }

    // --- 3. Remote connection carrying a CER ---

    fn on_r_conn_cer(
        &mut self,
        cer: DiameterMessage,
        connection: ConnectionId,
        now: Instant,
        actions: &mut Vec<FsmAction>,
    ) -> Result<()> {
        match self.state {
            PeerState::Closed => {
                self.learn_remote_host(&cer);
                self.accepted = Some(connection);
                actions.push(FsmAction::Send { connection, control: Control::Cea(cer) });
                self.enter_open(now, actions);
            }
            PeerState::WaitConnAck => {
                // Election waits for our own attempt to resolve
                self.learn_remote_host(&cer);
                self.accepted = Some(connection);
                self.accepted_cer = Some(cer);
                self.state = PeerState::WaitConnAckElect;
            }
            PeerState::WaitCea => {
                self.learn_remote_host(&cer);
                self.accepted = Some(connection);
                self.accepted_cer = Some(cer);
                if self.elect(actions) {
                    self.win_election(now, actions);
                } else {
                    self.state = PeerState::WaitReturns;
                }
            }
            PeerState::WaitConnAckElect | PeerState::WaitReturns => {
                if self.accepted != Some(connection) && self.initiated != Some(connection) {
                    // R-Reject: keep the candidate we already have
                    actions.push(FsmAction::Log(format!(
                        "Rejecting CER on connection {connection} in state {}",
                        self.state
                    )));
                    actions.push(FsmAction::Disconnect(connection));
                }
            }
            PeerState::Open | PeerState::Closing => return Err(self.unexpected("rConnCER")),
        }
        Ok(())
    }

    // --- 4. Messages on established connections ---

    fn on_receive(
        &mut self,
        message: DiameterMessage,
        now: Instant,
        actions: &mut Vec<FsmAction>,
    ) -> Result<()> {
        self.last_message = Some(now);

        if message.is_dwr() {
            match message.connection.or(self.connection()) {
                Some(connection) => actions.push(FsmAction::Send {
                    connection,
                    control: Control::Dwa(message),
                }),
                None => return Err(self.unexpected("rcvDWR")),
            }
            return Ok(());
        }
        if message.is_dwa() {
            self.wait_for_dwa = false;
            return Ok(());
        }
        if message.is_cer() {
            return match message.connection {
                Some(connection) => self.on_r_conn_cer(message, connection, now, actions),
                None => Err(self.unexpected("rConnCER")),
            };
        }
        if message.is_cea() {
            return self.on_cea(message, now, actions);
        }
        if message.is_dpr() {
            return self.on_dpr(message, actions);
        }
        if message.is_dpa() {
            if self.state != PeerState::Closing {
                return Err(self.unexpected("rcvDPA"));
            }
            self.teardown(actions);
            return Ok(());
        }

        // Application traffic is only accepted once the peer is open
        if self.state != PeerState::Open {
            return Err(self.unexpected(if message.is_request { "rcvRequest" } else { "rcvAnswer" }));
        }
        if message.is_request {
            actions.push(FsmAction::Deliver(message));
        } else {
            actions.push(FsmAction::DeliverAnswer(message));
        }
        Ok(())
    }

    fn on_cea(&mut self, cea: DiameterMessage, now: Instant, actions: &mut Vec<FsmAction>) -> Result<()> {
        match self.state {
            PeerState::WaitCea => match cea.result_code() {
                Some(code) if code != RESULT_CODE_SUCCESS => {
                    actions.push(FsmAction::Log(format!("CEA rejected capabilities: Result-Code {code}")));
                    self.close(actions);
                }
                _ => self.enter_open(now, actions),
            },
            PeerState::WaitReturns => {
                // I-Rcv-CEA: the remote won, our initiated connection survives
                if let Some(connection) = self.accepted.take() {
                    actions.push(FsmAction::Disconnect(connection));
                }
                self.accepted_cer = None;
                self.enter_open(now, actions);
            }
            _ => return Err(self.unexpected("rcvCEA")),
        }
        Ok(())
    }

    fn on_dpr(&mut self, dpr: DiameterMessage, actions: &mut Vec<FsmAction>) -> Result<()> {
        if self.state != PeerState::Open {
            return Err(self.unexpected("rcvDPR"));
        }
        let rebooting = dpr.disconnect_cause() == Some(DISCONNECT_CAUSE_REBOOTING);
        if let Some(connection) = dpr.connection.or(self.connection()) {
            actions.push(FsmAction::Send { connection, control: Control::Dpa(dpr) });
        }
        self.teardown(actions);

        // The remote announced a reboot: come back once it is up again
        if rebooting && !self.stopped {
            actions.push(FsmAction::ScheduleReconnect);
        }
        Ok(())
    }

    // --- 5. Transport failures ---

    fn on_disc(&mut self, connection: ConnectionId, now: Instant, actions: &mut Vec<FsmAction>) {
        let is_initiated = self.initiated == Some(connection);
        let is_accepted = self.accepted == Some(connection);
        if !is_initiated && !is_accepted {
            actions.push(FsmAction::Log(format!("Ignoring close of foreign connection {connection}")));
            return;
        }

        match self.state {
            PeerState::WaitReturns if is_initiated => {
                // I-Peer-Disc: fall back to the remote's connection
                self.initiated = None;
                actions.push(FsmAction::Disconnect(connection));
                self.win_election(now, actions);
            }
            PeerState::WaitReturns => {
                // R-Peer-Disc: keep waiting for the CEA on our connection
                self.accepted = None;
                self.accepted_cer = None;
                actions.push(FsmAction::Disconnect(connection));
                self.state = PeerState::WaitCea;
            }
            PeerState::Closing => self.teardown(actions),
            _ => self.close(actions),
        }
    }

    // --- 6. Watchdog ---

    fn on_watchdog(&mut self, idle_threshold: Duration, now: Instant, actions: &mut Vec<FsmAction>) {
        if self.state != PeerState::Open {
            return;
        }
        let idle = self
            .last_message
            .map_or(true, |last| now.saturating_duration_since(last) >= idle_threshold);
        if !idle {
            return;
        }

        if self.wait_for_dwa {
            actions.push(FsmAction::Log("Closing peer as no DWA received".to_string()));
            self.close(actions);
        } else if let Some(connection) = self.connection() {
            actions.push(FsmAction::Send { connection, control: Control::Dwr });
            self.wait_for_dwa = true;
        }
    }

    // --- 7. Stuck states ---

    fn on_timeout(&mut self, limit: Duration, now: Instant, actions: &mut Vec<FsmAction>) {
        let expired = self
            .state_since
            .is_some_and(|since| now.saturating_duration_since(since) >= limit);
        if !expired {
            return;
        }
        match self.state {
            PeerState::WaitConnAck
            | PeerState::WaitCea
            | PeerState::WaitConnAckElect
            | PeerState::WaitReturns => {
                actions.push(FsmAction::Log(format!("Timeout in state {}", self.state)));
                self.close(actions);
            }
            PeerState::Closing => {
                actions.push(FsmAction::Log("No DPA received, closing".to_string()));
                self.teardown(actions);
            }
            PeerState::Closed | PeerState::Open => {}
        }
    }

    // --- Helpers ---

    fn learn_remote_host(&mut self, cer: &DiameterMessage) {
        if self.remote_host.is_none() {
            self.remote_host = cer.origin_host();
        }
    }

    /// Election: the greater identity wins and keeps the accepted connection
    fn elect(&self, actions: &mut Vec<FsmAction>) -> bool {
        let local = self.local_identity.as_str();
        let remote = self.remote_host.as_deref().unwrap_or_default();
        let won = local > remote;
        actions.push(FsmAction::Log(if won {
            format!("Won election ({local} > {remote})")
        } else {
            format!("Lost election ({local} <= {remote})")
        }));
        won
    }

    /// I-Disc, R-Snd-CEA, R-Open
    fn win_election(&mut self, now: Instant, actions: &mut Vec<FsmAction>) {
        if let Some(connection) = self.initiated.take() {
            actions.push(FsmAction::Disconnect(connection));
        }
        if let (Some(connection), Some(cer)) = (self.accepted, self.accepted_cer.take()) {
            actions.push(FsmAction::Send { connection, control: Control::Cea(cer) });
        }
        self.enter_open(now, actions);
    }

    fn enter_open(&mut self, now: Instant, actions: &mut Vec<FsmAction>) {
        self.state = PeerState::Open;
        self.accepted_cer = None;
        self.wait_for_dwa = false;
        self.last_message = Some(now);
        actions.push(FsmAction::NotifyUp);
    }

    /// Drop both connections and land in Closed without scheduling anything
    fn teardown(&mut self, actions: &mut Vec<FsmAction>) {
        for connection in [self.initiated.take(), self.accepted.take()].into_iter().flatten() {
            actions.push(FsmAction::Disconnect(connection));
        }
        if self.state == PeerState::Open {
            actions.push(FsmAction::NotifyDown);
        }
        self.accepted_cer = None;
        self.connecting = None;
        self.wait_for_dwa = false;
        actions.push(FsmAction::DropPending);
        self.state = PeerState::Closed;
    }

    /// Close-and-maybe-reconnect: only failures, never an administrative stop, reconnect
    fn close(&mut self, actions: &mut Vec<FsmAction>) {
        self.teardown(actions);
        if !self.stopped {
            actions.push(FsmAction::ScheduleReconnect);
        }
    }
}
