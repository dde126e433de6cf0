use crate::connection::{DiameterConnection, PeerLink};
use crate::peer::{Peer, PeerCommand};
use crate::reconnect::ReconnectTask;
use dpa_core::{DpaError, Result};
use dpa_metrics::{
    record_transition, PROTOCOL_VIOLATIONS_TOTAL, RECONNECTS_SCHEDULED_TOTAL,
    WATCHDOG_FAILURES_TOTAL, WATCHDOG_REQUESTS_TOTAL,
};
use dpa_peer_core::{AttemptId, Control, FsmAction, FsmEvent, PeerFsm, PeerState};
use dpa_shared::{
    Avp, ConnectionId, DiameterMessage, AVP_DISCONNECT_CAUSE, AVP_ORIGIN_HOST, AVP_ORIGIN_REALM,
    CMD_CER, CMD_DPR, CMD_DWR, RESULT_CODE_SUCCESS,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Runs one peer: applies its events in order and carries out the actions.
pub(crate) struct PeerActor {
    core: PeerFsm,
    peer: Peer,
    receiver: mpsc::UnboundedReceiver<PeerCommand>,
    state_tx: watch::Sender<PeerState>,

    // Connections the machine references, by id
    connections: HashMap<ConnectionId, Arc<dyn DiameterConnection>>,
}

impl PeerActor {
    pub(crate) fn new(
        core: PeerFsm,
        peer: Peer,
        receiver: mpsc::UnboundedReceiver<PeerCommand>,
        state_tx: watch::Sender<PeerState>,
    ) -> Self {
        Self {
            core,
            peer,
            receiver,
            state_tx,
            connections: HashMap::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        while let Some(command) = self.receiver.recv().await {
            self.handle_command(command);
        }
    }

    fn handle_command(&mut self, command: PeerCommand) {
        match command {
            PeerCommand::Event { event, done } => {
                let result = self.handle_event(event, None);
                reply(done, result);
            }
            PeerCommand::Candidate { cer, connection, done } => {
                let event = FsmEvent::RConnCer { cer, connection: connection.id() };
                let result = self.handle_event(event, Some(connection));
                reply(Some(done), result);
            }
            PeerCommand::Connected { attempt, connection } => {
                let event = FsmEvent::ConnAck { attempt, connection: connection.id() };
                let _ = self.handle_event(event, Some(connection));
            }
            PeerCommand::Write { request, done } => {
                let result = self.write(&request);
                reply(Some(done), result);
            }
            PeerCommand::SetHost(host) => {
                if let Err(e) = self.core.set_remote_host(&host) {
                    warn!(peer = %host, error = %e, "Host change ignored");
                }
            }
        }
    }

    // Hand the event to the core, then carry out its actions
    fn handle_event(
        &mut self,
        event: FsmEvent,
        candidate: Option<Arc<dyn DiameterConnection>>,
    ) -> Result<()> {
        let from = self.core.state();
        let event_name = event.name();
        // Linked before any answer goes out on it
        let candidate_id = candidate.map(|connection| self.link(connection));

        let result = match self.core.step(event, Instant::now()) {
            Ok(actions) => {
                self.execute(actions);
                Ok(())
            }
            Err(e) => {
                warn!(peer = %self.host(), error = %e, severity = %e.severity(), "Protocol violation");
                PROTOCOL_VIOLATIONS_TOTAL.inc();
                Err(e)
            }
        };

        self.release_orphans();
        if let Some(id) = candidate_id {
            self.check_closed(id);
        }

        let to = self.core.state();
        self.peer.shared().set_stopped(self.core.is_stopped());
        if from != to {
            debug!("peer={} {} > {}", self.host(), from, to);
            record_transition(from.name(), to.name());
            if event_name == "watchdog" && to == PeerState::Closed {
                warn!(peer = %self.host(), "Closing peer as no DWA received");
                WATCHDOG_FAILURES_TOTAL.inc();
            }
            if event_name == "timeout" {
                warn!(peer = %self.host(), state = %from, "Peer timed out");
            }
            self.state_tx.send_replace(to);
        }
        result
    }

    fn execute(&mut self, actions: Vec<FsmAction>) {
        for action in actions {
            match action {
                FsmAction::Connect { attempt } => self.connect(attempt),
                FsmAction::Send { connection, control } => self.send_control(connection, control),
                FsmAction::Disconnect(connection) => self.disconnect(connection),
                FsmAction::Deliver(request) => self.peer.node().handle(request),
                FsmAction::DeliverAnswer(mut answer) => {
                    answer.request = self.peer.pending().remove(answer.hop_by_hop_id).map(Box::new);
                    if answer.request.is_none() {
                        debug!(peer = %self.host(), hop_by_hop_id = answer.hop_by_hop_id, "Answer without pending request");
                    }
                    self.peer.node().handle(answer);
                }
                FsmAction::ScheduleReconnect => {
                    RECONNECTS_SCHEDULED_TOTAL.inc();
                    self.peer.node().schedule_reconnect(ReconnectTask::new(self.peer.clone()));
                }
                FsmAction::DropPending => {
                    let dropped = self.peer.pending().clear();
                    if dropped > 0 {
                        debug!(peer = %self.host(), dropped, "Pending requests dropped");
                    }
                }
                FsmAction::NotifyUp => info!(peer = %self.host(), "Peer is up"),
                FsmAction::NotifyDown => info!(peer = %self.host(), "Peer is down"),
                FsmAction::Log(message) => debug!(peer = %self.host(), "{}", message),
            }
        }
    }

    // The attempt runs on its own task; its outcome comes back through the queue
    fn connect(&self, attempt: AttemptId) {
        let peer = self.peer.clone();
        tokio::spawn(async move {
            match peer.node().connect(&peer).await {
                Ok(connection) => {
                    let orphan = connection.clone();
                    if peer.post(PeerCommand::Connected { attempt, connection }).is_err() {
                        orphan.close();
                    }
                }
                Err(e) => {
                    debug!(peer = %peer, error = %e, retryable = e.is_retryable(), "Connect failed");
                    let _ = peer.post(PeerCommand::Event {
                        event: FsmEvent::ConnNack { attempt },
                        done: None,
                    });
                }
            }
        });
    }

    fn send_control(&self, id: ConnectionId, control: Control) {
        let Some(connection) = self.connections.get(&id) else {
            debug!(peer = %self.host(), connection = id, control = control.name(), "No connection for control message");
            return;
        };
        let name = control.name();
        let is_dpr = matches!(control, Control::Dpr(_));
        if matches!(control, Control::Dwr) {
            WATCHDOG_REQUESTS_TOTAL.inc();
        }

        let message = self.build_control(control);
        if let Err(e) = connection.write(&message) {
            if is_dpr {
                warn!(peer = %self.host(), error = %e, "Failed to send DPR");
            } else {
                debug!(peer = %self.host(), error = %e, control = name, "Failed to send control message");
            }
        }
    }

    fn build_control(&self, control: Control) -> DiameterMessage {
        let node = self.peer.node();
        let mut message = match control {
            Control::Cer => {
                let mut cer = self.new_request(CMD_CER);
                node.add_capabilities(&mut cer);
                cer
            }
            Control::Cea(cer) => {
                let mut cea = cer.create_answer(RESULT_CODE_SUCCESS);
                node.add_capabilities(&mut cea);
                cea
            }
            Control::Dwr => self.new_request(CMD_DWR),
            Control::Dwa(dwr) => dwr.create_answer(RESULT_CODE_SUCCESS),
            Control::Dpr(cause) => {
                let mut dpr = self.new_request(CMD_DPR);
                dpr.add_avp(Avp::u32(AVP_DISCONNECT_CAUSE, cause));
                dpr
            }
            Control::Dpa(dpr) => dpr.create_answer(RESULT_CODE_SUCCESS),
        };
        message.set_avp(Avp::string(AVP_ORIGIN_HOST, node.identity()));
        message.set_avp(Avp::string(AVP_ORIGIN_REALM, node.realm()));
        message
    }

    fn new_request(&self, command_code: u32) -> DiameterMessage {
        let ids = &self.peer.shared().ids;
        let mut request = DiameterMessage::request(command_code, 0);
        request.hop_by_hop_id = ids.next_hop_by_hop();
        request.end_to_end_id = ids.next_end_to_end();
        request
    }

    fn write(&self, request: &DiameterMessage) -> Result<()> {
        if !self.core.is_open() {
            return Err(DpaError::PeerNotOpen(self.host().to_string()));
        }
        let id = self
            .core
            .connection()
            .ok_or_else(|| DpaError::PeerNotOpen(self.host().to_string()))?;
        let connection = self.connections.get(&id).ok_or(DpaError::ConnectionClosed(id))?;
        connection.write(request)
    }

    fn disconnect(&mut self, id: ConnectionId) {
        if let Some(connection) = self.connections.remove(&id) {
            connection.set_owner(None);
            connection.close();
        }
    }

    // Route a new connection's traffic to this peer
    fn link(&mut self, connection: Arc<dyn DiameterConnection>) -> ConnectionId {
        let id = connection.id();
        connection.set_owner(Some(PeerLink::new(self.peer.sender())));
        self.connections.insert(id, connection);
        id
    }

    // A connection that closed before it was linked never reports it
    fn check_closed(&self, id: ConnectionId) {
        let closed = self.connections.get(&id).is_some_and(|connection| !connection.is_open());
        if closed {
            let _ = self.peer.post(PeerCommand::Event { event: FsmEvent::PeerDisc(id), done: None });
        }
    }

    // Close anything the machine no longer references (rejected candidates, stale attempts)
    fn release_orphans(&mut self) {
        let orphans: Vec<ConnectionId> = self
            .connections
            .keys()
            .filter(|id| !self.owns(**id))
            .copied()
            .collect();
        for id in orphans {
            self.disconnect(id);
        }
    }

    fn owns(&self, id: ConnectionId) -> bool {
        self.core.initiated() == Some(id) || self.core.accepted() == Some(id)
    }

    fn host(&self) -> &str {
        self.core.remote_host().unwrap_or("<unknown>")
    }
}

fn reply(done: Option<oneshot::Sender<Result<()>>>, result: Result<()>) {
    if let Some(done) = done {
        let _ = done.send(result);
    }
}
