//! In-memory `Node` and `DiameterConnection` for actor tests.

use crate::connection::{DiameterConnection, PeerLink};
use crate::node::Node;
use crate::peer::Peer;
use crate::reconnect::ReconnectTask;
use async_trait::async_trait;
use dpa_core::{DpaError, Result};
use dpa_shared::{ConnectionId, DiameterMessage};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
pub struct MockConnection {
    id: ConnectionId,
    open: AtomicBool,
    fail_writes: AtomicBool,
    owner: Mutex<Option<PeerLink>>,
    written: Mutex<Vec<DiameterMessage>>,
}

impl MockConnection {
    pub fn new(id: ConnectionId) -> Arc<Self> {
        Arc::new(Self {
            id,
            open: AtomicBool::new(true),
            fail_writes: AtomicBool::new(false),
            owner: Mutex::new(None),
            written: Mutex::new(Vec::new()),
        })
    }

    pub fn written(&self) -> Vec<DiameterMessage> {
        self.written.lock().clone()
    }

    pub fn has_owner(&self) -> bool {
        self.owner.lock().is_some()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// The remote end hung up
    pub fn remote_close(&self) {
        self.open.store(false, Ordering::SeqCst);
        if let Some(owner) = self.owner.lock().take() {
            owner.closed(self.id);
        }
    }
}

impl DiameterConnection for MockConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn set_owner(&self, owner: Option<PeerLink>) {
        *self.owner.lock() = owner;
    }

    fn write(&self, message: &DiameterMessage) -> Result<()> {
        if !self.is_open() || self.fail_writes.load(Ordering::SeqCst) {
            return Err(DpaError::ConnectionClosed(self.id));
        }
        self.written.lock().push(message.clone());
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

pub struct MockNode {
    identity: String,
    fail_connects: AtomicBool,
    next_id: AtomicU64,
    request_timeout: Mutex<Duration>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
    handled: Mutex<Vec<DiameterMessage>>,
    expired: Mutex<Vec<DiameterMessage>>,
    reconnects: Mutex<Vec<ReconnectTask>>,
}

impl MockNode {
    pub fn new(identity: &str) -> Arc<Self> {
        Arc::new(Self {
            identity: identity.to_string(),
            fail_connects: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            request_timeout: Mutex::new(Duration::from_secs(30)),
            connections: Mutex::new(Vec::new()),
            handled: Mutex::new(Vec::new()),
            expired: Mutex::new(Vec::new()),
            reconnects: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_connects(&self, fail: bool) {
        self.fail_connects.store(fail, Ordering::SeqCst);
    }

    pub fn set_request_timeout(&self, timeout: Duration) {
        *self.request_timeout.lock() = timeout;
    }

    /// The n-th outbound connection handed out
    pub fn connection(&self, n: usize) -> Arc<MockConnection> {
        self.connections.lock()[n].clone()
    }

    pub fn handled(&self) -> Vec<DiameterMessage> {
        self.handled.lock().clone()
    }

    pub fn expired(&self) -> Vec<DiameterMessage> {
        self.expired.lock().clone()
    }

    pub fn reconnects(&self) -> Vec<ReconnectTask> {
        self.reconnects.lock().clone()
    }
}

#[async_trait]
impl Node for MockNode {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn realm(&self) -> &str {
        "example.com"
    }

    fn add_capabilities(&self, _message: &mut DiameterMessage) {}

    async fn connect(&self, _peer: &Peer) -> Result<Arc<dyn DiameterConnection>> {
        if self.fail_connects.load(Ordering::SeqCst) {
            return Err(DpaError::NetworkError("connection refused".to_string()));
        }
        let connection = MockConnection::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.connections.lock().push(connection.clone());
        Ok(connection)
    }

    fn schedule_reconnect(&self, task: ReconnectTask) {
        self.reconnects.lock().push(task);
    }

    fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(10)
    }

    fn request_timeout(&self) -> Duration {
        *self.request_timeout.lock()
    }

    fn is_started(&self) -> bool {
        true
    }

    fn handle(&self, message: DiameterMessage) {
        self.handled.lock().push(message);
    }

    fn handle_expired(&self, request: DiameterMessage) {
        self.expired.lock().push(request);
    }
}
