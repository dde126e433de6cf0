use crate::connector::TcpClient;
use crate::listener::TcpServer;
use async_trait::async_trait;
use dashmap::DashMap;
use dpa_config::NodeConfig;
use dpa_core::{DpaError, Result};
use dpa_peer_runtime::{DiameterConnection, Node, Peer, ReconnectTask};
use dpa_shared::{
    Avp, DiameterMessage, AVP_AUTH_APPLICATION_ID, AVP_HOST_IP_ADDRESS, AVP_ORIGIN_STATE_ID,
    AVP_PRODUCT_NAME, AVP_VENDOR_ID,
};
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The local Diameter node: peer table, timers and transport.
pub struct LocalNode {
    config: NodeConfig,
    me: Weak<LocalNode>,
    peers: DashMap<String, Peer>,
    started: AtomicBool,
    shutdown: CancellationToken,
    next_connection: AtomicU64,
    origin_state_id: u32,
    host_ip: IpAddr,
    inbound_tx: mpsc::UnboundedSender<DiameterMessage>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<DiameterMessage>>>,
}

impl LocalNode {
    pub fn new(config: NodeConfig) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let host_ip = config
            .listen_addr
            .parse::<SocketAddr>()
            .map(|addr| addr.ip())
            .ok()
            .filter(|ip| !ip.is_unspecified())
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let origin_state_id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or_default();

        Arc::new_cyclic(|me| Self {
            config,
            me: me.clone(),
            peers: DashMap::new(),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            next_connection: AtomicU64::new(1),
            origin_state_id,
            host_ip,
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    fn arc(&self) -> Result<Arc<LocalNode>> {
        self.me
            .upgrade()
            .ok_or_else(|| DpaError::InternalError("node dropped".to_string()))
    }

    /// Register a peer (or return the existing one) without starting it
    pub fn add_peer(&self, host: &str, address: Option<&str>, port: u16) -> Result<Peer> {
        let node: Arc<dyn Node> = self.arc()?;
        let peer = self
            .peers
            .entry(host.to_string())
            .or_insert_with(|| Peer::spawn(node, Some(host.to_string())))
            .clone();
        peer.set_address(address.unwrap_or(host), port);
        Ok(peer)
    }

    pub fn peer(&self, host: &str) -> Option<Peer> {
        self.peers.get(host).map(|entry| entry.value().clone())
    }

    /// Peer for an inbound CER; unknown hosts get an unstarted peer
    pub fn peer_for_cer(&self, host: &str) -> Result<Peer> {
        if let Some(peer) = self.peer(host) {
            return Ok(peer);
        }
        let node: Arc<dyn Node> = self.arc()?;
        info!(peer = host, "Learned peer from inbound CER");
        Ok(self
            .peers
            .entry(host.to_string())
            .or_insert_with(|| Peer::spawn(node, Some(host.to_string())))
            .clone())
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.peers.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Fires when the node stops
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }

    /// Application messages delivered by the peers; can be taken once
    pub fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<DiameterMessage>> {
        self.inbound_rx.lock().take()
    }

    /// Bind the listener and accept connections until the node stops
    pub async fn listen(&self) -> Result<SocketAddr> {
        let addr: SocketAddr = self
            .config
            .listen_addr
            .parse()
            .map_err(|e| DpaError::ConfigError(format!("listen_addr: {e}")))?;
        let server = TcpServer::bind(addr, self.arc()?)?;
        let local = server.local_addr()?;
        tokio::spawn(server.run(self.shutdown.clone()));
        Ok(local)
    }

    /// Start every configured peer and the watchdog ticker
    pub async fn start(&self) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);

        for peer_config in &self.config.peers {
            let peer = self.add_peer(
                &peer_config.host,
                peer_config.address.as_deref(),
                peer_config.port,
            )?;
            if let Err(e) = peer.start().await {
                warn!(peer = %peer, error = %e, "Failed to start peer");
            }
        }

        self.spawn_watchdog()?;
        info!(identity = %self.config.identity, peers = self.peers.len(), "Node started");
        Ok(())
    }

    /// Stop every peer (DPR to open ones) and cancel all timers
    pub async fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
        for peer in self.peers() {
            if let Err(e) = peer.stop().await {
                warn!(peer = %peer, error = %e, "Failed to stop peer");
            }
        }
        self.shutdown.cancel();
        info!(identity = %self.config.identity, "Node stopped");
    }

    fn spawn_watchdog(&self) -> Result<()> {
        let node = self.arc()?;
        let tw = self.config.watchdog_interval();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = time::interval(tw / 2);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        for peer in node.peers() {
                            if let Err(e) = peer.send_dwr_if_needed(tw).await {
                                debug!(peer = %peer, error = %e, "Watchdog check failed");
                            }
                        }
                    }
                }
            }
        });
        Ok(())
    }
}

#[async_trait]
impl Node for LocalNode {
    fn identity(&self) -> &str {
        &self.config.identity
    }

    fn realm(&self) -> &str {
        &self.config.realm
    }

    fn add_capabilities(&self, message: &mut DiameterMessage) {
        message.set_avp(host_ip_address(self.host_ip));
        message.set_avp(Avp::u32(AVP_VENDOR_ID, self.config.vendor_id));
        message.set_avp(Avp::string(AVP_PRODUCT_NAME, &self.config.product_name));
        message.set_avp(Avp::u32(AVP_ORIGIN_STATE_ID, self.origin_state_id));
        for application_id in &self.config.auth_application_ids {
            message.add_avp(Avp::u32(AVP_AUTH_APPLICATION_ID, *application_id));
        }
    }

    async fn connect(&self, peer: &Peer) -> Result<Arc<dyn DiameterConnection>> {
        let addr = peer.connect_addr().ok_or(DpaError::HostNotSet)?;
        let client = TcpClient::new(addr, self.config.connect_timeout());
        let connection = client.connect(self.next_connection_id()).await?;
        Ok(connection)
    }

    fn schedule_reconnect(&self, task: ReconnectTask) {
        let delay = self.reconnect_delay();
        let shutdown = self.shutdown.clone();
        debug!(peer = %task.peer(), delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = time::sleep(delay) => task.run().await,
            }
        });
    }

    fn reconnect_delay(&self) -> Duration {
        self.config.reconnect_delay()
    }

    fn request_timeout(&self) -> Duration {
        self.config.request_timeout()
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.shutdown.is_cancelled()
    }

    fn handle(&self, message: DiameterMessage) {
        if self.inbound_tx.send(message).is_err() {
            debug!("Inbound receiver dropped, message discarded");
        }
    }
}

/// Host-IP-Address: Address type (RFC 6733 Sec 4.3.1), family then octets
fn host_ip_address(ip: IpAddr) -> Avp {
    let mut data = Vec::with_capacity(18);
    match ip {
        IpAddr::V4(v4) => {
            data.extend_from_slice(&1u16.to_be_bytes());
            data.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            data.extend_from_slice(&2u16.to_be_bytes());
            data.extend_from_slice(&v6.octets());
        }
    }
    Avp::new(AVP_HOST_IP_ADDRESS, data)
}
