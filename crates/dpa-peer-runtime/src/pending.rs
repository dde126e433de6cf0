use dashmap::DashMap;
use dpa_metrics::PENDING_REQUESTS;
use dpa_shared::DiameterMessage;
use std::time::{Duration, Instant};

/// A request written to the peer and still waiting for its answer
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub request: DiameterMessage,
    pub sent_at: Instant,
}

/// Requests awaiting answers, keyed by Hop-by-Hop id.
///
/// Guarded by its own lock so senders never wait on the peer's event queue.
#[derive(Debug, Default)]
pub struct PendingRequests {
    entries: DashMap<u32, PendingRequest>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, request: DiameterMessage, sent_at: Instant) {
        let key = request.hop_by_hop_id;
        if self.entries.insert(key, PendingRequest { request, sent_at }).is_none() {
            PENDING_REQUESTS.inc();
        }
    }

    /// Remove and return the request an answer belongs to
    pub fn remove(&self, hop_by_hop_id: u32) -> Option<DiameterMessage> {
        let (_, pending) = self.entries.remove(&hop_by_hop_id)?;
        PENDING_REQUESTS.dec();
        Some(pending.request)
    }

    /// Drop every entry, returns how many were dropped
    pub fn clear(&self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        PENDING_REQUESTS.sub(dropped as i64);
        dropped
    }

    /// Remove entries sent `timeout` or longer before `now`
    pub fn take_expired(&self, now: Instant, timeout: Duration) -> Vec<DiameterMessage> {
        // Collect keys first: removing while iterating would deadlock the shard
        let keys: Vec<u32> = self
            .entries
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.sent_at) >= timeout)
            .map(|entry| *entry.key())
            .collect();

        keys.into_iter().filter_map(|key| self.remove(key)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
