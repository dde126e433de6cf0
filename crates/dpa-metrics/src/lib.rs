use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Once;

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref PEER_TRANSITIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("peer_transitions_total", "Peer state machine transitions"),
        &["from", "to"]
    ).unwrap();

    pub static ref PEERS_OPEN: IntGauge = IntGauge::with_opts(
        Opts::new("peers_open", "Number of peers in the Open state")
    ).unwrap();

    pub static ref WATCHDOG_REQUESTS_TOTAL: IntCounter = IntCounter::with_opts(
        Opts::new("watchdog_requests_total", "Device-Watchdog-Requests sent")
    ).unwrap();

    pub static ref WATCHDOG_FAILURES_TOTAL: IntCounter = IntCounter::with_opts(
        Opts::new("watchdog_failures_total", "Peers closed because no DWA arrived")
    ).unwrap();

    pub static ref RECONNECTS_SCHEDULED_TOTAL: IntCounter = IntCounter::with_opts(
        Opts::new("reconnects_scheduled_total", "Reconnect attempts scheduled")
    ).unwrap();

    pub static ref PENDING_REQUESTS: IntGauge = IntGauge::with_opts(
        Opts::new("pending_requests", "Requests sent and awaiting an answer")
    ).unwrap();

    pub static ref PROTOCOL_VIOLATIONS_TOTAL: IntCounter = IntCounter::with_opts(
        Opts::new("protocol_violations_total", "Events received in a state that does not accept them")
    ).unwrap();
}

static REGISTER: Once = Once::new();

/// Register all metrics with the global registry (only the first call registers)
pub fn register_metrics() {
    REGISTER.call_once(|| {
        REGISTRY.register(Box::new(PEER_TRANSITIONS_TOTAL.clone())).unwrap();
        REGISTRY.register(Box::new(PEERS_OPEN.clone())).unwrap();
        REGISTRY.register(Box::new(WATCHDOG_REQUESTS_TOTAL.clone())).unwrap();
        REGISTRY.register(Box::new(WATCHDOG_FAILURES_TOTAL.clone())).unwrap();
        REGISTRY.register(Box::new(RECONNECTS_SCHEDULED_TOTAL.clone())).unwrap();
        REGISTRY.register(Box::new(PENDING_REQUESTS.clone())).unwrap();
        REGISTRY.register(Box::new(PROTOCOL_VIOLATIONS_TOTAL.clone())).unwrap();
    });
}

/// Record a state transition
pub fn record_transition(from: &str, to: &str) {
    PEER_TRANSITIONS_TOTAL.with_label_values(&[from, to]).inc();
    if to == "Open" {
        PEERS_OPEN.inc();
    } else if from == "Open" {
        PEERS_OPEN.dec();
    }
}

/// Gather metrics in Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        register_metrics();
        register_metrics();

        record_transition("Wait-I-CEA", "Open");
        WATCHDOG_REQUESTS_TOTAL.inc();
        PENDING_REQUESTS.set(3);

        let metrics = gather_metrics();
        assert!(metrics.contains("peer_transitions_total"));
        assert!(metrics.contains("watchdog_requests_total"));
        assert!(metrics.contains("pending_requests 3"));
    }
}
