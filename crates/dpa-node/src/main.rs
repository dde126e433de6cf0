use dpa_config::NodeConfig;
use dpa_core::DpaError;
use dpa_node::LocalNode;
use dpa_shared::{Avp, AVP_ORIGIN_HOST, AVP_ORIGIN_REALM};
use std::net::{Ipv4Addr, SocketAddr};
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::var("DPA_CONFIG").unwrap_or_else(|_| "config/dpa.yaml".to_string());
    let config: NodeConfig = dpa_config::load_config(&path)?;

    // Initialize logging
    let log_format: dpa_logging::LogFormat =
        config.app.log_format.parse().map_err(anyhow::Error::msg)?;
    dpa_logging::init_with(&config.app.log_level, log_format);

    // Register metrics
    dpa_metrics::register_metrics();

    info!(
        service = %config.app.service_name,
        version = env!("CARGO_PKG_VERSION"),
        identity = %config.identity,
        "Starting Diameter Peer Agent service"
    );

    let metrics_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.app.metrics_port));
    let node = LocalNode::new(config);
    dpa_node::metrics::serve(metrics_addr, node.shutdown_token()).await?;
    let addr = node.listen().await?;
    info!(%addr, "Accepting peer connections");
    node.start().await?;

    // No applications are hosted here: requests are refused, answers only logged
    if let Some(mut inbound) = node.take_inbound() {
        let node = node.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                if !message.is_request {
                    debug!(command_code = message.command_code, "Answer received");
                    continue;
                }
                let Some(peer) = message.origin_host().and_then(|host| node.peer(&host)) else {
                    continue;
                };
                let refusal = DpaError::ApplicationUnsupported(message.application_id);
                let mut answer = message.create_answer(refusal.to_result_code());
                answer.set_avp(Avp::string(AVP_ORIGIN_HOST, &node.config().identity));
                answer.set_avp(Avp::string(AVP_ORIGIN_REALM, &node.config().realm));
                if let Err(e) = peer.send(answer).await {
                    warn!(peer = %peer, error = %e, severity = %e.severity(), "Failed to answer request");
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    node.stop().await;
    Ok(())
}
