//! relayq broker - Main Entry Point
//!
//! Binds the frontend and backend endpoints and routes requests until Ctrl-C.

use relayq_broker::Broker;
use relayq_common::{logging, RelayConfig, METRICS};
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::load()?;
    logging::init_tracing("relayq_broker", &config.observability.log_level);

    info!(
        "Broker configuration loaded: frontend={}, backend={}, queue_capacity={}",
        config.broker.frontend_address, config.broker.backend_address, config.broker.queue_capacity
    );

    let broker = Broker::bind(&config.broker).await?;
    info!(
        "relayq broker bound: frontend={}, backend={}",
        broker.frontend_addr()?,
        broker.backend_addr()?
    );

    let report = broker
        .run(async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    if config.observability.enable_metrics {
        info!("Final metrics:\n{}", METRICS.gather());
    }

    info!(
        "relayq broker shutdown complete ({} abandoned, {} discarded)",
        report.abandoned_assignments, report.discarded_requests
    );
    Ok(())
}
