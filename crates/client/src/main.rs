//! relayq client - Main Entry Point
//!
//! Greets the broker a configured number of times and logs every reply.

use relayq_client::run_client;
use relayq_common::{logging, RelayConfig};
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::load()?;
    logging::init_tracing("relayq_client", &config.observability.log_level);

    let client_config = config.client;
    info!(
        "Starting relayq client (frontend={}, requests={}, interval={:?})",
        client_config.frontend_address,
        client_config.requests,
        client_config.interval()
    );

    tokio::select! {
        result = run_client(&client_config) => {
            let replies = result?;
            info!("Client finished after {} replies", replies.len());
        }
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    Ok(())
}
