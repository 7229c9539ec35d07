//! relayq worker - Main Entry Point
//!
//! Connects to the broker backend and greets every request it receives.

use relayq_common::{logging, RelayConfig};
use relayq_worker::{run_worker, Greeter};
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::load()?;
    logging::init_tracing("relayq_worker", &config.observability.log_level);

    let worker_config = config.worker;
    let name = worker_config
        .name
        .clone()
        .unwrap_or_else(|| format!("worker-{}", std::process::id()));

    info!(
        "Starting relayq worker {} (backend={}, max_replies={:?})",
        name, worker_config.backend_address, worker_config.max_replies
    );

    tokio::select! {
        result = run_worker(&worker_config, Greeter::new(name.clone())) => {
            let summary = result?;
            info!("{} finished after {} replies ({:?})", name, summary.replies, summary.end);
        }
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    Ok(())
}
