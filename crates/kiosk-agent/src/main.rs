//! Kiosk OBD-II Agent - Main Entry Point

use kiosk_agent::{init_logging, json_logging_requested, Agent};
use obd_connection::{AgentSettings, SystemConnector};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging(json_logging_requested())?;

    info!("=== Kiosk OBD-II Agent v{} ===", env!("CARGO_PKG_VERSION"));
    let settings = AgentSettings::load()?;
    info!(
        "Bluetooth {:?}, profile {}, timeout {}ms",
        settings.bluetooth_policy(),
        settings.protocol_profile,
        settings.timeout_ms
    );

    let mut agent = Agent::new(settings, Arc::new(SystemConnector));
    agent.start().await;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    agent.shutdown().await;

    Ok(())
}
