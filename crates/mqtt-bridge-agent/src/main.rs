//! # mqtt-bridge Agent
//!
//! Bridges a JSON-lines stream on stdin/stdout to an MQTT broker.
//!
//! Usage: `mqtt-bridge-agent [CONFIG]`. Without an argument the path is read
//! from `MQTT_BRIDGE_CONFIG`; without either, defaults and `MQTT_BRIDGE_*`
//! overrides are used.

use anyhow::{Context, Result};
use mqtt_bridge_agent::stdio::{pump_lines, spawn_taps};
use mqtt_bridge_agent::{BridgeConfig, Runtime};
use mqtt_bridge_bus::{LocalBus, MemoryBus};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries frames.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting mqtt-bridge agent");

    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = BridgeConfig::load(path.as_deref()).context("Failed to load configuration")?;

    let bus = MemoryBus::new();
    let local: Arc<dyn LocalBus> = Arc::new(bus.clone());

    let taps = spawn_taps(
        local.as_ref(),
        &config.remote_to_local_channels(),
        tokio::io::stdout(),
    )
    .context("Failed to tap remote channels")?;

    // A blocking stdin read cannot be cancelled, so it gets a plain thread.
    let input_bus = Arc::clone(&local);
    std::thread::spawn(move || {
        if let Err(e) = pump_lines(std::io::stdin().lock(), input_bus.as_ref()) {
            tracing::error!(error = %e, "Failed to read standard input");
        }
    });

    let runtime = Runtime::from_config(config, local);
    let shutdown = async {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                }
            }
            () = bus.shutdown_requested() => {}
        }
    };

    let result = runtime.run(shutdown).await;

    bus.shutdown();
    let _ = taps.await;

    result
}
