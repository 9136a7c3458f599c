//! Bridge runtime orchestration.

use crate::config::BridgeConfig;
use crate::registry::{BridgeContext, BridgeRegistry};
use crate::supervisor::{teardown, Supervisor};
use crate::transport::{RumqttTransport, Transport};
use anyhow::{Context, Result};
use mqtt_bridge_bus::LocalBus;
use mqtt_bridge_core::{ConnectionStatus, IS_CONNECTED_KEY};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Wires configuration, transport, supervisor and bridges together.
pub struct Runtime<T: Transport> {
    config: BridgeConfig,
    transport: Arc<T>,
    bus: Arc<dyn LocalBus>,
    status: ConnectionStatus,
}

impl Runtime<RumqttTransport> {
    /// Create a runtime talking to the broker named in `config`.
    #[must_use]
    pub fn from_config(config: BridgeConfig, bus: Arc<dyn LocalBus>) -> Self {
        let transport = Arc::new(RumqttTransport::new(&config.mqtt));
        Self::new(config, transport, bus)
    }
}

impl<T: Transport> Runtime<T> {
    /// Create a runtime over an existing transport.
    #[must_use]
    pub fn new(config: BridgeConfig, transport: Arc<T>, bus: Arc<dyn LocalBus>) -> Self {
        Self {
            config,
            transport,
            bus,
            status: ConnectionStatus::new(),
        }
    }

    /// Connection status, observable while [`Runtime::run`] is in progress.
    #[must_use]
    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    /// Run until `shutdown` resolves.
    ///
    /// Connects first, then builds every bridge and starts supervising the
    /// connection. A shutdown during the startup connect returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns error if a codec reference is unknown, a route cannot be
    /// built, or the network loop fails to start.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tracing::info!(routes = self.config.bridge.len(), "Starting bridge runtime");

        let context =
            BridgeContext::from_config(&self.config).context("Failed to resolve codecs")?;
        if !context.extractor().prefix().is_empty() {
            tracing::info!(private_path = context.extractor().prefix(), "Using private path");
        }

        self.bus.set_param(IS_CONNECTED_KEY, Value::Bool(false));

        let (stop_tx, stop_rx) = watch::channel(false);
        let supervisor = Supervisor::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.bus),
            self.status.clone(),
            self.config.mqtt.backoff(),
            stop_rx,
        );

        tokio::pin!(shutdown);

        let connected = tokio::select! {
            result = supervisor.connect_blocking() => result.is_ok(),
            () = &mut shutdown => false,
        };
        if !connected {
            tracing::info!("Shutdown requested during startup");
            let _ = stop_tx.send(true);
            self.teardown().await;
            return Ok(());
        }

        let mut registry =
            match BridgeRegistry::build(&self.config.bridge, &context, &self.bus, &self.transport)
            {
                Ok(registry) => registry,
                Err(e) => {
                    self.teardown().await;
                    return Err(e).context("Failed to create bridges");
                }
            };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        if let Err(e) = self.transport.loop_start(events_tx) {
            registry.shutdown();
            self.teardown().await;
            return Err(e).context("Failed to start MQTT network loop");
        }

        let handle = supervisor.spawn(events_rx);
        tracing::info!(bridges = registry.len(), "Bridge running, press Ctrl+C to stop");

        shutdown.await;
        tracing::info!("Shutting down");

        let _ = stop_tx.send(true);
        handle.shutdown().await;
        registry.shutdown();

        Ok(())
    }

    async fn teardown(&self) {
        teardown(self.transport.as_ref(), self.bus.as_ref(), &self.status).await;
    }
}
