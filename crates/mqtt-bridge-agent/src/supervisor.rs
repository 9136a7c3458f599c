//! Connection supervisor.
//!
//! Owns the `Disconnected -> Connecting -> Connected` state machine. Startup
//! blocks in [`Supervisor::connect_blocking`] until the broker accepts a
//! session; afterwards a dedicated task consumes [`LinkEvent`]s and drives
//! reconnects with a fixed backoff. Every state change is mirrored to the
//! local bus under [`IS_CONNECTED_KEY`].

use crate::transport::{LinkEvent, Transport, TransportError};
use mqtt_bridge_bus::LocalBus;
use mqtt_bridge_core::{ConnectionState, ConnectionStatus, IS_CONNECTED_KEY};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Drives the broker connection.
pub struct Supervisor<T: Transport> {
    transport: Arc<T>,
    bus: Arc<dyn LocalBus>,
    status: ConnectionStatus,
    backoff: Duration,
    shutdown: watch::Receiver<bool>,
}

impl<T: Transport> Supervisor<T> {
    /// Create a supervisor.
    ///
    /// `shutdown` flips to `true` when the process is stopping.
    pub fn new(
        transport: Arc<T>,
        bus: Arc<dyn LocalBus>,
        status: ConnectionStatus,
        backoff: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            transport,
            bus,
            status,
            backoff,
            shutdown,
        }
    }

    /// Shared connection status.
    #[must_use]
    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    /// Connect at startup, retrying without limit.
    ///
    /// Returns the number of attempts it took.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Shutdown`] if shutdown is signaled first.
    pub async fn connect_blocking(&self) -> Result<u32, SupervisorError> {
        let mut attempt: u32 = 0;

        loop {
            if self.shutdown_signaled() {
                return Err(SupervisorError::Shutdown);
            }

            attempt += 1;
            self.set_state(ConnectionState::Connecting);

            let mut shutdown = self.shutdown.clone();
            let result = tokio::select! {
                result = self.transport.connect() => result,
                () = stopped(&mut shutdown) => {
                    self.set_state(ConnectionState::Disconnected);
                    return Err(SupervisorError::Shutdown);
                }
            };

            match result {
                Ok(()) => {
                    self.set_state(ConnectionState::Connected);
                    tracing::info!(attempt, "Connected to MQTT broker");
                    return Ok(attempt);
                }
                Err(error) => {
                    self.set_state(ConnectionState::Disconnected);
                    log_attempt_failure(
                        &error,
                        attempt,
                        "Couldn't connect to broker during start sequence, trying again",
                    );
                    if !self.backoff().await {
                        return Err(SupervisorError::Shutdown);
                    }
                }
            }
        }
    }

    /// Spawn the supervision task consuming link events.
    #[must_use]
    pub fn spawn(self, events: mpsc::UnboundedReceiver<LinkEvent>) -> SupervisorHandle<T> {
        let transport = Arc::clone(&self.transport);
        let bus = Arc::clone(&self.bus);
        let status = self.status.clone();
        let task = tokio::spawn(self.run(events));

        SupervisorHandle {
            task,
            transport,
            bus,
            status,
        }
    }

    /// Consume link events until shutdown or until the transport goes away.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
        loop {
            let mut shutdown = self.shutdown.clone();
            let event = tokio::select! {
                event = events.recv() => event,
                () = stopped(&mut shutdown) => break,
            };

            match event {
                Some(LinkEvent::Connected { session_present }) => {
                    self.on_connected(session_present);
                }
                Some(LinkEvent::Disconnected { error }) => {
                    self.on_disconnected(&error);
                    if !self.reconnect(&mut events).await {
                        break;
                    }
                }
                None => {
                    tracing::debug!("Link event channel closed");
                    break;
                }
            }
        }

        tracing::debug!("Connection supervisor stopped");
    }

    fn on_connected(&self, session_present: bool) {
        tracing::info!(session_present, "MQTT connected");
        match self.status.state() {
            ConnectionState::Connected => {}
            ConnectionState::Connecting => self.set_state(ConnectionState::Connected),
            ConnectionState::Disconnected => {
                self.set_state(ConnectionState::Connecting);
                self.set_state(ConnectionState::Connected);
            }
        }
    }

    fn on_disconnected(&self, error: &TransportError) {
        tracing::info!(error = %error, "MQTT disconnected");
        if self.status.state() != ConnectionState::Disconnected {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Retry until a reconnect succeeds. Returns `false` on shutdown.
    async fn reconnect(&self, events: &mut mpsc::UnboundedReceiver<LinkEvent>) -> bool {
        let mut attempt: u32 = 0;

        loop {
            if self.shutdown_signaled() {
                tracing::debug!("Shutdown requested, abandoning reconnect");
                return false;
            }
            match self.wait_backoff(events).await {
                Backoff::Elapsed => {}
                Backoff::Restored => return true,
                Backoff::Stopped => {
                    tracing::debug!("Shutdown requested, abandoning reconnect");
                    return false;
                }
            }

            attempt += 1;
            tracing::info!(attempt, "Trying to reconnect to broker");
            self.set_state(ConnectionState::Connecting);
            self.transport.reconnect();

            let mut shutdown = self.shutdown.clone();
            let outcome = tokio::select! {
                event = events.recv() => event,
                () = stopped(&mut shutdown) => return false,
            };

            match outcome {
                Some(LinkEvent::Connected { session_present }) => {
                    self.set_state(ConnectionState::Connected);
                    tracing::info!(attempt, session_present, "Reconnected to MQTT broker");
                    return true;
                }
                Some(LinkEvent::Disconnected { error }) => {
                    self.set_state(ConnectionState::Disconnected);
                    log_attempt_failure(&error, attempt, "Couldn't connect to the broker");
                }
                None => return false,
            }
        }
    }

    /// Sleep one backoff interval while still listening to the network loop.
    async fn wait_backoff(&self, events: &mut mpsc::UnboundedReceiver<LinkEvent>) -> Backoff {
        let deadline = tokio::time::Instant::now() + self.backoff;
        let mut shutdown = self.shutdown.clone();

        loop {
            let event = tokio::select! {
                () = tokio::time::sleep_until(deadline) => return Backoff::Elapsed,
                () = stopped(&mut shutdown) => return Backoff::Stopped,
                event = events.recv() => event,
            };

            match event {
                Some(LinkEvent::Connected { session_present }) => {
                    self.on_connected(session_present);
                    return Backoff::Restored;
                }
                Some(LinkEvent::Disconnected { error }) => {
                    tracing::debug!(error = %error, "Link still down");
                }
                None => return Backoff::Stopped,
            }
        }
    }

    /// Sleep one backoff interval. Returns `false` if shutdown interrupted it.
    async fn backoff(&self) -> bool {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            () = tokio::time::sleep(self.backoff) => true,
            () = stopped(&mut shutdown) => false,
        }
    }

    fn shutdown_signaled(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        match self.status.transition(next) {
            Ok(()) => mirror(self.bus.as_ref(), &self.status),
            Err(e) => tracing::warn!(error = %e, "Ignoring connection state change"),
        }
    }
}

enum Backoff {
    Elapsed,
    Restored,
    Stopped,
}

/// Resolve once `shutdown` is set, or its sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn mirror(bus: &dyn LocalBus, status: &ConnectionStatus) {
    bus.set_param(IS_CONNECTED_KEY, Value::Bool(status.is_connected()));
}

fn log_attempt_failure(error: &TransportError, attempt: u32, what: &str) {
    if error.is_permanent() {
        tracing::error!(
            error = %error,
            attempt,
            permanent = true,
            "{what}; the broker rejected the session, check credentials and client id"
        );
    } else {
        tracing::error!(error = %error, attempt, "{what}");
    }
}

/// Handle to a running supervisor.
pub struct SupervisorHandle<T: Transport> {
    task: JoinHandle<()>,
    transport: Arc<T>,
    bus: Arc<dyn LocalBus>,
    status: ConnectionStatus,
}

impl<T: Transport> SupervisorHandle<T> {
    /// Shared connection status.
    #[must_use]
    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    /// Tear down the connection.
    ///
    /// Expects the shutdown signal to be set already. Waits for the
    /// supervisor task, stops the network loop, then disconnects. The loop
    /// goes first so no disconnect event races the teardown.
    pub async fn shutdown(self) {
        let mut task = self.task;
        if tokio::time::timeout(Duration::from_secs(5), &mut task)
            .await
            .is_err()
        {
            tracing::warn!("Connection supervisor did not stop in time");
            task.abort();
        }

        teardown(self.transport.as_ref(), self.bus.as_ref(), &self.status).await;
    }
}

/// Stop the network loop, disconnect and record the session as gone.
pub async fn teardown<T: Transport>(transport: &T, bus: &dyn LocalBus, status: &ConnectionStatus) {
    transport.loop_stop().await;
    if let Err(e) = transport.disconnect().await {
        tracing::warn!(error = %e, "Failed to disconnect from MQTT broker");
    }
    status.reset();
    mirror(bus, status);
    tracing::info!("MQTT connection closed");
}

/// Supervisor errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    /// Shutdown was signaled before a connection was established
    #[error("shutdown requested before the broker connection was established")]
    Shutdown,
}
