//! MQTT transport.
//!
//! The supervisor and the bridges talk to the broker only through
//! [`Transport`]. Connection outcomes observed by the background network loop
//! are reported as [`LinkEvent`]s; the loop never retries on its own. A new
//! attempt happens only when the supervisor calls [`Transport::reconnect`].

use crate::config::MqttConfig;
use mqtt_bridge_core::topic;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, Publish, QoS, SubscribeFilter,
};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

/// Connection outcome reported by the network loop.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Broker acknowledged a (re)connect
    Connected {
        /// Broker kept the previous session
        session_present: bool,
    },
    /// Connection dropped or a reconnect attempt failed
    Disconnected {
        /// What went wrong
        error: TransportError,
    },
}

/// Publish received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic the message was published on
    pub topic: String,
    /// Raw payload
    pub payload: Vec<u8>,
}

/// Narrow interface to the MQTT client.
pub trait Transport: Send + Sync + 'static {
    /// Make one connect attempt and wait for its outcome.
    ///
    /// Only valid while the network loop is stopped.
    fn connect(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Ask the running network loop for one reconnect attempt.
    ///
    /// The outcome arrives as a [`LinkEvent`].
    fn reconnect(&self);

    /// Close the session.
    fn disconnect(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Start the background network loop, reporting to `events`.
    ///
    /// # Errors
    ///
    /// Returns error if the loop is already running.
    fn loop_start(&self, events: mpsc::UnboundedSender<LinkEvent>) -> Result<(), TransportError>;

    /// Stop the background network loop and wait for it to end.
    fn loop_stop(&self) -> impl Future<Output = ()> + Send;

    /// Publish a payload.
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Subscribe to a filter.
    ///
    /// The subscription is remembered and re-issued whenever the broker
    /// starts a fresh session.
    ///
    /// # Errors
    ///
    /// Returns error if the filter is invalid.
    fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        queue_size: usize,
    ) -> Result<mpsc::Receiver<InboundMessage>, TransportError>;
}

/// Map a numeric QoS level.
///
/// # Errors
///
/// Returns error for levels above 2.
pub fn qos_from_level(level: u8) -> Result<QoS, TransportError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(TransportError::InvalidQos(other)),
    }
}

#[derive(Debug)]
struct Route {
    filter: String,
    qos: QoS,
    tx: mpsc::Sender<InboundMessage>,
}

/// Subscriptions shared between the transport and its network loop.
#[derive(Debug, Default, Clone)]
struct Routes(Arc<RwLock<Vec<Route>>>);

impl Routes {
    fn add(&self, route: Route) {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(route);
    }

    fn filters(&self) -> Vec<SubscribeFilter> {
        let routes = self.0.read().unwrap_or_else(PoisonError::into_inner);
        let mut filters: Vec<SubscribeFilter> = Vec::with_capacity(routes.len());
        for route in routes.iter() {
            if !filters.iter().any(|f| f.path == route.filter) {
                filters.push(SubscribeFilter::new(route.filter.clone(), route.qos));
            }
        }
        filters
    }

    /// Hand a publish to every matching route without waiting.
    fn dispatch(&self, publish: &Publish) {
        let mut routes = self.0.write().unwrap_or_else(PoisonError::into_inner);
        routes.retain(|route| {
            if !topic::matches(&publish.topic, &route.filter) {
                return true;
            }
            let message = InboundMessage {
                topic: publish.topic.clone(),
                payload: publish.payload.to_vec(),
            };
            match route.tx.try_send(message) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        topic = %publish.topic,
                        filter = %route.filter,
                        "Route queue full, dropping MQTT message"
                    );
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(filter = %route.filter, "Route closed, removing subscription");
                    false
                }
            }
        });
    }
}

/// [`Transport`] backed by `rumqttc`.
pub struct RumqttTransport {
    client: AsyncClient,
    eventloop: Arc<tokio::sync::Mutex<EventLoop>>,
    routes: Routes,
    connected: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    reconnect: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
    connect_timeout: Duration,
}

impl RumqttTransport {
    /// Create a transport from MQTT settings. Does not connect.
    #[must_use]
    pub fn new(config: &MqttConfig) -> Self {
        let client_id = config.client_id();
        let mut options = MqttOptions::new(
            &client_id,
            &config.connection.host,
            config.connection.port,
        );
        options.set_keep_alive(Duration::from_secs(config.connection.keepalive.max(5)));
        options.set_clean_session(config.client.clean_session);
        if let Some(account) = &config.account {
            options.set_credentials(
                &account.username,
                account.password.as_deref().unwrap_or_default(),
            );
        }

        tracing::debug!(
            client_id,
            host = %config.connection.host,
            port = config.connection.port,
            "Created MQTT transport"
        );

        let (client, eventloop) = AsyncClient::new(options, config.request_capacity.max(10));

        Self {
            client,
            eventloop: Arc::new(tokio::sync::Mutex::new(eventloop)),
            routes: Routes::default(),
            connected: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            reconnect: Arc::new(Notify::new()),
            task: Mutex::new(None),
            connect_timeout: config.connect_timeout(),
        }
    }

    fn resubscribe(client: &AsyncClient, routes: &Routes) {
        let filters = routes.filters();
        if filters.is_empty() {
            return;
        }
        let count = filters.len();
        match client.try_subscribe_many(filters) {
            Ok(()) => tracing::info!(count, "Subscribed to MQTT topics"),
            Err(e) => tracing::warn!(error = %e, count, "Failed to queue MQTT subscriptions"),
        }
    }

    async fn network_loop(
        eventloop: Arc<tokio::sync::Mutex<EventLoop>>,
        client: AsyncClient,
        routes: Routes,
        connected: Arc<AtomicBool>,
        reconnect: Arc<Notify>,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) {
        let mut eventloop = eventloop.lock().await;
        Self::resubscribe(&client, &routes);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    tracing::trace!(
                        topic = %publish.topic,
                        payload_len = publish.payload.len(),
                        "Received MQTT message"
                    );
                    routes.dispatch(&publish);
                }
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    connected.store(true, Ordering::SeqCst);
                    if !ack.session_present {
                        Self::resubscribe(&client, &routes);
                    }
                    let event = LinkEvent::Connected {
                        session_present: ack.session_present,
                    };
                    if events.send(event).is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    connected.store(false, Ordering::SeqCst);
                    let error = TransportError::from(e);
                    tracing::debug!(error = %error, "MQTT network loop lost the connection");
                    if events.send(LinkEvent::Disconnected { error }).is_err() {
                        break;
                    }
                    // Polling again reconnects; wait until asked to.
                    reconnect.notified().await;
                }
            }
        }

        tracing::debug!("MQTT network loop stopped");
    }
}

impl Transport for RumqttTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut eventloop = self
            .eventloop
            .try_lock()
            .map_err(|_| TransportError::LoopRunning)?;

        let attempt = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if !ack.session_present {
                            Self::resubscribe(&self.client, &self.routes);
                        }
                        return Ok(());
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.routes.dispatch(&publish);
                    }
                    Ok(_) => {}
                    Err(e) => return Err(TransportError::from(e)),
                }
            }
        };

        let result = tokio::time::timeout(self.connect_timeout, attempt)
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout))
            .and_then(|outcome| outcome);

        self.connected.store(result.is_ok(), Ordering::SeqCst);
        result
    }

    fn reconnect(&self) {
        self.reconnect.notify_one();
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            tracing::debug!("Not connected, skipping MQTT disconnect");
            return Ok(());
        }

        self.client
            .try_disconnect()
            .map_err(|e| TransportError::Disconnect(e.to_string()))?;

        // With the loop stopped nothing drains the request queue, so flush
        // the DISCONNECT here.
        let Ok(mut eventloop) = self.eventloop.try_lock() else {
            return Ok(());
        };
        let flush = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(Duration::from_secs(1), flush)
            .await
            .is_err()
        {
            tracing::warn!("Timed out flushing MQTT disconnect");
        }
        Ok(())
    }

    fn loop_start(&self, events: mpsc::UnboundedSender<LinkEvent>) -> Result<(), TransportError> {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(TransportError::LoopRunning);
        }

        self.running.store(true, Ordering::SeqCst);
        *task = Some(tokio::spawn(Self::network_loop(
            Arc::clone(&self.eventloop),
            self.client.clone(),
            self.routes.clone(),
            Arc::clone(&self.connected),
            Arc::clone(&self.reconnect),
            events,
        )));

        tracing::info!("MQTT network loop started");
        Ok(())
    }

    async fn loop_stop(&self) {
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = handle {
            handle.abort();
            // Cancellation is the expected outcome.
            let _ = handle.await;
            tracing::info!("MQTT network loop stopped");
        }
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        // Waits while the request queue is full; only the calling route stalls.
        self.client
            .publish(topic, qos, retain, payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        queue_size: usize,
    ) -> Result<mpsc::Receiver<InboundMessage>, TransportError> {
        topic::validate_filter(filter)
            .map_err(|e| TransportError::Subscribe(format!("{filter}: {e}")))?;

        let (tx, rx) = mpsc::channel(queue_size.max(1));
        self.routes.add(Route {
            filter: filter.to_string(),
            qos,
            tx,
        });

        // Before the loop starts, subscriptions are sent in one batch by
        // `network_loop`.
        if self.running.load(Ordering::SeqCst) {
            self.client
                .try_subscribe(filter, qos)
                .map_err(|e| TransportError::Subscribe(e.to_string()))?;
        }

        tracing::info!(filter, "Subscribed to MQTT filter");
        Ok(rx)
    }
}

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Network-level failure; may succeed on retry
    #[error("connection error: {0}")]
    Connection(String),
    /// Broker refused the session
    #[error("connection refused by broker: {reason}")]
    Refused {
        /// Broker return code
        reason: String,
        /// Retrying with the same settings will not help
        permanent: bool,
    },
    /// Connect attempt did not complete in time
    #[error("connect attempt timed out after {0:?}")]
    Timeout(Duration),
    /// Publish could not be queued
    #[error("publish error: {0}")]
    Publish(String),
    /// Subscription failed
    #[error("subscription error: {0}")]
    Subscribe(String),
    /// Disconnect failed
    #[error("disconnect error: {0}")]
    Disconnect(String),
    /// QoS level out of range
    #[error("invalid QoS level: {0}")]
    InvalidQos(u8),
    /// Operation needs the network loop to be stopped
    #[error("network loop is running")]
    LoopRunning,
}

impl TransportError {
    /// Whether retrying with unchanged settings can never succeed.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Refused { permanent: true, .. })
    }
}

impl From<ConnectionError> for TransportError {
    fn from(error: ConnectionError) -> Self {
        match error {
            ConnectionError::ConnectionRefused(code) => Self::Refused {
                reason: format!("{code:?}"),
                permanent: !matches!(
                    code,
                    ConnectReturnCode::Success | ConnectReturnCode::ServiceUnavailable
                ),
            },
            other => Self::Connection(other.to_string()),
        }
    }
}
