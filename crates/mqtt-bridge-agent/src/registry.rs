//! Bridge registry.
//!
//! One [`Bridge`] per configured route. Each forwarding direction is its own
//! task with its own queue, so a slow or failing route never holds up
//! another; within a route, messages keep their receipt order.

use crate::config::{BridgeConfig, Direction, RouteConfig};
use crate::echo::EchoPair;
use crate::transport::{qos_from_level, InboundMessage, Transport, TransportError};
use mqtt_bridge_bus::{normalize_channel, BusError, LocalBus, Subscription};
use mqtt_bridge_core::codec::CodecError;
use mqtt_bridge_core::message::MessageError;
use mqtt_bridge_core::topic::{self, TopicError};
use mqtt_bridge_core::{CodecPair, MessageType, PrivatePathExtractor};
use rumqttc::QoS;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Shared state handed to every bridge.
#[derive(Debug, Clone)]
pub struct BridgeContext {
    codecs: Arc<CodecPair>,
    extractor: Arc<PrivatePathExtractor>,
}

impl BridgeContext {
    /// Build a context from resolved parts.
    #[must_use]
    pub fn new(codecs: CodecPair, extractor: PrivatePathExtractor) -> Self {
        Self {
            codecs: Arc::new(codecs),
            extractor: Arc::new(extractor),
        }
    }

    /// Resolve codecs and the private path from configuration.
    ///
    /// # Errors
    ///
    /// Returns error if a codec reference is unknown.
    pub fn from_config(config: &BridgeConfig) -> Result<Self, CodecError> {
        let codecs = CodecPair::resolve(
            &config.serializer.as_str().into(),
            &config.deserializer.as_str().into(),
        )?;
        Ok(Self::new(
            codecs,
            PrivatePathExtractor::new(&config.mqtt.private_path),
        ))
    }

    /// Shared codec pair.
    #[must_use]
    pub fn codecs(&self) -> &CodecPair {
        &self.codecs
    }

    /// Shared path extractor.
    #[must_use]
    pub fn extractor(&self) -> &PrivatePathExtractor {
        &self.extractor
    }
}

/// A running route.
///
/// Dropping a bridge stops its forwarding tasks.
#[derive(Debug)]
pub struct Bridge {
    route: RouteConfig,
    local_channel: String,
    mqtt_topic: String,
    message_type: MessageType,
    tasks: Vec<JoinHandle<()>>,
}

impl Bridge {
    /// Route this bridge was built from.
    #[must_use]
    pub fn route(&self) -> &RouteConfig {
        &self.route
    }

    /// Normalized local channel.
    #[must_use]
    pub fn local_channel(&self) -> &str {
        &self.local_channel
    }

    /// Fully qualified MQTT topic or filter.
    #[must_use]
    pub fn mqtt_topic(&self) -> &str {
        &self.mqtt_topic
    }

    /// Message type of the route.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Whether every forwarding task is still alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.tasks.iter().all(|task| !task.is_finished())
    }

    /// Stop forwarding.
    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Per-route settings shared by its forwarding tasks.
#[derive(Debug)]
struct Forwarding {
    local_channel: String,
    mqtt_topic: String,
    message_type: MessageType,
    qos: QoS,
    retain: bool,
    codecs: Arc<CodecPair>,
    echo: Option<EchoPair>,
}

/// Build and start one route.
///
/// Sources are subscribed before any task starts, so a failure leaves
/// nothing running.
///
/// # Errors
///
/// Returns error if the message type is unknown, the QoS is out of range,
/// a topic is invalid, or a subscription fails.
pub fn create_bridge<T: Transport>(
    route: &RouteConfig,
    context: &BridgeContext,
    bus: &Arc<dyn LocalBus>,
    transport: &Arc<T>,
) -> Result<Bridge, BridgeError> {
    let message_type: MessageType = route.message_type.parse()?;
    let qos = qos_from_level(route.qos)?;
    let local_channel = normalize_channel(&route.local_topic)?;
    let mqtt_topic = context.extractor.resolve(&route.mqtt_topic);

    // Anything we publish to must be a concrete topic.
    let checked = if route.direction.has_local_source() {
        topic::validate_topic(&mqtt_topic)
    } else {
        topic::validate_filter(&mqtt_topic)
    };
    checked.map_err(|source| BridgeError::InvalidMqttTopic {
        topic: mqtt_topic.clone(),
        source,
    })?;

    let local_source = if route.direction.has_local_source() {
        Some(bus.subscribe(&local_channel)?)
    } else {
        None
    };
    let remote_source = if route.direction.has_remote_source() {
        Some(transport.subscribe(&mqtt_topic, qos, route.queue_size)?)
    } else {
        None
    };

    let forwarding = Arc::new(Forwarding {
        local_channel: local_channel.clone(),
        mqtt_topic: mqtt_topic.clone(),
        message_type,
        qos,
        retain: route.retain,
        codecs: Arc::clone(&context.codecs),
        echo: (route.direction == Direction::Bidirectional).then(EchoPair::default),
    });

    let mut tasks = Vec::with_capacity(2);
    if let Some(source) = local_source {
        tasks.push(tokio::spawn(local_to_remote(
            Arc::clone(&forwarding),
            source,
            Arc::clone(transport),
        )));
    }
    if let Some(source) = remote_source {
        tasks.push(tokio::spawn(remote_to_local(
            Arc::clone(&forwarding),
            source,
            Arc::clone(bus),
        )));
    }

    Ok(Bridge {
        route: route.clone(),
        local_channel,
        mqtt_topic,
        message_type,
        tasks,
    })
}

async fn local_to_remote<T: Transport>(
    route: Arc<Forwarding>,
    mut source: Subscription,
    transport: Arc<T>,
) {
    while let Some(message) = source.recv().await {
        if let Some(echo) = &route.echo {
            if echo.to_local.is_echo(&message) {
                tracing::trace!(channel = %route.local_channel, "Suppressed local echo");
                continue;
            }
        }

        if let Err(e) = route.message_type.validate(&message) {
            tracing::warn!(channel = %route.local_channel, error = %e, "Dropping local message");
            continue;
        }

        let payload = match route.codecs.serialize(&message) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(channel = %route.local_channel, error = %e, "Failed to serialize message");
                continue;
            }
        };

        // The broker may deliver the echo before the publish returns.
        if let Some(echo) = &route.echo {
            echo.to_remote.record(&message);
        }

        let payload_len = payload.len();
        match transport
            .publish(&route.mqtt_topic, payload, route.qos, route.retain)
            .await
        {
            Ok(()) => tracing::debug!(
                channel = %route.local_channel,
                topic = %route.mqtt_topic,
                payload_len,
                "Forwarded local message to MQTT"
            ),
            Err(e) => {
                if let Some(echo) = &route.echo {
                    echo.to_remote.forget(&message);
                }
                tracing::warn!(
                    topic = %route.mqtt_topic,
                    error = %e,
                    "Failed to publish to MQTT"
                );
            }
        }
    }

    tracing::debug!(channel = %route.local_channel, "Local source closed");
}

async fn remote_to_local(
    route: Arc<Forwarding>,
    mut source: mpsc::Receiver<InboundMessage>,
    bus: Arc<dyn LocalBus>,
) {
    while let Some(inbound) = source.recv().await {
        let message = match route.codecs.deserialize(&inbound.payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(
                    topic = %inbound.topic,
                    payload_len = inbound.payload.len(),
                    error = %e,
                    "Failed to deserialize MQTT message"
                );
                continue;
            }
        };

        if let Err(e) = route.message_type.validate(&message) {
            tracing::warn!(topic = %inbound.topic, error = %e, "Dropping MQTT message");
            continue;
        }

        if let Some(echo) = &route.echo {
            if echo.to_remote.is_echo(&message) {
                tracing::trace!(topic = %inbound.topic, "Suppressed MQTT echo");
                continue;
            }
            echo.to_local.record(&message);
        }

        match bus.publish(&route.local_channel, message) {
            Ok(()) => tracing::debug!(
                topic = %inbound.topic,
                channel = %route.local_channel,
                "Forwarded MQTT message to local bus"
            ),
            Err(BusError::Closed) => break,
            Err(e) => tracing::warn!(
                channel = %route.local_channel,
                error = %e,
                "Failed to publish on local bus"
            ),
        }
    }

    tracing::debug!(topic = %route.mqtt_topic, "MQTT source closed");
}

/// All routes of the process.
#[derive(Debug, Default)]
pub struct BridgeRegistry {
    bridges: Vec<Bridge>,
}

impl BridgeRegistry {
    /// Build every route. Fails as a whole if any route fails.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Route`] naming the first route that failed;
    /// routes built before it are stopped.
    pub fn build<T: Transport>(
        routes: &[RouteConfig],
        context: &BridgeContext,
        bus: &Arc<dyn LocalBus>,
        transport: &Arc<T>,
    ) -> Result<Self, BridgeError> {
        let mut registry = Self::default();

        for (index, route) in routes.iter().enumerate() {
            let bridge = create_bridge(route, context, bus, transport).map_err(|source| {
                BridgeError::Route {
                    index,
                    local_topic: route.local_topic.clone(),
                    mqtt_topic: route.mqtt_topic.clone(),
                    source: Box::new(source),
                }
            })?;

            tracing::info!(
                local = %bridge.local_channel,
                mqtt = %bridge.mqtt_topic,
                direction = ?route.direction,
                message_type = %bridge.message_type,
                "Bridge created"
            );
            registry.bridges.push(bridge);
        }

        Ok(registry)
    }

    /// Number of routes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bridges.len()
    }

    /// Whether no routes are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }

    /// Running bridges.
    #[must_use]
    pub fn bridges(&self) -> &[Bridge] {
        &self.bridges
    }

    /// Local channels fed from the broker.
    #[must_use]
    pub fn remote_channels(&self) -> Vec<&str> {
        self.bridges
            .iter()
            .filter(|bridge| bridge.route.direction.has_remote_source())
            .map(Bridge::local_channel)
            .collect()
    }

    /// Stop every route.
    pub fn shutdown(&mut self) {
        let count = self.bridges.len();
        self.bridges.clear();
        tracing::info!(count, "Bridges stopped");
    }
}

/// Bridge construction errors.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Message type is not registered
    #[error(transparent)]
    UnsupportedMessageType(#[from] MessageError),
    /// MQTT topic or filter is malformed
    #[error("invalid MQTT topic {topic:?}: {source}")]
    InvalidMqttTopic {
        /// Resolved topic
        topic: String,
        /// Validation failure
        source: TopicError,
    },
    /// Local bus rejected the channel or subscription
    #[error("local bus error: {0}")]
    Bus(#[from] BusError),
    /// Transport rejected the subscription or QoS
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// A specific configured route failed
    #[error("route #{index} ({local_topic} <-> {mqtt_topic}): {source}")]
    Route {
        /// Position in the configuration
        index: usize,
        /// Configured local topic
        local_topic: String,
        /// Configured MQTT topic
        mqtt_topic: String,
        /// Underlying failure
        source: Box<BridgeError>,
    },
}
