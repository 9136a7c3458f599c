//! Bridge configuration.
//!
//! Configuration is read from a JSON or YAML file (picked by extension) and
//! then overridden from `MQTT_BRIDGE_*` environment variables.

use anyhow::{Context, Result};
use mqtt_bridge_bus::normalize_channel;
use mqtt_bridge_core::codec::{DEFAULT_DESERIALIZER, DEFAULT_SERIALIZER};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

/// Lower bound for the reconnect backoff.
pub const MIN_BACKOFF_MS: u64 = 100;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "MQTT_BRIDGE_CONFIG";

/// Default MQTT port.
pub const DEFAULT_PORT: u16 = 1883;

/// Top-level bridge configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Broker connection settings
    pub mqtt: MqttConfig,

    /// Serializer reference, e.g. `msgpack:dumps`
    pub serializer: String,

    /// Deserializer reference, e.g. `msgpack:loads`
    pub deserializer: String,

    /// Routes to bridge
    #[serde(alias = "bridges")]
    pub bridge: Vec<RouteConfig>,
}

/// MQTT settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker address
    pub connection: ConnectionConfig,

    /// Client session settings
    pub client: ClientConfig,

    /// Credentials
    pub account: Option<AccountConfig>,

    /// Prefix for private (`~`) topics; empty disables it
    pub private_path: String,

    /// Fixed delay between connect attempts, in milliseconds
    pub backoff_ms: u64,

    /// Upper bound for a single connect attempt, in milliseconds
    pub connect_timeout_ms: u64,

    /// Capacity of the client request queue
    pub request_capacity: usize,
}

/// Broker address.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Broker host
    pub host: String,

    /// Broker port
    pub port: u16,

    /// Keep-alive interval in seconds
    pub keepalive: u64,
}

/// Client session settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Client identifier; generated when absent
    pub client_id: Option<String>,

    /// Start with a clean session
    pub clean_session: bool,
}

/// Broker credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    /// User name
    pub username: String,

    /// Password
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig::default(),
            serializer: DEFAULT_SERIALIZER.to_string(),
            deserializer: DEFAULT_DESERIALIZER.to_string(),
            bridge: Vec::new(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            client: ClientConfig::default(),
            account: None,
            private_path: String::new(),
            backoff_ms: 1000,
            connect_timeout_ms: 5000,
            request_capacity: 100,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            keepalive: 60,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            clean_session: true,
        }
    }
}

impl MqttConfig {
    /// Backoff between connect attempts, at least [`MIN_BACKOFF_MS`].
    #[must_use]
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms.max(MIN_BACKOFF_MS))
    }

    /// Timeout for one connect attempt.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Configured client id, or a fresh `mqtt-bridge-<uuid>`.
    #[must_use]
    pub fn client_id(&self) -> String {
        self.client
            .client_id
            .clone()
            .unwrap_or_else(|| format!("mqtt-bridge-{}", Uuid::new_v4()))
    }
}

impl BridgeConfig {
    /// Load configuration.
    ///
    /// Reads `path`, or the file named by `MQTT_BRIDGE_CONFIG`, or starts from
    /// defaults; then applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed, or an override is
    /// malformed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var(CONFIG_PATH_ENV).ok();
        let path = path.or_else(|| env_path.as_deref().map(Path::new));

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Parse a JSON or YAML configuration file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            serde_json::from_str(&contents)
                .with_context(|| format!("Invalid JSON config {}", path.display()))
        } else {
            serde_yaml::from_str(&contents)
                .with_context(|| format!("Invalid YAML config {}", path.display()))
        }
    }

    /// Apply overrides from the process environment.
    ///
    /// # Environment Variables
    ///
    /// - `MQTT_BRIDGE_BROKER`: broker URL (`tcp://host:port`, `host:port`)
    /// - `MQTT_BRIDGE_CLIENT_ID`: client identifier
    /// - `MQTT_BRIDGE_USERNAME` / `MQTT_BRIDGE_PASSWORD`: credentials
    /// - `MQTT_BRIDGE_PRIVATE_PATH`: private topic prefix
    /// - `MQTT_BRIDGE_SERIALIZER` / `MQTT_BRIDGE_DESERIALIZER`: codec references
    /// - `MQTT_BRIDGE_BRIDGES`: JSON array of routes, replacing the file's
    ///
    /// # Errors
    ///
    /// Returns error if an override is malformed.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup.
    ///
    /// # Errors
    ///
    /// Returns error if an override is malformed.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(broker) = lookup("MQTT_BRIDGE_BROKER") {
            let (host, port) = parse_broker_url(&broker).context("Invalid MQTT_BRIDGE_BROKER")?;
            self.mqtt.connection.host = host;
            self.mqtt.connection.port = port;
        }

        if let Some(client_id) = lookup("MQTT_BRIDGE_CLIENT_ID") {
            self.mqtt.client.client_id = Some(client_id);
        }

        if let Some(username) = lookup("MQTT_BRIDGE_USERNAME") {
            self.mqtt.account = Some(AccountConfig {
                username,
                password: lookup("MQTT_BRIDGE_PASSWORD"),
            });
        }

        if let Some(private_path) = lookup("MQTT_BRIDGE_PRIVATE_PATH") {
            self.mqtt.private_path = private_path;
        }

        if let Some(serializer) = lookup("MQTT_BRIDGE_SERIALIZER") {
            self.serializer = serializer;
        }

        if let Some(deserializer) = lookup("MQTT_BRIDGE_DESERIALIZER") {
            self.deserializer = deserializer;
        }

        if let Some(routes) = lookup("MQTT_BRIDGE_BRIDGES") {
            self.bridge =
                serde_json::from_str(&routes).context("Invalid MQTT_BRIDGE_BRIDGES JSON")?;
        }

        Ok(())
    }

    /// Local channels fed from the broker.
    #[must_use]
    pub fn remote_to_local_channels(&self) -> Vec<String> {
        self.bridge
            .iter()
            .filter(|route| route.direction.has_remote_source())
            .filter_map(|route| normalize_channel(&route.local_topic).ok())
            .collect()
    }
}

/// Forwarding direction of a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Local bus to MQTT
    #[serde(alias = "out")]
    LocalToRemote,
    /// MQTT to local bus
    #[serde(alias = "in")]
    RemoteToLocal,
    /// Both ways
    #[serde(alias = "both")]
    Bidirectional,
}

impl Direction {
    /// Whether the route reads from the local bus.
    #[must_use]
    pub fn has_local_source(self) -> bool {
        matches!(self, Self::LocalToRemote | Self::Bidirectional)
    }

    /// Whether the route reads from the broker.
    #[must_use]
    pub fn has_remote_source(self) -> bool {
        matches!(self, Self::RemoteToLocal | Self::Bidirectional)
    }

    fn from_factory(factory: &str) -> Option<Self> {
        let name = factory.rsplit([':', '.']).next().unwrap_or(factory);
        match name {
            "RosToMqttBridge" | "LocalToRemote" => Some(Self::LocalToRemote),
            "MqttToRosBridge" | "RemoteToLocal" => Some(Self::RemoteToLocal),
            _ => None,
        }
    }
}

/// One configured route.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawRouteConfig")]
pub struct RouteConfig {
    /// Local channel
    pub local_topic: String,

    /// MQTT topic; may be private (`~`)
    pub mqtt_topic: String,

    /// Forwarding direction
    pub direction: Direction,

    /// Message type name, e.g. `std_msgs/Bool`
    pub message_type: String,

    /// MQTT QoS level (0, 1 or 2)
    pub qos: u8,

    /// Publish with the retain flag
    pub retain: bool,

    /// Depth of each per-route queue
    pub queue_size: usize,
}

impl RouteConfig {
    /// Route with default QoS, retain and queue settings.
    #[must_use]
    pub fn new(
        local_topic: impl Into<String>,
        mqtt_topic: impl Into<String>,
        direction: Direction,
        message_type: impl Into<String>,
    ) -> Self {
        Self {
            local_topic: local_topic.into(),
            mqtt_topic: mqtt_topic.into(),
            direction,
            message_type: message_type.into(),
            qos: 0,
            retain: false,
            queue_size: DEFAULT_ROUTE_QUEUE,
        }
    }
}

const DEFAULT_ROUTE_QUEUE: usize = 100;

/// Route as written in configuration files.
///
/// Accepts both `local_topic`/`mqtt_topic` and the `topic_from`/`topic_to`
/// pair, whose meaning depends on the direction.
#[derive(Debug, Deserialize)]
struct RawRouteConfig {
    local_topic: Option<String>,
    mqtt_topic: Option<String>,
    topic_from: Option<String>,
    topic_to: Option<String>,
    direction: Option<Direction>,
    factory: Option<String>,
    #[serde(alias = "msg_type")]
    message_type: Option<String>,
    #[serde(default)]
    qos: u8,
    #[serde(default)]
    retain: bool,
    queue_size: Option<usize>,
}

impl TryFrom<RawRouteConfig> for RouteConfig {
    type Error = ConfigError;

    fn try_from(raw: RawRouteConfig) -> Result<Self, Self::Error> {
        let direction = match (raw.direction, raw.factory.as_deref()) {
            (Some(direction), _) => direction,
            (None, Some(factory)) => Direction::from_factory(factory)
                .ok_or_else(|| ConfigError::UnknownFactory(factory.to_string()))?,
            (None, None) => return Err(ConfigError::MissingField("direction")),
        };

        let (from_side, to_side) = match direction {
            Direction::RemoteToLocal => (raw.mqtt_topic, raw.local_topic),
            Direction::LocalToRemote | Direction::Bidirectional => {
                (raw.local_topic, raw.mqtt_topic)
            }
        };
        let source = from_side.or(raw.topic_from);
        let target = to_side.or(raw.topic_to);

        let (local_topic, mqtt_topic) = match direction {
            Direction::RemoteToLocal => (target, source),
            Direction::LocalToRemote | Direction::Bidirectional => (source, target),
        };

        Ok(Self {
            local_topic: local_topic.ok_or(ConfigError::MissingField("local_topic"))?,
            mqtt_topic: mqtt_topic.ok_or(ConfigError::MissingField("mqtt_topic"))?,
            direction,
            message_type: raw
                .message_type
                .ok_or(ConfigError::MissingField("message_type"))?,
            qos: raw.qos,
            retain: raw.retain,
            queue_size: raw.queue_size.unwrap_or(DEFAULT_ROUTE_QUEUE),
        })
    }
}

/// Parse a broker URL into host and port.
///
/// Accepts `tcp://host[:port]`, `mqtt://host[:port]` and bare `host[:port]`.
/// IPv6 hosts are written in brackets and returned without them.
///
/// # Errors
///
/// Returns error for another scheme, an empty host, a bad port, or a URL
/// carrying a path, query or credentials.
pub fn parse_broker_url(input: &str) -> Result<(String, u16), ConfigError> {
    let invalid = |reason: &dyn std::fmt::Display| {
        ConfigError::InvalidBrokerUrl(format!("{input}: {reason}"))
    };

    let input = input.trim();
    let url = if input.contains("://") {
        Url::parse(input)
    } else {
        Url::parse(&format!("tcp://{input}"))
    }
    .map_err(|e| invalid(&e))?;

    if !matches!(url.scheme(), "tcp" | "mqtt") {
        return Err(invalid(&format!("unsupported scheme '{}'", url.scheme())));
    }

    let host = url
        .host_str()
        .map(|host| host.trim_start_matches('[').trim_end_matches(']'))
        .filter(|host| !host.is_empty())
        .ok_or_else(|| invalid(&"missing host"))?;

    let has_extras = !matches!(url.path(), "" | "/")
        || url.query().is_some()
        || url.fragment().is_some()
        || !url.username().is_empty()
        || url.password().is_some();
    if has_extras {
        return Err(invalid(&"only host and port are allowed"));
    }

    Ok((host.to_string(), url.port().unwrap_or(DEFAULT_PORT)))
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Required route field is absent
    #[error("route is missing `{0}`")]
    MissingField(&'static str),
    /// Factory name does not map to a direction
    #[error("unknown bridge factory: {0}")]
    UnknownFactory(String),
    /// Broker URL could not be parsed
    #[error("invalid MQTT broker URL: {0}")]
    InvalidBrokerUrl(String),
}
