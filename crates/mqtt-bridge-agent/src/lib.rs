//! # mqtt-bridge Agent
//!
//! Runtime bridging a local publish/subscribe bus to an MQTT broker.
//!
//! ## Architecture
//!
//! The agent runs these concurrent parts:
//! 1. **Transport**: one network loop task owning the MQTT event loop
//! 2. **Supervisor**: owns the connection state and drives reconnects
//! 3. **Bridges**: one task per route direction, each with its own queue
//!
//! Startup blocks until the broker accepts a session; routes are built only
//! after that.

#![warn(clippy::all)]

pub mod config;
pub mod echo;
pub mod registry;
pub mod runtime;
pub mod stdio;
pub mod supervisor;
pub mod transport;

pub use config::{BridgeConfig, Direction, MqttConfig, RouteConfig};
pub use registry::{create_bridge, Bridge, BridgeContext, BridgeError, BridgeRegistry};
pub use runtime::Runtime;
pub use supervisor::{Supervisor, SupervisorError, SupervisorHandle};
pub use transport::{InboundMessage, LinkEvent, RumqttTransport, Transport, TransportError};
