//! # mqtt-bridge Local Bus
//!
//! The local side of the bridge is consumed through [`LocalBus`]: publish,
//! subscribe and a small shared key-value store. Applications embedding the
//! bridge implement it for their middleware; [`MemoryBus`] is an in-process
//! implementation used by the bundled agent and by tests.
//!
//! ## Channel Names
//!
//! Channel names are normalized before use: a leading private marker `~` and
//! leading slashes are stripped, so `~status`, `/status` and `status` are the
//! same channel.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory;

pub use memory::MemoryBus;

use mqtt_bridge_core::Message;
use serde_json::Value;
use tokio::sync::mpsc;

/// Narrow interface to the local publish/subscribe middleware.
pub trait LocalBus: Send + Sync + 'static {
    /// Publish a message on a channel.
    ///
    /// # Errors
    ///
    /// Returns error if the channel name is invalid or the bus is closed.
    fn publish(&self, channel: &str, message: Message) -> Result<(), BusError>;

    /// Subscribe to a channel.
    ///
    /// # Errors
    ///
    /// Returns error if the channel name is invalid or the bus is closed.
    fn subscribe(&self, channel: &str) -> Result<Subscription, BusError>;

    /// Read a shared parameter.
    fn get_param(&self, key: &str) -> Option<Value>;

    /// Write a shared parameter.
    fn set_param(&self, key: &str, value: Value);
}

/// A stream of messages from one local channel.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    rx: mpsc::Receiver<Message>,
}

impl Subscription {
    /// Wrap a receiver fed by a bus implementation.
    #[must_use]
    pub fn new(channel: impl Into<String>, rx: mpsc::Receiver<Message>) -> Self {
        Self {
            channel: channel.into(),
            rx,
        }
    }

    /// Normalized channel name.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Receive the next message, or `None` once the bus dropped the channel.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Receive without waiting.
    ///
    /// # Errors
    ///
    /// Returns error if no message is queued or the channel is closed.
    pub fn try_recv(&mut self) -> Result<Message, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }
}

/// Normalize a local channel name.
///
/// # Errors
///
/// Returns [`BusError::InvalidChannel`] if nothing is left after stripping.
pub fn normalize_channel(channel: &str) -> Result<String, BusError> {
    let trimmed = channel
        .trim()
        .trim_start_matches(mqtt_bridge_core::private_path::PRIVATE_MARKER)
        .trim_start_matches('/');

    if trimmed.is_empty() {
        return Err(BusError::InvalidChannel(channel.to_string()));
    }
    Ok(trimmed.to_string())
}

/// Local bus errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    /// Channel name is empty or malformed
    #[error("invalid channel name: {0:?}")]
    InvalidChannel(String),
    /// Bus has been shut down
    #[error("local bus is closed")]
    Closed,
}
