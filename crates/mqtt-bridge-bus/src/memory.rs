//! In-process bus.

use crate::{normalize_channel, BusError, LocalBus, Subscription};
use mqtt_bridge_core::Message;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{mpsc, watch};

/// Default per-subscriber queue depth.
pub const DEFAULT_QUEUE_SIZE: usize = 100;

/// In-process [`LocalBus`].
///
/// Every subscriber gets its own bounded queue. Publishing never waits: a
/// full queue drops the message for that subscriber only, so one slow
/// consumer cannot stall the others.
#[derive(Debug, Clone)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    queue_size: usize,
    channels: RwLock<HashMap<String, Vec<mpsc::Sender<Message>>>>,
    params: RwLock<HashMap<String, Value>>,
    shutdown: watch::Sender<bool>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    /// Create a bus with the default queue depth.
    #[must_use]
    pub fn new() -> Self {
        Self::with_queue_size(DEFAULT_QUEUE_SIZE)
    }

    /// Create a bus with a custom per-subscriber queue depth.
    #[must_use]
    pub fn with_queue_size(queue_size: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                queue_size: queue_size.max(1),
                channels: RwLock::new(HashMap::new()),
                params: RwLock::new(HashMap::new()),
                shutdown,
            }),
        }
    }

    /// Number of live subscribers on a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        let Ok(channel) = normalize_channel(channel) else {
            return 0;
        };
        self.inner
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&channel)
            .map_or(0, |senders| {
                senders.iter().filter(|tx| !tx.is_closed()).count()
            })
    }

    /// Signal shutdown: pending receivers drain and then end.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        self.inner
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Whether [`MemoryBus::shutdown`] has been called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Resolve once shutdown is signaled.
    pub async fn shutdown_requested(&self) {
        let mut rx = self.inner.shutdown.subscribe();
        // Sender lives in `inner`, so this only errors if it was dropped.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl LocalBus for MemoryBus {
    fn publish(&self, channel: &str, message: Message) -> Result<(), BusError> {
        if self.is_shutdown() {
            return Err(BusError::Closed);
        }
        let channel = normalize_channel(channel)?;

        let mut channels = self
            .inner
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(senders) = channels.get_mut(&channel) else {
            tracing::trace!(channel, "No subscribers for local channel");
            return Ok(());
        };

        senders.retain(|tx| match tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(channel, "Subscriber queue full, dropping message");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> Result<Subscription, BusError> {
        if self.is_shutdown() {
            return Err(BusError::Closed);
        }
        let channel = normalize_channel(channel)?;
        let (tx, rx) = mpsc::channel(self.inner.queue_size);

        self.inner
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(channel.clone())
            .or_default()
            .push(tx);

        tracing::debug!(channel, "Subscribed to local channel");
        Ok(Subscription::new(channel, rx))
    }

    fn get_param(&self, key: &str) -> Option<Value> {
        self.inner
            .params
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set_param(&self, key: &str, value: Value) {
        self.inner
            .params
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn delivers_to_every_subscriber() {
        let bus = MemoryBus::new();
        let mut first = bus.subscribe("status").unwrap();
        let mut second = bus.subscribe("~status").unwrap();

        bus.publish("/status", json!({"data": "ok"})).unwrap();

        assert_eq!(
            tokio_test::block_on(first.recv()),
            Some(json!({"data": "ok"}))
        );
        assert_eq!(
            tokio_test::block_on(second.recv()),
            Some(json!({"data": "ok"}))
        );
    }

    #[test]
    fn full_queue_does_not_block_others() {
        let bus = MemoryBus::with_queue_size(1);
        let mut slow = bus.subscribe("ticks").unwrap();
        let mut fast = bus.subscribe("ticks").unwrap();

        bus.publish("ticks", json!(1)).unwrap();
        assert_eq!(fast.try_recv().unwrap(), json!(1));

        bus.publish("ticks", json!(2)).unwrap();
        assert_eq!(fast.try_recv().unwrap(), json!(2));

        assert_eq!(slow.try_recv().unwrap(), json!(1));
        assert!(slow.try_recv().is_err());
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = MemoryBus::new();
        let sub = bus.subscribe("status").unwrap();
        assert_eq!(bus.subscriber_count("status"), 1);

        drop(sub);
        bus.publish("status", json!(null)).unwrap();
        assert_eq!(bus.subscriber_count("status"), 0);
    }

    #[test]
    fn params_round_trip() {
        let bus = MemoryBus::new();
        assert_eq!(bus.get_param("mqttbridge/is_connected"), None);

        bus.set_param("mqttbridge/is_connected", json!(true));
        assert_eq!(bus.get_param("mqttbridge/is_connected"), Some(json!(true)));
    }

    #[test]
    fn shutdown_closes_bus() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("status").unwrap();

        bus.shutdown();
        assert!(bus.is_shutdown());
        assert_eq!(bus.publish("status", json!(1)), Err(BusError::Closed));
        assert!(bus.subscribe("status").is_err());
        assert_eq!(tokio_test::block_on(sub.recv()), None);
        tokio_test::block_on(bus.shutdown_requested());
    }
}
