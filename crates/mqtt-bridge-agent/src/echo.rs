//! Echo suppression for bidirectional routes.
//!
//! A bidirectional route sees its own output come back: the broker delivers
//! our publish to our subscription, and the local bus delivers our local
//! publish to our local subscription. Each forwarded message is fingerprinted
//! and the first matching arrival on the opposite side within the TTL is
//! dropped.

use mqtt_bridge_core::Message;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// How long a forwarded message is remembered.
pub const DEFAULT_ECHO_TTL: Duration = Duration::from_secs(5);

const MAX_ENTRIES: usize = 10_000;

/// Fingerprints of recently forwarded messages.
#[derive(Debug)]
pub struct EchoGuard {
    seen: Mutex<HashMap<u64, Vec<Instant>>>,
    ttl: Duration,
}

impl Default for EchoGuard {
    fn default() -> Self {
        Self::new(DEFAULT_ECHO_TTL)
    }
}

impl EchoGuard {
    /// Create a guard remembering messages for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Remember a message we forwarded.
    pub fn record(&self, message: &Message) {
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);

        if seen.len() >= MAX_ENTRIES {
            let ttl = self.ttl;
            seen.retain(|_, stamps| {
                stamps.retain(|stamp| now.duration_since(*stamp) < ttl);
                !stamps.is_empty()
            });
        }

        seen.entry(fingerprint(message)).or_default().push(now);
    }

    /// Whether `message` is the echo of one we forwarded. Consumes the match.
    pub fn is_echo(&self, message: &Message) -> bool {
        self.take(message)
    }

    /// Drop one record of `message`, for a forward that did not happen.
    pub fn forget(&self, message: &Message) {
        self.take(message);
    }

    fn take(&self, message: &Message) -> bool {
        let now = Instant::now();
        let key = fingerprint(message);
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(stamps) = seen.get_mut(&key) else {
            return false;
        };
        stamps.retain(|stamp| now.duration_since(*stamp) < self.ttl);

        let echoed = !stamps.is_empty();
        if echoed {
            stamps.remove(0);
        }
        if stamps.is_empty() {
            seen.remove(&key);
        }
        echoed
    }
}

/// Guards for both directions of one route.
#[derive(Debug, Default)]
pub struct EchoPair {
    /// Messages we published on the local bus
    pub to_local: EchoGuard,
    /// Messages we published to the broker
    pub to_remote: EchoGuard,
}

fn fingerprint(message: &Message) -> u64 {
    let mut hasher = DefaultHasher::new();
    message.to_string().hash(&mut hasher);
    hasher.finish()
}
