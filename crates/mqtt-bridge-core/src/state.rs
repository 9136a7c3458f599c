//! Broker connection state.
//!
//! [`ConnectionStatus`] is the single shared record of connectivity. Its
//! public consumer is health reporting, which either polls
//! [`ConnectionStatus::is_connected`], watches changes through
//! [`ConnectionStatus::watch`], or reads the [`IS_CONNECTED_KEY`] mirror on
//! the local bus.

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Shared-state key mirroring [`ConnectionStatus::is_connected`].
pub const IS_CONNECTED_KEY: &str = "mqttbridge/is_connected";

/// Connection state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No session with the broker
    #[default]
    Disconnected,
    /// A connect attempt is in flight
    Connecting,
    /// Broker acknowledged the session
    Connected,
}

impl ConnectionState {
    /// Whether `self -> next` is a legal transition.
    ///
    /// ```text
    /// Disconnected -> Connecting -> Connected -> Disconnected
    ///                      |
    ///                      +------> Disconnected   (attempt failed)
    /// ```
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Disconnected, Self::Connecting)
                | (Self::Connecting, Self::Connected | Self::Disconnected)
                | (Self::Connected, Self::Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
        }
    }
}

/// Shared connectivity cell.
///
/// Cloning yields another handle to the same cell.
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    tx: Arc<watch::Sender<ConnectionState>>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStatus {
    /// Create a cell in the `Disconnected` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        Self { tx: Arc::new(tx) }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// `true` exactly when the state is `Connected`.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Move to `next`, rejecting illegal transitions.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] and leaves the state unchanged if the
    /// transition is not allowed.
    pub fn transition(&self, next: ConnectionState) -> Result<(), TransitionError> {
        let mut result = Ok(());
        self.tx.send_if_modified(|current| {
            if current.can_transition_to(next) {
                tracing::trace!(from = %current, to = %next, "Connection state transition");
                *current = next;
                true
            } else {
                result = Err(TransitionError {
                    from: *current,
                    to: next,
                });
                false
            }
        });
        result
    }

    /// Force the state to `Disconnected` regardless of the current state.
    ///
    /// Used on teardown, where the session is gone whatever the prior state.
    pub fn reset(&self) {
        self.tx.send_if_modified(|current| {
            let changed = *current != ConnectionState::Disconnected;
            *current = ConnectionState::Disconnected;
            changed
        });
    }
}

/// Illegal state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal connection state transition: {from} -> {to}")]
pub struct TransitionError {
    /// State before the attempted transition
    pub from: ConnectionState,
    /// Requested state
    pub to: ConnectionState,
}
