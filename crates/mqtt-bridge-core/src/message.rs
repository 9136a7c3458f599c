//! Message model and the static message type registry.
//!
//! Messages travel through the bridge as dynamic JSON-like values. The
//! message type of a route only decides which shapes are accepted.

use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// A bridged message.
pub type Message = Value;

/// Message types known to the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Any value, forwarded without shape checks
    Any,
    /// `std_msgs/Empty`: an object, contents ignored
    Empty,
    /// `std_msgs/Bool`: `{"data": bool}`
    Bool,
    /// `std_msgs/String`: `{"data": string}`
    String,
    /// `std_msgs/Int32`: `{"data": i32}`
    Int32,
    /// `std_msgs/Int64`: `{"data": i64}`
    Int64,
    /// `std_msgs/Float32`: `{"data": number}`
    Float32,
    /// `std_msgs/Float64`: `{"data": number}`
    Float64,
    /// `geometry_msgs/Point`: `{"x": number, "y": number, "z": number}`
    Point,
}

impl MessageType {
    /// Every registered type.
    pub const ALL: [Self; 9] = [
        Self::Any,
        Self::Empty,
        Self::Bool,
        Self::String,
        Self::Int32,
        Self::Int64,
        Self::Float32,
        Self::Float64,
        Self::Point,
    ];

    /// Canonical `package/Name` form.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Empty => "std_msgs/Empty",
            Self::Bool => "std_msgs/Bool",
            Self::String => "std_msgs/String",
            Self::Int32 => "std_msgs/Int32",
            Self::Int64 => "std_msgs/Int64",
            Self::Float32 => "std_msgs/Float32",
            Self::Float64 => "std_msgs/Float64",
            Self::Point => "geometry_msgs/Point",
        }
    }

    /// Check that a message has the shape this type requires.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::Shape`] describing the first mismatch.
    pub fn validate(self, message: &Message) -> Result<(), MessageError> {
        let shape = |what: &str| MessageError::Shape {
            message_type: self.name(),
            reason: what.to_string(),
        };

        match self {
            Self::Any => Ok(()),
            Self::Empty => message
                .is_object()
                .then_some(())
                .ok_or_else(|| shape("expected an object")),
            Self::Bool => data(message)
                .filter(|v| v.is_boolean())
                .map(|_| ())
                .ok_or_else(|| shape("expected boolean `data`")),
            Self::String => data(message)
                .filter(|v| v.is_string())
                .map(|_| ())
                .ok_or_else(|| shape("expected string `data`")),
            Self::Int32 => data(message)
                .and_then(Value::as_i64)
                .filter(|v| i32::try_from(*v).is_ok())
                .map(|_| ())
                .ok_or_else(|| shape("expected 32-bit integer `data`")),
            Self::Int64 => data(message)
                .and_then(Value::as_i64)
                .map(|_| ())
                .ok_or_else(|| shape("expected 64-bit integer `data`")),
            Self::Float32 | Self::Float64 => data(message)
                .filter(|v| v.is_number())
                .map(|_| ())
                .ok_or_else(|| shape("expected numeric `data`")),
            Self::Point => ["x", "y", "z"]
                .iter()
                .all(|axis| message.get(axis).is_some_and(Value::is_number))
                .then_some(())
                .ok_or_else(|| shape("expected numeric `x`, `y` and `z`")),
        }
    }
}

fn data(message: &Message) -> Option<&Value> {
    message.get("data")
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MessageType {
    type Err = MessageError;

    /// Accepts `pkg/Name`, `pkg/msg/Name` and `pkg.msg:Name`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().replace(".msg:", "/").replace("/msg/", "/");

        Self::ALL
            .into_iter()
            .find(|ty| ty.name() == normalized)
            .ok_or_else(|| MessageError::UnknownType(s.to_string()))
    }
}

/// Message errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    /// Type name is not registered
    #[error("unsupported message type: {0}")]
    UnknownType(String),
    /// Message does not match the type's shape
    #[error("message does not match {message_type}: {reason}")]
    Shape {
        /// Expected type
        message_type: &'static str,
        /// What was wrong
        reason: String,
    },
}
