//! # mqtt-bridge Core
//!
//! Building blocks shared by every bridge route.
//!
//! This crate provides:
//! - Private-path extraction for namespacing MQTT topics under a prefix
//! - A static codec registry resolving serializer/deserializer references
//! - MQTT topic and filter validation plus filter matching
//! - Message type registry validating payload shapes
//! - Connection state cell observed by health reporting

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod message;
pub mod private_path;
pub mod state;
pub mod topic;

pub use codec::{CodecError, CodecPair, DeserializerRef, SerializerRef};
pub use message::{Message, MessageType};
pub use private_path::PrivatePathExtractor;
pub use state::{ConnectionState, ConnectionStatus, TransitionError, IS_CONNECTED_KEY};
pub use topic::TopicError;
