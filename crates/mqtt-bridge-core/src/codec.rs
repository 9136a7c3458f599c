//! Serializer/deserializer resolution.
//!
//! Codecs are referenced either directly by function pointer or by a lookup
//! string of the form `module[:function]`, e.g. `msgpack:dumps`. Lookup goes
//! through a static registry; there is no dynamic loading.

use crate::message::Message;
use std::fmt;

/// Encodes a message into wire bytes.
pub type SerializeFn = fn(&Message) -> Result<Vec<u8>, CodecError>;

/// Decodes wire bytes into a message.
pub type DeserializeFn = fn(&[u8]) -> Result<Message, CodecError>;

/// Default serializer reference.
pub const DEFAULT_SERIALIZER: &str = "msgpack:dumps";

/// Default deserializer reference.
pub const DEFAULT_DESERIALIZER: &str = "msgpack:loads";

const SERIALIZE_NAMES: &[&str] = &["dumps", "encode", "serialize"];
const DESERIALIZE_NAMES: &[&str] = &["loads", "decode", "deserialize"];

/// Built-in codec modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    /// JSON text
    Json,
    /// CBOR binary
    Cbor,
    /// MessagePack binary
    MsgPack,
}

impl CodecKind {
    /// All built-in codecs.
    pub const ALL: [Self; 3] = [Self::Json, Self::Cbor, Self::MsgPack];

    /// Look up a codec module by name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "json" => Some(Self::Json),
            "cbor" => Some(Self::Cbor),
            "msgpack" | "rmp" => Some(Self::MsgPack),
            _ => None,
        }
    }

    /// Canonical module name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Cbor => "cbor",
            Self::MsgPack => "msgpack",
        }
    }

    /// Encoder for this codec.
    #[must_use]
    pub fn serializer(self) -> SerializeFn {
        match self {
            Self::Json => json_dumps,
            Self::Cbor => cbor_dumps,
            Self::MsgPack => msgpack_dumps,
        }
    }

    /// Decoder for this codec.
    #[must_use]
    pub fn deserializer(self) -> DeserializeFn {
        match self {
            Self::Json => json_loads,
            Self::Cbor => cbor_loads,
            Self::MsgPack => msgpack_loads,
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reference to a serializer: a lookup string or a function.
#[derive(Clone)]
pub enum SerializerRef {
    /// `module[:function]` lookup string
    Name(String),
    /// Direct function reference
    Function(SerializeFn),
}

/// Reference to a deserializer: a lookup string or a function.
#[derive(Clone)]
pub enum DeserializerRef {
    /// `module[:function]` lookup string
    Name(String),
    /// Direct function reference
    Function(DeserializeFn),
}

impl fmt::Debug for SerializerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => f.debug_tuple("Name").field(name).finish(),
            Self::Function(_) => f.write_str("Function(..)"),
        }
    }
}

impl fmt::Debug for DeserializerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => f.debug_tuple("Name").field(name).finish(),
            Self::Function(_) => f.write_str("Function(..)"),
        }
    }
}

impl Default for SerializerRef {
    fn default() -> Self {
        Self::Name(DEFAULT_SERIALIZER.to_string())
    }
}

impl Default for DeserializerRef {
    fn default() -> Self {
        Self::Name(DEFAULT_DESERIALIZER.to_string())
    }
}

impl From<&str> for SerializerRef {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<&str> for DeserializerRef {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

/// Resolve a serializer reference.
///
/// # Errors
///
/// Returns [`CodecError::UnknownCodec`] if the module or function is not in
/// the registry.
pub fn resolve_serializer(reference: &SerializerRef) -> Result<SerializeFn, CodecError> {
    match reference {
        SerializerRef::Function(function) => Ok(*function),
        SerializerRef::Name(name) => lookup(name, SERIALIZE_NAMES).map(CodecKind::serializer),
    }
}

/// Resolve a deserializer reference.
///
/// # Errors
///
/// Returns [`CodecError::UnknownCodec`] if the module or function is not in
/// the registry.
pub fn resolve_deserializer(reference: &DeserializerRef) -> Result<DeserializeFn, CodecError> {
    match reference {
        DeserializerRef::Function(function) => Ok(*function),
        DeserializerRef::Name(name) => lookup(name, DESERIALIZE_NAMES).map(CodecKind::deserializer),
    }
}

fn lookup(reference: &str, functions: &[&str]) -> Result<CodecKind, CodecError> {
    let reference = reference.trim();
    let (module, function) = match reference.split_once(':') {
        Some((module, function)) => (module, Some(function)),
        None => (reference, None),
    };

    let kind = CodecKind::from_name(module)
        .ok_or_else(|| CodecError::UnknownCodec(reference.to_string()))?;

    match function {
        Some(function) if !functions.contains(&function) => {
            Err(CodecError::UnknownCodec(reference.to_string()))
        }
        _ => Ok(kind),
    }
}

/// Resolved encode/decode pair shared by all routes.
#[derive(Clone, Copy)]
pub struct CodecPair {
    serialize: SerializeFn,
    deserialize: DeserializeFn,
}

impl CodecPair {
    /// Build a pair from already resolved functions.
    #[must_use]
    pub fn new(serialize: SerializeFn, deserialize: DeserializeFn) -> Self {
        Self {
            serialize,
            deserialize,
        }
    }

    /// Resolve both references.
    ///
    /// # Errors
    ///
    /// Returns error if either reference is unknown.
    pub fn resolve(
        serializer: &SerializerRef,
        deserializer: &DeserializerRef,
    ) -> Result<Self, CodecError> {
        Ok(Self::new(
            resolve_serializer(serializer)?,
            resolve_deserializer(deserializer)?,
        ))
    }

    /// Encode a message.
    ///
    /// # Errors
    ///
    /// Returns error if the message cannot be encoded.
    pub fn serialize(&self, message: &Message) -> Result<Vec<u8>, CodecError> {
        (self.serialize)(message)
    }

    /// Decode a message.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are not valid for the codec.
    pub fn deserialize(&self, bytes: &[u8]) -> Result<Message, CodecError> {
        (self.deserialize)(bytes)
    }
}

impl fmt::Debug for CodecPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecPair").finish_non_exhaustive()
    }
}

impl Default for CodecPair {
    fn default() -> Self {
        Self::new(msgpack_dumps, msgpack_loads)
    }
}

fn json_dumps(message: &Message) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(message).map_err(|e| CodecError::Serialize(e.to_string()))
}

fn json_loads(bytes: &[u8]) -> Result<Message, CodecError> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::Deserialize(e.to_string()))
}

fn cbor_dumps(message: &Message) -> Result<Vec<u8>, CodecError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(message, &mut bytes)
        .map_err(|e| CodecError::Serialize(e.to_string()))?;
    Ok(bytes)
}

fn cbor_loads(bytes: &[u8]) -> Result<Message, CodecError> {
    ciborium::from_reader(bytes).map_err(|e| CodecError::Deserialize(e.to_string()))
}

fn msgpack_dumps(message: &Message) -> Result<Vec<u8>, CodecError> {
    rmp_serde::to_vec_named(message).map_err(|e| CodecError::Serialize(e.to_string()))
}

fn msgpack_loads(bytes: &[u8]) -> Result<Message, CodecError> {
    rmp_serde::from_slice(bytes).map_err(|e| CodecError::Deserialize(e.to_string()))
}

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Reference does not name a registered codec
    #[error("unknown codec reference: {0}")]
    UnknownCodec(String),
    /// Encoding failed
    #[error("serialize error: {0}")]
    Serialize(String),
    /// Decoding failed
    #[error("deserialize error: {0}")]
    Deserialize(String),
}
