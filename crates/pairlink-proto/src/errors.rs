//! Protocol error types.

use thiserror::Error;

/// Result alias for wire-format operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while encoding or decoding protocol data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Top-level value of a message is not a map
    #[error("message is not a map")]
    NotAMap,

    /// Required envelope field is absent
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// Field is present but has the wrong shape
    #[error("field `{field}` has invalid type, expected {expected}")]
    InvalidFieldType {
        /// Field name on the wire
        field: &'static str,
        /// Human readable description of the expected shape
        expected: &'static str,
    },

    /// `type` string is not one of the five message types
    #[error("unknown message type `{0}`")]
    UnknownType(String),

    /// Disconnect reason string is not a known reason
    #[error("unknown disconnect reason `{0}`")]
    UnknownDisconnectReason(String),

    /// CBOR bytes could not be parsed
    #[error("CBOR decode failed: {0}")]
    Decode(String),

    /// Value could not be serialized to CBOR
    #[error("CBOR encode failed: {0}")]
    Encode(String),

    /// Chunk is shorter than its fixed header
    #[error("chunk too short: {0} bytes")]
    ChunkTooShort(usize),

    /// Chunk size leaves no room for payload bytes
    #[error("chunk size {0} does not exceed the chunk header")]
    ChunkSizeTooSmall(usize),

    /// Message exceeds the configured size ceiling
    #[error("message size {size} exceeds maximum {max}")]
    MessageTooLarge {
        /// Actual (or accumulated) size in bytes
        size: usize,
        /// Ceiling in bytes
        max: usize,
    },
}

impl ProtocolError {
    /// Whether this error means the peer violated the envelope structure.
    ///
    /// Structural violations end the session. An unknown message type is a
    /// well-formed envelope nobody handles, so it is dropped instead.
    pub fn is_structural(&self) -> bool {
        !matches!(self, Self::UnknownType(_) | Self::Encode(_) | Self::MessageTooLarge { .. })
    }
}
