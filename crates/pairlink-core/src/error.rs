//! Error types for the session core.
//!
//! Each layer has its own enum. Callers classify errors rather than match on
//! every variant: a reassembly ceiling breach is resource exhaustion, a
//! missing field is a structural violation, everything else is logged and the
//! session carries on.

use pairlink_proto::{MessageType, ProtocolError};
use thiserror::Error;

use crate::transport::ChannelKind;

/// Errors while reassembling chunks into messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReassemblyError {
    /// Chunk could not be parsed
    #[error(transparent)]
    Chunk(#[from] ProtocolError),

    /// Buffered bytes would exceed the configured ceiling
    #[error("reassembly buffer would hold {size} bytes, ceiling is {max}")]
    TooLarge {
        /// Bytes that would be buffered
        size: usize,
        /// Configured ceiling
        max: usize,
    },

    /// Same serial received twice for one message
    #[error("duplicate chunk {serial} for message {message_id}")]
    DuplicateChunk {
        /// Message id
        message_id: u32,
        /// Repeated serial
        serial: u32,
    },

    /// Chunk serial lies past the end-of-message chunk
    #[error("chunk {serial} for message {message_id} lies beyond end serial {end}")]
    BeyondEnd {
        /// Message id
        message_id: u32,
        /// Offending serial
        serial: u32,
        /// Serial of the chunk that carried the end flag
        end: u32,
    },
}

impl ReassemblyError {
    /// Whether the error is the memory ceiling rather than a malformed chunk.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, Self::TooLarge { .. })
    }
}

/// Errors raised by dispatchers and receivers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// Receiver could not decode the message payload
    #[error("failed to decode {sub_type}: {reason}")]
    Decode {
        /// Sub type being handled
        sub_type: String,
        /// Decoder's explanation
        reason: String,
    },

    /// Message lacks a field the protocol requires
    #[error("missing field `{field}` in {sub_type}")]
    MissingField {
        /// Sub type being handled
        sub_type: String,
        /// Absent field
        field: String,
    },

    /// A receiver is already registered for this pair
    #[error("receiver for {message_type}/{sub_type} already registered")]
    DuplicateReceiver {
        /// Dispatcher type
        message_type: MessageType,
        /// Conflicting sub type
        sub_type: String,
    },

    /// Envelope was routed to the wrong dispatcher
    #[error("{expected} dispatcher received a {got} message")]
    WrongType {
        /// Dispatcher type
        expected: MessageType,
        /// Envelope type
        got: MessageType,
    },
}

impl DispatchError {
    /// Whether the error invalidates the session rather than one message.
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::MissingField { .. } | Self::WrongType { .. })
    }
}

/// Errors reported by the handshake library or peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Handshake reached the task phase without a negotiated task
    #[error("no task negotiated")]
    NoTask,

    /// Peer connection has not been created yet
    #[error("peer connection not created")]
    NoPeerConnection,

    /// Channel is missing or already closed
    #[error("{0} channel unavailable")]
    ChannelUnavailable(ChannelKind),

    /// Handshake client could not be set up
    #[error("handshake setup failed: {0}")]
    Setup(String),

    /// Native send failed
    #[error("send failed: {0}")]
    Send(String),
}
