//! Connection control payloads.

use std::{fmt, str::FromStr};

use ciborium::Value;
use serde::{Deserialize, Serialize};

use crate::{
    envelope::{Envelope, MessageType, SUB_TYPE_CONNECTION_DISCONNECT},
    errors::{ProtocolError, Result},
};

/// Why a session was disconnected.
///
/// # Protocol Flow
///
/// Sent inside `update/connectionDisconnect` as `data.reason` by whichever
/// side closes the session. Received reasons become a peer-initiated
/// disconnect; `SessionDeleted` additionally tells the receiver to forget the
/// pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisconnectReason {
    /// Session stopped by the user or the app
    SessionStopped,
    /// Session deleted; the pairing must be forgotten
    SessionDeleted,
    /// The web client feature was switched off
    WebclientDisabled,
    /// Another session replaced this one
    SessionReplaced,
    /// A message exceeded the memory ceiling
    OutOfMemory,
    /// Unspecified failure
    Error,
}

impl DisconnectReason {
    /// Every reason, in wire order.
    pub const ALL: [Self; 6] = [
        Self::SessionStopped,
        Self::SessionDeleted,
        Self::WebclientDisabled,
        Self::SessionReplaced,
        Self::OutOfMemory,
        Self::Error,
    ];

    /// Wire string for this reason.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionStopped => "SESSION_STOPPED",
            Self::SessionDeleted => "SESSION_DELETED",
            Self::WebclientDisabled => "WEBCLIENT_DISABLED",
            Self::SessionReplaced => "SESSION_REPLACED",
            Self::OutOfMemory => "OUT_OF_MEMORY",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DisconnectReason {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|reason| reason.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownDisconnectReason(s.to_owned()))
    }
}

/// Data of the `update/connectionDisconnect` control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionDisconnect {
    /// Why the sender is disconnecting
    pub reason: DisconnectReason,
}

impl ConnectionDisconnect {
    const FIELD_REASON: &'static str = "reason";

    /// Wrap this payload in its envelope.
    pub fn to_envelope(self) -> Envelope {
        let data = Value::Map(vec![(
            Value::from(Self::FIELD_REASON),
            Value::from(self.reason.as_str()),
        )]);
        Envelope::new(MessageType::Update, SUB_TYPE_CONNECTION_DISCONNECT).with_data(data)
    }

    /// Read the payload out of a received envelope's `data`.
    ///
    /// # Errors
    ///
    /// - `MissingField("data")` if the envelope has no data
    /// - `InvalidFieldType` if data is not a map or reason is not a string
    /// - `MissingField("reason")` if the map has no reason
    /// - `UnknownDisconnectReason` for an unrecognised reason string
    pub fn from_envelope(envelope: &Envelope) -> Result<Self> {
        let data = envelope.data.as_ref().ok_or(ProtocolError::MissingField("data"))?;
        let entries = data
            .as_map()
            .ok_or(ProtocolError::InvalidFieldType { field: "data", expected: "map" })?;

        let reason = entries
            .iter()
            .find(|(key, _)| key.as_text() == Some(Self::FIELD_REASON))
            .map(|(_, value)| value)
            .ok_or(ProtocolError::MissingField(Self::FIELD_REASON))?;
        let reason = reason.as_text().ok_or(ProtocolError::InvalidFieldType {
            field: Self::FIELD_REASON,
            expected: "string",
        })?;

        Ok(Self { reason: reason.parse()? })
    }
}
