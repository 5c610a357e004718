//! Typed application envelope.
//!
//! Every application message is a self-describing map with a `type`, a
//! `subType`, and optional `args` and `data`. The engine only interprets the
//! first two; `args` and `data` belong to whichever handler owns the
//! `(type, subType)` pair.
//!
//! Field order on the wire is `type`, `subType`, `args`, `data`. Decoding
//! accepts any order and ignores unknown keys.

use std::{collections::BTreeMap, fmt, str::FromStr};

use ciborium::Value;

use crate::errors::{ProtocolError, Result};

/// Wire key of the message type.
pub const FIELD_TYPE: &str = "type";
/// Wire key of the message sub type.
pub const FIELD_SUB_TYPE: &str = "subType";
/// Wire key of the optional payload.
pub const FIELD_DATA: &str = "data";
/// Wire key of the optional argument map.
pub const FIELD_ARGS: &str = "args";

/// Sub type of the control message announcing a disconnect.
pub const SUB_TYPE_CONNECTION_DISCONNECT: &str = "connectionDisconnect";
/// Sub type of the battery status request the mobile side ignores.
pub const SUB_TYPE_BATTERY_STATUS: &str = "batteryStatus";

/// Argument map carried in `args`.
pub type Args = BTreeMap<String, Value>;

/// The five envelope types. Each has its own dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageType {
    /// Peer asks for something
    Request,
    /// Answer to a request
    Response,
    /// Unsolicited change notification
    Update,
    /// Peer asks to create an entity
    Create,
    /// Peer asks to delete an entity
    Delete,
}

impl MessageType {
    /// All types, in dispatcher registration order.
    pub const ALL: [Self; 5] =
        [Self::Request, Self::Response, Self::Update, Self::Create, Self::Delete];

    /// Wire string for this type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Update => "update",
            Self::Create => "create",
            Self::Delete => "delete",
        }
    }

    /// Parse a wire string. Returns `None` for anything but the five types.
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == value)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s).ok_or_else(|| ProtocolError::UnknownType(s.to_owned()))
    }
}

/// Application message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Dispatcher selector
    pub message_type: MessageType,
    /// Receiver selector within the dispatcher
    pub sub_type: String,
    /// Optional handler-defined payload
    pub data: Option<Value>,
    /// Optional handler-defined arguments
    pub args: Option<Args>,
}

impl Envelope {
    /// Create an envelope with neither `args` nor `data`.
    pub fn new(message_type: MessageType, sub_type: impl Into<String>) -> Self {
        Self { message_type, sub_type: sub_type.into(), data: None, args: None }
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Attach a whole argument map.
    #[must_use]
    pub fn with_args(mut self, args: Args) -> Self {
        self.args = Some(args);
        self
    }

    /// Add a single argument, creating the map if needed.
    #[must_use]
    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.get_or_insert_with(Args::new).insert(key.into(), value.into());
        self
    }

    /// Look up an argument.
    pub fn arg(&self, key: &str) -> Option<&Value> {
        self.args.as_ref().and_then(|args| args.get(key))
    }

    /// Look up a string argument.
    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.arg(key).and_then(Value::as_text)
    }

    /// Whether this is the `update/connectionDisconnect` control message.
    pub fn is_connection_disconnect(&self) -> bool {
        self.message_type == MessageType::Update
            && self.sub_type == SUB_TYPE_CONNECTION_DISCONNECT
    }

    /// Build the map form that goes on the wire.
    pub fn to_value(&self) -> Value {
        let mut entries = Vec::with_capacity(4);
        entries.push((Value::from(FIELD_TYPE), Value::from(self.message_type.as_str())));
        entries.push((Value::from(FIELD_SUB_TYPE), Value::from(self.sub_type.as_str())));

        if let Some(args) = &self.args {
            let args = args.iter().map(|(k, v)| (Value::from(k.as_str()), v.clone())).collect();
            entries.push((Value::from(FIELD_ARGS), Value::Map(args)));
        }
        if let Some(data) = &self.data {
            entries.push((Value::from(FIELD_DATA), data.clone()));
        }

        Value::Map(entries)
    }

    /// Interpret a decoded value as an envelope.
    ///
    /// # Errors
    ///
    /// - `NotAMap` if the value is not a map
    /// - `MissingField` if `type` or `subType` is absent
    /// - `InvalidFieldType` if a known field has the wrong shape
    /// - `UnknownType` if `type` is a string but not one of the five types
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Map(entries) = value else {
            return Err(ProtocolError::NotAMap);
        };

        let mut message_type = None;
        let mut sub_type = None;
        let mut data = None;
        let mut args = None;

        for (key, value) in entries {
            let Value::Text(key) = key else { continue };
            match key.as_str() {
                FIELD_TYPE => message_type = Some(value),
                FIELD_SUB_TYPE => sub_type = Some(value),
                FIELD_DATA => data = Some(value),
                FIELD_ARGS => args = Some(value),
                _ => {},
            }
        }

        let message_type = expect_text(message_type, FIELD_TYPE)?;
        let sub_type = expect_text(sub_type, FIELD_SUB_TYPE)?;
        let data = data.filter(|value| !value.is_null());
        let args = args.filter(|value| !value.is_null()).map(decode_args).transpose()?;

        let Some(message_type) = MessageType::parse(&message_type) else {
            return Err(ProtocolError::UnknownType(message_type));
        };

        Ok(Self { message_type, sub_type, data, args })
    }

    /// Encode to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns `Encode` if the serializer fails, which only happens for
    /// values CBOR cannot represent.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(&self.to_value(), &mut buf)
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(buf)
    }

    /// Decode from CBOR bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Self::from_value(decode_value(bytes)?)
    }
}

/// Decode raw CBOR bytes into a generic value.
///
/// # Errors
///
/// Returns `Decode` for malformed or truncated CBOR.
pub fn decode_value(bytes: &[u8]) -> Result<Value> {
    ciborium::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
}

fn expect_text(value: Option<Value>, field: &'static str) -> Result<String> {
    match value {
        None => Err(ProtocolError::MissingField(field)),
        Some(Value::Text(text)) => Ok(text),
        Some(_) => Err(ProtocolError::InvalidFieldType { field, expected: "string" }),
    }
}

fn decode_args(value: Value) -> Result<Args> {
    let invalid = ProtocolError::InvalidFieldType { field: FIELD_ARGS, expected: "map with string keys" };
    let Value::Map(entries) = value else {
        return Err(invalid);
    };

    let mut args = Args::new();
    for (key, value) in entries {
        let Value::Text(key) = key else {
            return Err(invalid);
        };
        args.insert(key, value);
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: Vec<(&str, Value)>) -> Value {
        Value::Map(entries.into_iter().map(|(k, v)| (Value::from(k), v)).collect())
    }

    #[test]
    fn type_strings() {
        let strings: Vec<_> = MessageType::ALL.iter().map(|t| t.as_str()).collect();
        assert_eq!(strings, ["request", "response", "update", "create", "delete"]);
        assert_eq!("update".parse::<MessageType>(), Ok(MessageType::Update));
        assert!(MessageType::parse("Update").is_none());
    }

    #[test]
    fn decode_minimal() {
        let value = map(vec![("type", "request".into()), ("subType", "clientInfo".into())]);
        let envelope = Envelope::from_value(value).expect("valid envelope");

        assert_eq!(envelope, Envelope::new(MessageType::Request, "clientInfo"));
    }

    #[test]
    fn field_order_does_not_matter() {
        let value = map(vec![
            ("data", Value::from(42)),
            ("subType", "typing".into()),
            ("extra", Value::Bool(true)),
            ("type", "update".into()),
        ]);
        let envelope = Envelope::from_value(value).expect("valid envelope");

        assert_eq!(envelope.message_type, MessageType::Update);
        assert_eq!(envelope.sub_type, "typing");
        assert_eq!(envelope.data, Some(Value::from(42)));
    }

    #[test]
    fn null_optionals_decode_as_absent() {
        let value = map(vec![
            ("type", "create".into()),
            ("subType", "contact".into()),
            ("args", Value::Null),
            ("data", Value::Null),
        ]);
        let envelope = Envelope::from_value(value).expect("valid envelope");

        assert!(envelope.args.is_none());
        assert!(envelope.data.is_none());
    }

    #[test]
    fn non_map_is_structural_error() {
        let err = Envelope::from_value(Value::from("hello")).expect_err("not a map");
        assert_eq!(err, ProtocolError::NotAMap);
        assert!(err.is_structural());
    }

    #[test]
    fn missing_sub_type_is_structural_error() {
        let err = Envelope::from_value(map(vec![("type", "request".into())])).expect_err("missing");
        assert_eq!(err, ProtocolError::MissingField(FIELD_SUB_TYPE));
        assert!(err.is_structural());
    }

    #[test]
    fn non_string_type_is_structural_error() {
        let value = map(vec![("type", Value::from(1)), ("subType", "x".into())]);
        let err = Envelope::from_value(value).expect_err("wrong type");
        assert!(matches!(err, ProtocolError::InvalidFieldType { field: FIELD_TYPE, .. }));
    }

    #[test]
    fn unknown_type_is_not_structural() {
        let value = map(vec![("type", "subscribe".into()), ("subType", "x".into())]);
        let err = Envelope::from_value(value).expect_err("unknown type");
        assert_eq!(err, ProtocolError::UnknownType("subscribe".to_owned()));
        assert!(!err.is_structural());
    }

    #[test]
    fn args_with_non_string_keys_rejected() {
        let args = Value::Map(vec![(Value::from(1), Value::from(2))]);
        let value = map(vec![("type", "request".into()), ("subType", "x".into()), ("args", args)]);
        let err = Envelope::from_value(value).expect_err("bad args");
        assert!(matches!(err, ProtocolError::InvalidFieldType { field: FIELD_ARGS, .. }));
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let err = Envelope::decode(&[0xff, 0x00, 0x13]).expect_err("garbage");
        assert!(matches!(err, ProtocolError::Decode(_)));
    }

    #[test]
    fn arg_lookup() {
        let envelope =
            Envelope::new(MessageType::Request, "messages").with_arg("id", "abc").with_arg("n", 3);

        assert_eq!(envelope.arg_str("id"), Some("abc"));
        assert_eq!(envelope.arg("n"), Some(&Value::from(3)));
        assert!(envelope.arg("missing").is_none());
    }

    #[test]
    fn encoding_snapshot() {
        let envelope = Envelope::new(MessageType::Update, SUB_TYPE_CONNECTION_DISCONNECT)
            .with_data(map(vec![("reason", "stop".into())]));
        let bytes = envelope.encode().expect("encodes");

        insta::assert_snapshot!(hex::encode(bytes), @"a3647479706566757064617465677375625479706574636f6e6e656374696f6e446973636f6e6e6563746464617461a166726561736f6e6473746f70");
    }
}
