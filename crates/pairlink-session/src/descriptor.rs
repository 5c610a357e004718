//! Stored pairing data.

use std::fmt;

/// Pairing record a session is created from. Read-only to the session.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    /// Id of the stored pairing
    pub model_id: u64,
    /// Hash of the pairing key, used to look up pending wake-ups
    pub key_hash: String,
    /// Relay host
    pub host: String,
    /// Relay port
    pub port: u16,
    /// Pinned relay public key
    pub server_key: Option<Vec<u8>>,
    /// Peer's permanent public key, known once paired
    pub peer_key: Option<Vec<u8>>,
    /// Our stored private key, known once paired
    pub private_key: Option<Vec<u8>>,
    /// Push token of the web client
    pub push_token: Option<String>,
}

impl SessionDescriptor {
    /// Keys needed to resume, if both are stored.
    pub fn trusted_keys(&self) -> Option<(&[u8], &[u8])> {
        Some((self.peer_key.as_deref()?, self.private_key.as_deref()?))
    }
}

impl fmt::Debug for SessionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionDescriptor")
            .field("model_id", &self.model_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("pinned", &self.server_key.is_some())
            .field("paired", &self.trusted_keys().is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> SessionDescriptor {
        SessionDescriptor {
            model_id: 7,
            key_hash: "ab12".into(),
            host: "relay.example".into(),
            port: 443,
            server_key: None,
            peer_key: Some(vec![1; 32]),
            private_key: None,
            push_token: None,
        }
    }

    #[test]
    fn trusted_keys_need_both_halves() {
        let mut descriptor = descriptor();
        assert!(descriptor.trusted_keys().is_none());

        descriptor.private_key = Some(vec![2; 32]);
        assert!(descriptor.trusted_keys().is_some());
    }

    #[test]
    fn debug_hides_keys() {
        let mut descriptor = descriptor();
        descriptor.private_key = Some(vec![0xAA; 32]);
        let printed = format!("{descriptor:?}");
        assert!(printed.contains("paired: true"));
        assert!(!printed.contains("170"));
    }
}
