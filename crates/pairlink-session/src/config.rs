//! Session configuration.

use std::time::Duration;

use pairlink_core::ConnectionConfig;
use serde::{Deserialize, Serialize};

/// Session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Time allowed from connect until the application channel opens
    pub handshake_timeout: Duration,
    /// Relay websocket connect timeout
    pub ws_connect_timeout: Duration,
    /// Relay websocket ping interval
    pub ping_interval: Duration,
    /// Whether IPv6 candidates may be gathered
    pub allow_ipv6: bool,
    /// Per-connection flow control and reassembly limits
    #[serde(flatten)]
    pub connection: ConnectionConfig,
}

impl SessionConfig {
    /// Ceiling for one reassembled or encoded message.
    pub fn max_message_bytes(&self) -> usize {
        self.connection.max_message_bytes
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(42),
            ws_connect_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(60),
            allow_ipv6: true,
            connection: ConnectionConfig::default(),
        }
    }
}
