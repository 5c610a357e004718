//! Transport abstraction.
//!
//! Two external libraries sit underneath a session:
//!
//! - the rendezvous/handshake client, which authenticates both sides through
//!   a relay and negotiates a task, and
//! - the peer connection, which carries the data channels once the task is
//!   running.
//!
//! [`PeerTransport`] covers both for one connection attempt. Its methods are
//! synchronous commands; everything the libraries report back arrives
//! asynchronously on their own threads and is funnelled through
//! [`TransportEvents`] as [`TransportEvent`]s.

use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;

use crate::error::TransportError;

/// Handshake phases reported by the rendezvous client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingState {
    /// Client created, nothing started
    New,
    /// Opening the relay websocket
    WsConnecting,
    /// Authenticating against the relay
    ServerHandshake,
    /// Authenticating against the peer
    PeerHandshake,
    /// Task negotiated and running
    Task,
    /// Signaling shutting down
    Closing,
    /// Signaling gone
    Closed,
    /// Signaling failed
    Error,
}

impl SignalingState {
    /// Whether this is one of the phases before the task runs.
    pub fn is_handshake(self) -> bool {
        matches!(self, Self::WsConnecting | Self::ServerHandshake | Self::PeerHandshake)
    }
}

/// Peer connection states, after mapping the ICE state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerConnectionState {
    /// Created, ICE not started
    New,
    /// Checking candidates or temporarily disconnected
    Connecting,
    /// ICE connected or completed
    Connected,
    /// ICE failed
    Failed,
    /// Closed
    Closed,
}

/// Data channel states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// Not yet open
    Connecting,
    /// Ready for messages
    Open,
    /// Shutting down
    Closing,
    /// Gone
    Closed,
}

/// The two data channels of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Pre-negotiated channel the handshake library hands over to
    Signaling,
    /// Channel announced by the peer for application messages
    Application,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Signaling => "signaling",
            Self::Application => "application",
        })
    }
}

/// Task protocol versions the responder offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskVersion {
    /// Current task
    V1,
    /// Legacy fallback
    V0,
}

impl TaskVersion {
    /// Offer order: preferred first.
    pub const PREFERRED: [Self; 2] = [Self::V1, Self::V0];
}

/// Fixed parameters of the pre-negotiated signaling channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingLink {
    /// Negotiated channel id
    pub id: u16,
    /// Channel label
    pub label: String,
    /// Channel sub-protocol
    pub protocol: String,
}

/// Close codes sent to the handshake library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// Normal shutdown
    GoingAway,
    /// Peer violated the protocol
    ProtocolError,
}

impl CloseCode {
    /// Numeric code on the relay wire.
    pub fn code(self) -> u16 {
        match self {
            Self::GoingAway => 1001,
            Self::ProtocolError => 3001,
        }
    }
}

/// Key material for the handshake.
#[derive(Clone, PartialEq, Eq)]
pub enum HandshakeKeys {
    /// New pairing: the peer proves knowledge of the auth token
    Initiator {
        /// Peer's permanent public key
        permanent_key: Vec<u8>,
        /// One-time auth token from the pairing code
        auth_token: Vec<u8>,
    },
    /// Resumed pairing: both sides already trust each other
    TrustedPeer {
        /// Peer's permanent public key
        peer_key: Vec<u8>,
        /// Our stored private key
        private_key: Vec<u8>,
    },
}

impl fmt::Debug for HandshakeKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initiator { .. } => f.write_str("Initiator(..)"),
            Self::TrustedPeer { .. } => f.write_str("TrustedPeer(..)"),
        }
    }
}

/// Everything needed to start one handshake as responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeParams {
    /// Relay host
    pub host: String,
    /// Relay port
    pub port: u16,
    /// Pinned relay key, if the descriptor has one
    pub server_key: Option<Vec<u8>>,
    /// Keys for this attempt
    pub keys: HandshakeKeys,
    /// Offered task versions, preferred first
    pub tasks: Vec<TaskVersion>,
    /// Whether signaling moves onto the peer connection after the task starts
    pub handover: bool,
    /// Relay websocket ping interval
    pub ping_interval: Duration,
    /// Relay websocket connect timeout
    pub ws_connect_timeout: Duration,
    /// Whether IPv6 candidates may be gathered
    pub allow_ipv6: bool,
}

/// Events reported by the native libraries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Handshake phase changed
    SignalingStateChanged(SignalingState),
    /// Peer connection state changed
    PeerConnectionStateChanged(PeerConnectionState),
    /// Peer announced a data channel
    ChannelAnnounced {
        /// Channel label
        label: String,
        /// State at the time of the announcement
        state: ChannelState,
    },
    /// One of our channels changed state
    ChannelStateChanged {
        /// Channel
        channel: ChannelKind,
        /// New state
        state: ChannelState,
    },
    /// Native buffered amount of a channel changed
    BufferedAmountChanged {
        /// Channel
        channel: ChannelKind,
        /// Bytes buffered natively
        amount: usize,
    },
    /// Raw message on a channel
    ChannelMessage {
        /// Channel
        channel: ChannelKind,
        /// Whether the frame was binary
        binary: bool,
        /// Frame bytes
        data: Bytes,
    },
    /// Handshake library wants to send signaling bytes after handover
    SignalingOutbound(Bytes),
    /// Handshake library wants the signaling channel closed after handover
    SignalingCloseRequested,
}

impl TransportEvent {
    /// Channel the event belongs to, for per-channel ordering.
    ///
    /// An announcement belongs to the application channel it announces.
    pub fn channel(&self) -> Option<ChannelKind> {
        match self {
            Self::ChannelAnnounced { .. } => Some(ChannelKind::Application),
            Self::ChannelStateChanged { channel, .. }
            | Self::BufferedAmountChanged { channel, .. }
            | Self::ChannelMessage { channel, .. } => Some(*channel),
            _ => None,
        }
    }
}

/// Receiver of native callbacks.
///
/// Implementations are called from arbitrary threads and must not block.
pub trait TransportEvents: Send + Sync {
    /// Report an event.
    fn emit(&self, event: TransportEvent);
}

/// Handshake client plus peer connection for one connection attempt.
///
/// Commands are issued only from the session worker. Dropping the transport
/// releases every native resource.
pub trait PeerTransport: Send {
    /// Start the relay handshake.
    fn connect(&mut self) -> Result<(), TransportError>;

    /// Task chosen by the handshake, once in the task phase.
    fn negotiated_task(&self) -> Option<TaskVersion>;

    /// Create the peer connection for the negotiated task.
    fn create_peer_connection(&mut self) -> Result<(), TransportError>;

    /// Parameters of the signaling channel from the negotiated task.
    fn signaling_link(&self) -> Result<SignalingLink, TransportError>;

    /// Create the pre-negotiated, ordered signaling channel.
    fn create_signaling_channel(&mut self, link: &SignalingLink) -> Result<(), TransportError>;

    /// Maximum size of one data channel message.
    fn max_message_size(&self) -> usize;

    /// Set the native buffered-amount-low threshold of a channel.
    fn set_buffered_amount_low_threshold(&mut self, channel: ChannelKind, threshold: usize);

    /// Move signaling onto the signaling channel.
    fn handover(&mut self) -> Result<(), TransportError>;

    /// Feed a reassembled signaling message to the handshake library.
    fn feed_signaling(&mut self, message: Bytes) -> Result<(), TransportError>;

    /// Tell the handshake library the signaling channel is closing.
    fn signaling_link_closing(&mut self);

    /// Tell the handshake library the signaling channel is closed.
    fn signaling_link_closed(&mut self);

    /// Write one frame to a channel.
    fn send(&mut self, channel: ChannelKind, frame: Bytes) -> Result<(), TransportError>;

    /// Close a channel.
    fn close_channel(&mut self, channel: ChannelKind);

    /// Release a closed channel.
    fn dispose_channel(&mut self, channel: ChannelKind);

    /// Close the running task with a code.
    fn close_task(&mut self, code: CloseCode);

    /// Disconnect signaling.
    fn disconnect(&mut self);

    /// Dispose the peer connection. Idempotent.
    fn dispose_peer_connection(&mut self);
}

/// Creates transports for connection attempts.
pub trait TransportFactory: Send + Sync {
    /// Create a transport whose callbacks go to `events`.
    fn create(
        &self,
        params: HandshakeParams,
        events: Arc<dyn TransportEvents>,
    ) -> Result<Box<dyn PeerTransport>, TransportError>;
}
