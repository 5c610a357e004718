//! Scripted transport.
//!
//! [`SimNetwork`] stands in for both native libraries. The session creates
//! one [`SimPeer`] per connection attempt through the factory; the test
//! drives the other side by emitting native events into the attempt's sink
//! and inspects every call the session made.
//!
//! Events are emitted without holding the network lock, so the worker can
//! call back into the transport while handling them.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use pairlink_core::{
    Envelope,
    error::TransportError,
    reassembly::Unchunker,
    transport::{
        ChannelKind, ChannelState, CloseCode, HandshakeParams, PeerConnectionState, PeerTransport,
        SignalingLink, SignalingState, TaskVersion, TransportEvent, TransportEvents,
        TransportFactory,
    },
};
use pairlink_proto::{Chunker, MAX_MESSAGE_SIZE};

/// Label the simulated web client uses for its application channel.
pub const APPLICATION_LABEL: &str = "pairlink-app";

/// Behaviour of the simulated libraries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimTransportConfig {
    /// Task the handshake settles on
    pub negotiated_task: Option<TaskVersion>,
    /// Maximum data channel message size
    pub max_message_size: usize,
    /// Make the factory fail
    pub fail_create: bool,
    /// Make `connect` fail
    pub fail_connect: bool,
}

impl Default for SimTransportConfig {
    fn default() -> Self {
        Self {
            negotiated_task: Some(TaskVersion::V1),
            max_message_size: 16 * 1024,
            fail_create: false,
            fail_connect: false,
        }
    }
}

/// Calls the session made on a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    /// `connect`
    Connect,
    /// `create_peer_connection`
    CreatePeerConnection,
    /// `create_signaling_channel`
    CreateSignalingChannel(SignalingLink),
    /// `set_buffered_amount_low_threshold`
    SetThreshold {
        /// Channel
        channel: ChannelKind,
        /// Threshold
        threshold: usize,
    },
    /// `handover`
    Handover,
    /// `feed_signaling`
    FeedSignaling(Bytes),
    /// `signaling_link_closing`
    SignalingLinkClosing,
    /// `signaling_link_closed`
    SignalingLinkClosed,
    /// `send`
    Send {
        /// Channel
        channel: ChannelKind,
        /// Frame
        frame: Bytes,
    },
    /// `close_channel`
    CloseChannel(ChannelKind),
    /// `dispose_channel`
    DisposeChannel(ChannelKind),
    /// `close_task`
    CloseTask(CloseCode),
    /// `disconnect`
    Disconnect,
    /// `dispose_peer_connection`
    DisposePeerConnection,
}

struct Attempt {
    params: HandshakeParams,
    events: Arc<dyn TransportEvents>,
    calls: Vec<TransportCall>,
    dropped: bool,
}

struct NetworkState {
    config: SimTransportConfig,
    attempts: Vec<Attempt>,
    peer_chunker: Chunker,
}

/// Both native libraries plus the remote web client.
#[derive(Clone)]
pub struct SimNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

impl SimNetwork {
    /// Create a network with the given behaviour.
    pub fn new(config: SimTransportConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(NetworkState {
                config,
                attempts: Vec::new(),
                peer_chunker: Chunker::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Factory to hand to the session.
    pub fn factory(&self) -> Arc<dyn TransportFactory> {
        Arc::new(SimTransportFactory { network: self.clone() })
    }

    /// Change behaviour for later attempts and calls.
    pub fn configure(&self, f: impl FnOnce(&mut SimTransportConfig)) {
        f(&mut self.state().config);
    }

    /// Number of transports created.
    pub fn attempts(&self) -> usize {
        self.state().attempts.len()
    }

    /// Parameters of attempt `index`.
    pub fn params(&self, index: usize) -> Option<HandshakeParams> {
        self.state().attempts.get(index).map(|a| a.params.clone())
    }

    /// Calls made on attempt `index`.
    pub fn calls(&self, index: usize) -> Vec<TransportCall> {
        self.state().attempts.get(index).map(|a| a.calls.clone()).unwrap_or_default()
    }

    /// Calls made on the latest attempt.
    pub fn last_calls(&self) -> Vec<TransportCall> {
        let state = self.state();
        state.attempts.last().map(|a| a.calls.clone()).unwrap_or_default()
    }

    /// Whether the session dropped the transport of attempt `index`.
    pub fn is_dropped(&self, index: usize) -> bool {
        self.state().attempts.get(index).is_some_and(|a| a.dropped)
    }

    /// Emit a native event on attempt `index`.
    pub fn emit_to(&self, index: usize, event: TransportEvent) {
        let events = self.state().attempts.get(index).map(|a| Arc::clone(&a.events));
        if let Some(events) = events {
            events.emit(event);
        }
    }

    /// Emit a native event on the latest attempt.
    pub fn emit(&self, event: TransportEvent) {
        let latest = self.attempts().checked_sub(1);
        if let Some(index) = latest {
            self.emit_to(index, event);
        }
    }

    /// Walk the handshake up to the task phase.
    pub fn handshake(&self) {
        for state in [
            SignalingState::WsConnecting,
            SignalingState::ServerHandshake,
            SignalingState::PeerHandshake,
            SignalingState::Task,
        ] {
            self.emit(TransportEvent::SignalingStateChanged(state));
        }
    }

    /// Connect the peer connection and open the signaling channel.
    pub fn connect_peer(&self) {
        self.emit(TransportEvent::PeerConnectionStateChanged(PeerConnectionState::Connecting));
        self.emit(TransportEvent::PeerConnectionStateChanged(PeerConnectionState::Connected));
        self.emit(TransportEvent::ChannelStateChanged {
            channel: ChannelKind::Signaling,
            state: ChannelState::Open,
        });
    }

    /// Announce the application channel and open it.
    pub fn open_application(&self) {
        self.emit(TransportEvent::ChannelAnnounced {
            label: APPLICATION_LABEL.into(),
            state: ChannelState::Connecting,
        });
        self.emit(TransportEvent::ChannelStateChanged {
            channel: ChannelKind::Application,
            state: ChannelState::Open,
        });
    }

    /// Full establishment: handshake, peer connection, application channel.
    pub fn establish(&self) {
        self.handshake();
        self.connect_peer();
        self.open_application();
    }

    /// Chunk an encoded message the way the web client would.
    pub fn peer_frames(&self, message: &[u8]) -> Vec<Bytes> {
        let mut state = self.state();
        let chunk_size = state.config.max_message_size;
        state.peer_chunker.chunk(message, chunk_size).unwrap_or_default()
    }

    /// Deliver raw frames on the application channel.
    pub fn deliver_frames(&self, frames: Vec<Bytes>) {
        for data in frames {
            self.emit(TransportEvent::ChannelMessage {
                channel: ChannelKind::Application,
                binary: true,
                data,
            });
        }
    }

    /// Send an encoded message from the web client.
    pub fn peer_send_raw(&self, message: &[u8]) {
        let frames = self.peer_frames(message);
        self.deliver_frames(frames);
    }

    /// Send an envelope from the web client.
    pub fn peer_send(&self, envelope: &Envelope) {
        if let Ok(message) = envelope.encode() {
            self.peer_send_raw(&message);
        }
    }

    /// Envelopes the session sent on the application channel of attempt
    /// `index`, reassembled and decoded.
    pub fn sent_envelopes(&self, index: usize) -> Vec<Envelope> {
        let frames: Vec<Bytes> = self
            .calls(index)
            .into_iter()
            .filter_map(|call| match call {
                TransportCall::Send { channel: ChannelKind::Application, frame } => Some(frame),
                _ => None,
            })
            .collect();

        let mut unchunker = Unchunker::new(MAX_MESSAGE_SIZE);
        let now = std::time::Instant::now();
        frames
            .into_iter()
            .filter_map(|frame| unchunker.add(frame, now).ok().flatten())
            .filter_map(|message| Envelope::decode(&message).ok())
            .collect()
    }

    /// Envelopes the session sent on the latest attempt.
    pub fn last_sent_envelopes(&self) -> Vec<Envelope> {
        self.attempts().checked_sub(1).map(|i| self.sent_envelopes(i)).unwrap_or_default()
    }

    fn record(&self, index: usize, call: TransportCall) {
        if let Some(attempt) = self.state().attempts.get_mut(index) {
            attempt.calls.push(call);
        }
    }
}

/// Creates [`SimPeer`]s on a [`SimNetwork`].
pub struct SimTransportFactory {
    network: SimNetwork,
}

impl TransportFactory for SimTransportFactory {
    fn create(
        &self,
        params: HandshakeParams,
        events: Arc<dyn TransportEvents>,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        let mut state = self.network.state();
        if state.config.fail_create {
            return Err(TransportError::Setup("simulated factory failure".into()));
        }
        state.attempts.push(Attempt { params, events, calls: Vec::new(), dropped: false });
        let index = state.attempts.len() - 1;
        drop(state);

        Ok(Box::new(SimPeer { network: self.network.clone(), index, peer_connection: false }))
    }
}

/// Transport of one simulated connection attempt.
pub struct SimPeer {
    network: SimNetwork,
    index: usize,
    peer_connection: bool,
}

impl SimPeer {
    fn record(&self, call: TransportCall) {
        self.network.record(self.index, call);
    }

    fn config(&self) -> SimTransportConfig {
        self.network.state().config.clone()
    }
}

impl PeerTransport for SimPeer {
    fn connect(&mut self) -> Result<(), TransportError> {
        self.record(TransportCall::Connect);
        if self.config().fail_connect {
            return Err(TransportError::Setup("simulated connect failure".into()));
        }
        Ok(())
    }

    fn negotiated_task(&self) -> Option<TaskVersion> {
        self.config().negotiated_task
    }

    fn create_peer_connection(&mut self) -> Result<(), TransportError> {
        self.record(TransportCall::CreatePeerConnection);
        self.peer_connection = true;
        Ok(())
    }

    fn signaling_link(&self) -> Result<SignalingLink, TransportError> {
        if !self.peer_connection {
            return Err(TransportError::NoPeerConnection);
        }
        Ok(SignalingLink { id: 0, label: "pairlink-signaling".into(), protocol: "v1".into() })
    }

    fn create_signaling_channel(&mut self, link: &SignalingLink) -> Result<(), TransportError> {
        self.record(TransportCall::CreateSignalingChannel(link.clone()));
        Ok(())
    }

    fn max_message_size(&self) -> usize {
        self.config().max_message_size
    }

    fn set_buffered_amount_low_threshold(&mut self, channel: ChannelKind, threshold: usize) {
        self.record(TransportCall::SetThreshold { channel, threshold });
    }

    fn handover(&mut self) -> Result<(), TransportError> {
        self.record(TransportCall::Handover);
        Ok(())
    }

    fn feed_signaling(&mut self, message: Bytes) -> Result<(), TransportError> {
        self.record(TransportCall::FeedSignaling(message));
        Ok(())
    }

    fn signaling_link_closing(&mut self) {
        self.record(TransportCall::SignalingLinkClosing);
    }

    fn signaling_link_closed(&mut self) {
        self.record(TransportCall::SignalingLinkClosed);
    }

    fn send(&mut self, channel: ChannelKind, frame: Bytes) -> Result<(), TransportError> {
        self.record(TransportCall::Send { channel, frame });
        Ok(())
    }

    fn close_channel(&mut self, channel: ChannelKind) {
        self.record(TransportCall::CloseChannel(channel));
    }

    fn dispose_channel(&mut self, channel: ChannelKind) {
        self.record(TransportCall::DisposeChannel(channel));
    }

    fn close_task(&mut self, code: CloseCode) {
        self.record(TransportCall::CloseTask(code));
    }

    fn disconnect(&mut self) {
        self.record(TransportCall::Disconnect);
    }

    fn dispose_peer_connection(&mut self) {
        self.record(TransportCall::DisposePeerConnection);
        self.peer_connection = false;
    }
}

impl Drop for SimPeer {
    fn drop(&mut self) {
        if let Some(attempt) = self.network.state().attempts.get_mut(self.index) {
            attempt.dropped = true;
        }
    }
}
