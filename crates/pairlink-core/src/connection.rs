//! Per-connection context.
//!
//! One [`SessionConnectionContext`] exists per connection attempt. It tracks
//! the handshake phase, the peer connection, and the two data channels, and
//! turns native transport events into [`ConnectionAction`]s.
//!
//! # Architecture: Action-Based State Machine
//!
//! - Methods accept the session state and time as parameters
//! - Methods return `Vec<ConnectionAction>`
//! - The session worker executes actions against the transport, and routes
//!   `Transition` actions into the session state machine
//!
//! The context never calls back into the session. Failures become
//! `Transition(SessionEvent::Error(..))` or `Transition(SessionEvent::Disconnect(..))`
//! actions.
//!
//! # Establishment
//!
//! ```text
//!  signaling: WsConnecting → ServerHandshake → PeerHandshake → Task
//!                                                               │
//!                          CreatePeerConnection + signaling channel
//!                                                               │
//!  signaling channel Open ──> Handover                          │
//!                                                               ▼
//!  peer announces application channel ──> Open ──> Transition(Connected)
//! ```
//!
//! # Closing
//!
//! [`SessionConnectionContext::close`] is idempotent. Once closed, every
//! method returns no actions, and the shared closed flag lets native callback
//! sinks drop events before they reach the worker.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use pairlink_proto::{
    Chunker, ConnectionDisconnect, DisconnectReason, Envelope, MAX_MESSAGE_SIZE, ProtocolError,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::{
    disconnect::DisconnectContext,
    flow_control::FlowControlledSender,
    reassembly::Unchunker,
    state::{ConnectionId, SessionEvent, SessionStateKind},
    transport::{
        ChannelKind, ChannelState, CloseCode, PeerConnectionState, SignalingState, TransportEvent,
    },
};

/// Actions returned by the connection context, executed in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionAction {
    /// Create the peer connection and the pre-negotiated signaling channel,
    /// then report back through
    /// [`SessionConnectionContext::signaling_channel_created`]
    CreatePeerConnection,
    /// Register the native buffered-amount-low threshold of a channel
    SetBufferedAmountLowThreshold {
        /// Channel
        channel: ChannelKind,
        /// Threshold in bytes
        threshold: usize,
    },
    /// Hand signaling over to the signaling channel
    Handover,
    /// Pass a reassembled signaling message to the handshake library
    FeedSignaling(Bytes),
    /// Signaling channel is closing
    SignalingLinkClosing,
    /// Signaling channel is closed
    SignalingLinkClosed,
    /// Write a frame to a channel
    Send {
        /// Channel
        channel: ChannelKind,
        /// Encoded chunk
        frame: Bytes,
    },
    /// Close a channel
    CloseChannel(ChannelKind),
    /// Release a closed channel
    DisposeChannel(ChannelKind),
    /// Close the handshake task with a code
    CloseTask(CloseCode),
    /// Disconnect signaling
    DisconnectSignaling,
    /// Dispose the peer connection
    DisposePeerConnection,
    /// Hand a decoded envelope to the dispatchers
    Deliver(Envelope),
    /// Feed an event into the session state machine
    Transition(SessionEvent),
}

/// How an outgoing message is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendMode {
    /// Through the flow-controlled queue
    Async,
    /// Straight to the channel, bypassing the queue; failures are ignored
    BestEffortSync,
}

/// Connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Buffered amount at which queued frames are released again
    pub low_water_mark: usize,
    /// Buffered amount at which frames start queueing locally
    pub high_water_mark: usize,
    /// Ceiling for one encoded or reassembled message
    pub max_message_bytes: usize,
    /// Incomplete inbound messages older than this are dropped
    pub incomplete_message_max_age: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            low_water_mark: 256 * 1024,
            high_water_mark: 1024 * 1024,
            max_message_bytes: MAX_MESSAGE_SIZE,
            incomplete_message_max_age: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct ChannelContext {
    state: ChannelState,
    chunk_size: usize,
    chunker: Chunker,
    unchunker: Unchunker,
    sender: FlowControlledSender,
}

impl ChannelContext {
    fn new(config: &ConnectionConfig, chunk_size: usize, state: ChannelState) -> Self {
        Self {
            state,
            chunk_size,
            chunker: Chunker::new(),
            unchunker: Unchunker::new(config.max_message_bytes),
            sender: FlowControlledSender::new(config.low_water_mark, config.high_water_mark),
        }
    }
}

/// Per-connection state machine.
#[derive(Debug)]
pub struct SessionConnectionContext {
    connection_id: ConnectionId,
    config: ConnectionConfig,
    closed: Arc<AtomicBool>,
    signaling_state: SignalingState,
    peer_connection: Option<PeerConnectionState>,
    max_message_size: usize,
    signaling: Option<ChannelContext>,
    application: Option<ChannelContext>,
    application_announced: bool,
    early_application: Vec<TransportEvent>,
}

impl SessionConnectionContext {
    /// Create a context for a new connection attempt.
    pub fn new(connection_id: ConnectionId, config: ConnectionConfig) -> Self {
        Self {
            connection_id,
            config,
            closed: Arc::new(AtomicBool::new(false)),
            signaling_state: SignalingState::New,
            peer_connection: None,
            max_message_size: 0,
            signaling: None,
            application: None,
            application_announced: false,
            early_application: Vec::new(),
        }
    }

    /// Connection id this context belongs to.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Whether [`Self::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flag shared with native callback sinks.
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }

    /// Last reported handshake phase.
    pub fn signaling_state(&self) -> SignalingState {
        self.signaling_state
    }

    /// Last reported peer connection state, if one was created.
    pub fn peer_connection_state(&self) -> Option<PeerConnectionState> {
        self.peer_connection
    }

    /// Whether the application channel exists and is open.
    pub fn is_application_open(&self) -> bool {
        self.application.as_ref().is_some_and(|c| c.state == ChannelState::Open)
    }

    /// Bytes waiting in the application channel's local queue.
    pub fn queued_application_bytes(&self) -> usize {
        self.application.as_ref().map_or(0, |c| c.sender.queued_bytes())
    }

    /// Handle one native event.
    ///
    /// # Arguments
    /// * `event` - Event reported by the transport
    /// * `session` - Current session state
    /// * `now` - Current time
    pub fn handle_event(
        &mut self,
        event: TransportEvent,
        session: SessionStateKind,
        now: Instant,
    ) -> Vec<ConnectionAction> {
        if self.is_closed() {
            trace!(connection_id = self.connection_id, ?event, "context closed, dropping event");
            return Vec::new();
        }
        if !self.application_announced
            && event.channel() == Some(ChannelKind::Application)
            && !matches!(event, TransportEvent::ChannelAnnounced { .. })
        {
            trace!(connection_id = self.connection_id, ?event, "application channel not announced, buffering");
            self.early_application.push(event);
            return Vec::new();
        }

        match event {
            TransportEvent::SignalingStateChanged(state) => self.on_signaling_state(state, session),
            TransportEvent::PeerConnectionStateChanged(state) => self.on_peer_connection_state(state),
            TransportEvent::ChannelAnnounced { label, state } => {
                self.on_channel_announced(&label, state, session, now)
            },
            TransportEvent::ChannelStateChanged { channel, state } => match channel {
                ChannelKind::Signaling => self.on_signaling_channel_state(state),
                ChannelKind::Application => self.on_application_channel_state(state),
            },
            TransportEvent::BufferedAmountChanged { channel, amount } => {
                self.on_buffered_amount(channel, amount)
            },
            TransportEvent::ChannelMessage { channel, binary, data } => match channel {
                ChannelKind::Signaling => self.on_signaling_message(binary, data, session, now),
                ChannelKind::Application => self.on_application_message(binary, data, session, now),
            },
            TransportEvent::SignalingOutbound(message) => self.send_signaling(&message),
            TransportEvent::SignalingCloseRequested => {
                debug!(connection_id = self.connection_id, "handshake library closed signaling channel");
                vec![ConnectionAction::CloseChannel(ChannelKind::Signaling)]
            },
        }
    }

    /// Peer connection and signaling channel were created.
    ///
    /// # Arguments
    /// * `max_message_size` - Peer connection's maximum message size, used as
    ///   chunk size for both channels
    pub fn signaling_channel_created(&mut self, max_message_size: usize) -> Vec<ConnectionAction> {
        if self.is_closed() {
            return Vec::new();
        }

        self.max_message_size = max_message_size;
        let context = ChannelContext::new(&self.config, max_message_size, ChannelState::Connecting);
        let threshold = context.sender.low_water_mark();
        self.signaling = Some(context);

        vec![ConnectionAction::SetBufferedAmountLowThreshold {
            channel: ChannelKind::Signaling,
            threshold,
        }]
    }

    /// Encode and send an envelope on the application channel.
    ///
    /// Encoding failures drop the message. An encoding above the message
    /// ceiling counts as resource exhaustion.
    pub fn send_envelope(
        &mut self,
        envelope: &Envelope,
        mode: SendMode,
        session: SessionStateKind,
    ) -> Vec<ConnectionAction> {
        match envelope.encode() {
            Ok(bytes) => self.send_message(&bytes, mode, session),
            Err(e) => {
                warn!(connection_id = self.connection_id, sub_type = %envelope.sub_type, error = %e, "dropping unencodable message");
                Vec::new()
            },
        }
    }

    /// Chunk and send an already encoded message on the application channel.
    pub fn send_message(
        &mut self,
        message: &[u8],
        mode: SendMode,
        session: SessionStateKind,
    ) -> Vec<ConnectionAction> {
        if self.is_closed() {
            return Vec::new();
        }
        if message.len() > self.config.max_message_bytes {
            let e = ProtocolError::MessageTooLarge {
                size: message.len(),
                max: self.config.max_message_bytes,
            };
            return self.resource_exhausted(&format!("encoding outgoing message ({e})"), session);
        }

        let connection_id = self.connection_id;
        let Some(channel) = self.application.as_mut().filter(|c| c.state == ChannelState::Open)
        else {
            warn!(connection_id, "application channel not open, dropping outgoing message");
            return Vec::new();
        };

        let frames = match channel.chunker.chunk(message, channel.chunk_size) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(connection_id, error = %e, "could not chunk outgoing message");
                return Vec::new();
            },
        };

        let ready = match mode {
            SendMode::Async => frames.into_iter().flat_map(|f| channel.sender.write(f)).collect(),
            SendMode::BestEffortSync => frames,
        };
        sends(ChannelKind::Application, ready)
    }

    /// Best-effort `connectionDisconnect` to the peer.
    ///
    /// Written straight to the application channel, bypassing the queue. Does
    /// nothing unless the channel is open.
    pub fn disconnect_notice(&mut self, reason: DisconnectReason) -> Vec<ConnectionAction> {
        if self.is_closed() {
            return Vec::new();
        }
        debug!(connection_id = self.connection_id, %reason, "sending disconnect notice");
        self.send_notice(&ConnectionDisconnect { reason }.to_envelope())
    }

    /// Close the context. Idempotent.
    ///
    /// Returns the teardown actions on the first call only.
    pub fn close(&mut self) -> Vec<ConnectionAction> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }

        let mut actions = Vec::with_capacity(4);
        if self.application.take().is_some() {
            actions.push(ConnectionAction::CloseChannel(ChannelKind::Application));
        }
        if self.signaling.take().is_some() {
            actions.push(ConnectionAction::CloseChannel(ChannelKind::Signaling));
        }
        actions.push(ConnectionAction::DisconnectSignaling);
        if self.peer_connection.is_some() {
            actions.push(ConnectionAction::DisposePeerConnection);
        }

        debug!(connection_id = self.connection_id, "connection context closed");
        actions
    }

    fn on_signaling_state(
        &mut self,
        state: SignalingState,
        session: SessionStateKind,
    ) -> Vec<ConnectionAction> {
        let previous = self.signaling_state;
        self.signaling_state = state;
        debug!(connection_id = self.connection_id, ?previous, ?state, "signaling state changed");

        match state {
            SignalingState::New => Vec::new(),
            SignalingState::WsConnecting
            | SignalingState::ServerHandshake
            | SignalingState::PeerHandshake => {
                if session == SessionStateKind::Connecting {
                    Vec::new()
                } else {
                    error(format!("Signaling state changed to {state:?} in session state {session}"))
                }
            },
            SignalingState::Task => {
                if session != SessionStateKind::Connecting {
                    return error(format!(
                        "Signaling state changed to {state:?} in session state {session}"
                    ));
                }
                if self.peer_connection.is_some() {
                    return error("Peer connection already created".to_owned());
                }
                self.peer_connection = Some(PeerConnectionState::New);
                vec![ConnectionAction::CreatePeerConnection]
            },
            SignalingState::Closing => vec![
                ConnectionAction::DisconnectSignaling,
                ConnectionAction::Transition(SessionEvent::Disconnect(DisconnectContext::unknown())),
            ],
            SignalingState::Closed => {
                vec![ConnectionAction::Transition(SessionEvent::Disconnect(
                    DisconnectContext::unknown(),
                ))]
            },
            SignalingState::Error => error("Signaling state changed to ERROR".to_owned()),
        }
    }

    fn on_peer_connection_state(&mut self, state: PeerConnectionState) -> Vec<ConnectionAction> {
        let previous = self.peer_connection.replace(state);
        info!(
            connection_id = self.connection_id,
            ?previous,
            ?state,
            signaling = ?self.signaling_state,
            "peer connection state changed"
        );

        match state {
            PeerConnectionState::Failed | PeerConnectionState::Closed => {
                vec![ConnectionAction::Transition(SessionEvent::Disconnect(
                    DisconnectContext::unknown(),
                ))]
            },
            PeerConnectionState::New
            | PeerConnectionState::Connecting
            | PeerConnectionState::Connected => Vec::new(),
        }
    }

    fn on_channel_announced(
        &mut self,
        label: &str,
        state: ChannelState,
        session: SessionStateKind,
        now: Instant,
    ) -> Vec<ConnectionAction> {
        if !matches!(state, ChannelState::Connecting | ChannelState::Open) {
            warn!(connection_id = self.connection_id, label, ?state, "ignoring announced channel");
            return Vec::new();
        }
        if self.peer_connection.is_none() {
            return error("Data channel announced without a peer connection".to_owned());
        }
        if self.application.is_some() {
            return error("A data channel is already registered".to_owned());
        }

        debug!(connection_id = self.connection_id, label, ?state, "application channel announced");
        let context = ChannelContext::new(&self.config, self.max_message_size, state);
        let threshold = context.sender.low_water_mark();
        self.application = Some(context);
        self.application_announced = true;

        let mut actions = vec![ConnectionAction::SetBufferedAmountLowThreshold {
            channel: ChannelKind::Application,
            threshold,
        }];
        if state == ChannelState::Open {
            trace!(connection_id = self.connection_id, %session, "application channel already open");
            actions.push(ConnectionAction::Transition(SessionEvent::Connected));
        }

        let early = std::mem::take(&mut self.early_application);
        if !early.is_empty() {
            debug!(
                connection_id = self.connection_id,
                count = early.len(),
                "replaying early application channel events"
            );
        }
        for event in early {
            actions.extend(self.handle_event(event, session, now));
        }
        actions
    }

    fn on_signaling_channel_state(&mut self, state: ChannelState) -> Vec<ConnectionAction> {
        let Some(channel) = self.signaling.as_mut() else {
            debug!(connection_id = self.connection_id, ?state, "no signaling channel");
            return Vec::new();
        };
        channel.state = state;

        match state {
            ChannelState::Connecting => Vec::new(),
            ChannelState::Open => vec![ConnectionAction::Handover],
            ChannelState::Closing => vec![ConnectionAction::SignalingLinkClosing],
            ChannelState::Closed => {
                self.signaling = None;
                vec![
                    ConnectionAction::SignalingLinkClosed,
                    ConnectionAction::DisposeChannel(ChannelKind::Signaling),
                ]
            },
        }
    }

    fn on_application_channel_state(&mut self, state: ChannelState) -> Vec<ConnectionAction> {
        let Some(channel) = self.application.as_mut() else {
            debug!(connection_id = self.connection_id, ?state, "no application channel");
            return Vec::new();
        };
        let previous = std::mem::replace(&mut channel.state, state);

        match state {
            ChannelState::Connecting => Vec::new(),
            ChannelState::Open if previous == ChannelState::Open => {
                trace!(connection_id = self.connection_id, "application channel already open");
                Vec::new()
            },
            ChannelState::Open => vec![ConnectionAction::Transition(SessionEvent::Connected)],
            ChannelState::Closing => vec![
                ConnectionAction::DisconnectSignaling,
                ConnectionAction::Transition(SessionEvent::Disconnect(DisconnectContext::unknown())),
            ],
            ChannelState::Closed => {
                self.application = None;
                vec![ConnectionAction::DisposeChannel(ChannelKind::Application)]
            },
        }
    }

    fn on_buffered_amount(&mut self, kind: ChannelKind, amount: usize) -> Vec<ConnectionAction> {
        let channel = match kind {
            ChannelKind::Signaling => self.signaling.as_mut(),
            ChannelKind::Application => self.application.as_mut(),
        };
        let Some(channel) = channel else {
            return Vec::new();
        };
        sends(kind, channel.sender.buffered_amount_changed(amount))
    }

    fn on_signaling_message(
        &mut self,
        binary: bool,
        data: Bytes,
        session: SessionStateKind,
        now: Instant,
    ) -> Vec<ConnectionAction> {
        if !binary {
            warn!(connection_id = self.connection_id, "non-binary message on signaling channel");
            return vec![ConnectionAction::CloseTask(CloseCode::ProtocolError)];
        }

        let max_age = self.config.incomplete_message_max_age;
        let Some(channel) = self.signaling.as_mut() else {
            return Vec::new();
        };
        channel.unchunker.gc(now, max_age);

        match channel.unchunker.add(data, now) {
            Ok(Some(message)) => vec![ConnectionAction::FeedSignaling(Bytes::from(message))],
            Ok(None) => Vec::new(),
            Err(e) if e.is_resource_exhaustion() => {
                self.resource_exhausted(&format!("reassembling signaling message ({e})"), session)
            },
            Err(e) => {
                warn!(connection_id = self.connection_id, error = %e, "invalid signaling chunk");
                vec![ConnectionAction::CloseTask(CloseCode::ProtocolError)]
            },
        }
    }

    fn on_application_message(
        &mut self,
        binary: bool,
        data: Bytes,
        session: SessionStateKind,
        now: Instant,
    ) -> Vec<ConnectionAction> {
        if !binary {
            return vec![
                ConnectionAction::Transition(SessionEvent::Error(
                    "Received non-binary message on application channel".to_owned(),
                )),
                ConnectionAction::CloseChannel(ChannelKind::Application),
            ];
        }

        let connection_id = self.connection_id;
        let max_age = self.config.incomplete_message_max_age;
        let Some(channel) = self.application.as_mut() else {
            return Vec::new();
        };
        let dropped = channel.unchunker.gc(now, max_age);
        if dropped > 0 {
            debug!(connection_id, dropped, "dropped stale incomplete messages");
        }

        let message = match channel.unchunker.add(data, now) {
            Ok(Some(message)) => message,
            Ok(None) => return Vec::new(),
            Err(e) if e.is_resource_exhaustion() => {
                return self.resource_exhausted(&format!("reassembling message ({e})"), session);
            },
            Err(e) => return error(format!("Invalid chunk on application channel: {e}")),
        };

        match Envelope::decode(&message) {
            Ok(envelope) => {
                trace!(connection_id, message_type = %envelope.message_type, sub_type = %envelope.sub_type, "message received");
                vec![ConnectionAction::Deliver(envelope)]
            },
            Err(e) if e.is_structural() => error(format!("Protocol error: {e}")),
            Err(e) => {
                warn!(connection_id, error = %e, "ignoring message");
                Vec::new()
            },
        }
    }

    fn send_signaling(&mut self, message: &[u8]) -> Vec<ConnectionAction> {
        let connection_id = self.connection_id;
        let Some(channel) = self.signaling.as_mut() else {
            warn!(connection_id, "no signaling channel, dropping signaling message");
            return Vec::new();
        };

        match channel.chunker.chunk(message, channel.chunk_size) {
            Ok(frames) => {
                let ready = frames.into_iter().flat_map(|f| channel.sender.write(f)).collect();
                sends(ChannelKind::Signaling, ready)
            },
            Err(e) => {
                warn!(connection_id, error = %e, "could not chunk signaling message");
                Vec::new()
            },
        }
    }

    fn resource_exhausted(&mut self, what: &str, session: SessionStateKind) -> Vec<ConnectionAction> {
        warn!(connection_id = self.connection_id, what, "resource exhaustion");

        let mut actions = if session == SessionStateKind::Connected {
            self.disconnect_notice(DisconnectReason::OutOfMemory)
        } else {
            Vec::new()
        };
        actions.push(ConnectionAction::Transition(SessionEvent::Error(format!(
            "Out of memory while {what}"
        ))));
        actions
    }

    fn send_notice(&mut self, envelope: &Envelope) -> Vec<ConnectionAction> {
        let Ok(bytes) = envelope.encode() else {
            return Vec::new();
        };
        let Some(channel) = self.application.as_mut().filter(|c| c.state == ChannelState::Open)
        else {
            return Vec::new();
        };
        channel
            .chunker
            .chunk(&bytes, channel.chunk_size)
            .map(|frames| sends(ChannelKind::Application, frames))
            .unwrap_or_default()
    }
}

fn sends(channel: ChannelKind, frames: Vec<Bytes>) -> Vec<ConnectionAction> {
    frames.into_iter().map(|frame| ConnectionAction::Send { channel, frame }).collect()
}

fn error(reason: String) -> Vec<ConnectionAction> {
    vec![ConnectionAction::Transition(SessionEvent::Error(reason))]
}

#[cfg(test)]
mod tests {
    use pairlink_proto::{Chunk, MessageType};

    use super::*;

    const CHUNK: usize = 64;

    fn now() -> Instant {
        Instant::now()
    }

    fn handle(
        context: &mut SessionConnectionContext,
        event: TransportEvent,
        session: SessionStateKind,
    ) -> Vec<ConnectionAction> {
        context.handle_event(event, session, now())
    }

    fn task_running() -> SessionConnectionContext {
        let mut context = SessionConnectionContext::new(1, ConnectionConfig::default());
        let actions = handle(
            &mut context,
            TransportEvent::SignalingStateChanged(SignalingState::Task),
            SessionStateKind::Connecting,
        );
        assert_eq!(actions, vec![ConnectionAction::CreatePeerConnection]);
        context.signaling_channel_created(CHUNK);
        context
    }

    fn connected() -> SessionConnectionContext {
        let mut context = task_running();
        let actions = handle(
            &mut context,
            TransportEvent::ChannelAnnounced { label: "app".into(), state: ChannelState::Open },
            SessionStateKind::Connecting,
        );
        assert!(actions.contains(&ConnectionAction::Transition(SessionEvent::Connected)));
        context
    }

    fn inbound(message: &[u8]) -> Vec<TransportEvent> {
        Chunker::new()
            .chunk(message, CHUNK)
            .expect("chunking")
            .into_iter()
            .map(|data| TransportEvent::ChannelMessage {
                channel: ChannelKind::Application,
                binary: true,
                data,
            })
            .collect()
    }

    fn is_error(actions: &[ConnectionAction]) -> bool {
        actions
            .iter()
            .any(|a| matches!(a, ConnectionAction::Transition(SessionEvent::Error(_))))
    }

    fn sent_frames(actions: &[ConnectionAction]) -> Vec<Bytes> {
        actions
            .iter()
            .filter_map(|a| match a {
                ConnectionAction::Send { channel: ChannelKind::Application, frame } => {
                    Some(frame.clone())
                },
                _ => None,
            })
            .collect()
    }

    fn reassemble(frames: Vec<Bytes>) -> Envelope {
        let mut unchunker = Unchunker::new(MAX_MESSAGE_SIZE);
        let mut message = None;
        for frame in frames {
            message = unchunker.add(frame, now()).expect("valid chunk");
        }
        Envelope::decode(&message.expect("complete message")).expect("valid envelope")
    }

    #[test]
    fn handshake_phases_pass_while_connecting() {
        let mut context = SessionConnectionContext::new(1, ConnectionConfig::default());
        for state in [
            SignalingState::New,
            SignalingState::WsConnecting,
            SignalingState::ServerHandshake,
            SignalingState::PeerHandshake,
        ] {
            let actions = handle(
                &mut context,
                TransportEvent::SignalingStateChanged(state),
                SessionStateKind::Connecting,
            );
            assert!(actions.is_empty(), "{state:?}");
        }
    }

    #[test]
    fn handshake_phase_outside_connecting_is_error() {
        let mut context = SessionConnectionContext::new(1, ConnectionConfig::default());
        let actions = handle(
            &mut context,
            TransportEvent::SignalingStateChanged(SignalingState::PeerHandshake),
            SessionStateKind::Connected,
        );
        assert_eq!(actions, vec![ConnectionAction::Transition(SessionEvent::Error(
            "Signaling state changed to PeerHandshake in session state connected".into()
        ))]);
    }

    #[test]
    fn second_task_event_is_error() {
        let mut context = task_running();
        let actions = handle(
            &mut context,
            TransportEvent::SignalingStateChanged(SignalingState::Task),
            SessionStateKind::Connecting,
        );
        assert!(is_error(&actions));
    }

    #[test]
    fn signaling_error_state() {
        let mut context = task_running();
        let actions = handle(
            &mut context,
            TransportEvent::SignalingStateChanged(SignalingState::Error),
            SessionStateKind::Connecting,
        );
        assert_eq!(actions, vec![ConnectionAction::Transition(SessionEvent::Error(
            "Signaling state changed to ERROR".into()
        ))]);
    }

    #[test]
    fn signaling_closing_disconnects_unknown() {
        let mut context = task_running();
        let actions = handle(
            &mut context,
            TransportEvent::SignalingStateChanged(SignalingState::Closing),
            SessionStateKind::Connected,
        );
        assert_eq!(actions, vec![
            ConnectionAction::DisconnectSignaling,
            ConnectionAction::Transition(SessionEvent::Disconnect(DisconnectContext::unknown())),
        ]);
    }

    #[test]
    fn signaling_channel_open_requests_handover() {
        let mut context = task_running();
        let actions = handle(
            &mut context,
            TransportEvent::ChannelStateChanged {
                channel: ChannelKind::Signaling,
                state: ChannelState::Open,
            },
            SessionStateKind::Connecting,
        );
        assert_eq!(actions, vec![ConnectionAction::Handover]);
    }

    #[test]
    fn signaling_channel_closed_is_disposed() {
        let mut context = task_running();
        let actions = handle(
            &mut context,
            TransportEvent::ChannelStateChanged {
                channel: ChannelKind::Signaling,
                state: ChannelState::Closed,
            },
            SessionStateKind::Connected,
        );
        assert_eq!(actions, vec![
            ConnectionAction::SignalingLinkClosed,
            ConnectionAction::DisposeChannel(ChannelKind::Signaling),
        ]);
    }

    #[test]
    fn non_binary_signaling_message_closes_task() {
        let mut context = task_running();
        let actions = handle(
            &mut context,
            TransportEvent::ChannelMessage {
                channel: ChannelKind::Signaling,
                binary: false,
                data: Bytes::from_static(b"{}"),
            },
            SessionStateKind::Connecting,
        );
        assert_eq!(actions, vec![ConnectionAction::CloseTask(CloseCode::ProtocolError)]);
    }

    #[test]
    fn signaling_messages_reach_handshake_library() {
        let mut context = task_running();
        let frames = Chunker::new().chunk(&[7u8; 100], CHUNK).expect("chunking");

        let mut actions = Vec::new();
        for data in frames {
            actions = handle(
                &mut context,
                TransportEvent::ChannelMessage { channel: ChannelKind::Signaling, binary: true, data },
                SessionStateKind::Connecting,
            );
        }
        assert_eq!(actions, vec![ConnectionAction::FeedSignaling(Bytes::from(vec![7u8; 100]))]);
    }

    #[test]
    fn outbound_signaling_is_chunked() {
        let mut context = task_running();
        let actions = handle(
            &mut context,
            TransportEvent::SignalingOutbound(Bytes::from(vec![1u8; 100])),
            SessionStateKind::Connecting,
        );
        assert_eq!(actions.len(), 100usize.div_ceil(CHUNK - pairlink_proto::CHUNK_HEADER_SIZE));
        assert!(actions.iter().all(|a| matches!(
            a,
            ConnectionAction::Send { channel: ChannelKind::Signaling, .. }
        )));
    }

    #[test]
    fn announced_channel_without_peer_connection_is_error() {
        let mut context = SessionConnectionContext::new(1, ConnectionConfig::default());
        let actions = handle(
            &mut context,
            TransportEvent::ChannelAnnounced { label: "app".into(), state: ChannelState::Open },
            SessionStateKind::Connecting,
        );
        assert!(is_error(&actions));
    }

    #[test]
    fn second_application_channel_is_error() {
        let mut context = connected();
        let actions = handle(
            &mut context,
            TransportEvent::ChannelAnnounced { label: "other".into(), state: ChannelState::Open },
            SessionStateKind::Connected,
        );
        assert_eq!(actions, vec![ConnectionAction::Transition(SessionEvent::Error(
            "A data channel is already registered".into()
        ))]);
    }

    #[test]
    fn closing_announced_channel_is_ignored() {
        let mut context = task_running();
        let actions = handle(
            &mut context,
            TransportEvent::ChannelAnnounced { label: "app".into(), state: ChannelState::Closing },
            SessionStateKind::Connecting,
        );
        assert!(actions.is_empty());
        assert!(!context.is_application_open());
    }

    #[test]
    fn application_channel_opening_later_connects() {
        let mut context = task_running();
        let actions = handle(
            &mut context,
            TransportEvent::ChannelAnnounced { label: "app".into(), state: ChannelState::Connecting },
            SessionStateKind::Connecting,
        );
        assert!(!actions.contains(&ConnectionAction::Transition(SessionEvent::Connected)));

        let actions = handle(
            &mut context,
            TransportEvent::ChannelStateChanged {
                channel: ChannelKind::Application,
                state: ChannelState::Open,
            },
            SessionStateKind::Connecting,
        );
        assert_eq!(actions, vec![ConnectionAction::Transition(SessionEvent::Connected)]);
    }

    #[test]
    fn application_open_before_announce_is_replayed() {
        let mut context = task_running();
        handle(
            &mut context,
            TransportEvent::PeerConnectionStateChanged(PeerConnectionState::Connected),
            SessionStateKind::Connecting,
        );
        let actions = handle(
            &mut context,
            TransportEvent::ChannelStateChanged {
                channel: ChannelKind::Application,
                state: ChannelState::Open,
            },
            SessionStateKind::Connecting,
        );
        assert!(actions.is_empty());

        let actions = handle(
            &mut context,
            TransportEvent::ChannelAnnounced { label: "app".into(), state: ChannelState::Connecting },
            SessionStateKind::Connecting,
        );
        let connected = actions
            .iter()
            .filter(|a| **a == ConnectionAction::Transition(SessionEvent::Connected))
            .count();
        assert_eq!(connected, 1);
        assert!(context.is_application_open());
    }

    #[test]
    fn repeated_open_connects_once() {
        let mut context = connected();
        let actions = handle(
            &mut context,
            TransportEvent::ChannelStateChanged {
                channel: ChannelKind::Application,
                state: ChannelState::Open,
            },
            SessionStateKind::Connected,
        );
        assert!(actions.is_empty());
        assert!(context.is_application_open());
    }

    #[test]
    fn application_channel_closing_disconnects() {
        let mut context = connected();
        let actions = handle(
            &mut context,
            TransportEvent::ChannelStateChanged {
                channel: ChannelKind::Application,
                state: ChannelState::Closing,
            },
            SessionStateKind::Connected,
        );
        assert_eq!(actions, vec![
            ConnectionAction::DisconnectSignaling,
            ConnectionAction::Transition(SessionEvent::Disconnect(DisconnectContext::unknown())),
        ]);
    }

    #[test]
    fn peer_connection_failure_disconnects() {
        let mut context = connected();
        let actions = handle(
            &mut context,
            TransportEvent::PeerConnectionStateChanged(PeerConnectionState::Failed),
            SessionStateKind::Connected,
        );
        assert_eq!(actions, vec![ConnectionAction::Transition(SessionEvent::Disconnect(
            DisconnectContext::unknown()
        ))]);
        assert_eq!(context.peer_connection_state(), Some(PeerConnectionState::Failed));
    }

    #[test]
    fn inbound_envelope_is_delivered() {
        let mut context = connected();
        let envelope = Envelope::new(MessageType::Request, "clientInfo").with_arg("browser", "x");
        let bytes = envelope.encode().expect("encodes");

        let mut actions = Vec::new();
        for event in inbound(&bytes) {
            actions = handle(&mut context, event, SessionStateKind::Connected);
        }
        assert_eq!(actions, vec![ConnectionAction::Deliver(envelope)]);
    }

    #[test]
    fn non_map_message_is_protocol_error() {
        let mut context = connected();
        let mut bytes = Vec::new();
        ciborium::into_writer(&ciborium::Value::from("hi"), &mut bytes).expect("encodes");

        let actions: Vec<_> = inbound(&bytes)
            .into_iter()
            .flat_map(|event| handle(&mut context, event, SessionStateKind::Connected))
            .collect();
        assert!(is_error(&actions));
    }

    #[test]
    fn unknown_message_type_is_dropped() {
        let mut context = connected();
        let mut bytes = Vec::new();
        let value = ciborium::Value::Map(vec![
            ("type".into(), "subscribe".into()),
            ("subType".into(), "x".into()),
        ]);
        ciborium::into_writer(&value, &mut bytes).expect("encodes");

        let actions: Vec<_> = inbound(&bytes)
            .into_iter()
            .flat_map(|event| handle(&mut context, event, SessionStateKind::Connected))
            .collect();
        assert!(actions.is_empty());
    }

    #[test]
    fn non_binary_application_message_is_error() {
        let mut context = connected();
        let actions = handle(
            &mut context,
            TransportEvent::ChannelMessage {
                channel: ChannelKind::Application,
                binary: false,
                data: Bytes::from_static(b"text"),
            },
            SessionStateKind::Connected,
        );
        assert!(is_error(&actions));
        assert!(actions.contains(&ConnectionAction::CloseChannel(ChannelKind::Application)));
    }

    #[test]
    fn reassembly_ceiling_sends_notice_then_errors() {
        let config = ConnectionConfig { max_message_bytes: 100, ..ConnectionConfig::default() };
        let mut context = SessionConnectionContext::new(1, config);
        handle(
            &mut context,
            TransportEvent::SignalingStateChanged(SignalingState::Task),
            SessionStateKind::Connecting,
        );
        context.signaling_channel_created(CHUNK);
        handle(
            &mut context,
            TransportEvent::ChannelAnnounced { label: "app".into(), state: ChannelState::Open },
            SessionStateKind::Connecting,
        );

        let actions: Vec<_> = inbound(&[0u8; 500])
            .into_iter()
            .flat_map(|event| handle(&mut context, event, SessionStateKind::Connected))
            .collect();

        let error_at = actions
            .iter()
            .position(|a| matches!(a, ConnectionAction::Transition(SessionEvent::Error(_))))
            .expect("error transition");
        let notice = reassemble(sent_frames(&actions[..error_at]));
        assert_eq!(
            ConnectionDisconnect::from_envelope(&notice).map(|n| n.reason),
            Ok(DisconnectReason::OutOfMemory)
        );
    }

    #[test]
    fn exhaustion_while_connecting_skips_notice() {
        let config = ConnectionConfig { max_message_bytes: 10, ..ConnectionConfig::default() };
        let mut context = SessionConnectionContext::new(1, config);
        let actions = context.send_message(&[0u8; 11], SendMode::Async, SessionStateKind::Connecting);

        assert_eq!(actions.len(), 1);
        assert!(is_error(&actions));
    }

    #[test]
    fn async_sends_respect_flow_control() {
        let config = ConnectionConfig {
            low_water_mark: 0,
            high_water_mark: CHUNK,
            ..ConnectionConfig::default()
        };
        let mut context = SessionConnectionContext::new(1, config);
        handle(
            &mut context,
            TransportEvent::SignalingStateChanged(SignalingState::Task),
            SessionStateKind::Connecting,
        );
        context.signaling_channel_created(CHUNK);
        handle(
            &mut context,
            TransportEvent::ChannelAnnounced { label: "app".into(), state: ChannelState::Open },
            SessionStateKind::Connecting,
        );

        let actions = context.send_message(&[1u8; 200], SendMode::Async, SessionStateKind::Connected);
        assert_eq!(sent_frames(&actions).len(), 1);
        assert!(context.queued_application_bytes() > 0);

        let drained = handle(
            &mut context,
            TransportEvent::BufferedAmountChanged { channel: ChannelKind::Application, amount: 0 },
            SessionStateKind::Connected,
        );
        assert_eq!(sent_frames(&drained).len(), 1);
    }

    #[test]
    fn best_effort_bypasses_queue() {
        let config = ConnectionConfig {
            low_water_mark: 0,
            high_water_mark: 1,
            ..ConnectionConfig::default()
        };
        let mut context = SessionConnectionContext::new(1, config);
        handle(
            &mut context,
            TransportEvent::SignalingStateChanged(SignalingState::Task),
            SessionStateKind::Connecting,
        );
        context.signaling_channel_created(CHUNK);
        handle(
            &mut context,
            TransportEvent::ChannelAnnounced { label: "app".into(), state: ChannelState::Open },
            SessionStateKind::Connecting,
        );

        let frames = sent_frames(&context.send_message(
            &[1u8; 200],
            SendMode::BestEffortSync,
            SessionStateKind::Connected,
        ));
        let serials: Vec<u32> = frames
            .into_iter()
            .map(|f| Chunk::parse(f).expect("valid chunk").header.serial)
            .collect();
        assert_eq!(serials, vec![0, 1, 2, 3]);
    }

    #[test]
    fn sending_without_open_channel_is_dropped() {
        let mut context = task_running();
        let actions = context.send_message(b"x", SendMode::Async, SessionStateKind::Connecting);
        assert!(actions.is_empty());
    }

    #[test]
    fn close_is_idempotent_and_silences_context() {
        let mut context = connected();
        let flag = context.closed_flag();

        let actions = context.close();
        assert_eq!(actions, vec![
            ConnectionAction::CloseChannel(ChannelKind::Application),
            ConnectionAction::CloseChannel(ChannelKind::Signaling),
            ConnectionAction::DisconnectSignaling,
            ConnectionAction::DisposePeerConnection,
        ]);
        assert!(flag.load(Ordering::Acquire));
        assert!(context.close().is_empty());

        let after = handle(
            &mut context,
            TransportEvent::PeerConnectionStateChanged(PeerConnectionState::Failed),
            SessionStateKind::Connected,
        );
        assert!(after.is_empty());
        assert!(context.disconnect_notice(DisconnectReason::SessionStopped).is_empty());
        assert!(context.send_message(b"x", SendMode::Async, SessionStateKind::Connected).is_empty());
    }
}
