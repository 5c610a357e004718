//! Session state manager.
//!
//! Owns the session state and at most one live connection: the
//! [`SessionConnectionContext`] and its [`PeerTransport`], created together on
//! Connecting and dropped together on teardown. Every event runs through
//! [`transition`]; the resulting actions are executed here in order. Events
//! produced while executing them are queued and handled after the current
//! transition has finished.
//!
//! When the session comes to rest, the owner is told it stopped unless a
//! wake-up is pending. That happens before public listeners hear about the
//! new state.

use std::{collections::VecDeque, sync::Arc};

use pairlink_core::{
    ConnectionAction, ConnectionId, DisconnectContext, Envelope, SessionConnectionContext,
    SessionEvent, SessionState, SessionStateKind,
    connection::SendMode,
    env::Environment,
    error::TransportError,
    state::{Disposition, StateAction, Transition, transition},
    transport::{
        HandshakeKeys, HandshakeParams, PeerTransport, TaskVersion, TransportEvent,
        TransportFactory,
    },
};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::{
    config::SessionConfig,
    descriptor::SessionDescriptor,
    listeners::Listeners,
    services::SessionServices,
    wakeup::WakeUpCoordinator,
    worker::{EventSink, Scheduler, WorkerEvent, WorkerHandle},
};

/// Public view of a session, readable from any thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Current state
    pub state: SessionStateKind,
    /// Live connection
    pub connection_id: Option<ConnectionId>,
    /// Affiliation id of the current or last start
    pub affiliation_id: Option<String>,
}

/// Receives teardown and stopped notifications.
pub trait StopHandler {
    /// A connection was torn down, whatever the reason.
    fn on_teardown(&mut self) {}

    /// Session came to rest with no wake-up pending.
    fn on_stopped(&mut self, reason: &DisconnectContext);
}

struct LiveConnection {
    context: SessionConnectionContext,
    transport: Box<dyn PeerTransport>,
}

impl LiveConnection {
    fn create_peer_connection(&mut self) -> Result<usize, TransportError> {
        let task = self.transport.negotiated_task().ok_or(TransportError::NoTask)?;
        debug!(connection_id = self.context.connection_id(), ?task, "creating peer connection");

        self.transport.create_peer_connection()?;
        let link = self.transport.signaling_link()?;
        self.transport.create_signaling_channel(&link)?;
        Ok(self.transport.max_message_size())
    }

    /// Execute one transport action. Returns an event if the failure matters
    /// to the session.
    fn perform(&mut self, action: ConnectionAction) -> Option<SessionEvent> {
        let transport = &mut self.transport;
        match action {
            ConnectionAction::SetBufferedAmountLowThreshold { channel, threshold } => {
                transport.set_buffered_amount_low_threshold(channel, threshold);
            },
            ConnectionAction::Handover => {
                if let Err(e) = transport.handover() {
                    return Some(SessionEvent::Error(format!("Handover failed: {e}")));
                }
            },
            ConnectionAction::FeedSignaling(message) => {
                if let Err(e) = transport.feed_signaling(message) {
                    return Some(SessionEvent::Error(format!("Signaling failed: {e}")));
                }
            },
            ConnectionAction::SignalingLinkClosing => transport.signaling_link_closing(),
            ConnectionAction::SignalingLinkClosed => transport.signaling_link_closed(),
            ConnectionAction::Send { channel, frame } => {
                if let Err(e) = transport.send(channel, frame) {
                    warn!(connection_id = self.context.connection_id(), %channel, error = %e, "send failed");
                }
            },
            ConnectionAction::CloseChannel(channel) => transport.close_channel(channel),
            ConnectionAction::DisposeChannel(channel) => transport.dispose_channel(channel),
            ConnectionAction::CloseTask(code) => transport.close_task(code),
            ConnectionAction::DisconnectSignaling => transport.disconnect(),
            ConnectionAction::DisposePeerConnection => transport.dispose_peer_connection(),
            ConnectionAction::CreatePeerConnection
            | ConnectionAction::Deliver(_)
            | ConnectionAction::Transition(_) => {},
        }
        None
    }
}

/// Owner of the session state and the live connection.
pub struct SessionStateManager {
    session_id: u64,
    descriptor: Arc<SessionDescriptor>,
    config: SessionConfig,
    state: SessionState,
    last_connection_id: ConnectionId,
    keys: Option<HandshakeKeys>,
    affiliation_id: Option<String>,
    live: Option<LiveConnection>,
    inbox: Vec<(ConnectionId, Envelope)>,
    transport: Arc<dyn TransportFactory>,
    wakeups: Arc<dyn WakeUpCoordinator>,
    env: Arc<dyn Environment>,
    scheduler: Arc<dyn Scheduler>,
    handle: WorkerHandle,
    listeners: Listeners,
    snapshot: watch::Sender<SessionSnapshot>,
}

impl SessionStateManager {
    /// Create a manager in Disconnected.
    ///
    /// Returns the manager and a receiver for its published snapshots.
    pub fn new(
        session_id: u64,
        descriptor: Arc<SessionDescriptor>,
        config: SessionConfig,
        services: &SessionServices,
        scheduler: Arc<dyn Scheduler>,
        handle: WorkerHandle,
        listeners: Listeners,
    ) -> (Self, watch::Receiver<SessionSnapshot>) {
        let (snapshot, rx) = watch::channel(SessionSnapshot {
            state: SessionStateKind::Disconnected,
            connection_id: None,
            affiliation_id: None,
        });
        let manager = Self {
            session_id,
            descriptor,
            config,
            state: SessionState::Disconnected,
            last_connection_id: 0,
            keys: None,
            affiliation_id: None,
            live: None,
            inbox: Vec::new(),
            transport: Arc::clone(&services.transport),
            wakeups: Arc::clone(&services.wakeups),
            env: Arc::clone(&services.env),
            scheduler,
            handle,
            listeners,
            snapshot,
        };
        (manager, rx)
    }

    /// Current state.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Id handed out by the most recent connect.
    pub fn last_connection_id(&self) -> ConnectionId {
        self.last_connection_id
    }

    /// Id of the live connection context.
    pub fn live_connection_id(&self) -> Option<ConnectionId> {
        self.live.as_ref().map(|l| l.context.connection_id())
    }

    /// Affiliation id of the current or last start.
    pub fn affiliation_id(&self) -> Option<&str> {
        self.affiliation_id.as_deref()
    }

    /// Record the affiliation id of a start or resume.
    pub fn set_affiliation(&mut self, affiliation_id: Option<String>) {
        self.affiliation_id = affiliation_id;
        self.publish();
    }

    /// Connect with the given keys.
    pub fn connect(&mut self, keys: HandshakeKeys, stop: &mut dyn StopHandler) -> Disposition {
        self.keys = Some(keys);
        self.apply(SessionEvent::Connect, stop)
    }

    /// Feed one event into the state machine.
    ///
    /// Returns how that event was treated. Events caused by it are handled
    /// before this returns.
    pub fn apply(&mut self, event: SessionEvent, stop: &mut dyn StopHandler) -> Disposition {
        self.run(VecDeque::from([event]), stop).unwrap_or(Disposition::Ignored)
    }

    /// Handle a native event tagged with its connection id.
    ///
    /// Events for any connection but the live one are dropped.
    pub fn handle_transport(
        &mut self,
        connection_id: ConnectionId,
        event: TransportEvent,
        stop: &mut dyn StopHandler,
    ) {
        let session_id = self.session_id;
        let kind = self.state.kind();
        let now = self.env.now();
        let Some(live) =
            self.live.as_mut().filter(|l| l.context.connection_id() == connection_id)
        else {
            trace!(session_id, connection_id, ?event, "event for stale connection");
            return;
        };

        let actions = live.context.handle_event(event, kind, now);
        let mut events = VecDeque::new();
        self.execute(actions, &mut events);
        self.run(events, stop);
    }

    /// Handshake deadline of `connection_id` elapsed.
    pub fn handshake_deadline(&mut self, connection_id: ConnectionId, stop: &mut dyn StopHandler) {
        if self.state != (SessionState::Connecting { connection_id }) {
            trace!(session_id = self.session_id, connection_id, "handshake deadline no longer relevant");
            return;
        }
        warn!(session_id = self.session_id, connection_id, "handshake timed out");
        self.apply(SessionEvent::Error("Timeout while connecting to remote client".into()), stop);
    }

    /// Send an encoded message on the live connection.
    pub fn send_message(&mut self, message: &[u8], mode: SendMode, stop: &mut dyn StopHandler) {
        let kind = self.state.kind();
        let Some(live) = self.live.as_mut() else {
            warn!(session_id = self.session_id, "no connection, dropping outgoing message");
            return;
        };
        let actions = live.context.send_message(message, mode, kind);
        self.flush(actions, stop);
    }

    /// Encode and send an envelope on the live connection.
    pub fn send_envelope(&mut self, envelope: &Envelope, mode: SendMode, stop: &mut dyn StopHandler) {
        let kind = self.state.kind();
        let Some(live) = self.live.as_mut() else {
            warn!(session_id = self.session_id, sub_type = %envelope.sub_type, "no connection, dropping outgoing message");
            return;
        };
        let actions = live.context.send_envelope(envelope, mode, kind);
        self.flush(actions, stop);
    }

    /// Take the envelopes delivered since the last call, tagged with their
    /// connection.
    pub fn take_inbox(&mut self) -> Vec<(ConnectionId, Envelope)> {
        std::mem::take(&mut self.inbox)
    }

    fn flush(&mut self, actions: Vec<ConnectionAction>, stop: &mut dyn StopHandler) {
        let mut events = VecDeque::new();
        self.execute(actions, &mut events);
        self.run(events, stop);
    }

    fn run(
        &mut self,
        mut events: VecDeque<SessionEvent>,
        stop: &mut dyn StopHandler,
    ) -> Option<Disposition> {
        let session_id = self.session_id;
        let mut first = None;

        while let Some(event) = events.pop_front() {
            let name = event.name();
            let from = self.state.kind();
            let Transition { state, actions, disposition } =
                transition(&self.state, event, self.last_connection_id);

            match disposition {
                Disposition::Applied => {
                    debug!(session_id, %from, to = %state.kind(), event = name, "session transition");
                },
                Disposition::Ignored => {
                    debug!(session_id, state = %from, event = name, "ignoring event");
                },
                Disposition::Invalid => {
                    warn!(session_id, reason = state.error_reason(), "invalid session transition");
                },
            }
            first.get_or_insert(disposition);
            self.state = state;

            for action in actions {
                self.perform(action, &mut events, stop);
            }
        }
        first
    }

    fn perform(
        &mut self,
        action: StateAction,
        events: &mut VecDeque<SessionEvent>,
        stop: &mut dyn StopHandler,
    ) {
        match action {
            StateAction::OpenConnection { connection_id } => {
                self.open_connection(connection_id, events);
            },
            StateAction::NotifyPeer { reason } => {
                let actions = match self.live.as_mut() {
                    Some(live) => live.context.disconnect_notice(reason),
                    None => Vec::new(),
                };
                self.execute(actions, events);
            },
            StateAction::Teardown { connection_id } => {
                self.teardown(connection_id);
                stop.on_teardown();
            },
            StateAction::Settled { reason } => {
                if self.wakeups.has_pending(&self.descriptor.key_hash) {
                    debug!(session_id = self.session_id, %reason, "wake-up pending, not reporting stop");
                } else {
                    info!(session_id = self.session_id, %reason, "session stopped");
                    stop.on_stopped(&reason);
                }
            },
            StateAction::NotifyListeners { old, new } => {
                self.publish();
                self.listeners.notify_state(old, new);
            },
        }
    }

    fn open_connection(&mut self, connection_id: ConnectionId, events: &mut VecDeque<SessionEvent>) {
        self.last_connection_id = connection_id;
        if let Some(previous) = self.live.as_ref().map(|l| l.context.connection_id()) {
            warn!(session_id = self.session_id, previous, "replacing live connection");
            self.teardown(previous);
        }

        let Some(keys) = self.keys.clone() else {
            events.push_back(SessionEvent::Error("No keys available for handshake".into()));
            return;
        };
        let params = HandshakeParams {
            host: self.descriptor.host.clone(),
            port: self.descriptor.port,
            server_key: self.descriptor.server_key.clone(),
            keys,
            tasks: TaskVersion::PREFERRED.to_vec(),
            handover: true,
            ping_interval: self.config.ping_interval,
            ws_connect_timeout: self.config.ws_connect_timeout,
            allow_ipv6: self.config.allow_ipv6,
        };

        let context = SessionConnectionContext::new(connection_id, self.config.connection.clone());
        let sink = Arc::new(EventSink::new(connection_id, context.closed_flag(), self.handle.clone()));
        let transport = match self.transport.create(params, sink) {
            Ok(transport) => transport,
            Err(e) => {
                events.push_back(SessionEvent::Error(format!("Could not create handshake client: {e}")));
                return;
            },
        };

        info!(session_id = self.session_id, connection_id, host = %self.descriptor.host, "connecting");
        let live = self.live.insert(LiveConnection { context, transport });
        if let Err(e) = live.transport.connect() {
            events.push_back(SessionEvent::Error(format!("Could not start handshake: {e}")));
            return;
        }

        self.scheduler.schedule(
            self.config.handshake_timeout,
            WorkerEvent::HandshakeDeadline { connection_id },
            self.handle.clone(),
        );
    }

    fn teardown(&mut self, connection_id: ConnectionId) {
        let Some(mut live) = self.live.take() else {
            trace!(session_id = self.session_id, connection_id, "nothing to tear down");
            return;
        };
        if live.context.connection_id() != connection_id {
            warn!(
                session_id = self.session_id,
                connection_id,
                live = live.context.connection_id(),
                "tearing down unexpected connection"
            );
        }

        for action in live.context.close() {
            if let Some(event) = live.perform(action) {
                trace!(session_id = self.session_id, ?event, "ignoring failure during teardown");
            }
        }
        debug!(session_id = self.session_id, connection_id, "connection torn down");
    }

    fn execute(&mut self, actions: Vec<ConnectionAction>, events: &mut VecDeque<SessionEvent>) {
        let mut queue = VecDeque::from(actions);
        while let Some(action) = queue.pop_front() {
            match action {
                ConnectionAction::Deliver(envelope) => {
                    if let Some(connection_id) = self.live_connection_id() {
                        self.inbox.push((connection_id, envelope));
                    }
                },
                ConnectionAction::Transition(event) => events.push_back(event),
                ConnectionAction::CreatePeerConnection => {
                    let Some(live) = self.live.as_mut() else { continue };
                    match live.create_peer_connection() {
                        Ok(max_message_size) => {
                            queue.extend(live.context.signaling_channel_created(max_message_size));
                        },
                        Err(e) => events.push_back(SessionEvent::Error(format!(
                            "Could not create peer connection: {e}"
                        ))),
                    }
                },
                other => {
                    let Some(live) = self.live.as_mut() else {
                        trace!(session_id = self.session_id, action = ?other, "no live connection");
                        continue;
                    };
                    if let Some(event) = live.perform(other) {
                        events.push_back(event);
                    }
                },
            }
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(SessionSnapshot {
            state: self.state.kind(),
            connection_id: self.state.connection_id(),
            affiliation_id: self.affiliation_id.clone(),
        });
    }
}
