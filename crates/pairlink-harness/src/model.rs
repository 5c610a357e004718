//! Reference model of a session.
//!
//! [`ModelSession`] restates the session lifecycle in the simplest possible
//! form: a state kind, the last connection id, and the stopped notifications
//! the owner should have seen. Property tests drive it and a real session
//! with the same [`Operation`]s and compare the two after every step.

use arbitrary::Arbitrary;
use pairlink_core::{
    ConnectionId, DisconnectContext, DisconnectReason, SessionEvent, SessionStateKind,
};

/// Disconnect reasons a local stop can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Arbitrary)]
pub enum StopReason {
    /// `SESSION_STOPPED`
    Stopped,
    /// `SESSION_DELETED`
    Deleted,
    /// `WEBCLIENT_DISABLED`
    Disabled,
    /// `SESSION_REPLACED`
    Replaced,
    /// `OUT_OF_MEMORY`
    OutOfMemory,
    /// `ERROR`
    Error,
}

impl From<StopReason> for DisconnectReason {
    fn from(reason: StopReason) -> Self {
        match reason {
            StopReason::Stopped => Self::SessionStopped,
            StopReason::Deleted => Self::SessionDeleted,
            StopReason::Disabled => Self::WebclientDisabled,
            StopReason::Replaced => Self::SessionReplaced,
            StopReason::OutOfMemory => Self::OutOfMemory,
            StopReason::Error => Self::Error,
        }
    }
}

/// Operation applied to both the model and a real session.
#[derive(Debug, Clone, PartialEq, Eq, Arbitrary)]
pub enum Operation {
    /// Pair with a new web client
    Start,
    /// Reconnect with stored keys
    Resume,
    /// Complete the handshake and open the application channel
    Establish,
    /// Stop from this device
    Stop(StopReason),
    /// Web client sends `connectionDisconnect`
    PeerDisconnect(StopReason),
    /// Signaling transport closes without a reason
    TransportLost,
    /// Signaling reports an error
    SignalingError,
    /// Handshake deadline expires
    FireDeadline,
}

/// Raw state machine event, for fuzzing the pure transition function.
#[derive(Debug, Clone, PartialEq, Eq, Arbitrary)]
pub enum ModelEvent {
    /// `Connect`
    Connect,
    /// `Connected`
    Connected,
    /// `Disconnect` initiated locally
    DisconnectByUs(StopReason),
    /// `Disconnect` announced by the peer
    DisconnectByPeer(StopReason),
    /// `Disconnect` without a reason
    DisconnectUnknown,
    /// `Error`
    Error,
}

impl From<ModelEvent> for SessionEvent {
    fn from(event: ModelEvent) -> Self {
        match event {
            ModelEvent::Connect => Self::Connect,
            ModelEvent::Connected => Self::Connected,
            ModelEvent::DisconnectByUs(r) => Self::Disconnect(DisconnectContext::by_us(r.into())),
            ModelEvent::DisconnectByPeer(r) => {
                Self::Disconnect(DisconnectContext::by_peer(r.into()))
            },
            ModelEvent::DisconnectUnknown => Self::Disconnect(DisconnectContext::unknown()),
            ModelEvent::Error => Self::Error("model error".into()),
        }
    }
}

/// Reference session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSession {
    /// Current state
    pub state: SessionStateKind,
    /// Id of the most recent connection attempt
    pub last_connection_id: ConnectionId,
    /// Stopped notifications the owner received, in order
    pub stopped: Vec<DisconnectContext>,
    /// Disconnect notices sent to the peer, in order
    pub notices: Vec<DisconnectReason>,
}

impl Default for ModelSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelSession {
    /// A session that never started.
    pub fn new() -> Self {
        Self {
            state: SessionStateKind::Disconnected,
            last_connection_id: 0,
            stopped: Vec::new(),
            notices: Vec::new(),
        }
    }

    /// Apply a state machine event.
    pub fn apply_event(&mut self, event: SessionEvent) {
        use SessionStateKind as K;

        match (self.state, event) {
            (K::Disconnected | K::Error, SessionEvent::Connect) => {
                self.last_connection_id += 1;
                self.state = K::Connecting;
            },
            (K::Connecting, SessionEvent::Connected) => self.state = K::Connected,
            (K::Connecting, SessionEvent::Disconnect(context)) => self.settle(K::Disconnected, context),
            (K::Connected, SessionEvent::Disconnect(context)) => {
                if let Some(reason) = context.local_notice() {
                    self.notices.push(reason);
                }
                self.settle(K::Disconnected, context);
            },
            (K::Connecting | K::Connected, SessionEvent::Error(_)) => self.fail(),
            (K::Disconnected, SessionEvent::Disconnect(_)) | (K::Error, _) => {},
            (K::Disconnected | K::Connecting | K::Connected, _) => self.fail(),
        }
    }

    /// Apply a session level operation.
    pub fn apply(&mut self, op: &Operation) {
        match op {
            Operation::Start | Operation::Resume => self.apply_event(SessionEvent::Connect),
            Operation::Establish => {
                if self.state == SessionStateKind::Connecting {
                    self.apply_event(SessionEvent::Connected);
                }
            },
            Operation::Stop(reason) => {
                self.apply_event(SessionEvent::Disconnect(DisconnectContext::by_us((*reason).into())));
            },
            Operation::PeerDisconnect(reason) => {
                if self.state == SessionStateKind::Connected {
                    self.apply_event(SessionEvent::Disconnect(DisconnectContext::by_peer(
                        (*reason).into(),
                    )));
                }
            },
            Operation::TransportLost => {
                if self.state.is_running() {
                    self.apply_event(SessionEvent::Disconnect(DisconnectContext::unknown()));
                }
            },
            Operation::SignalingError => {
                if self.state.is_running() {
                    self.apply_event(SessionEvent::Error("signaling".into()));
                }
            },
            Operation::FireDeadline => {
                if self.state == SessionStateKind::Connecting {
                    self.apply_event(SessionEvent::Error("timeout".into()));
                }
            },
        }
    }

    fn settle(&mut self, state: SessionStateKind, context: DisconnectContext) {
        self.state = state;
        self.stopped.push(context);
    }

    fn fail(&mut self) {
        if self.state != SessionStateKind::Error {
            self.stopped.push(DisconnectContext::by_us(DisconnectReason::Error));
        }
        self.state = SessionStateKind::Error;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_twice_fails_and_stops() {
        let mut model = ModelSession::new();
        model.apply(&Operation::Start);
        model.apply(&Operation::Start);

        assert_eq!(model.state, SessionStateKind::Error);
        assert_eq!(model.last_connection_id, 1);
        assert_eq!(model.stopped, vec![DisconnectContext::by_us(DisconnectReason::Error)]);
    }

    #[test]
    fn stop_in_error_keeps_error_without_second_stop() {
        let mut model = ModelSession::new();
        model.apply(&Operation::Start);
        model.apply(&Operation::FireDeadline);
        model.apply(&Operation::Stop(StopReason::Stopped));

        assert_eq!(model.state, SessionStateKind::Error);
        assert_eq!(model.stopped.len(), 1);
    }

    #[test]
    fn local_stop_while_connected_notifies_peer() {
        let mut model = ModelSession::new();
        model.apply(&Operation::Start);
        model.apply(&Operation::Establish);
        model.apply(&Operation::Stop(StopReason::Deleted));

        assert_eq!(model.notices, vec![DisconnectReason::SessionDeleted]);
        assert_eq!(model.state, SessionStateKind::Disconnected);
    }
}
