//! Session state machine.
//!
//! The session state is a closed enum and every change goes through
//! [`transition`], a pure function of the current state, the event, and the
//! last connection id handed out. It returns the next state together with the
//! actions the manager must perform, in order.
//!
//! # State Machine
//!
//! ```text
//!                 connect                    connected
//! ┌──────────────┐──────>┌────────────┐───────────────>┌───────────┐
//! │ Disconnected │       │ Connecting │                │ Connected │
//! └──────────────┘<──────└────────────┘                └───────────┘
//!        ^       disconnect   │   ^                      │      │
//!        │                    │   │ connect              │      │
//!        │               error│   │ (retry)         error│      │disconnect
//!        │                    v   │                      │      │
//!        │                 ┌───────┐<────────────────────┘      │
//!        │                 │ Error │ error: replace diagnostic  │
//!        │                 └───────┘                            │
//!        └──────────────────────────────────────────────────────┘
//! ```
//!
//! Disconnected + disconnect is ignored. Every other pair not drawn above is
//! an invalid transition and forces Error with a diagnostic.

use std::fmt;

use pairlink_proto::DisconnectReason;

use crate::disconnect::DisconnectContext;

/// Identifies one connection attempt within a session.
///
/// Incremented by exactly one each time the session enters Connecting.
pub type ConnectionId = u64;

/// Session state. Each variant carries only what is valid in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No connection context exists
    Disconnected,
    /// Handshake in progress for this connection
    Connecting {
        /// Connection being established
        connection_id: ConnectionId,
    },
    /// Application channel open
    Connected {
        /// Live connection
        connection_id: ConnectionId,
    },
    /// Stopped on a failure
    Error {
        /// Diagnostic shown to the user and logs
        reason: String,
    },
}

/// Fieldless mirror of [`SessionState`] for observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStateKind {
    /// See [`SessionState::Disconnected`]
    Disconnected,
    /// See [`SessionState::Connecting`]
    Connecting,
    /// See [`SessionState::Connected`]
    Connected,
    /// See [`SessionState::Error`]
    Error,
}

impl SessionStateKind {
    /// Lowercase name used in diagnostics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }

    /// Whether a connection context is (or should be) live.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

impl fmt::Display for SessionStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SessionState {
    /// Variant without payload.
    pub fn kind(&self) -> SessionStateKind {
        match self {
            Self::Disconnected => SessionStateKind::Disconnected,
            Self::Connecting { .. } => SessionStateKind::Connecting,
            Self::Connected { .. } => SessionStateKind::Connected,
            Self::Error { .. } => SessionStateKind::Error,
        }
    }

    /// Connection id of the live context, if any.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        match self {
            Self::Connecting { connection_id } | Self::Connected { connection_id } => {
                Some(*connection_id)
            },
            Self::Disconnected | Self::Error { .. } => None,
        }
    }

    /// Diagnostic of the Error state.
    pub fn error_reason(&self) -> Option<&str> {
        match self {
            Self::Error { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Inputs to the session state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Start (or retry) a connection
    Connect,
    /// Application channel opened
    Connected,
    /// Session ended without failure
    Disconnect(DisconnectContext),
    /// Session failed
    Error(String),
}

impl SessionEvent {
    /// Event name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Connected => "connected",
            Self::Disconnect(_) => "disconnect",
            Self::Error(_) => "error",
        }
    }
}

/// Effects the manager performs after a transition, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateAction {
    /// Create a fresh connection context, start the handshake, and arm the
    /// handshake deadline
    OpenConnection {
        /// Id assigned to the new context
        connection_id: ConnectionId,
    },
    /// Synchronously send a best-effort `connectionDisconnect` over the still
    /// open application channel
    NotifyPeer {
        /// Reason to announce
        reason: DisconnectReason,
    },
    /// Close and drop the live connection context
    Teardown {
        /// Context being torn down
        connection_id: ConnectionId,
    },
    /// Session came to rest; stop it unless a wake-up is pending
    Settled {
        /// Reported to the owner in the stopped notification
        reason: DisconnectContext,
    },
    /// Inform public state listeners
    NotifyListeners {
        /// State before the transition
        old: SessionStateKind,
        /// State after the transition
        new: SessionStateKind,
    },
}

/// How an event was treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Event is part of the transition matrix
    Applied,
    /// Event is a documented no-op
    Ignored,
    /// Event is not allowed in the current state; session forced to Error
    Invalid,
}

/// Result of [`transition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Next state
    pub state: SessionState,
    /// Effects, in execution order
    pub actions: Vec<StateAction>,
    /// Whether the event was applied, ignored, or invalid
    pub disposition: Disposition,
}

/// Compute the next session state.
///
/// `last_connection_id` is the id handed out most recently (0 before the
/// first connect). Entering Connecting always uses `last_connection_id + 1`.
pub fn transition(
    current: &SessionState,
    event: SessionEvent,
    last_connection_id: ConnectionId,
) -> Transition {
    let old = current.kind();

    match (current, event) {
        (SessionState::Disconnected | SessionState::Error { .. }, SessionEvent::Connect) => {
            let connection_id = last_connection_id + 1;
            applied(SessionState::Connecting { connection_id }, old, vec![
                StateAction::OpenConnection { connection_id },
            ])
        },

        (SessionState::Connecting { connection_id }, SessionEvent::Connected) => {
            applied(SessionState::Connected { connection_id: *connection_id }, old, vec![])
        },

        (SessionState::Connecting { connection_id }, SessionEvent::Disconnect(context)) => {
            applied(SessionState::Disconnected, old, vec![
                StateAction::Teardown { connection_id: *connection_id },
                StateAction::Settled { reason: context },
            ])
        },

        (SessionState::Connected { connection_id }, SessionEvent::Disconnect(context)) => {
            let mut actions = Vec::with_capacity(3);
            if let Some(reason) = context.local_notice() {
                actions.push(StateAction::NotifyPeer { reason });
            }
            actions.push(StateAction::Teardown { connection_id: *connection_id });
            actions.push(StateAction::Settled { reason: context });
            applied(SessionState::Disconnected, old, actions)
        },

        (
            SessionState::Connecting { connection_id } | SessionState::Connected { connection_id },
            SessionEvent::Error(reason),
        ) => applied(SessionState::Error { reason }, old, vec![
            StateAction::Teardown { connection_id: *connection_id },
            StateAction::Settled { reason: error_context() },
        ]),

        (SessionState::Error { .. }, SessionEvent::Error(reason)) => {
            applied(SessionState::Error { reason }, old, vec![])
        },

        (SessionState::Disconnected, SessionEvent::Disconnect(_)) => Transition {
            state: current.clone(),
            actions: Vec::new(),
            disposition: Disposition::Ignored,
        },

        (current, event) => forced_error(current, &event),
    }
}

fn applied(state: SessionState, old: SessionStateKind, mut actions: Vec<StateAction>) -> Transition {
    actions.push(StateAction::NotifyListeners { old, new: state.kind() });
    Transition { state, actions, disposition: Disposition::Applied }
}

fn forced_error(current: &SessionState, event: &SessionEvent) -> Transition {
    let old = current.kind();
    let reason = format!("Invalid state transition: {} event in state {}", event.name(), old);

    let mut actions = Vec::with_capacity(3);
    if let Some(connection_id) = current.connection_id() {
        actions.push(StateAction::Teardown { connection_id });
    }
    if old != SessionStateKind::Error {
        actions.push(StateAction::Settled { reason: error_context() });
    }
    actions.push(StateAction::NotifyListeners { old, new: SessionStateKind::Error });

    Transition { state: SessionState::Error { reason }, actions, disposition: Disposition::Invalid }
}

fn error_context() -> DisconnectContext {
    DisconnectContext::by_us(DisconnectReason::Error)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connecting(id: ConnectionId) -> SessionState {
        SessionState::Connecting { connection_id: id }
    }

    fn connected(id: ConnectionId) -> SessionState {
        SessionState::Connected { connection_id: id }
    }

    fn stopped() -> SessionEvent {
        SessionEvent::Disconnect(DisconnectContext::by_us(DisconnectReason::SessionStopped))
    }

    #[test]
    fn connect_from_disconnected_opens_next_connection() {
        let t = transition(&SessionState::Disconnected, SessionEvent::Connect, 4);

        assert_eq!(t.state, connecting(5));
        assert_eq!(t.disposition, Disposition::Applied);
        assert_eq!(t.actions, vec![
            StateAction::OpenConnection { connection_id: 5 },
            StateAction::NotifyListeners {
                old: SessionStateKind::Disconnected,
                new: SessionStateKind::Connecting,
            },
        ]);
    }

    #[test]
    fn connect_from_error_retries() {
        let error = SessionState::Error { reason: "timeout".into() };
        let t = transition(&error, SessionEvent::Connect, 1);

        assert_eq!(t.state, connecting(2));
        assert!(t.actions.contains(&StateAction::OpenConnection { connection_id: 2 }));
    }

    #[test]
    fn connected_keeps_connection_id() {
        let t = transition(&connecting(3), SessionEvent::Connected, 3);
        assert_eq!(t.state, connected(3));
    }

    #[test]
    fn local_disconnect_while_connected_notifies_peer_before_teardown() {
        let t = transition(&connected(2), stopped(), 2);

        assert_eq!(t.state, SessionState::Disconnected);
        assert_eq!(t.actions[0], StateAction::NotifyPeer {
            reason: DisconnectReason::SessionStopped
        });
        assert_eq!(t.actions[1], StateAction::Teardown { connection_id: 2 });
        assert!(matches!(t.actions[2], StateAction::Settled { .. }));
        assert!(matches!(t.actions[3], StateAction::NotifyListeners { .. }));
    }

    #[test]
    fn peer_disconnect_does_not_notify_peer() {
        let event = SessionEvent::Disconnect(DisconnectContext::by_peer(
            DisconnectReason::SessionStopped,
        ));
        let t = transition(&connected(2), event, 2);

        assert!(!t.actions.iter().any(|a| matches!(a, StateAction::NotifyPeer { .. })));
    }

    #[test]
    fn disconnect_while_connecting_never_notifies_peer() {
        let t = transition(&connecting(1), stopped(), 1);

        assert_eq!(t.state, SessionState::Disconnected);
        assert_eq!(t.actions[0], StateAction::Teardown { connection_id: 1 });
    }

    #[test]
    fn settled_precedes_listener_notification() {
        let t = transition(&connected(1), SessionEvent::Error("boom".into()), 1);

        let settled = t.actions.iter().position(|a| matches!(a, StateAction::Settled { .. }));
        let notify =
            t.actions.iter().position(|a| matches!(a, StateAction::NotifyListeners { .. }));
        assert!(settled < notify);
    }

    #[test]
    fn error_replaces_diagnostic_without_teardown() {
        let error = SessionState::Error { reason: "first".into() };
        let t = transition(&error, SessionEvent::Error("second".into()), 1);

        assert_eq!(t.state, SessionState::Error { reason: "second".into() });
        assert!(!t.actions.iter().any(|a| matches!(a, StateAction::Teardown { .. })));
    }

    #[test]
    fn disconnect_while_disconnected_is_ignored() {
        let t = transition(&SessionState::Disconnected, stopped(), 7);

        assert_eq!(t.state, SessionState::Disconnected);
        assert_eq!(t.disposition, Disposition::Ignored);
        assert!(t.actions.is_empty());
    }

    #[test]
    fn invalid_transitions_force_error() {
        let cases = [
            (SessionState::Disconnected, SessionEvent::Connected),
            (SessionState::Disconnected, SessionEvent::Error("x".into())),
            (connecting(1), SessionEvent::Connect),
            (connected(1), SessionEvent::Connect),
            (connected(1), SessionEvent::Connected),
            (SessionState::Error { reason: "x".into() }, SessionEvent::Connected),
            (SessionState::Error { reason: "x".into() }, stopped()),
        ];

        for (state, event) in cases {
            let name = event.name();
            let t = transition(&state, event, 1);
            assert_eq!(t.disposition, Disposition::Invalid, "{state:?} + {name}");
            assert_eq!(t.state.kind(), SessionStateKind::Error);
            let reason = t.state.error_reason().expect("diagnostic");
            assert!(reason.contains(name), "{reason}");
        }
    }

    #[test]
    fn invalid_transition_tears_down_live_context() {
        let t = transition(&connected(9), SessionEvent::Connect, 9);
        assert!(t.actions.contains(&StateAction::Teardown { connection_id: 9 }));

        let t = transition(&SessionState::Disconnected, SessionEvent::Connected, 9);
        assert!(!t.actions.iter().any(|a| matches!(a, StateAction::Teardown { .. })));
    }
}
