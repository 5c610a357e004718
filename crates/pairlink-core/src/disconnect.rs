//! Who ended a session, and why.

use std::fmt;

use pairlink_proto::DisconnectReason;

/// Side that initiated a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectInitiator {
    /// This device stopped the session
    Us,
    /// The paired web client sent `connectionDisconnect`
    Peer,
    /// The transport went away without a reason
    Unknown,
}

/// Disconnect initiator plus optional reason.
///
/// Only `by_us` and `by_peer` carry a reason; transport failures are
/// `unknown()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DisconnectContext {
    initiator: DisconnectInitiator,
    reason: Option<DisconnectReason>,
}

impl DisconnectContext {
    /// Disconnect initiated locally.
    pub fn by_us(reason: DisconnectReason) -> Self {
        Self { initiator: DisconnectInitiator::Us, reason: Some(reason) }
    }

    /// Disconnect announced by the peer.
    pub fn by_peer(reason: DisconnectReason) -> Self {
        Self { initiator: DisconnectInitiator::Peer, reason: Some(reason) }
    }

    /// Connection lost without explanation.
    pub fn unknown() -> Self {
        Self { initiator: DisconnectInitiator::Unknown, reason: None }
    }

    /// Initiating side.
    pub fn initiator(&self) -> DisconnectInitiator {
        self.initiator
    }

    /// Reason, if one was given.
    pub fn reason(&self) -> Option<DisconnectReason> {
        self.reason
    }

    /// Reason to announce to the peer, if this disconnect is ours.
    pub fn local_notice(&self) -> Option<DisconnectReason> {
        match self.initiator {
            DisconnectInitiator::Us => self.reason,
            DisconnectInitiator::Peer | DisconnectInitiator::Unknown => None,
        }
    }

    /// Whether the pairing must be deleted after this disconnect.
    pub fn should_forget(&self) -> bool {
        self.reason == Some(DisconnectReason::SessionDeleted)
    }
}

impl fmt::Display for DisconnectContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.initiator, self.reason) {
            (DisconnectInitiator::Us, Some(reason)) => write!(f, "by us ({reason})"),
            (DisconnectInitiator::Peer, Some(reason)) => write!(f, "by peer ({reason})"),
            (DisconnectInitiator::Us, None) => f.write_str("by us"),
            (DisconnectInitiator::Peer, None) => f.write_str("by peer"),
            (DisconnectInitiator::Unknown, _) => f.write_str("unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_forget_only_when_deleted() {
        for reason in DisconnectReason::ALL {
            let expected = reason == DisconnectReason::SessionDeleted;
            assert_eq!(DisconnectContext::by_us(reason).should_forget(), expected);
            assert_eq!(DisconnectContext::by_peer(reason).should_forget(), expected);
        }
        assert!(!DisconnectContext::unknown().should_forget());
    }

    #[test]
    fn only_local_disconnects_notify_peer() {
        let ours = DisconnectContext::by_us(DisconnectReason::SessionStopped);
        let theirs = DisconnectContext::by_peer(DisconnectReason::SessionStopped);

        assert_eq!(ours.local_notice(), Some(DisconnectReason::SessionStopped));
        assert_eq!(theirs.local_notice(), None);
        assert_eq!(DisconnectContext::unknown().local_notice(), None);
    }

    #[test]
    fn display() {
        assert_eq!(
            DisconnectContext::by_peer(DisconnectReason::SessionReplaced).to_string(),
            "by peer (SESSION_REPLACED)"
        );
        assert_eq!(DisconnectContext::unknown().to_string(), "unknown");
    }
}
