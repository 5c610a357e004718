//! Collaborators a session is wired to.

use std::sync::Arc;

use pairlink_core::{
    DisconnectContext, MessageType,
    dispatch::{ConnectionLifetime, OutboundQueue, Receiver, Updater},
    env::Environment,
    transport::TransportFactory,
};

use crate::{descriptor::SessionDescriptor, wakeup::WakeUpCoordinator};

/// Supplies the receivers and updaters of a session.
///
/// Called once per session, when the session is built.
pub trait HandlerSet: Send + Sync {
    /// Receivers with the type they are registered under.
    fn receivers(&self, session: &SessionDescriptor) -> Vec<(MessageType, Box<dyn Receiver>)>;

    /// Updaters, all unregistered.
    fn updaters(&self, session: &SessionDescriptor) -> Vec<Box<dyn Updater>>;
}

/// Service that owns sessions.
pub trait SessionOwner: Send + Sync {
    /// Session came to rest and no wake-up is pending for it.
    fn on_stopped(&self, session: &SessionDescriptor, reason: &DisconnectContext);
}

/// Everything a session needs from the outside.
#[derive(Clone)]
pub struct SessionServices {
    /// Creates handshake clients and peer connections
    pub transport: Arc<dyn TransportFactory>,
    /// Receivers and updaters
    pub handlers: Arc<dyn HandlerSet>,
    /// Keeps the network connection alive
    pub lifetime: Arc<dyn ConnectionLifetime>,
    /// Outgoing messages waiting for the network
    pub queue: Arc<dyn OutboundQueue>,
    /// Pending wake-ups
    pub wakeups: Arc<dyn WakeUpCoordinator>,
    /// Gets the stopped notification
    pub owner: Arc<dyn SessionOwner>,
    /// Time source
    pub env: Arc<dyn Environment>,
}
