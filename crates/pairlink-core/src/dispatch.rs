//! Typed envelope dispatch.
//!
//! Each of the five envelope types has one [`MessageDispatcher`]; within a
//! dispatcher every sub type maps to exactly one [`Receiver`]. Receivers are
//! supplied by external handlers and registered once, when the session
//! starts.
//!
//! Receivers answer through an [`Outbox`]: replies are sent after the
//! receiver returns, and updater activations register the named
//! [`Updater`] lazily, the first time the peer asks for the data it streams.
//!
//! # Connection lingering
//!
//! A receiver may cause outgoing messages that are not sent over the session
//! (for example, queued chat messages). When it says so through
//! [`Receiver::maybe_needs_connection`] and the outbound queue is not empty,
//! the dispatcher holds the network connection open for
//! [`linger_duration`] of the queue depth.

use std::{collections::HashMap, sync::Arc, time::Duration};

use pairlink_proto::{Envelope, MessageType};
use tracing::{debug, trace};

use crate::error::DispatchError;

/// Base linger time for a non-empty outbound queue.
pub const LINGER_BASE: Duration = Duration::from_millis(5_000);
/// Additional linger time per queued message.
pub const LINGER_PER_MESSAGE: Duration = Duration::from_millis(100);
/// Upper bound of the linger time.
pub const LINGER_MAX: Duration = Duration::from_millis(30_000);

/// Tag under which dispatchers acquire the network connection.
pub const LIFETIME_TAG: &str = "session-dispatcher";

/// How long to keep the connection for `queue_depth` outbound messages.
///
/// `min(30 s, 5 s + 100 ms × depth)`. Monotone in the depth.
pub fn linger_duration(queue_depth: usize) -> Duration {
    let extra = LINGER_PER_MESSAGE.as_millis() as u64;
    let millis = (LINGER_BASE.as_millis() as u64)
        .saturating_add(extra.saturating_mul(queue_depth as u64))
        .min(LINGER_MAX.as_millis() as u64);
    Duration::from_millis(millis)
}

/// Keeps the device's network connection alive.
pub trait ConnectionLifetime: Send + Sync {
    /// Hold the connection under `tag`.
    fn acquire(&self, tag: &str);

    /// Release the hold under `tag` after `linger`.
    fn release_after(&self, tag: &str, linger: Duration);
}

/// Outgoing messages waiting for the network.
pub trait OutboundQueue: Send + Sync {
    /// Number of queued messages.
    fn len(&self) -> usize;

    /// Whether the queue is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Output of a receiver, applied after it returns.
#[derive(Debug, Default)]
pub struct Outbox {
    replies: Vec<Envelope>,
    activations: Vec<String>,
}

impl Outbox {
    /// Create an empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply to the peer.
    pub fn reply(&mut self, envelope: Envelope) {
        self.replies.push(envelope);
    }

    /// Ask for the named updater to be registered.
    pub fn activate(&mut self, updater: impl Into<String>) {
        self.activations.push(updater.into());
    }

    /// Replies queued so far.
    pub fn replies(&self) -> &[Envelope] {
        &self.replies
    }

    /// Take the queued replies.
    pub fn take_replies(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.replies)
    }

    /// Take the requested activations.
    pub fn take_activations(&mut self) -> Vec<String> {
        std::mem::take(&mut self.activations)
    }
}

/// Handles one `(type, subType)` pair.
pub trait Receiver: Send {
    /// Sub type this receiver handles.
    fn sub_type(&self) -> &str;

    /// Handle a message.
    ///
    /// # Errors
    ///
    /// `DispatchError::Decode` drops just this message. `MissingField` ends
    /// the session.
    fn receive(&mut self, envelope: &Envelope, outbox: &mut Outbox) -> Result<(), DispatchError>;

    /// Whether handling may leave outgoing messages in the outbound queue.
    fn maybe_needs_connection(&self) -> bool {
        false
    }
}

/// Where updaters push their updates.
pub trait UpdateSink: Send + Sync {
    /// Send an update to the peer.
    fn emit(&self, envelope: Envelope);
}

/// Streams change notifications to the peer while registered.
pub trait Updater: Send {
    /// Name used for activation.
    fn name(&self) -> &str;

    /// Start listening for changes.
    fn register(&mut self, sink: Arc<dyn UpdateSink>);

    /// Stop listening. Must be idempotent.
    fn unregister(&mut self);
}

/// Updaters of one session with their registration state.
#[derive(Default)]
pub struct UpdaterSet {
    updaters: Vec<(Box<dyn Updater>, bool)>,
}

impl UpdaterSet {
    /// Wrap the given updaters, all unregistered.
    pub fn new(updaters: Vec<Box<dyn Updater>>) -> Self {
        Self { updaters: updaters.into_iter().map(|u| (u, false)).collect() }
    }

    /// Register the named updater if it is not registered yet.
    ///
    /// Returns whether a registration happened.
    pub fn activate(&mut self, name: &str, sink: &Arc<dyn UpdateSink>) -> bool {
        let Some((updater, registered)) = self.updaters.iter_mut().find(|(u, _)| u.name() == name)
        else {
            debug!(updater = name, "no such updater");
            return false;
        };
        if *registered {
            return false;
        }

        updater.register(Arc::clone(sink));
        *registered = true;
        debug!(updater = name, "updater registered");
        true
    }

    /// Whether the named updater is registered.
    pub fn is_registered(&self, name: &str) -> bool {
        self.updaters.iter().any(|(u, registered)| *registered && u.name() == name)
    }

    /// Unregister every registered updater. Idempotent.
    pub fn unregister_all(&mut self) {
        for (updater, registered) in &mut self.updaters {
            if *registered {
                updater.unregister();
                *registered = false;
            }
        }
    }
}

/// Receiver that accepts a sub type and does nothing.
#[derive(Debug, Clone)]
pub struct IgnoreReceiver {
    sub_type: String,
}

impl IgnoreReceiver {
    /// Ignore messages of `sub_type`.
    pub fn new(sub_type: impl Into<String>) -> Self {
        Self { sub_type: sub_type.into() }
    }
}

impl Receiver for IgnoreReceiver {
    fn sub_type(&self) -> &str {
        &self.sub_type
    }

    fn receive(&mut self, envelope: &Envelope, _outbox: &mut Outbox) -> Result<(), DispatchError> {
        trace!(message_type = %envelope.message_type, sub_type = %envelope.sub_type, "ignored");
        Ok(())
    }
}

/// Routes envelopes of one type to receivers by sub type.
pub struct MessageDispatcher {
    message_type: MessageType,
    receivers: HashMap<String, Box<dyn Receiver>>,
    lifetime: Arc<dyn ConnectionLifetime>,
    queue: Arc<dyn OutboundQueue>,
}

impl MessageDispatcher {
    /// Create an empty dispatcher for `message_type`.
    pub fn new(
        message_type: MessageType,
        lifetime: Arc<dyn ConnectionLifetime>,
        queue: Arc<dyn OutboundQueue>,
    ) -> Self {
        Self { message_type, receivers: HashMap::new(), lifetime, queue }
    }

    /// Type this dispatcher handles.
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Whether a receiver exists for `sub_type`.
    pub fn handles(&self, sub_type: &str) -> bool {
        self.receivers.contains_key(sub_type)
    }

    /// Register a receiver.
    ///
    /// # Errors
    ///
    /// `DuplicateReceiver` if the sub type already has one.
    pub fn add_receiver(&mut self, receiver: Box<dyn Receiver>) -> Result<(), DispatchError> {
        let sub_type = receiver.sub_type().to_owned();
        if self.receivers.contains_key(&sub_type) {
            return Err(DispatchError::DuplicateReceiver {
                message_type: self.message_type,
                sub_type,
            });
        }
        self.receivers.insert(sub_type, receiver);
        Ok(())
    }

    /// Hand an envelope to its receiver.
    ///
    /// Returns whether a receiver was registered for the sub type.
    ///
    /// # Errors
    ///
    /// - `WrongType` if the envelope belongs to another dispatcher
    /// - whatever the receiver returns
    pub fn dispatch(&mut self, envelope: &Envelope, outbox: &mut Outbox) -> Result<bool, DispatchError> {
        if envelope.message_type != self.message_type {
            return Err(DispatchError::WrongType {
                expected: self.message_type,
                got: envelope.message_type,
            });
        }

        let Some(receiver) = self.receivers.get_mut(&envelope.sub_type) else {
            return Ok(false);
        };
        receiver.receive(envelope, outbox)?;

        if receiver.maybe_needs_connection() {
            let depth = self.queue.len();
            if depth > 0 {
                let linger = linger_duration(depth);
                debug!(depth, ?linger, sub_type = %envelope.sub_type, "holding connection for outbound queue");
                self.lifetime.acquire(LIFETIME_TAG);
                self.lifetime.release_after(LIFETIME_TAG, linger);
            }
        }
        Ok(true)
    }
}

/// One dispatcher per envelope type.
pub struct DispatcherSet {
    dispatchers: Vec<MessageDispatcher>,
}

impl DispatcherSet {
    /// Create the five empty dispatchers.
    pub fn new(lifetime: &Arc<dyn ConnectionLifetime>, queue: &Arc<dyn OutboundQueue>) -> Self {
        let dispatchers = MessageType::ALL
            .into_iter()
            .map(|t| MessageDispatcher::new(t, Arc::clone(lifetime), Arc::clone(queue)))
            .collect();
        Self { dispatchers }
    }

    /// Dispatcher for a type.
    pub fn get(&self, message_type: MessageType) -> Option<&MessageDispatcher> {
        self.dispatchers.iter().find(|d| d.message_type == message_type)
    }

    /// Register a receiver with the dispatcher for `message_type`.
    pub fn add_receiver(
        &mut self,
        message_type: MessageType,
        receiver: Box<dyn Receiver>,
    ) -> Result<(), DispatchError> {
        match self.dispatchers.iter_mut().find(|d| d.message_type == message_type) {
            Some(dispatcher) => dispatcher.add_receiver(receiver),
            None => Ok(()),
        }
    }

    /// Route an envelope by its type.
    pub fn dispatch(&mut self, envelope: &Envelope, outbox: &mut Outbox) -> Result<bool, DispatchError> {
        match self.dispatchers.iter_mut().find(|d| d.message_type == envelope.message_type) {
            Some(dispatcher) => dispatcher.dispatch(envelope, outbox),
            None => Ok(false),
        }
    }
}
