//! Worker queue and the message-passing boundary.
//!
//! Everything that changes session state is a [`WorkerEvent`] posted through
//! a [`WorkerHandle`]. The worker drains the queue in post order, so state is
//! only ever touched from one place.
//!
//! Native callbacks arrive on arbitrary threads through [`EventSink`]. Events
//! of one data channel pass a [`ChannelEventGate`] first: the gate's lock is
//! held while the event is stamped and posted, which fixes one order for
//! buffered-amount, state, and message callbacks racing on that channel.

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use pairlink_core::{
    ConnectionId, DisconnectContext, Envelope,
    connection::SendMode,
    transport::{ChannelKind, TransportEvent, TransportEvents},
};
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{Result, SessionError};

/// Control commands from the session's owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Pair with a new web client
    Start {
        /// Web client's permanent public key
        permanent_key: Vec<u8>,
        /// One-time auth token
        auth_token: Vec<u8>,
        /// Affiliation id of the pairing request
        affiliation_id: Option<String>,
    },
    /// Reconnect to an already paired web client
    Resume {
        /// Affiliation id of the wake-up
        affiliation_id: Option<String>,
    },
    /// Stop the session
    Stop(DisconnectContext),
    /// Send an encoded message to the peer
    Send {
        /// Encoded envelope
        message: Bytes,
        /// Queueing mode
        mode: SendMode,
    },
}

/// Items on the worker queue.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// Control command
    Command(Command),
    /// Native event for one connection attempt
    Transport {
        /// Connection the event belongs to
        connection_id: ConnectionId,
        /// Per-channel sequence number for channel events
        sequence: Option<u64>,
        /// The event
        event: TransportEvent,
    },
    /// Handshake deadline of a connection elapsed
    HandshakeDeadline {
        /// Connection the deadline was armed for
        connection_id: ConnectionId,
    },
    /// Updater output to send to the peer
    Update(Envelope),
    /// Stop draining the queue
    Shutdown,
}

/// Posts events to a session worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl WorkerHandle {
    /// Create a handle and the queue it feeds.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Post an event.
    ///
    /// # Errors
    ///
    /// `WorkerGone` if the worker was dropped.
    pub fn post(&self, event: WorkerEvent) -> Result<()> {
        self.tx.send(event).map_err(|_| SessionError::WorkerGone)
    }
}

/// Serializes the callbacks of one data channel.
#[derive(Debug, Default)]
pub struct ChannelEventGate {
    sequence: Mutex<u64>,
}

impl ChannelEventGate {
    /// Create a gate starting at sequence 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with the next sequence number while holding the gate.
    pub fn pass<T>(&self, f: impl FnOnce(u64) -> T) -> T {
        let mut sequence = self.sequence.lock().unwrap_or_else(PoisonError::into_inner);
        *sequence += 1;
        f(*sequence)
    }
}

/// Callback sink handed to the transport of one connection attempt.
#[derive(Debug)]
pub struct EventSink {
    connection_id: ConnectionId,
    closed: Arc<AtomicBool>,
    handle: WorkerHandle,
    signaling: ChannelEventGate,
    application: ChannelEventGate,
}

impl EventSink {
    /// Create a sink for `connection_id`.
    ///
    /// `closed` is the connection context's closed flag; once set, events are
    /// dropped without reaching the worker.
    pub fn new(connection_id: ConnectionId, closed: Arc<AtomicBool>, handle: WorkerHandle) -> Self {
        Self {
            connection_id,
            closed,
            handle,
            signaling: ChannelEventGate::new(),
            application: ChannelEventGate::new(),
        }
    }

    fn gate(&self, channel: ChannelKind) -> &ChannelEventGate {
        match channel {
            ChannelKind::Signaling => &self.signaling,
            ChannelKind::Application => &self.application,
        }
    }

    fn post(&self, sequence: Option<u64>, event: TransportEvent) {
        let connection_id = self.connection_id;
        if self.handle.post(WorkerEvent::Transport { connection_id, sequence, event }).is_err() {
            trace!(connection_id, "worker gone, dropping native event");
        }
    }
}

impl TransportEvents for EventSink {
    fn emit(&self, event: TransportEvent) {
        if self.closed.load(Ordering::Acquire) {
            trace!(connection_id = self.connection_id, ?event, "connection closed, dropping native event");
            return;
        }

        match event.channel() {
            Some(channel) => self.gate(channel).pass(|sequence| self.post(Some(sequence), event)),
            None => self.post(None, event),
        }
    }
}

/// Runs delayed worker events.
pub trait Scheduler: Send + Sync {
    /// Post `event` through `handle` after `delay`.
    fn schedule(&self, delay: Duration, event: WorkerEvent, handle: WorkerHandle);
}

/// Scheduler backed by tokio timers. Must be used inside a runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, event: WorkerEvent, handle: WorkerHandle) {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if handle.post(event).is_err() {
                trace!("worker gone before timer fired");
            }
        });
    }
}
