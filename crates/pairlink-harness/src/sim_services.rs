//! Recording collaborators for simulated sessions.
//!
//! Everything observable from outside a session lands in one shared
//! [`EventLog`], so tests can assert on the relative order of stop
//! notifications, listener callbacks, and connection lifetime calls.

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use ciborium::Value;
use pairlink_core::{
    DisconnectContext, Envelope, MessageType, SessionStateKind,
    dispatch::{
        ConnectionLifetime, IgnoreReceiver, OutboundQueue, Outbox, Receiver, UpdateSink, Updater,
    },
    error::DispatchError,
};
use pairlink_proto::SUB_TYPE_BATTERY_STATUS;
use pairlink_session::{
    HandlerSet, MessageListener, SessionDescriptor, SessionOwner, StateListener,
    worker::{Scheduler, WorkerEvent, WorkerHandle},
};

/// Name of the typing updater.
pub const TYPING: &str = "typing";

/// Something a session did that is visible from outside.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEntry {
    /// Owner got the stopped notification
    Stopped(DisconnectContext),
    /// State listener was called
    StateChanged {
        /// Previous state
        old: SessionStateKind,
        /// New state
        new: SessionStateKind,
    },
    /// Message listener was called
    Message(Envelope),
    /// Network connection acquired
    Acquired(String),
    /// Network connection release scheduled
    Released {
        /// Lifetime tag
        tag: String,
        /// Linger before release
        linger: Duration,
    },
    /// Updater registered
    UpdaterRegistered(String),
    /// Updater unregistered
    UpdaterUnregistered(String),
}

/// Shared, ordered record of [`LogEntry`]s.
#[derive(Clone, Default)]
pub struct EventLog {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl EventLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry.
    pub fn push(&self, entry: LogEntry) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).push(entry);
    }

    /// Snapshot of all entries.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of entries matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&LogEntry) -> bool) -> usize {
        self.entries().iter().filter(|e| predicate(e)).count()
    }

    /// Position of the first entry matching `predicate`.
    pub fn position(&self, predicate: impl Fn(&LogEntry) -> bool) -> Option<usize> {
        self.entries().iter().position(predicate)
    }

    /// Reasons of every stopped notification, in order.
    pub fn stopped(&self) -> Vec<DisconnectContext> {
        self.entries()
            .into_iter()
            .filter_map(|e| match e {
                LogEntry::Stopped(reason) => Some(reason),
                _ => None,
            })
            .collect()
    }

    /// States reported to listeners, in order.
    pub fn states(&self) -> Vec<SessionStateKind> {
        self.entries()
            .into_iter()
            .filter_map(|e| match e {
                LogEntry::StateChanged { new, .. } => Some(new),
                _ => None,
            })
            .collect()
    }
}

/// Connection lifetime that records acquire and release.
pub struct RecordingLifetime {
    log: EventLog,
}

impl RecordingLifetime {
    /// Record into `log`.
    pub fn new(log: EventLog) -> Self {
        Self { log }
    }
}

impl ConnectionLifetime for RecordingLifetime {
    fn acquire(&self, tag: &str) {
        self.log.push(LogEntry::Acquired(tag.to_owned()));
    }

    fn release_after(&self, tag: &str, linger: Duration) {
        self.log.push(LogEntry::Released { tag: tag.to_owned(), linger });
    }
}

/// Outbound queue whose depth the test sets.
#[derive(Debug, Default)]
pub struct SimQueue {
    depth: AtomicUsize,
}

impl SimQueue {
    /// Set the reported depth.
    pub fn set(&self, depth: usize) {
        self.depth.store(depth, Ordering::SeqCst);
    }
}

impl OutboundQueue for SimQueue {
    fn len(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

/// Session owner that records stopped notifications.
pub struct RecordingOwner {
    log: EventLog,
}

impl RecordingOwner {
    /// Record into `log`.
    pub fn new(log: EventLog) -> Self {
        Self { log }
    }
}

impl SessionOwner for RecordingOwner {
    fn on_stopped(&self, _session: &SessionDescriptor, reason: &DisconnectContext) {
        self.log.push(LogEntry::Stopped(*reason));
    }
}

/// State and message listener that records callbacks.
pub struct RecordingListener {
    log: EventLog,
}

impl RecordingListener {
    /// Record into `log`.
    pub fn new(log: EventLog) -> Self {
        Self { log }
    }
}

impl StateListener for RecordingListener {
    fn on_state_changed(&self, old: SessionStateKind, new: SessionStateKind) {
        self.log.push(LogEntry::StateChanged { old, new });
    }
}

impl MessageListener for RecordingListener {
    fn on_message(&self, envelope: &Envelope) {
        self.log.push(LogEntry::Message(envelope.clone()));
    }
}

/// Answers `request/echo` with `response/echo` carrying the same data.
///
/// May leave messages in the outbound queue.
struct EchoReceiver;

impl Receiver for EchoReceiver {
    fn sub_type(&self) -> &str {
        "echo"
    }

    fn receive(&mut self, envelope: &Envelope, outbox: &mut Outbox) -> Result<(), DispatchError> {
        let mut reply = Envelope::new(MessageType::Response, "echo");
        if let Some(data) = envelope.data.clone() {
            reply = reply.with_data(data);
        }
        outbox.reply(reply);
        Ok(())
    }

    fn maybe_needs_connection(&self) -> bool {
        true
    }
}

/// Answers `request/typing` with a snapshot and activates the typing updater.
struct TypingReceiver;

impl Receiver for TypingReceiver {
    fn sub_type(&self) -> &str {
        TYPING
    }

    fn receive(&mut self, _envelope: &Envelope, outbox: &mut Outbox) -> Result<(), DispatchError> {
        outbox.reply(Envelope::new(MessageType::Response, TYPING).with_data(Value::Array(vec![])));
        outbox.activate(TYPING);
        Ok(())
    }
}

/// `request/profile`: requires an `id` argument and map data.
struct ProfileReceiver;

impl Receiver for ProfileReceiver {
    fn sub_type(&self) -> &str {
        "profile"
    }

    fn receive(&mut self, envelope: &Envelope, outbox: &mut Outbox) -> Result<(), DispatchError> {
        let Some(id) = envelope.arg_str("id") else {
            return Err(DispatchError::MissingField { sub_type: "profile".into(), field: "id".into() });
        };
        if !matches!(envelope.data, Some(Value::Map(_))) {
            return Err(DispatchError::Decode {
                sub_type: "profile".into(),
                reason: "data is not a map".into(),
            });
        }
        outbox.reply(Envelope::new(MessageType::Response, "profile").with_arg("id", id));
        Ok(())
    }
}

/// Streams typing notifications while registered.
struct TypingUpdater {
    log: EventLog,
    sink: Option<Arc<dyn UpdateSink>>,
}

impl Updater for TypingUpdater {
    fn name(&self) -> &str {
        TYPING
    }

    fn register(&mut self, sink: Arc<dyn UpdateSink>) {
        self.log.push(LogEntry::UpdaterRegistered(TYPING.into()));
        sink.emit(Envelope::new(MessageType::Update, TYPING).with_arg("active", true));
        self.sink = Some(sink);
    }

    fn unregister(&mut self) {
        if self.sink.take().is_some() {
            self.log.push(LogEntry::UpdaterUnregistered(TYPING.into()));
        }
    }
}

/// Small handler set exercising every dispatch path.
pub struct DemoHandlers {
    log: EventLog,
}

impl DemoHandlers {
    /// Updaters record into `log`.
    pub fn new(log: EventLog) -> Self {
        Self { log }
    }
}

impl HandlerSet for DemoHandlers {
    fn receivers(&self, _session: &SessionDescriptor) -> Vec<(MessageType, Box<dyn Receiver>)> {
        vec![
            (MessageType::Request, Box::new(EchoReceiver)),
            (MessageType::Request, Box::new(TypingReceiver)),
            (MessageType::Request, Box::new(ProfileReceiver)),
            (MessageType::Request, Box::new(IgnoreReceiver::new(SUB_TYPE_BATTERY_STATUS))),
        ]
    }

    fn updaters(&self, _session: &SessionDescriptor) -> Vec<Box<dyn Updater>> {
        vec![Box::new(TypingUpdater { log: self.log.clone(), sink: None })]
    }
}

/// Scheduler that holds timers until the test fires them.
#[derive(Default)]
pub struct ManualScheduler {
    timers: Mutex<Vec<(Duration, WorkerEvent, WorkerHandle)>>,
}

impl ManualScheduler {
    /// Create a scheduler with no timers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays of the pending timers.
    pub fn pending(&self) -> Vec<Duration> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner).iter().map(|(d, ..)| *d).collect()
    }

    /// Post every pending timer's event. Returns how many fired.
    pub fn fire_all(&self) -> usize {
        let timers = std::mem::take(&mut *self.timers.lock().unwrap_or_else(PoisonError::into_inner));
        let fired = timers.len();
        for (_, event, handle) in timers {
            if handle.post(event).is_err() {
                tracing::debug!("worker gone, timer dropped");
            }
        }
        fired
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, event: WorkerEvent, handle: WorkerHandle) {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner).push((delay, event, handle));
    }
}
