//! Session control surface and worker.
//!
//! [`SessionBuilder::build`] wires a session and returns its two halves:
//!
//! - [`SessionInstance`], the cloneable control surface. Commands are posted
//!   to the worker; queries read the published snapshot.
//! - [`SessionWorker`], which owns all session state and must be driven,
//!   either with [`SessionWorker::run`] on a tokio runtime or step by step
//!   with [`SessionWorker::run_until_idle`].

use std::{ops::ControlFlow, sync::Arc};

use bytes::Bytes;
use pairlink_core::{
    DisconnectContext, Envelope, SessionEvent, SessionStateKind,
    connection::SendMode,
    dispatch::{DispatcherSet, Outbox, UpdateSink, UpdaterSet},
    transport::HandshakeKeys,
};
use pairlink_proto::ConnectionDisconnect;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use crate::{
    config::SessionConfig,
    descriptor::SessionDescriptor,
    error::{Result, SessionError},
    listeners::Listeners,
    manager::{SessionSnapshot, SessionStateManager, StopHandler},
    services::{SessionOwner, SessionServices},
    worker::{Command, Scheduler, TokioScheduler, WorkerEvent, WorkerHandle},
};

/// Wires a session.
pub struct SessionBuilder {
    descriptor: SessionDescriptor,
    services: SessionServices,
    config: SessionConfig,
    scheduler: Arc<dyn Scheduler>,
    listeners: Listeners,
    session_id: Option<u64>,
}

impl SessionBuilder {
    /// Start building a session for `descriptor`.
    pub fn new(descriptor: SessionDescriptor, services: SessionServices) -> Self {
        Self {
            descriptor,
            services,
            config: SessionConfig::default(),
            scheduler: Arc::new(TokioScheduler),
            listeners: Listeners::new(),
            session_id: None,
        }
    }

    /// Id used in logs and errors. Defaults to the descriptor's model id.
    pub fn session_id(mut self, session_id: u64) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Use a non-default configuration.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom timer source.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Use a pre-populated listener registry.
    pub fn listeners(mut self, listeners: Listeners) -> Self {
        self.listeners = listeners;
        self
    }

    /// Register the handlers and create both halves of the session.
    ///
    /// # Errors
    ///
    /// `Dispatch` if the handler set registers two receivers for one
    /// `(type, subType)` pair.
    pub fn build(self) -> Result<(SessionInstance, SessionWorker)> {
        let Self { descriptor, services, config, scheduler, listeners, session_id } = self;
        let session_id = session_id.unwrap_or(descriptor.model_id);
        let descriptor = Arc::new(descriptor);

        let mut dispatchers = DispatcherSet::new(&services.lifetime, &services.queue);
        for (message_type, receiver) in services.handlers.receivers(&descriptor) {
            dispatchers.add_receiver(message_type, receiver)?;
        }
        let updaters = UpdaterSet::new(services.handlers.updaters(&descriptor));

        let (handle, rx) = WorkerHandle::channel();
        let (manager, snapshot) = SessionStateManager::new(
            session_id,
            Arc::clone(&descriptor),
            config,
            &services,
            scheduler,
            handle.clone(),
            listeners.clone(),
        );
        let update_sink: Arc<dyn UpdateSink> = Arc::new(WorkerUpdateSink { handle: handle.clone() });

        let instance = SessionInstance {
            session_id,
            descriptor: Arc::clone(&descriptor),
            handle,
            snapshot,
            listeners: listeners.clone(),
        };
        let worker = SessionWorker {
            session_id,
            descriptor,
            rx,
            manager,
            dispatchers,
            updaters,
            update_sink,
            owner: services.owner,
            listeners,
        };
        debug!(session_id, model_id = instance.descriptor.model_id, "session built");
        Ok((instance, worker))
    }
}

/// Control surface of one session.
#[derive(Clone)]
pub struct SessionInstance {
    session_id: u64,
    descriptor: Arc<SessionDescriptor>,
    handle: WorkerHandle,
    snapshot: watch::Receiver<SessionSnapshot>,
    listeners: Listeners,
}

impl SessionInstance {
    /// Process-unique session id.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Pairing record of this session.
    pub fn model(&self) -> &SessionDescriptor {
        &self.descriptor
    }

    /// Listener registry of this session.
    pub fn listeners(&self) -> &Listeners {
        &self.listeners
    }

    /// Pair with a new web client.
    ///
    /// # Errors
    ///
    /// `WorkerGone` if the worker was dropped.
    pub fn start(
        &self,
        permanent_key: Vec<u8>,
        auth_token: Vec<u8>,
        affiliation_id: Option<String>,
    ) -> Result<()> {
        self.command(Command::Start { permanent_key, auth_token, affiliation_id })
    }

    /// Reconnect to the paired web client.
    ///
    /// # Errors
    ///
    /// - `MissingKeys` if the pairing has no stored keys; state is unchanged
    /// - `WorkerGone` if the worker was dropped
    pub fn resume(&self, affiliation_id: Option<String>) -> Result<()> {
        if self.descriptor.trusted_keys().is_none() {
            error!(session_id = self.session_id, "cannot resume session without stored keys");
            return Err(SessionError::MissingKeys(self.session_id));
        }
        self.command(Command::Resume { affiliation_id })
    }

    /// Stop the session.
    ///
    /// # Errors
    ///
    /// `WorkerGone` if the worker was dropped.
    pub fn stop(&self, reason: DisconnectContext) -> Result<()> {
        self.command(Command::Stop(reason))
    }

    /// Send an encoded message to the peer.
    ///
    /// # Errors
    ///
    /// `WorkerGone` if the worker was dropped.
    pub fn send(&self, message: Bytes, mode: SendMode) -> Result<()> {
        self.command(Command::Send { message, mode })
    }

    /// Let the worker's run loop return.
    ///
    /// # Errors
    ///
    /// `WorkerGone` if the worker was dropped.
    pub fn shutdown(&self) -> Result<()> {
        self.handle.post(WorkerEvent::Shutdown)
    }

    /// Whether the session is connecting or connected.
    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    /// Current state.
    pub fn state(&self) -> SessionStateKind {
        self.snapshot.borrow().state
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that sees every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Affiliation id of the current or last start.
    pub fn affiliation(&self) -> Option<String> {
        self.snapshot.borrow().affiliation_id.clone()
    }

    /// Whether a start for `affiliation_id` requires a restart.
    ///
    /// True when the session is not running, or when an affiliation id is
    /// given and differs from the current one.
    pub fn needs_restart(&self, affiliation_id: Option<&str>) -> bool {
        let snapshot = self.snapshot.borrow();
        if !snapshot.state.is_running() {
            return true;
        }
        affiliation_id.is_some_and(|id| snapshot.affiliation_id.as_deref() != Some(id))
    }

    fn command(&self, command: Command) -> Result<()> {
        debug!(session_id = self.session_id, "posting command");
        self.handle.post(WorkerEvent::Command(command))
    }
}

struct WorkerUpdateSink {
    handle: WorkerHandle,
}

impl UpdateSink for WorkerUpdateSink {
    fn emit(&self, envelope: Envelope) {
        if self.handle.post(WorkerEvent::Update(envelope)).is_err() {
            debug!("worker gone, dropping update");
        }
    }
}

struct WorkerStop<'a> {
    descriptor: &'a SessionDescriptor,
    updaters: &'a mut UpdaterSet,
    owner: &'a dyn SessionOwner,
}

impl StopHandler for WorkerStop<'_> {
    fn on_teardown(&mut self) {
        self.updaters.unregister_all();
    }

    fn on_stopped(&mut self, reason: &DisconnectContext) {
        self.updaters.unregister_all();
        self.owner.on_stopped(self.descriptor, reason);
    }
}

/// Owns and drives all state of one session.
pub struct SessionWorker {
    session_id: u64,
    descriptor: Arc<SessionDescriptor>,
    rx: mpsc::UnboundedReceiver<WorkerEvent>,
    manager: SessionStateManager,
    dispatchers: DispatcherSet,
    updaters: UpdaterSet,
    update_sink: Arc<dyn UpdateSink>,
    owner: Arc<dyn SessionOwner>,
    listeners: Listeners,
}

impl SessionWorker {
    /// State manager, for inspection.
    pub fn manager(&self) -> &SessionStateManager {
        &self.manager
    }

    /// Whether the named updater is registered.
    pub fn is_updater_registered(&self, name: &str) -> bool {
        self.updaters.is_registered(name)
    }

    /// Handle one event.
    ///
    /// Returns `Break` on shutdown.
    pub fn handle(&mut self, event: WorkerEvent) -> ControlFlow<()> {
        let mut stop = WorkerStop {
            descriptor: &self.descriptor,
            updaters: &mut self.updaters,
            owner: &*self.owner,
        };

        match event {
            WorkerEvent::Command(Command::Start { permanent_key, auth_token, affiliation_id }) => {
                info!(session_id = self.session_id, ?affiliation_id, "starting session");
                self.manager.set_affiliation(affiliation_id);
                self.manager.connect(HandshakeKeys::Initiator { permanent_key, auth_token }, &mut stop);
            },
            WorkerEvent::Command(Command::Resume { affiliation_id }) => {
                let Some((peer_key, private_key)) = self.descriptor.trusted_keys() else {
                    error!(session_id = self.session_id, "cannot resume session without stored keys");
                    return ControlFlow::Continue(());
                };
                let keys = HandshakeKeys::TrustedPeer {
                    peer_key: peer_key.to_vec(),
                    private_key: private_key.to_vec(),
                };
                info!(session_id = self.session_id, ?affiliation_id, "resuming session");
                self.manager.set_affiliation(affiliation_id);
                self.manager.connect(keys, &mut stop);
            },
            WorkerEvent::Command(Command::Stop(reason)) => {
                info!(session_id = self.session_id, %reason, "stopping session");
                stop.updaters.unregister_all();
                self.manager.apply(SessionEvent::Disconnect(reason), &mut stop);
            },
            WorkerEvent::Command(Command::Send { message, mode }) => {
                self.manager.send_message(&message, mode, &mut stop);
            },
            WorkerEvent::Transport { connection_id, sequence, event } => {
                trace!(session_id = self.session_id, connection_id, ?sequence, "native event");
                self.manager.handle_transport(connection_id, event, &mut stop);
            },
            WorkerEvent::HandshakeDeadline { connection_id } => {
                self.manager.handshake_deadline(connection_id, &mut stop);
            },
            WorkerEvent::Update(envelope) => {
                self.manager.send_envelope(&envelope, SendMode::Async, &mut stop);
            },
            WorkerEvent::Shutdown => return ControlFlow::Break(()),
        }

        self.drain_inbox();
        ControlFlow::Continue(())
    }

    /// Handle every queued event without waiting.
    ///
    /// Returns the number of events handled.
    pub fn run_until_idle(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.rx.try_recv() {
            handled += 1;
            if self.handle(event).is_break() {
                break;
            }
        }
        handled
    }

    /// Drain the queue until shutdown.
    pub async fn run(mut self) {
        let span = info_span!("session", session_id = self.session_id);
        async move {
            while let Some(event) = self.rx.recv().await {
                if self.handle(event).is_break() {
                    break;
                }
            }
            debug!("session worker finished");
        }
        .instrument(span)
        .await;
    }

    /// Run the worker on the current tokio runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    fn drain_inbox(&mut self) {
        for (connection_id, envelope) in self.manager.take_inbox() {
            if self.manager.live_connection_id() != Some(connection_id) {
                debug!(session_id = self.session_id, connection_id, "dropping message of closed connection");
                continue;
            }
            self.listeners.notify_message(&envelope);

            if envelope.is_connection_disconnect() {
                self.peer_disconnected(&envelope);
                continue;
            }
            self.dispatch(&envelope);
        }
    }

    fn peer_disconnected(&mut self, envelope: &Envelope) {
        let mut stop = WorkerStop {
            descriptor: &self.descriptor,
            updaters: &mut self.updaters,
            owner: &*self.owner,
        };
        match ConnectionDisconnect::from_envelope(envelope) {
            Ok(ConnectionDisconnect { reason }) => {
                info!(session_id = self.session_id, %reason, "peer disconnected");
                stop.updaters.unregister_all();
                self.manager.apply(SessionEvent::Disconnect(DisconnectContext::by_peer(reason)), &mut stop);
            },
            Err(e) => {
                warn!(session_id = self.session_id, error = %e, "ignoring invalid connectionDisconnect");
            },
        }
    }

    fn dispatch(&mut self, envelope: &Envelope) {
        let mut outbox = Outbox::new();
        let result = self.dispatchers.dispatch(envelope, &mut outbox);

        let mut stop = WorkerStop {
            descriptor: &self.descriptor,
            updaters: &mut self.updaters,
            owner: &*self.owner,
        };
        match result {
            Ok(true) => {},
            Ok(false) => {
                warn!(
                    session_id = self.session_id,
                    message_type = %envelope.message_type,
                    sub_type = %envelope.sub_type,
                    "no receiver, dropping message"
                );
            },
            Err(e) if e.is_structural() => {
                self.manager.apply(SessionEvent::Error(format!("Protocol error: {e}")), &mut stop);
                return;
            },
            Err(e) => {
                warn!(session_id = self.session_id, error = %e, "could not handle message");
            },
        }

        for reply in outbox.take_replies() {
            self.manager.send_envelope(&reply, SendMode::Async, &mut stop);
        }
        for name in outbox.take_activations() {
            stop.updaters.activate(&name, &self.update_sink);
        }
    }
}
