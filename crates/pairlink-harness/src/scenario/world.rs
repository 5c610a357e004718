//! World state for scenario execution.
//!
//! The World wires one session to the simulated network, records everything
//! it does, and provides oracle verification helpers.

use std::sync::Arc;

use pairlink_core::{ConnectionId, Envelope, SessionState, SessionStateKind};
use pairlink_session::{
    Listeners, PendingWakeUps, SessionBuilder, SessionConfig, SessionDescriptor, SessionError,
    SessionInstance, SessionServices, SessionWorker, StateListener,
};

use crate::{
    sim_env::SimEnv,
    sim_services::{
        DemoHandlers, EventLog, ManualScheduler, RecordingLifetime, RecordingListener,
        RecordingOwner, SimQueue,
    },
    sim_transport::{SimNetwork, SimTransportConfig},
};

/// Descriptor of the simulated pairing.
pub fn demo_descriptor() -> SessionDescriptor {
    SessionDescriptor {
        model_id: 1,
        key_hash: "5f2e1a".into(),
        host: "relay.pairlink.test".into(),
        port: 443,
        server_key: Some(vec![0x5e; 32]),
        peer_key: Some(vec![0x1d; 32]),
        private_key: Some(vec![0x2b; 32]),
        push_token: Some("push-token".into()),
    }
}

/// One session plus everything around it.
pub struct World {
    /// Control surface
    pub instance: SessionInstance,
    /// Worker, driven step by step
    pub worker: SessionWorker,
    /// Simulated libraries and web client
    pub network: SimNetwork,
    /// Shared record of observable effects
    pub log: EventLog,
    /// Outbound queue depth
    pub queue: Arc<SimQueue>,
    /// Pending wake-ups
    pub wakeups: Arc<PendingWakeUps>,
    /// Handshake deadlines
    pub scheduler: Arc<ManualScheduler>,
    /// Clock and randomness
    pub env: SimEnv,
}

impl World {
    /// Build a world for `descriptor`.
    ///
    /// # Errors
    ///
    /// Whatever building the session returns.
    pub fn new(
        descriptor: SessionDescriptor,
        config: SessionConfig,
        transport: SimTransportConfig,
        seed: u64,
    ) -> Result<Self, SessionError> {
        let env = SimEnv::with_seed(seed);
        let network = SimNetwork::new(transport);
        let log = EventLog::new();
        let queue = Arc::new(SimQueue::default());
        let wakeups = Arc::new(PendingWakeUps::new(Arc::new(env.clone())));
        let scheduler = Arc::new(ManualScheduler::new());

        let listeners = Listeners::new();
        let recorder = Arc::new(RecordingListener::new(log.clone()));
        listeners.add_state_listener(Arc::clone(&recorder) as Arc<dyn StateListener>);
        listeners.add_message_listener(recorder);

        let services = SessionServices {
            transport: network.factory(),
            handlers: Arc::new(DemoHandlers::new(log.clone())),
            lifetime: Arc::new(RecordingLifetime::new(log.clone())),
            queue: Arc::clone(&queue) as _,
            wakeups: Arc::clone(&wakeups) as _,
            owner: Arc::new(RecordingOwner::new(log.clone())),
            env: Arc::new(env.clone()),
        };
        let (instance, worker) = SessionBuilder::new(descriptor, services)
            .config(config)
            .scheduler(Arc::clone(&scheduler) as _)
            .listeners(listeners)
            .build()?;

        Ok(Self { instance, worker, network, log, queue, wakeups, scheduler, env })
    }

    /// Build a world with defaults.
    ///
    /// # Errors
    ///
    /// Whatever building the session returns.
    pub fn with_seed(seed: u64) -> Result<Self, SessionError> {
        Self::new(demo_descriptor(), SessionConfig::default(), SimTransportConfig::default(), seed)
    }

    /// Handle everything queued on the worker.
    pub fn settle(&mut self) -> usize {
        self.worker.run_until_idle()
    }

    /// Current state as seen by the manager.
    pub fn state(&self) -> &SessionState {
        self.worker.manager().state()
    }

    /// Current state as seen by observers.
    pub fn state_kind(&self) -> SessionStateKind {
        self.instance.state()
    }

    /// Id of the most recent connection attempt.
    pub fn last_connection_id(&self) -> ConnectionId {
        self.worker.manager().last_connection_id()
    }

    /// Envelopes the session sent on the latest attempt.
    pub fn sent(&self) -> Vec<Envelope> {
        self.network.last_sent_envelopes()
    }

    /// Whether the session is connected and the snapshot agrees.
    pub fn is_connected(&self) -> bool {
        matches!(self.state(), SessionState::Connected { .. })
            && self.state_kind() == SessionStateKind::Connected
    }

    /// Diagnostic of the Error state.
    pub fn error_reason(&self) -> Option<&str> {
        self.state().error_reason()
    }
}
