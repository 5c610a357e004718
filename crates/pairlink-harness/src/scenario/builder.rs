//! Scenario builder API.
//!
//! Provides a declarative API for constructing scenario tests that enforce
//! the Oracle Pattern.

use std::time::Duration;

use bytes::Bytes;
use pairlink_core::{
    DisconnectContext, Envelope, connection::SendMode, transport::TransportEvent,
};
use pairlink_session::SessionConfig;

use crate::{
    scenario::{OracleFn, World, world::demo_descriptor},
    sim_transport::SimTransportConfig,
};

/// One step of a scenario. Every step is followed by draining the worker.
#[derive(Debug, Clone)]
pub enum Step {
    /// `start` with fixed pairing keys
    Start {
        /// Affiliation id
        affiliation_id: Option<String>,
    },
    /// `resume` with the stored keys
    Resume,
    /// Handshake, peer connection, application channel
    Establish,
    /// Raw native event on the latest attempt
    Emit(TransportEvent),
    /// Envelope from the web client
    PeerSends(Envelope),
    /// Encoded message from the web client, not necessarily an envelope
    PeerSendsRaw(Vec<u8>),
    /// Several envelopes from the web client with their chunks shuffled
    PeerSendsShuffled(Vec<Envelope>),
    /// Message from this device
    Send(Bytes, SendMode),
    /// `stop`
    Stop(DisconnectContext),
    /// Set the outbound queue depth
    QueueDepth(usize),
    /// Park a wake-up for this session
    WakeUp(Duration),
    /// Fire every pending timer
    FireTimers,
    /// Advance the simulated clock
    Advance(Duration),
}

/// Scenario builder.
///
/// Construct a scenario by adding steps. Must call `.oracle()` to get a
/// RunnableScenario that can be executed.
pub struct Scenario {
    name: String,
    seed: u64,
    config: SessionConfig,
    transport: SimTransportConfig,
    steps: Vec<Step>,
}

impl Scenario {
    /// Create a new scenario with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            seed: 0,
            config: SessionConfig::default(),
            transport: SimTransportConfig::default(),
            steps: Vec::new(),
        }
    }

    /// Seed for the simulated environment.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Session configuration.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Behaviour of the simulated libraries.
    pub fn transport(mut self, transport: SimTransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Append a step.
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Start a new pairing.
    pub fn start(self) -> Self {
        self.step(Step::Start { affiliation_id: None })
    }

    /// Start and fully establish a connection.
    pub fn connected(self) -> Self {
        self.start().step(Step::Establish)
    }

    /// The web client sends an envelope.
    pub fn peer_sends(self, envelope: Envelope) -> Self {
        self.step(Step::PeerSends(envelope))
    }

    /// Stop the session.
    pub fn stop(self, reason: DisconnectContext) -> Self {
        self.step(Step::Stop(reason))
    }

    /// Set the oracle function and return a runnable scenario.
    ///
    /// The oracle is mandatory - you cannot run a scenario without
    /// verification.
    pub fn oracle(self, oracle: OracleFn) -> RunnableScenario {
        RunnableScenario { scenario: self, oracle }
    }
}

/// A scenario with an oracle function that can be executed.
pub struct RunnableScenario {
    scenario: Scenario,
    oracle: OracleFn,
}

impl RunnableScenario {
    /// Execute the scenario.
    ///
    /// Builds the world, applies every step, draining the worker after each,
    /// then runs the oracle on the final world.
    pub fn run(self) -> Result<(), String> {
        let Scenario { name, seed, config, transport, steps } = self.scenario;
        let mut world = World::new(demo_descriptor(), config, transport, seed)
            .map_err(|e| format!("Scenario '{name}': could not build session: {e}"))?;

        for (index, step) in steps.into_iter().enumerate() {
            apply(&mut world, step)
                .map_err(|e| format!("Scenario '{name}': step {index} failed: {e}"))?;
            world.settle();
        }

        (self.oracle)(&world).map_err(|e| format!("Scenario '{name}': {e}"))
    }
}

fn apply(world: &mut World, step: Step) -> Result<(), String> {
    match step {
        Step::Start { affiliation_id } => world
            .instance
            .start(vec![0x1d; 32], vec![0xa7; 32], affiliation_id)
            .map_err(|e| e.to_string()),
        Step::Resume => world.instance.resume(None).map_err(|e| e.to_string()),
        Step::Establish => {
            world.network.establish();
            Ok(())
        },
        Step::Emit(event) => {
            world.network.emit(event);
            Ok(())
        },
        Step::PeerSends(envelope) => {
            world.network.peer_send(&envelope);
            Ok(())
        },
        Step::PeerSendsRaw(message) => {
            world.network.peer_send_raw(&message);
            Ok(())
        },
        Step::PeerSendsShuffled(envelopes) => {
            let mut frames = Vec::new();
            for envelope in &envelopes {
                let message = envelope.encode().map_err(|e| e.to_string())?;
                frames.extend(world.network.peer_frames(&message));
            }
            world.env.shuffle(&mut frames);
            world.network.deliver_frames(frames);
            Ok(())
        },
        Step::Send(message, mode) => world.instance.send(message, mode).map_err(|e| e.to_string()),
        Step::Stop(reason) => world.instance.stop(reason).map_err(|e| e.to_string()),
        Step::QueueDepth(depth) => {
            world.queue.set(depth);
            Ok(())
        },
        Step::WakeUp(lifetime) => {
            let key_hash = world.instance.model().key_hash.clone();
            world.wakeups.schedule(&key_hash, None, lifetime);
            Ok(())
        },
        Step::FireTimers => {
            world.scheduler.fire_all();
            Ok(())
        },
        Step::Advance(duration) => {
            world.env.advance(duration);
            Ok(())
        },
    }
}
