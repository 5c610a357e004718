//! Pairlink session runtime
//!
//! Runs one paired session on a single worker: native transport callbacks,
//! control commands, and timers are all posted to the worker's queue and
//! handled strictly in order. The worker drives the sans-IO state machines of
//! `pairlink-core` and executes their actions against the transport.
//!
//! # Architecture
//!
//! ```text
//!  SessionInstance ──commands──┐
//!  EventSink (native threads) ─┼──> WorkerHandle ──> SessionWorker
//!  Scheduler (deadlines) ──────┘                       │
//!                                                      ├─ SessionStateManager
//!                                                      │    ├─ SessionConnectionContext
//!                                                      │    └─ PeerTransport
//!                                                      ├─ DispatcherSet
//!                                                      └─ UpdaterSet
//! ```
//!
//! Observers read the published [`SessionSnapshot`] and never touch worker
//! state.

pub mod config;
pub mod descriptor;
pub mod error;
pub mod instance;
pub mod listeners;
pub mod manager;
pub mod services;
pub mod wakeup;
pub mod worker;

pub use config::SessionConfig;
pub use descriptor::SessionDescriptor;
pub use error::SessionError;
pub use instance::{SessionBuilder, SessionInstance, SessionWorker};
pub use listeners::{ListenerId, Listeners, MessageListener, StateListener};
pub use manager::{SessionSnapshot, SessionStateManager, StopHandler};
pub use services::{HandlerSet, SessionOwner, SessionServices};
pub use wakeup::{PendingWakeUp, PendingWakeUps, WakeUpCoordinator};
pub use worker::{
    ChannelEventGate, Command, EventSink, Scheduler, TokioScheduler, WorkerEvent, WorkerHandle,
};
