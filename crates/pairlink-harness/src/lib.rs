//! Deterministic simulation harness for Pairlink sessions.
//!
//! Scripted implementations of the transport, scheduler, and environment
//! traits so a whole session can be driven step by step, with every native
//! call and every externally visible effect recorded for verification.
//!
//! ```text
//!   Scenario steps ──> SimNetwork ──events──> SessionWorker
//!                          ^                       │
//!                          └────── calls ──────────┤
//!                                                  v
//!                                   EventLog (stopped, listeners, lifetime)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod model;
pub mod scenario;
pub mod sim_env;
pub mod sim_services;
pub mod sim_transport;

pub use model::{ModelEvent, ModelSession, Operation, StopReason};
pub use scenario::{OracleFn, RunnableScenario, Scenario, Step, World};
pub use sim_env::SimEnv;
pub use sim_services::{DemoHandlers, EventLog, LogEntry, ManualScheduler, SimQueue};
pub use sim_transport::{SimNetwork, SimTransportConfig, TransportCall};
