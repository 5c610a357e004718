//! Pairlink session protocol core logic
//!
//! Pure state machine logic for a paired mobile/web-client session,
//! decoupled from I/O, threads, and timers.
//!
//! # Architecture
//!
//! Every component here is a deterministic state machine. Inputs (native
//! transport events, inbound chunks, control commands) are passed in together
//! with the current time, and the component answers with declarative actions
//! describing the effects it wants: create a peer connection, send these
//! frames, transition the session to Error. The session worker in
//! `pairlink-session` executes those actions against real transports, and the
//! simulation harness executes them against scripted ones.
//!
//! # Components
//!
//! - [`state`]: Session state enum and the pure transition function
//! - [`connection`]: Per-connection context (handshake phases, channels)
//! - [`reassembly`]: Chunk reassembly keyed by message id
//! - [`flow_control`]: Unbounded flow-controlled sender
//! - [`dispatch`]: Typed envelope dispatch to receivers and updaters
//! - [`disconnect`]: Who disconnected and why
//! - [`transport`]: Traits for the handshake library and peer connection
//! - [`mod@env`]: Environment abstraction (time)
//! - [`error`]: Error types

pub mod connection;
pub mod disconnect;
pub mod dispatch;
pub mod env;
pub mod error;
pub mod flow_control;
pub mod reassembly;
pub mod state;
pub mod transport;

pub use connection::{ConnectionAction, ConnectionConfig, SessionConnectionContext};
pub use disconnect::{DisconnectContext, DisconnectInitiator};
pub use pairlink_proto::{DisconnectReason, Envelope, MessageType};
pub use state::{ConnectionId, SessionEvent, SessionState, SessionStateKind};
