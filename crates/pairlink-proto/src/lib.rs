//! Wire format for the Pairlink session protocol.
//!
//! Two layers travel over every data channel between the mobile client and
//! its paired web client:
//!
//! ```text
//! ┌──────────────────────────── chunk ────────────────────────────┐
//! │ options (1) │ message id (4, BE) │ serial (4, BE) │ payload … │
//! └───────────────────────────────────────────────────────────────┘
//!                                                         │
//!                              reassembled by message id  ▼
//!                 ┌──────────── envelope (CBOR map) ─────────────┐
//!                 │ type │ subType │ args? │ data?               │
//!                 └──────────────────────────────────────────────┘
//! ```
//!
//! Chunks let a message exceed the transport's maximum message size. The
//! envelope is a self-describing map so that handlers can evolve their
//! `data` and `args` schemas without touching the engine.
//!
//! # Security
//!
//! Decoding never trusts a peer-supplied length. Envelope decoding checks
//! every field's shape before building an [`Envelope`], and the message size
//! ceiling ([`MAX_MESSAGE_SIZE`]) bounds what a reassembler will buffer.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod chunk;
pub mod envelope;
pub mod errors;
pub mod flags;
pub mod payloads;

pub use chunk::{CHUNK_HEADER_SIZE, Chunk, ChunkHeader, Chunker};
pub use envelope::{
    Args, Envelope, MessageType, SUB_TYPE_BATTERY_STATUS, SUB_TYPE_CONNECTION_DISCONNECT,
};
pub use errors::{ProtocolError, Result};
pub use flags::ChunkFlags;
pub use payloads::connection::{ConnectionDisconnect, DisconnectReason};

/// Default ceiling for a single reassembled message (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
