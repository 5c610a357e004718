//! Payloads the engine itself interprets.
//!
//! Everything else in `data` belongs to external handlers and stays an
//! opaque [`ciborium::Value`].

pub mod connection;
