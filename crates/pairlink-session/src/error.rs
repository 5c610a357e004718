//! Session errors.

use pairlink_core::error::{DispatchError, TransportError};
use thiserror::Error;

/// Errors surfaced by the session control surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Resume needs the peer's key and our stored private key
    #[error("session {0} has no stored keys, cannot resume")]
    MissingKeys(u64),

    /// Handler set registered two receivers for one pair
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Transport could not be created or started
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Worker queue is closed
    #[error("session worker has stopped")]
    WorkerGone,
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
