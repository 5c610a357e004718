//! Pending wake-ups.
//!
//! A push message from the web client asks the device to start a session.
//! When it cannot be served right away it is parked here until the session
//! service picks it up or it expires. While a wake-up is pending for a
//! session, that session is not reported as stopped when it comes to rest,
//! since it is about to be started again.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use pairlink_core::env::Environment;
use tracing::{debug, trace};

/// Lifetime of a wake-up from a push message.
pub const DEFAULT_WAKEUP_LIFETIME: Duration = Duration::from_secs(60);

/// Lifetime of a wake-up scheduled while a session disconnects to restart.
pub const DISCONNECT_WAKEUP_LIFETIME: Duration = Duration::from_secs(20);

/// Answers whether a session is about to be woken up again.
pub trait WakeUpCoordinator: Send + Sync {
    /// Whether an unexpired wake-up exists for the session key hash.
    fn has_pending(&self, key_hash: &str) -> bool;
}

/// A parked wake-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWakeUp {
    /// Session the wake-up is for
    pub key_hash: String,
    /// Affiliation id from the push message
    pub affiliation_id: Option<String>,
    /// When the wake-up stops being valid
    pub expires_at: Instant,
}

/// In-memory wake-up queue.
pub struct PendingWakeUps {
    env: Arc<dyn Environment>,
    pending: Mutex<Vec<PendingWakeUp>>,
}

impl PendingWakeUps {
    /// Create an empty queue reading time from `env`.
    pub fn new(env: Arc<dyn Environment>) -> Self {
        Self { env, pending: Mutex::new(Vec::new()) }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, Vec<PendingWakeUp>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park a wake-up. Replaces an earlier one for the same session.
    pub fn schedule(&self, key_hash: &str, affiliation_id: Option<String>, lifetime: Duration) {
        let expires_at = self.env.now() + lifetime;
        let mut pending = self.pending();
        pending.retain(|w| w.key_hash != key_hash);
        pending.push(PendingWakeUp { key_hash: key_hash.to_owned(), affiliation_id, expires_at });
        debug!(key_hash, ?lifetime, "wake-up scheduled");
    }

    /// Whether an unexpired wake-up exists at `now`.
    pub fn has_pending_at(&self, key_hash: &str, now: Instant) -> bool {
        self.pending().iter().any(|w| w.key_hash == key_hash && w.expires_at > now)
    }

    /// Remove every wake-up. Returns the unexpired ones, oldest first.
    pub fn take_due(&self, now: Instant) -> Vec<PendingWakeUp> {
        let (due, expired): (Vec<_>, Vec<_>) =
            std::mem::take(&mut *self.pending()).into_iter().partition(|w| w.expires_at > now);
        for wakeup in &expired {
            trace!(key_hash = %wakeup.key_hash, "discarding expired wake-up");
        }
        due
    }

    /// Drop every wake-up.
    pub fn discard_all(&self) {
        self.pending().clear();
    }

    /// Number of parked wake-ups, expired or not.
    pub fn len(&self) -> usize {
        self.pending().len()
    }

    /// Whether nothing is parked.
    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }
}

impl WakeUpCoordinator for PendingWakeUps {
    fn has_pending(&self, key_hash: &str) -> bool {
        self.has_pending_at(key_hash, self.env.now())
    }
}
