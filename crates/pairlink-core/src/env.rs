//! Environment abstraction.
//!
//! State machines take `now` as a parameter. Whoever drives them reads it from
//! an [`Environment`] so simulations can substitute a virtual clock.

use std::time::Instant;

/// Source of time for drivers.
pub trait Environment: Send + Sync {
    /// Current time.
    fn now(&self) -> Instant;
}

/// Wall-clock environment used in production.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl Environment for SystemEnv {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
