//! Simulated environment: virtual clock plus seeded randomness.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use pairlink_core::env::Environment;
use rand::{SeedableRng, seq::SliceRandom};
use rand_chacha::ChaCha8Rng;

/// Deterministic environment. Clones share the clock and the RNG.
#[derive(Clone)]
pub struct SimEnv {
    now: Arc<Mutex<Instant>>,
    rng: Arc<Mutex<ChaCha8Rng>>,
}

impl SimEnv {
    /// Create an environment with a fixed seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += duration;
    }

    /// Shuffle `items` with the seeded RNG.
    pub fn shuffle<T>(&self, items: &mut [T]) {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        items.shuffle(&mut *rng);
    }
}

impl Environment for SimEnv {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
