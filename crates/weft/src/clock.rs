//! Time sources for the scheduler.
//!
//! All timer arithmetic goes through [`ActorClock`] so that tests can drive
//! deadlines deterministically with a [`ControlledClock`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic time source used by workers, timers and retry strategies.
pub trait ActorClock: Send + Sync {
    /// Milliseconds since an arbitrary fixed origin.
    fn millis(&self) -> u64;

    /// Nanoseconds since the same origin.
    fn nanos(&self) -> u64 {
        self.millis().saturating_mul(1_000_000)
    }
}

/// Production clock backed by [`Instant`].
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ActorClock for SystemClock {
    fn millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn nanos(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Manually advanced clock for deterministic tests.
///
/// Time only moves when [`advance`](ControlledClock::advance) or
/// [`set_millis`](ControlledClock::set_millis) is called.
pub struct ControlledClock {
    millis: AtomicU64,
}

impl ControlledClock {
    pub fn new() -> Self {
        Self {
            millis: AtomicU64::new(0),
        }
    }

    pub fn set_millis(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Default for ControlledClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ActorClock for ControlledClock {
    fn millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}
