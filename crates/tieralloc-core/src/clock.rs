//! Tick sources for expiry decisions made by the background reclaimer.
//!
//! Allocation and access calls carry their own `now`; only the reclaimer
//! needs to ask what time it is.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic tick source.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> u64;
}

/// Milliseconds elapsed since construction.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX - 1)
    }
}

/// Externally driven clock. Clones share the same tick.
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    tick: Arc<AtomicU64>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: u64) -> Self {
        Self {
            tick: Arc::new(AtomicU64::new(start)),
        }
    }

    pub fn set(&self, tick: u64) {
        self.tick.store(tick, Ordering::Release);
    }

    pub fn advance(&self, ticks: u64) -> u64 {
        self.tick.fetch_add(ticks, Ordering::AcqRel) + ticks
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.tick.load(Ordering::Acquire)
    }
}
