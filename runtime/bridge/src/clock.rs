//! Time sources for clock subscriptions.
//!
//! Deadlines are absolute nanosecond values in the domain of the clock a
//! subscription names. The host only ever sleeps against the monotonic
//! clock.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

/// A source of the two clocks the engine may wait on.
pub trait Clock: Send + Sync {
    /// Monotonic time in nanoseconds from an arbitrary origin.
    fn monotonic_ns(&self) -> u64;

    /// Wall-clock time in nanoseconds since the Unix epoch.
    fn realtime_ns(&self) -> u64;
}

/// Manually advanced clock.
///
/// Clones share the same time, so a host loop can keep one handle and
/// move time forward while the bridge owns another.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
    epoch_offset: u64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wall-clock readings are `epoch_offset` ahead of monotonic ones.
    pub fn with_epoch_offset(epoch_offset: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(0)),
            epoch_offset,
        }
    }

    pub fn set(&self, ns: u64) {
        self.now.store(ns, Ordering::SeqCst);
    }

    pub fn advance(&self, ns: u64) {
        self.now.fetch_add(ns, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn monotonic_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn realtime_ns(&self) -> u64 {
        self.monotonic_ns().saturating_add(self.epoch_offset)
    }
}

/// Host clock backed by `std::time`.
#[cfg(feature = "std")]
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: std::time::Instant,
}

#[cfg(feature = "std")]
impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

#[cfg(feature = "std")]
impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std")]
impl Clock for SystemClock {
    fn monotonic_ns(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn realtime_ns(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}
