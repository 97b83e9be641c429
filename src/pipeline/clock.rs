//! Injectable time source and the device-monotonic millisecond clock.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Trait for time sources (allows mocking in tests).
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> Instant;
}

/// Real system clock using `std::time::Instant::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug, Clone)]
pub struct MockClock {
    current: Arc<Mutex<Instant>>,
}

impl MockClock {
    /// Creates a new mock clock starting at the current instant.
    pub fn new() -> Self {
        Self {
            current: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Advances the mock clock by the given duration.
    pub fn advance(&self, duration: Duration) {
        *self.current.lock() += duration;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        *self.current.lock()
    }
}

/// Milliseconds since pipeline start, truncated to 32 bits like a device tick counter.
#[derive(Clone)]
pub struct DeviceClock {
    clock: Arc<dyn Clock>,
    origin: Instant,
}

impl DeviceClock {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let origin = clock.now();
        Self { clock, origin }
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Wraps after about 49.7 days, as the wire field is 32 bits.
    pub fn millis(&self) -> u32 {
        let elapsed = self.clock.now().saturating_duration_since(self.origin);
        (elapsed.as_millis() & u128::from(u32::MAX)) as u32
    }
}

impl std::fmt::Debug for DeviceClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceClock")
            .field("origin", &self.origin)
            .finish()
    }
}
