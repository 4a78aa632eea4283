//! Time source abstraction.
//!
//! The safety monitor and the sensor bank stamp state with milliseconds since
//! the connection started. Production code uses [`SystemClock`]; tests use
//! [`MockClock`](crate::hal::MockClock) to step time deterministically.
//!
//! # Example
//!
//! ```rust
//! use rs_trainz_bridge::traits::Clock;
//! use rs_trainz_bridge::hal::MockClock;
//!
//! let clock = MockClock::new();
//! assert_eq!(clock.now_ms(), 0);
//!
//! clock.advance(100);
//! assert_eq!(clock.now_ms(), 100);
//! ```

use std::time::Instant;

/// Monotonic time source in milliseconds.
pub trait Clock: Send + Sync {
    /// Returns current time in milliseconds since an arbitrary epoch.
    ///
    /// Must be monotonically increasing.
    fn now_ms(&self) -> u64;
}

/// Wall-clock implementation counting from construction.
#[derive(Clone, Copy, Debug)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    /// Start counting now.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    #[inline]
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }
}
