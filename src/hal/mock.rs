//! Mock implementations for testing without hardware.
//!
//! # Available Mocks
//!
//! | Mock | Trait | Purpose |
//! |------|-------|---------|
//! | [`MockChannel`] | [`PhysicalChannel`] | Records writes, injects inbound units, simulates link loss |
//! | [`MockClock`] | [`Clock`] | Controllable time source |
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use rs_trainz_bridge::hal::MockChannel;
//! use rs_trainz_bridge::traits::PhysicalChannel;
//!
//! let channel = MockChannel::new("mock0");
//! channel.open(Arc::new(|_unit: &[u8]| {})).unwrap();
//! assert!(channel.write(&[96]).unwrap());
//! assert_eq!(channel.writes(), vec![vec![96]]);
//!
//! channel.drop_link();
//! assert!(!channel.is_open());
//! assert!(channel.write(&[97]).is_err());
//! ```
//!
//! [`PhysicalChannel`]: crate::traits::PhysicalChannel
//! [`Clock`]: crate::traits::Clock

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{BridgeError, Result};
use crate::traits::{Clock, InboundHandler, PhysicalChannel};

// ============================================================================
// Channel Mock
// ============================================================================

/// Auto-responder invoked after each accepted write; returns inbound units.
pub type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

#[derive(Default)]
struct MockState {
    open: bool,
    handler: Option<InboundHandler>,
    writes: Vec<Vec<u8>>,
    open_count: usize,
    fail_open: bool,
    reject_writes: bool,
    responder: Option<Responder>,
}

/// In-memory channel.
///
/// Writes are recorded; inbound units are delivered synchronously on the
/// thread that calls [`inject`](Self::inject) or on the writer's thread when
/// a [`Responder`] is installed.
pub struct MockChannel {
    name: String,
    state: Mutex<MockState>,
    written: Condvar,
}

impl MockChannel {
    /// Create a closed channel.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(MockState::default()),
            written: Condvar::new(),
        }
    }

    /// Make subsequent [`open`](PhysicalChannel::open) calls fail.
    pub fn set_fail_open(&self, fail: bool) {
        self.state.lock().fail_open = fail;
    }

    /// Make the transport refuse writes (`write` returns `Ok(false)`).
    pub fn set_reject_writes(&self, reject: bool) {
        self.state.lock().reject_writes = reject;
    }

    /// Install a responder that answers writes with inbound units.
    pub fn set_responder(&self, responder: impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static) {
        self.state.lock().responder = Some(Box::new(responder));
    }

    /// Remove the responder.
    pub fn clear_responder(&self) {
        self.state.lock().responder = None;
    }

    /// Simulate a detected disconnect.
    pub fn drop_link(&self) {
        self.state.lock().open = false;
    }

    /// Deliver one inbound unit to the registered handler.
    ///
    /// Returns false if the channel is closed.
    pub fn inject(&self, unit: &[u8]) -> bool {
        let handler = {
            let state = self.state.lock();
            if !state.open {
                return false;
            }
            state.handler.clone()
        };
        match handler {
            Some(handler) => {
                handler(unit);
                true
            }
            None => false,
        }
    }

    /// All accepted writes, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().writes.clone()
    }

    /// All accepted bytes, concatenated.
    pub fn written_bytes(&self) -> Vec<u8> {
        self.state.lock().writes.concat()
    }

    /// Forget recorded writes.
    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }

    /// Number of successful opens.
    pub fn open_count(&self) -> usize {
        self.state.lock().open_count
    }

    /// Block until at least `count` writes were recorded or `timeout` passed.
    pub fn wait_for_writes(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.writes.len() < count {
            if self.written.wait_until(&mut state, deadline).timed_out() {
                return state.writes.len() >= count;
            }
        }
        true
    }
}

impl PhysicalChannel for MockChannel {
    fn describe(&self) -> String {
        format!("mock:{}", self.name)
    }

    fn open(&self, handler: InboundHandler) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_open {
            return Err(BridgeError::PortBusy(self.name.clone()));
        }
        state.open = true;
        state.handler = Some(handler);
        state.open_count += 1;
        Ok(())
    }

    fn write(&self, bytes: &[u8]) -> Result<bool> {
        let (replies, handler) = {
            let mut state = self.state.lock();
            if !state.open {
                return Err(BridgeError::NotConnected);
            }
            if state.reject_writes {
                return Ok(false);
            }
            state.writes.push(bytes.to_vec());
            self.written.notify_all();
            let replies = state
                .responder
                .as_mut()
                .map(|responder| responder(bytes))
                .unwrap_or_default();
            (replies, state.handler.clone())
        };
        if let Some(handler) = handler {
            for unit in replies {
                handler(&unit);
            }
        }
        Ok(true)
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.open = false;
        state.handler = None;
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }
}

// ============================================================================
// Clock Mock
// ============================================================================

/// Mock clock for testing time-dependent behavior.
///
/// Shared by reference between the code under test and the test itself, so
/// time moves through `&self`.
///
/// # Example
///
/// ```rust
/// use rs_trainz_bridge::hal::MockClock;
/// use rs_trainz_bridge::traits::Clock;
///
/// let clock = MockClock::new();
/// clock.set(1000);
/// clock.advance(500);
/// assert_eq!(clock.now_ms(), 1500);
/// ```
#[derive(Debug, Default)]
pub struct MockClock {
    current_ms: AtomicU64,
}

impl MockClock {
    /// Creates a new mock clock starting at 0ms.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the current time in milliseconds.
    pub fn set(&self, ms: u64) {
        self.current_ms.store(ms, Ordering::SeqCst);
    }

    /// Advances the clock by the given duration.
    pub fn advance(&self, ms: u64) {
        self.current_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        self.current_ms.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn sink() -> (InboundHandler, Arc<Mutex<Vec<Vec<u8>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        (Arc::new(move |u: &[u8]| s.lock().push(u.to_vec())), seen)
    }

    #[test]
    fn closed_channel_fails_fast() {
        let channel = MockChannel::new("t");
        assert!(matches!(channel.write(&[1]), Err(BridgeError::NotConnected)));
        assert!(!channel.inject(&[1]));
    }

    #[test]
    fn fail_open_reports_busy_port() {
        let channel = MockChannel::new("ttyS0");
        channel.set_fail_open(true);
        let (handler, _) = sink();
        assert!(matches!(channel.open(handler), Err(BridgeError::PortBusy(_))));
        assert_eq!(channel.open_count(), 0);
    }

    #[test]
    fn rejected_write_is_not_recorded() {
        let channel = MockChannel::new("t");
        let (handler, _) = sink();
        channel.open(handler).unwrap();
        channel.set_reject_writes(true);
        assert!(!channel.write(&[1]).unwrap());
        assert!(channel.writes().is_empty());
    }

    #[test]
    fn responder_replies_reach_handler() {
        let channel = MockChannel::new("t");
        let (handler, seen) = sink();
        channel.open(handler).unwrap();
        channel.set_responder(|bytes| vec![vec![bytes[0] + 1]]);
        channel.write(&[0x30]).unwrap();
        assert_eq!(*seen.lock(), vec![vec![0x31]]);
        assert_eq!(channel.written_bytes(), vec![0x30]);
    }

    #[test]
    fn wait_for_writes_times_out() {
        let channel = MockChannel::new("t");
        assert!(!channel.wait_for_writes(1, Duration::from_millis(10)));
        assert!(channel.wait_for_writes(0, Duration::from_millis(10)));
    }

    #[test]
    fn mock_clock_advances() {
        let clock = MockClock::new();
        assert_eq!(clock.now_ms(), 0);
        clock.advance(2000);
        clock.advance(50);
        assert_eq!(clock.now_ms(), 2050);
    }
}
