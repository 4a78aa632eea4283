//! Solenoid dwell tracking.
//!
//! Switch-machine coils are rated for pulses. Every accessory command that
//! energizes a coil is recorded here with its dwell: the requested switch
//! time, capped at the configured maximum. The dispatcher asks for
//! [`due`](SafetyMonitor::due) coils on every idle tick and after every
//! command, and writes the backend's cutoff frame for each of them.
//!
//! ```rust
//! use std::sync::Arc;
//! use rs_trainz_bridge::hal::MockClock;
//! use rs_trainz_bridge::safety::SafetyMonitor;
//! use rs_trainz_bridge::{AccessoryValue, DecoderProtocol};
//!
//! let clock = Arc::new(MockClock::new());
//! let monitor = SafetyMonitor::new(clock.clone(), 2000);
//! monitor.energize(5, DecoderProtocol::Mm, AccessoryValue::Green, 0);
//!
//! clock.advance(1999);
//! assert!(monitor.due().is_empty());
//! clock.advance(1);
//! assert_eq!(monitor.due().len(), 1);
//! assert!(!monitor.is_energized());
//! ```

use std::sync::Arc;

use parking_lot::Mutex;

use crate::commands::{AccessoryValue, DecoderProtocol};
use crate::traits::Clock;

/// Default maximum dwell in milliseconds.
pub const DEFAULT_MAX_DWELL_MS: u64 = 2000;

/// A coil currently carrying current.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnergizedCoil {
    /// Accessory address.
    pub address: u32,
    /// Accessory protocol.
    pub protocol: DecoderProtocol,
    /// Which coil.
    pub value: AccessoryValue,
    /// When the coil was energized.
    pub since_ms: u64,
    /// Allowed activation time.
    pub dwell_ms: u64,
}

impl EnergizedCoil {
    /// Time at which the coil must be cut off.
    #[inline]
    pub fn deadline_ms(&self) -> u64 {
        self.since_ms + self.dwell_ms
    }
}

/// Tracks energized coils and reports the ones past their dwell.
pub struct SafetyMonitor {
    clock: Arc<dyn Clock>,
    max_dwell_ms: u64,
    coils: Mutex<Vec<EnergizedCoil>>,
}

impl SafetyMonitor {
    /// Monitor with the given maximum dwell.
    pub fn new(clock: Arc<dyn Clock>, max_dwell_ms: u64) -> Self {
        Self {
            clock,
            max_dwell_ms,
            coils: Mutex::new(Vec::new()),
        }
    }

    /// Maximum dwell in milliseconds.
    pub fn max_dwell_ms(&self) -> u64 {
        self.max_dwell_ms
    }

    /// Record a coil energized now.
    ///
    /// `switch_time_ms == 0` means the maximum dwell. An accessory has one
    /// entry; switching it again restarts its dwell.
    pub fn energize(
        &self,
        address: u32,
        protocol: DecoderProtocol,
        value: AccessoryValue,
        switch_time_ms: u32,
    ) {
        let dwell_ms = match u64::from(switch_time_ms) {
            0 => self.max_dwell_ms,
            t => t.min(self.max_dwell_ms),
        };
        let coil = EnergizedCoil {
            address,
            protocol,
            value,
            since_ms: self.clock.now_ms(),
            dwell_ms,
        };
        let mut coils = self.coils.lock();
        coils.retain(|c| !(c.address == address && c.protocol == protocol));
        coils.push(coil);
        tracing::trace!(address, dwell_ms, "coil energized");
    }

    /// Forget a coil that was cut off by other means.
    pub fn release(&self, address: u32, protocol: DecoderProtocol) {
        self.coils
            .lock()
            .retain(|c| !(c.address == address && c.protocol == protocol));
    }

    /// Remove and return every coil whose dwell has expired.
    pub fn due(&self) -> Vec<EnergizedCoil> {
        let now = self.clock.now_ms();
        let mut coils = self.coils.lock();
        let (due, keep): (Vec<_>, Vec<_>) = coils.iter().copied().partition(|c| now >= c.deadline_ms());
        *coils = keep;
        due
    }

    /// Remove and return every energized coil (shutdown).
    pub fn take_all(&self) -> Vec<EnergizedCoil> {
        std::mem::take(&mut *self.coils.lock())
    }

    /// Milliseconds until the next coil is due, if any is energized.
    pub fn next_due_in_ms(&self) -> Option<u64> {
        let now = self.clock.now_ms();
        self.coils
            .lock()
            .iter()
            .map(|c| c.deadline_ms().saturating_sub(now))
            .min()
    }

    /// True while any coil is energized.
    pub fn is_energized(&self) -> bool {
        !self.coils.lock().is_empty()
    }

    /// Snapshot of energized coils.
    pub fn energized(&self) -> Vec<EnergizedCoil> {
        self.coils.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MockClock;

    fn monitor() -> (Arc<MockClock>, SafetyMonitor) {
        let clock = Arc::new(MockClock::new());
        let monitor = SafetyMonitor::new(clock.clone(), DEFAULT_MAX_DWELL_MS);
        (clock, monitor)
    }

    #[test]
    fn requested_time_is_capped_at_max() {
        let (_, m) = monitor();
        m.energize(1, DecoderProtocol::Mm, AccessoryValue::Red, 250);
        m.energize(2, DecoderProtocol::Mm, AccessoryValue::Red, 60_000);
        let coils = m.energized();
        assert_eq!(coils[0].dwell_ms, 250);
        assert_eq!(coils[1].dwell_ms, 2000);
    }

    #[test]
    fn due_only_returns_expired_coils() {
        let (clock, m) = monitor();
        m.energize(1, DecoderProtocol::Mm, AccessoryValue::Red, 100);
        m.energize(2, DecoderProtocol::Mm, AccessoryValue::Green, 0);
        clock.advance(100);
        let due = m.due();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].address, 1);
        assert_eq!(m.next_due_in_ms(), Some(1900));
    }

    #[test]
    fn reswitching_restarts_dwell() {
        let (clock, m) = monitor();
        m.energize(1, DecoderProtocol::Mm, AccessoryValue::Green, 0);
        clock.advance(1500);
        m.energize(1, DecoderProtocol::Mm, AccessoryValue::Red, 0);
        clock.advance(1000);
        assert!(m.due().is_empty());
        assert_eq!(m.energized().len(), 1);
        assert_eq!(m.energized()[0].value, AccessoryValue::Red);
    }

    #[test]
    fn same_address_other_protocol_is_separate() {
        let (_, m) = monitor();
        m.energize(1, DecoderProtocol::Mm, AccessoryValue::Green, 0);
        m.energize(1, DecoderProtocol::Dcc, AccessoryValue::Green, 0);
        assert_eq!(m.energized().len(), 2);
        m.release(1, DecoderProtocol::Mm);
        assert_eq!(m.energized().len(), 1);
    }

    #[test]
    fn take_all_empties_monitor() {
        let (_, m) = monitor();
        m.energize(1, DecoderProtocol::Mm, AccessoryValue::Green, 0);
        assert_eq!(m.take_all().len(), 1);
        assert!(!m.is_energized());
        assert_eq!(m.next_due_in_ms(), None);
    }
}
