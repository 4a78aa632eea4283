//! Shared station state for all network services.
//!
//! `SharedStation` wraps one [`CommandStationController`] and records every
//! event it emits in a bounded journal, so web clients can poll for changes
//! and all services agree on the same time base.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use rs_trainz_bridge::services::SharedStation;
//!
//! let shared = Arc::new(SharedStation::new(Arc::new(station)));
//!
//! // Web and MQTT both use the same state
//! let web_router = build_router(Arc::clone(&shared), &web_config);
//! let mqtt_handler = MqttHandler::new(Arc::clone(&shared), mqtt_config);
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::events::BridgeEvent;
use crate::fanout::ListenerId;
use crate::traits::CommandStationController;

/// Number of events the journal keeps by default.
pub const DEFAULT_JOURNAL_CAPACITY: usize = 256;

// ============================================================================
// Event Journal
// ============================================================================

/// One recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Sequence number, starting at 1
    pub seq: u64,
    /// Milliseconds since the shared state was created
    pub at_ms: u64,
    /// The event
    pub event: BridgeEvent,
}

struct JournalInner {
    next_seq: u64,
    entries: VecDeque<JournalEntry>,
    power: Option<bool>,
}

/// Bounded, sequence-numbered record of recent events.
pub struct EventJournal {
    capacity: usize,
    inner: Mutex<JournalInner>,
}

impl EventJournal {
    /// Journal keeping the last `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(JournalInner {
                next_seq: 1,
                entries: VecDeque::with_capacity(capacity),
                power: None,
            }),
        }
    }

    /// Append one event.
    pub fn record(&self, event: BridgeEvent, at_ms: u64) {
        let mut inner = self.inner.lock();
        if let BridgeEvent::Power(p) = event {
            inner.power = Some(p.on);
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        if inner.entries.len() == self.capacity {
            inner.entries.pop_front();
        }
        inner.entries.push_back(JournalEntry { seq, at_ms, event });
    }

    /// Entries with a sequence number greater than `seq`.
    pub fn since(&self, seq: u64) -> Vec<JournalEntry> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|e| e.seq > seq)
            .copied()
            .collect()
    }

    /// Sequence number of the newest entry (0 if none).
    pub fn last_seq(&self) -> u64 {
        self.inner.lock().next_seq - 1
    }

    /// Track power as last reported.
    pub fn power(&self) -> Option<bool> {
        self.inner.lock().power
    }

    /// Forget power state (station disconnected).
    pub fn reset_power(&self) {
        self.inner.lock().power = None;
    }
}

// ============================================================================
// Shared Station
// ============================================================================

/// Station handle shared between web and MQTT services.
pub struct SharedStation {
    /// The station all services command
    station: Arc<dyn CommandStationController>,

    /// Time when the state was created (for consistent timestamps across services)
    start_time: Instant,

    journal: Arc<EventJournal>,
    listener: ListenerId,
}

impl SharedStation {
    /// Wrap `station` and start journaling its events.
    pub fn new(station: Arc<dyn CommandStationController>) -> Self {
        Self::with_capacity(station, DEFAULT_JOURNAL_CAPACITY)
    }

    /// Like [`new`](Self::new) with a custom journal size.
    pub fn with_capacity(station: Arc<dyn CommandStationController>, capacity: usize) -> Self {
        let start_time = Instant::now();
        let journal = Arc::new(EventJournal::new(capacity));
        let sink = Arc::clone(&journal);
        let listener = station.events().add_listener(move |event: &BridgeEvent| {
            sink.record(*event, start_time.elapsed().as_millis() as u64);
        });
        Self {
            station,
            start_time,
            journal,
            listener,
        }
    }

    /// The wrapped station.
    pub fn station(&self) -> &Arc<dyn CommandStationController> {
        &self.station
    }

    /// Milliseconds since the shared state was created.
    #[inline]
    pub fn now_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    /// The event journal.
    pub fn journal(&self) -> &EventJournal {
        &self.journal
    }

    /// Connect the station and forget stale power state on failure.
    pub fn connect(&self) -> bool {
        let connected = self.station.connect();
        if !connected {
            self.journal.reset_power();
        }
        connected
    }

    /// Disconnect the station.
    pub fn disconnect(&self) {
        self.station.disconnect();
        self.journal.reset_power();
    }
}

impl Drop for SharedStation {
    fn drop(&mut self) {
        self.station.events().remove_listener(self.listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::VirtualStation;
    use crate::events::PowerEvent;

    #[test]
    fn journal_is_bounded_and_sequenced() {
        let journal = EventJournal::new(2);
        for on in [true, false, true] {
            journal.record(BridgeEvent::Power(PowerEvent { on }), 0);
        }
        let entries = journal.since(0);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].seq, 2);
        assert_eq!(journal.last_seq(), 3);
        assert_eq!(journal.power(), Some(true));
        assert!(journal.since(3).is_empty());
    }

    #[test]
    fn station_events_are_journaled() {
        let station: Arc<dyn CommandStationController> = Arc::new(VirtualStation::with_defaults());
        let shared = SharedStation::new(Arc::clone(&station));
        assert!(shared.connect());
        station.power(true);
        assert_eq!(shared.journal().power(), Some(true));
        assert_eq!(shared.journal().since(0).len(), 1);

        shared.disconnect();
        assert_eq!(shared.journal().power(), None);
    }

    #[test]
    fn dropping_shared_state_removes_listener() {
        let station: Arc<dyn CommandStationController> = Arc::new(VirtualStation::with_defaults());
        let before = station.events().listener_count();
        let shared = SharedStation::new(Arc::clone(&station));
        assert_eq!(station.events().listener_count(), before + 1);
        drop(shared);
        assert_eq!(station.events().listener_count(), before);
    }
}
