//! Per-connection layout state: feedback contacts, known locomotive state and
//! the [`Session`] that bundles them with devices and measurement channels.
//!
//! All of it is owned by the connection and cleared on disconnect;
//! addresses may be renumbered between sessions so nothing is cached across
//! connections.
//!
//! # Sensor Commit Model
//!
//! Each contact is a single packed `AtomicU64`:
//!
//! ```text
//! bit 0      current state
//! bit 1      previous state
//! bits 2..64 timestamp of last change (ms)
//! ```
//!
//! The reader worker is the only writer and replaces the whole word with one
//! store, so a concurrent reader always observes the last fully committed
//! value, never a state where `current` moved but `previous` did not.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::commands::{AccessoryValue, DecoderProtocol, Direction};
use crate::device::{Device, Measurement, MeasurementChannel};
use crate::events::{BridgeEvent, SensorEvent};
use crate::fanout::EventFanout;
use crate::traits::Clock;

// ============================================================================
// Sensor State
// ============================================================================

const CURRENT_BIT: u64 = 0b01;
const PREVIOUS_BIT: u64 = 0b10;
const TIME_SHIFT: u32 = 2;

/// Snapshot of one feedback contact.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct SensorState {
    /// Committed current value.
    pub active: bool,
    /// Value before the last commit.
    pub previous_active: bool,
    /// Millisecond timestamp of the last change.
    pub last_change_ms: u64,
}

impl SensorState {
    /// True iff the last commit changed the contact.
    #[inline]
    pub fn is_changed(&self) -> bool {
        self.active != self.previous_active
    }

    fn pack(self) -> u64 {
        let mut word = (self.last_change_ms << TIME_SHIFT) & !(CURRENT_BIT | PREVIOUS_BIT);
        if self.active {
            word |= CURRENT_BIT;
        }
        if self.previous_active {
            word |= PREVIOUS_BIT;
        }
        word
    }

    fn unpack(word: u64) -> Self {
        Self {
            active: word & CURRENT_BIT != 0,
            previous_active: word & PREVIOUS_BIT != 0,
            last_change_ms: word >> TIME_SHIFT,
        }
    }
}

/// Identity of one contact on a feedback bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContactKey {
    /// Layout-wide sensor id.
    pub id: u32,
    /// Module or bus device number.
    pub device_id: u16,
    /// Contact number, 1-based.
    pub contact: u16,
}

impl ContactKey {
    /// Key for `contact` on feedback `module`, numbered from `address_offset`.
    ///
    /// Module 1 contact 1 maps to `address_offset + 1`; every further module
    /// adds `ports_per_module`.
    ///
    /// ```
    /// use rs_trainz_bridge::state::ContactKey;
    ///
    /// let key = ContactKey::for_module(1, 2, 1000, 16);
    /// assert_eq!(key.id, 1002);
    /// assert_eq!(ContactKey::for_module(2, 1, 1000, 16).id, 1017);
    /// ```
    pub fn for_module(module: u16, contact: u16, address_offset: u32, ports_per_module: u16) -> Self {
        let base = u32::from(module.saturating_sub(1)) * u32::from(ports_per_module);
        Self {
            id: address_offset + base + u32::from(contact),
            device_id: module,
            contact,
        }
    }
}

/// Table of feedback contacts with atomic per-contact commits.
#[derive(Default)]
pub struct SensorBank {
    contacts: RwLock<HashMap<u32, Arc<AtomicU64>>>,
}

impl SensorBank {
    /// Create an empty bank.
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, id: u32) -> Arc<AtomicU64> {
        if let Some(cell) = self.contacts.read().get(&id) {
            return Arc::clone(cell);
        }
        let mut contacts = self.contacts.write();
        Arc::clone(contacts.entry(id).or_insert_with(|| Arc::new(AtomicU64::new(0))))
    }

    /// Commit a decoded contact value.
    ///
    /// `previous` becomes the old `current`. Returns an event only when the
    /// committed value differs from the old one.
    pub fn commit(&self, key: ContactKey, active: bool, now_ms: u64) -> Option<SensorEvent> {
        let cell = self.cell(key.id);
        let old = SensorState::unpack(cell.load(Ordering::Acquire));
        let changed = old.active != active;
        let new = SensorState {
            active,
            previous_active: old.active,
            last_change_ms: if changed { now_ms } else { old.last_change_ms },
        };
        cell.store(new.pack(), Ordering::Release);

        changed.then_some(SensorEvent {
            id: key.id,
            device_id: key.device_id,
            contact: key.contact,
            active,
            previous_active: old.active,
            millis: now_ms,
        })
    }

    /// Commit a full 16-contact module reply from the legacy feedback bus.
    ///
    /// Bit 15 of `bits` is contact 1, bit 0 is contact 16.
    pub fn commit_module(
        &self,
        module: u16,
        bits: u16,
        address_offset: u32,
        ports_per_module: u16,
        now_ms: u64,
    ) -> Vec<SensorEvent> {
        (1..=ports_per_module.min(16))
            .filter_map(|contact| {
                let active = bits & (0x8000 >> (contact - 1)) != 0;
                let key = ContactKey::for_module(module, contact, address_offset, ports_per_module);
                self.commit(key, active, now_ms)
            })
            .collect()
    }

    /// Read the last committed state of a contact.
    pub fn get(&self, id: u32) -> Option<SensorState> {
        self.contacts
            .read()
            .get(&id)
            .map(|cell| SensorState::unpack(cell.load(Ordering::Acquire)))
    }

    /// Number of known contacts.
    pub fn len(&self) -> usize {
        self.contacts.read().len()
    }

    /// Returns true if no contact has reported yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every contact (connection closed).
    pub fn clear(&self) {
        self.contacts.write().clear();
    }
}

// ============================================================================
// Locomotive State
// ============================================================================

/// Last known state of one locomotive decoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct LocoState {
    /// Speed in backend steps.
    pub speed: u16,
    /// Direction of travel.
    pub direction: Direction,
    /// Function bitmap, bit n = function n.
    pub functions: u64,
}

impl LocoState {
    /// State of function `number`.
    #[inline]
    pub fn function(&self, number: u8) -> bool {
        number < 64 && self.functions & (1 << number) != 0
    }

    /// Copy with function `number` set to `on`.
    pub fn with_function(mut self, number: u8, on: bool) -> Self {
        if number < 64 {
            if on {
                self.functions |= 1 << number;
            } else {
                self.functions &= !(1 << number);
            }
        }
        self
    }
}

/// Known locomotive state keyed by protocol and address.
#[derive(Default)]
pub struct LocoTable {
    locos: Mutex<HashMap<(DecoderProtocol, u32), LocoState>>,
}

impl LocoTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Known state, or the power-on default.
    pub fn get(&self, protocol: DecoderProtocol, address: u32) -> LocoState {
        self.locos
            .lock()
            .get(&(protocol, address))
            .copied()
            .unwrap_or_default()
    }

    /// Fold a locomotive event into the table. Other events are ignored.
    ///
    /// Returns true if the event changed the known state.
    pub fn apply(&self, event: &BridgeEvent) -> bool {
        let (protocol, address) = match event {
            BridgeEvent::Speed(e) => (e.protocol, e.address),
            BridgeEvent::Direction(e) => (e.protocol, e.address),
            BridgeEvent::Function(e) => (e.protocol, e.address),
            _ => return false,
        };
        let mut locos = self.locos.lock();
        let loco = locos.entry((protocol.unwrap_or_default(), address)).or_default();
        let before = *loco;
        match *event {
            BridgeEvent::Speed(e) => loco.speed = e.speed,
            BridgeEvent::Direction(e) => loco.direction = e.direction,
            BridgeEvent::Function(e) => *loco = loco.with_function(e.number, e.on),
            _ => {}
        }
        *loco != before
    }

    /// Locomotives last known to be running.
    pub fn moving(&self) -> Vec<(DecoderProtocol, u32)> {
        self.locos
            .lock()
            .iter()
            .filter(|(_, loco)| loco.speed > 0)
            .map(|(key, _)| *key)
            .collect()
    }

    /// Forget every locomotive (connection closed).
    pub fn clear(&self) {
        self.locos.lock().clear();
    }
}

// ============================================================================
// Session
// ============================================================================

/// Everything one connection knows about the layout.
///
/// Created with the connection and cleared on disconnect. Listeners live in
/// the shared [`EventFanout`] and survive reconnects.
pub struct Session {
    fanout: Arc<EventFanout>,
    clock: Arc<dyn Clock>,
    /// Feedback contacts.
    pub sensors: SensorBank,
    /// Known locomotive state.
    pub locos: LocoTable,
    power: Mutex<Option<bool>>,
    accessories: Mutex<HashMap<(DecoderProtocol, u32), AccessoryValue>>,
    devices: Mutex<BTreeMap<u32, Device>>,
    channels: Mutex<Vec<MeasurementChannel>>,
}

impl Session {
    /// Empty session publishing to `fanout`.
    pub fn new(fanout: Arc<EventFanout>, clock: Arc<dyn Clock>) -> Self {
        Self {
            fanout,
            clock,
            sensors: SensorBank::new(),
            locos: LocoTable::new(),
            power: Mutex::new(None),
            accessories: Mutex::new(HashMap::new()),
            devices: Mutex::new(BTreeMap::new()),
            channels: Mutex::new(Vec::new()),
        }
    }

    /// Listener registry.
    pub fn fanout(&self) -> &EventFanout {
        &self.fanout
    }

    /// Milliseconds on the session clock.
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Fold events into the known state and emit the ones that changed it.
    ///
    /// Returns the number of emitted events.
    pub fn publish(&self, events: impl IntoIterator<Item = BridgeEvent>) -> usize {
        let mut emitted = 0;
        for event in events {
            if self.record(&event) {
                self.fanout.emit(event);
                emitted += 1;
            }
        }
        emitted
    }

    fn record(&self, event: &BridgeEvent) -> bool {
        match *event {
            BridgeEvent::Sensor(_) => true,
            BridgeEvent::Power(e) => self.power.lock().replace(e.on) != Some(e.on),
            BridgeEvent::Accessory(e) => {
                let key = (e.protocol.unwrap_or_default(), e.address);
                self.accessories.lock().insert(key, e.value) != Some(e.value)
            }
            _ => self.locos.apply(event),
        }
    }

    /// Commit one contact and emit a sensor event if it changed.
    pub fn commit_contact(&self, key: ContactKey, active: bool) {
        if let Some(event) = self.sensors.commit(key, active, self.now_ms()) {
            self.fanout.emit(event.into());
        }
    }

    /// Commit a 16-contact module reply and emit the changes.
    pub fn commit_module(&self, module: u16, bits: u16, address_offset: u32, ports: u16) {
        let now = self.now_ms();
        for event in self
            .sensors
            .commit_module(module, bits, address_offset, ports, now)
        {
            self.fanout.emit(event.into());
        }
    }

    /// Last known track power.
    pub fn power(&self) -> Option<bool> {
        *self.power.lock()
    }

    /// Update (or create) the device with `uid`, returning what `update` returns.
    pub fn update_device<R>(&self, uid: u32, update: impl FnOnce(&mut Device) -> R) -> R {
        let mut devices = self.devices.lock();
        update(devices.entry(uid).or_insert_with(|| Device::new(uid)))
    }

    /// Snapshot of known devices, ordered by UID.
    pub fn devices(&self) -> Vec<Device> {
        self.devices.lock().values().cloned().collect()
    }

    /// Replace the measurement channel table.
    pub fn set_channels(&self, channels: Vec<MeasurementChannel>) {
        *self.channels.lock() = channels;
    }

    /// Add or replace one measurement channel.
    pub fn upsert_channel(&self, channel: MeasurementChannel) {
        let mut channels = self.channels.lock();
        channels.retain(|c| c.number != channel.number);
        channels.push(channel);
        channels.sort_by_key(|c| c.number);
    }

    /// Snapshot of measurement channels.
    pub fn channels(&self) -> Vec<MeasurementChannel> {
        self.channels.lock().clone()
    }

    /// Record a validity flag reported for `channel`.
    pub fn set_channel_validity(&self, channel: u8, valid: bool) {
        if let Some(c) = self.channels.lock().iter_mut().find(|c| c.number == channel) {
            c.valid = Some(valid);
        }
    }

    /// Scale a raw reading with the channel table.
    pub fn measure(&self, channel: u8, raw: u16) -> Option<Measurement> {
        self.channels
            .lock()
            .iter()
            .find(|c| c.number == channel)
            .map(|c| c.measure(raw))
    }

    /// Forget everything learned on this connection.
    pub fn clear(&self) {
        self.sensors.clear();
        self.locos.clear();
        *self.power.lock() = None;
        self.accessories.lock().clear();
        self.devices.lock().clear();
        self.channels.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{LocomotiveFunctionEvent, LocomotiveSpeedEvent};

    #[test]
    fn pack_round_trip_keeps_all_fields() {
        let s = SensorState {
            active: true,
            previous_active: false,
            last_change_ms: 123_456_789,
        };
        assert_eq!(SensorState::unpack(s.pack()), s);
    }

    #[test]
    fn commit_tracks_previous_and_change() {
        let bank = SensorBank::new();
        let key = ContactKey::for_module(1, 2, 1000, 16);

        let event = bank.commit(key, true, 10).unwrap();
        assert_eq!(event.id, 1002);
        assert!(event.active);
        assert!(!event.previous_active);

        let state = bank.get(1002).unwrap();
        assert!(state.is_changed());
        assert_eq!(state.last_change_ms, 10);

        // Same value again: no event, no longer "changed", timestamp kept
        assert!(bank.commit(key, true, 50).is_none());
        let state = bank.get(1002).unwrap();
        assert!(!state.is_changed());
        assert_eq!(state.last_change_ms, 10);

        let event = bank.commit(key, false, 90).unwrap();
        assert!(!event.active);
        assert!(event.previous_active);
    }

    #[test]
    fn commit_module_maps_msb_to_contact_one() {
        let bank = SensorBank::new();
        // contact 2 active
        let events = bank.commit_module(1, 0b0100_0000_0000_0000, 1000, 16, 0);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, 1002);
        assert_eq!(events[0].contact, 2);
        assert_eq!(bank.len(), 16);
    }

    #[test]
    fn clear_forgets_contacts() {
        let bank = SensorBank::new();
        bank.commit(ContactKey::for_module(1, 1, 0, 16), true, 0);
        assert!(!bank.is_empty());
        bank.clear();
        assert!(bank.get(1).is_none());
    }

    #[test]
    fn loco_table_folds_events() {
        let table = LocoTable::new();
        table.apply(&BridgeEvent::Speed(LocomotiveSpeedEvent {
            address: 12,
            protocol: None,
            speed: 11,
        }));
        table.apply(&BridgeEvent::Function(LocomotiveFunctionEvent {
            address: 12,
            protocol: Some(DecoderProtocol::Mm),
            number: 0,
            on: true,
        }));
        let loco = table.get(DecoderProtocol::Mm, 12);
        assert_eq!(loco.speed, 11);
        assert!(loco.function(0));
        assert!(!loco.function(1));
        assert_eq!(table.get(DecoderProtocol::Dcc, 12), LocoState::default());
    }

    #[test]
    fn loco_table_reports_changes_only() {
        let table = LocoTable::new();
        let speed = BridgeEvent::Speed(LocomotiveSpeedEvent {
            address: 1,
            protocol: None,
            speed: 4,
        });
        assert!(table.apply(&speed));
        assert!(!table.apply(&speed));
        assert!(!table.apply(&BridgeEvent::Power(crate::events::PowerEvent { on: true })));
    }

    #[test]
    fn session_publishes_only_changes() {
        use crate::events::PowerEvent;
        use crate::hal::MockClock;
        use std::sync::atomic::AtomicUsize;

        let fanout = Arc::new(EventFanout::new());
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        fanout.add_listener(move |_: &BridgeEvent| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let session = Session::new(fanout, Arc::new(MockClock::new()));

        let on = BridgeEvent::Power(PowerEvent { on: true });
        assert_eq!(session.publish([on, on]), 1);
        assert_eq!(session.power(), Some(true));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        session.clear();
        assert_eq!(session.power(), None);
        assert_eq!(session.publish([on]), 1);
    }

    #[test]
    fn session_commits_contacts_with_clock_time() {
        use crate::hal::MockClock;

        let clock = Arc::new(MockClock::new());
        let session = Session::new(Arc::new(EventFanout::new()), clock.clone());
        clock.set(40);
        session.commit_contact(ContactKey::for_module(1, 2, 1000, 16), true);
        let state = session.sensors.get(1002).unwrap();
        assert!(state.active);
        assert_eq!(state.last_change_ms, 40);
    }

    #[test]
    fn session_channels_and_devices() {
        use crate::device::default_channels;
        use crate::hal::MockClock;

        let session = Session::new(Arc::new(EventFanout::new()), Arc::new(MockClock::new()));
        session.set_channels(default_channels());
        session.set_channel_validity(1, false);
        let m = session.measure(1, 4095).unwrap();
        assert!(!m.valid);
        assert!((m.value - 5.0).abs() < 1e-9);
        assert!(session.measure(9, 1).is_none());

        session.update_device(7, |d| d.name = "Gleisbox".into());
        assert_eq!(session.devices()[0].uid, 7);
        session.clear();
        assert!(session.devices().is_empty());
        assert!(session.channels().is_empty());
    }

    #[test]
    fn with_function_ignores_out_of_range() {
        let s = LocoState::default().with_function(70, true);
        assert_eq!(s.functions, 0);
        assert!(!s.function(70));
    }
}
