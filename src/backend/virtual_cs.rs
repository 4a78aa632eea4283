//! In-process command station without hardware.
//!
//! Accepts every command, reports it back as the normalized events a real
//! station would broadcast, and answers feedback reads from a contact map the
//! caller fills in. Used for demos and as the default backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{halt_events, intent_events};
use crate::commands::{AccessoryValue, Command, DecoderProtocol, Direction};
use crate::device::{Device, DeviceKind, Measurement, MeasurementChannel};
use crate::fanout::EventFanout;
use crate::state::{SensorState, Session};
use crate::traits::{Clock, CommandStationController, SystemClock};

/// Speed range the virtual station accepts.
pub const SPEED_MAX: u16 = 1000;

/// Track current the virtual booster reports while power is on, in mA.
pub const IDLE_CURRENT_MA: u16 = 120;

/// Contacts per simulated feedback module.
const PORTS_PER_MODULE: u16 = 16;

/// Software command station.
///
/// ```
/// use rs_trainz_bridge::CommandStationController;
/// use rs_trainz_bridge::backend::VirtualStation;
///
/// let station = VirtualStation::with_defaults();
/// station.set_contact(1, 3, true);
/// assert!(station.connect());
/// assert_eq!(station.get_feedback(1), Some([0x20, 0x00]));
/// assert!(station.sensor_state(3).unwrap().active);
/// ```
pub struct VirtualStation {
    session: Session,
    connected: AtomicBool,
    feedback: Mutex<HashMap<u16, u16>>,
    address_offset: u32,
}

impl VirtualStation {
    /// Station publishing to `fanout`.
    pub fn new(fanout: Arc<EventFanout>, clock: Arc<dyn Clock>) -> Self {
        Self {
            session: Session::new(fanout, clock),
            connected: AtomicBool::new(false),
            feedback: Mutex::new(HashMap::new()),
            address_offset: 0,
        }
    }

    /// Station with its own listener registry and the system clock.
    pub fn with_defaults() -> Self {
        Self::new(Arc::new(EventFanout::new()), Arc::new(SystemClock::new()))
    }

    /// Set the sensor id offset used for feedback modules.
    pub fn with_address_offset(mut self, offset: u32) -> Self {
        self.address_offset = offset;
        self
    }

    /// Set one simulated contact (1..=16) of a feedback module.
    pub fn set_contact(&self, module: u16, contact: u16, active: bool) {
        if !(1..=PORTS_PER_MODULE).contains(&contact) {
            tracing::warn!(module, contact, "contact out of range");
            return;
        }
        let mask = 0x8000 >> (contact - 1);
        let mut feedback = self.feedback.lock();
        let bits = feedback.entry(module).or_default();
        if active {
            *bits |= mask;
        } else {
            *bits &= !mask;
        }
    }

    /// Replace the contact bits of one feedback module (bit 15 = contact 1).
    pub fn set_module(&self, module: u16, bits: u16) {
        self.feedback.lock().insert(module, bits);
    }

    /// Layout state of this station.
    pub fn session(&self) -> &Session {
        &self.session
    }

    fn accept(&self, command: Command) -> bool {
        if !self.is_connected() {
            tracing::warn!(
                backend = self.name(),
                command = command.kind.name(),
                "station offline, dropping command"
            );
            return false;
        }
        tracing::debug!(command = command.kind.name(), address = command.address, "virtual command");
        self.session.publish(intent_events(&command, SPEED_MAX));
        true
    }

    fn booster() -> MeasurementChannel {
        MeasurementChannel::new(1, "TRACK", "mA", 0.0, 65535.0, 0, u16::MAX)
    }
}

impl CommandStationController for VirtualStation {
    fn name(&self) -> &'static str {
        "virtual"
    }

    fn connect(&self) -> bool {
        if self.connected.swap(true, Ordering::SeqCst) {
            return true;
        }
        self.session.clear();
        self.session.update_device(0, |d| {
            d.kind = DeviceKind::CentralStation;
            d.name = "Virtual Station".to_string();
            d.measurement_channels = 1;
        });
        self.session.set_channels(vec![Self::booster()]);
        tracing::info!(backend = self.name(), "station connected");
        true
    }

    fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.session.clear();
            tracing::info!(backend = self.name(), "station disconnected");
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn power(&self, on: bool) -> bool {
        self.accept(Command::power(on))
    }

    fn change_direction(&self, address: u32, protocol: DecoderProtocol, direction: Direction) {
        self.accept(Command::change_direction(address, Some(protocol), direction));
    }

    fn change_velocity(&self, address: u32, protocol: DecoderProtocol, speed: u16) {
        self.accept(Command::set_speed(address, Some(protocol), speed));
    }

    fn change_function_value(&self, address: u32, protocol: DecoderProtocol, number: u8, on: bool) {
        self.accept(Command::set_function(address, Some(protocol), number, on));
    }

    fn switch_accessory(
        &self,
        address: u32,
        protocol: DecoderProtocol,
        value: AccessoryValue,
        switch_time_ms: u32,
    ) {
        self.accept(Command::switch_accessory(
            address,
            Some(protocol),
            value,
            switch_time_ms,
        ));
    }

    fn get_feedback(&self, module: u16) -> Option<[u8; 2]> {
        if !self.is_connected() || module == 0 {
            return None;
        }
        let bits = self.feedback.lock().get(&module).copied().unwrap_or(0);
        self.session
            .commit_module(module, bits, self.address_offset, PORTS_PER_MODULE);
        Some(bits.to_be_bytes())
    }

    fn sensor_state(&self, id: u32) -> Option<SensorState> {
        self.session.sensors.get(id)
    }

    fn measurements(&self) -> Vec<Measurement> {
        if !self.is_connected() {
            return Vec::new();
        }
        let raw = if self.session.power() == Some(true) {
            IDLE_CURRENT_MA
        } else {
            0
        };
        self.session.measure(1, raw).into_iter().collect()
    }

    fn devices(&self) -> Vec<Device> {
        self.session.devices()
    }

    fn events(&self) -> &EventFanout {
        self.session.fanout()
    }

    fn emergency_stop(&self) -> bool {
        let stopped = self.power(false);
        self.session.publish(halt_events(&self.session.locos));
        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{BridgeEvent, SensorEvent};
    use crate::hal::MockClock;

    fn station() -> (Arc<MockClock>, VirtualStation) {
        let clock = Arc::new(MockClock::new());
        let station = VirtualStation::new(Arc::new(EventFanout::new()), clock.clone());
        (clock, station)
    }

    fn record(station: &VirtualStation) -> Arc<Mutex<Vec<BridgeEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        station
            .events()
            .add_listener(move |e: &BridgeEvent| sink.lock().push(*e));
        seen
    }

    #[test]
    fn commands_are_dropped_until_connected() {
        let (_, station) = station();
        let seen = record(&station);
        assert!(!station.power(true));
        assert!(seen.lock().is_empty());

        assert!(station.connect());
        assert!(station.power(true));
        assert_eq!(station.session().power(), Some(true));
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn repeated_commands_emit_once() {
        let (_, station) = station();
        station.connect();
        let seen = record(&station);
        station.change_velocity(3, DecoderProtocol::Dcc, 40);
        station.change_velocity(3, DecoderProtocol::Dcc, 40);
        station.change_function_value(3, DecoderProtocol::Dcc, 0, true);
        let names: Vec<_> = seen.lock().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["speed", "function"]);
    }

    #[test]
    fn feedback_reports_changes_with_time() {
        let (clock, station) = station();
        station.connect();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        station
            .events()
            .add_sensor_listener(move |e: &SensorEvent| sink.lock().push(*e));

        station.set_contact(2, 1, true);
        clock.set(500);
        assert_eq!(station.get_feedback(2), Some([0x80, 0x00]));
        assert_eq!(station.get_feedback(2), Some([0x80, 0x00]));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].id, 17);
        assert_eq!(seen[0].millis, 500);
        assert!(!seen[0].previous_active);
    }

    #[test]
    fn current_follows_power() {
        let (_, station) = station();
        station.connect();
        assert_eq!(station.measurements()[0].raw, 0);
        station.power(true);
        assert_eq!(station.measurements()[0].raw, IDLE_CURRENT_MA);
        assert_eq!(station.measurements()[0].unit, "mA");
    }

    #[test]
    fn emergency_stop_halts_running_locos() {
        let (_, station) = station();
        station.connect();
        station.power(true);
        station.change_velocity(5, DecoderProtocol::Mfx, 300);
        let seen = record(&station);
        assert!(station.emergency_stop());
        let seen = seen.lock();
        assert!(seen.contains(&BridgeEvent::Power(crate::events::PowerEvent { on: false })));
        assert!(seen.iter().any(|e| matches!(e, BridgeEvent::Speed(s) if s.speed == 0 && s.address == 5)));
    }

    #[test]
    fn disconnect_forgets_devices() {
        let (_, station) = station();
        station.connect();
        assert_eq!(station.devices().len(), 1);
        station.disconnect();
        assert!(station.devices().is_empty());
        assert!(station.get_feedback(1).is_none());
    }
}
