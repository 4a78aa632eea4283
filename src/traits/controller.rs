//! The upstream contract every command station variant offers.
//!
//! Autopilot, UI and persistence collaborators talk only to this trait. The
//! operations never return transport errors: a failed or offline link turns
//! into a logged no-op, and callers poll [`is_connected`](CommandStationController::is_connected).
//!
//! # Example
//!
//! ```rust
//! use rs_trainz_bridge::{CommandStationController, DecoderProtocol, Direction};
//! use rs_trainz_bridge::backend::VirtualStation;
//!
//! let station = VirtualStation::with_defaults();
//! assert!(station.connect());
//! assert!(station.power(true));
//! station.change_velocity(3, DecoderProtocol::Dcc, 400);
//! station.change_direction(3, DecoderProtocol::Dcc, Direction::Backward);
//! station.disconnect();
//! assert!(!station.is_connected());
//! ```

use crate::commands::{AccessoryValue, DecoderProtocol, Direction};
use crate::device::{Device, Measurement};
use crate::fanout::EventFanout;
use crate::state::SensorState;

/// Capability interface of one command station connection.
pub trait CommandStationController: Send + Sync {
    /// Backend name (`legacy-serial`, `marklin-can`, `dcc-ex`, `virtual`).
    fn name(&self) -> &'static str;

    /// Open the channel, probe liveness and start the dispatcher.
    fn connect(&self) -> bool;

    /// Stop the dispatcher (with safety cutoff) and close the channel.
    fn disconnect(&self);

    /// True iff the channel is open and the last liveness probe succeeded.
    fn is_connected(&self) -> bool;

    /// Switch track power. Returns true if the command was dispatched.
    fn power(&self, on: bool) -> bool;

    /// Change locomotive direction.
    fn change_direction(&self, address: u32, protocol: DecoderProtocol, direction: Direction);

    /// Change locomotive speed in backend steps.
    fn change_velocity(&self, address: u32, protocol: DecoderProtocol, speed: u16);

    /// Switch a locomotive function.
    fn change_function_value(&self, address: u32, protocol: DecoderProtocol, number: u8, on: bool);

    /// Energize an accessory coil for at most `switch_time_ms` (0 = maximum dwell).
    fn switch_accessory(
        &self,
        address: u32,
        protocol: DecoderProtocol,
        value: AccessoryValue,
        switch_time_ms: u32,
    );

    /// Read one feedback module's two raw bytes. `None` when unavailable.
    fn get_feedback(&self, module: u16) -> Option<[u8; 2]>;

    /// Last committed state of one sensor.
    fn sensor_state(&self, id: u32) -> Option<SensorState>;

    /// Read all measurement channels the backend offers.
    fn measurements(&self) -> Vec<Measurement>;

    /// Modules discovered on this connection.
    fn devices(&self) -> Vec<Device>;

    /// Listener registry for this connection.
    fn events(&self) -> &EventFanout;

    /// Cut track power immediately.
    fn emergency_stop(&self) -> bool {
        self.power(false)
    }
}
