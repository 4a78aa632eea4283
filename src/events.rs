//! Normalized change events delivered to upstream listeners.
//!
//! Every backend, whatever its wire format, reports the same event values.
//! Events are plain `Copy` values: listeners never see live backend state.

use crate::commands::{AccessoryValue, DecoderProtocol, Direction};

/// A feedback contact changed state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SensorEvent {
    /// Layout-wide sensor id (module offset + contact).
    pub id: u32,
    /// Feedback module or bus device that reported the change.
    pub device_id: u16,
    /// Contact number on that device, 1-based.
    pub contact: u16,
    /// New state.
    pub active: bool,
    /// State before this change.
    pub previous_active: bool,
    /// Timestamp of the change in milliseconds since the connection started.
    pub millis: u64,
}

impl SensorEvent {
    /// Returns true if the contact actually changed.
    #[inline]
    pub fn is_changed(&self) -> bool {
        self.active != self.previous_active
    }
}

/// Track power switched on or off.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PowerEvent {
    /// True when the track is powered.
    pub on: bool,
}

/// A locomotive's speed changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LocomotiveSpeedEvent {
    /// Locomotive address.
    pub address: u32,
    /// Decoder protocol, if the backend knows it.
    pub protocol: Option<DecoderProtocol>,
    /// Speed in the backend's native step range.
    pub speed: u16,
}

/// A locomotive's direction changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LocomotiveDirectionEvent {
    /// Locomotive address.
    pub address: u32,
    /// Decoder protocol, if the backend knows it.
    pub protocol: Option<DecoderProtocol>,
    /// New direction.
    pub direction: Direction,
}

/// A locomotive function was switched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LocomotiveFunctionEvent {
    /// Locomotive address.
    pub address: u32,
    /// Decoder protocol, if the backend knows it.
    pub protocol: Option<DecoderProtocol>,
    /// Function number.
    pub number: u8,
    /// New state.
    pub on: bool,
}

/// An accessory was switched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AccessoryEvent {
    /// Accessory address.
    pub address: u32,
    /// Decoder protocol, if the backend knows it.
    pub protocol: Option<DecoderProtocol>,
    /// Coil that was energized.
    pub value: AccessoryValue,
}

/// Any event the bridge can emit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "snake_case"))]
pub enum BridgeEvent {
    /// Feedback contact change.
    Sensor(SensorEvent),
    /// Track power change.
    Power(PowerEvent),
    /// Locomotive speed change.
    Speed(LocomotiveSpeedEvent),
    /// Locomotive direction change.
    Direction(LocomotiveDirectionEvent),
    /// Locomotive function change.
    Function(LocomotiveFunctionEvent),
    /// Accessory change.
    Accessory(AccessoryEvent),
}

impl BridgeEvent {
    /// Short stable name, used as MQTT topic suffix.
    pub const fn name(&self) -> &'static str {
        match self {
            BridgeEvent::Sensor(_) => "sensor",
            BridgeEvent::Power(_) => "power",
            BridgeEvent::Speed(_) => "speed",
            BridgeEvent::Direction(_) => "direction",
            BridgeEvent::Function(_) => "function",
            BridgeEvent::Accessory(_) => "accessory",
        }
    }
}

impl From<SensorEvent> for BridgeEvent {
    fn from(e: SensorEvent) -> Self {
        BridgeEvent::Sensor(e)
    }
}

impl From<PowerEvent> for BridgeEvent {
    fn from(e: PowerEvent) -> Self {
        BridgeEvent::Power(e)
    }
}

impl From<LocomotiveSpeedEvent> for BridgeEvent {
    fn from(e: LocomotiveSpeedEvent) -> Self {
        BridgeEvent::Speed(e)
    }
}

impl From<LocomotiveDirectionEvent> for BridgeEvent {
    fn from(e: LocomotiveDirectionEvent) -> Self {
        BridgeEvent::Direction(e)
    }
}

impl From<LocomotiveFunctionEvent> for BridgeEvent {
    fn from(e: LocomotiveFunctionEvent) -> Self {
        BridgeEvent::Function(e)
    }
}

impl From<AccessoryEvent> for BridgeEvent {
    fn from(e: AccessoryEvent) -> Self {
        BridgeEvent::Accessory(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensor_event_changed_flag() {
        let mut e = SensorEvent {
            id: 1002,
            device_id: 1,
            contact: 2,
            active: true,
            previous_active: false,
            millis: 0,
        };
        assert!(e.is_changed());
        e.previous_active = true;
        assert!(!e.is_changed());
    }

    #[test]
    fn event_names() {
        assert_eq!(BridgeEvent::from(PowerEvent { on: true }).name(), "power");
        let acc = AccessoryEvent {
            address: 5,
            protocol: None,
            value: AccessoryValue::Red,
        };
        assert_eq!(BridgeEvent::from(acc).name(), "accessory");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_string(&BridgeEvent::Power(PowerEvent { on: false })).unwrap();
        assert_eq!(json, r#"{"type":"power","on":false}"#);
    }
}
