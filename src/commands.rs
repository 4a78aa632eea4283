//! Command types: the domain intents the bridge serializes onto the wire.
//!
//! A [`Command`] is created by an upstream caller, enqueued on the
//! [`CommandDispatcher`](crate::dispatcher::CommandDispatcher), encoded by the
//! backend codec and then dropped. Commands are immutable once enqueued and are
//! never persisted.
//!
//! # Address Spaces
//!
//! Addresses are protocol-local integers. Motorola, DCC, mfx and SX1 decoders
//! can share numeric addresses, so a [`DecoderProtocol`] tag disambiguates them
//! where the backend needs it (the CAN central stations do; the legacy serial
//! interface only speaks Motorola).
//!
//! ```rust
//! use rs_trainz_bridge::{Command, CommandKind, DecoderProtocol, Direction};
//!
//! let cmd = Command::set_speed(12, Some(DecoderProtocol::Mm), 11);
//! assert_eq!(cmd.address, 12);
//! assert!(matches!(cmd.kind, CommandKind::SetSpeed { speed: 11 }));
//!
//! let reverse = Command::change_direction(12, None, Direction::Backward);
//! assert_eq!(reverse.kind.name(), "change_direction");
//! ```
//!
//! # Speed Units
//!
//! Speeds are carried in the backend's native step range and clamped by the
//! codec: 0..=14 for the legacy serial box, 0..=1000 for CAN stations and
//! 0..=126 for the text protocol.

// ============================================================================
// Decoder Protocol
// ============================================================================

/// Decoder protocol tag used to disambiguate overlapping address spaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum DecoderProtocol {
    /// Märklin Motorola (MM / MM2).
    #[default]
    Mm,
    /// NMRA DCC.
    Dcc,
    /// Märklin mfx.
    Mfx,
    /// Selectrix SX1.
    Sx1,
}

impl DecoderProtocol {
    /// Returns the protocol as a lowercase string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            DecoderProtocol::Mm => "mm",
            DecoderProtocol::Dcc => "dcc",
            DecoderProtocol::Mfx => "mfx",
            DecoderProtocol::Sx1 => "sx1",
        }
    }

    /// Parse a protocol name, case-insensitive. `mm2` is accepted as Motorola.
    ///
    /// ```
    /// use rs_trainz_bridge::DecoderProtocol;
    ///
    /// assert_eq!(DecoderProtocol::from_text("DCC"), Some(DecoderProtocol::Dcc));
    /// assert_eq!(DecoderProtocol::from_text("mm2"), Some(DecoderProtocol::Mm));
    /// assert_eq!(DecoderProtocol::from_text("lgb"), None);
    /// ```
    pub fn from_text(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mm" | "mm2" | "motorola" => Some(DecoderProtocol::Mm),
            "dcc" => Some(DecoderProtocol::Dcc),
            "mfx" => Some(DecoderProtocol::Mfx),
            "sx1" | "sx" => Some(DecoderProtocol::Sx1),
            _ => None,
        }
    }
}

// ============================================================================
// Direction
// ============================================================================

/// Direction of travel of a locomotive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Direction {
    /// Forward travel.
    #[default]
    Forward,
    /// Backward travel.
    Backward,
}

impl Direction {
    /// Returns the opposite direction.
    #[inline]
    pub const fn toggled(self) -> Self {
        match self {
            Direction::Forward => Direction::Backward,
            Direction::Backward => Direction::Forward,
        }
    }

    /// Returns the direction as a lowercase string.
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Backward => "backward",
        }
    }

    /// Parse direction from text input.
    ///
    /// Accepts `forward`/`fwd`/`1` and `backward`/`reverse`/`rev`/`0`.
    /// Input is trimmed and case-insensitive.
    ///
    /// ```
    /// use rs_trainz_bridge::Direction;
    ///
    /// assert_eq!(Direction::from_text("fwd"), Some(Direction::Forward));
    /// assert_eq!(Direction::from_text(" REVERSE "), Some(Direction::Backward));
    /// assert_eq!(Direction::from_text("sideways"), None);
    /// ```
    pub fn from_text(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "forward" | "fwd" | "1" => Some(Direction::Forward),
            "backward" | "back" | "reverse" | "rev" | "0" => Some(Direction::Backward),
            _ => None,
        }
    }
}

// ============================================================================
// Accessory Value
// ============================================================================

/// Output of a two-coil accessory (turnout or semaphore signal).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum AccessoryValue {
    /// Green coil: straight / proceed.
    Green,
    /// Red coil: diverging / stop.
    Red,
}

impl AccessoryValue {
    /// Returns the value as a lowercase string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            AccessoryValue::Green => "green",
            AccessoryValue::Red => "red",
        }
    }

    /// Parse `green`/`straight`/`1` or `red`/`diverging`/`0`.
    pub fn from_text(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "green" | "straight" | "1" => Some(AccessoryValue::Green),
            "red" | "diverging" | "curved" | "0" => Some(AccessoryValue::Red),
            _ => None,
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

/// What a [`Command`] asks the command station to do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandKind {
    /// Set locomotive speed in the backend's native step range.
    SetSpeed {
        /// Speed step, clamped by the codec.
        speed: u16,
    },

    /// Change the direction of travel.
    ChangeDirection(Direction),

    /// Switch a decoder function on or off (f0 is the headlight).
    SetFunction {
        /// Function number.
        number: u8,
        /// Desired state.
        on: bool,
    },

    /// Energize one coil of an accessory.
    SwitchAccessory {
        /// Which coil.
        value: AccessoryValue,
        /// Requested activation time; 0 means "use the maximum dwell".
        switch_time_ms: u32,
    },

    /// Read one feedback module (the address is the module number).
    PollFeedback,

    /// Track power on (`true`) or off (`false`).
    Power(bool),

    /// Read one measurement channel of the central station.
    QueryMeasurement {
        /// Channel number (1 = main track current).
        channel: u8,
    },

    /// Request device description data (CAN status-config index).
    QueryDevice {
        /// Config index; 0 is the device description itself.
        index: u8,
    },
}

impl CommandKind {
    /// Short stable name used in log fields and API payloads.
    pub const fn name(&self) -> &'static str {
        match self {
            CommandKind::SetSpeed { .. } => "set_speed",
            CommandKind::ChangeDirection(_) => "change_direction",
            CommandKind::SetFunction { .. } => "set_function",
            CommandKind::SwitchAccessory { .. } => "switch_accessory",
            CommandKind::PollFeedback => "poll_feedback",
            CommandKind::Power(true) => "power_on",
            CommandKind::Power(false) => "power_off",
            CommandKind::QueryMeasurement { .. } => "query_measurement",
            CommandKind::QueryDevice { .. } => "query_device",
        }
    }

    /// Returns true for commands that energize an accessory coil.
    pub const fn energizes_coil(&self) -> bool {
        matches!(self, CommandKind::SwitchAccessory { .. })
    }
}

/// A request to act on the track.
///
/// Built with the constructor helpers and handed to a backend. Immutable once
/// enqueued; there is deliberately no setter API.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    /// What to do.
    pub kind: CommandKind,
    /// Protocol-local target address (locomotive, accessory or module number).
    pub address: u32,
    /// Protocol tag for backends with overlapping address spaces.
    pub protocol: Option<DecoderProtocol>,
}

impl Command {
    /// Create a command from its parts.
    pub fn new(kind: CommandKind, address: u32, protocol: Option<DecoderProtocol>) -> Self {
        Self {
            kind,
            address,
            protocol,
        }
    }

    /// Set locomotive speed.
    pub fn set_speed(address: u32, protocol: Option<DecoderProtocol>, speed: u16) -> Self {
        Self::new(CommandKind::SetSpeed { speed }, address, protocol)
    }

    /// Change locomotive direction.
    pub fn change_direction(
        address: u32,
        protocol: Option<DecoderProtocol>,
        direction: Direction,
    ) -> Self {
        Self::new(CommandKind::ChangeDirection(direction), address, protocol)
    }

    /// Set a locomotive function.
    pub fn set_function(
        address: u32,
        protocol: Option<DecoderProtocol>,
        number: u8,
        on: bool,
    ) -> Self {
        Self::new(CommandKind::SetFunction { number, on }, address, protocol)
    }

    /// Switch an accessory coil.
    pub fn switch_accessory(
        address: u32,
        protocol: Option<DecoderProtocol>,
        value: AccessoryValue,
        switch_time_ms: u32,
    ) -> Self {
        Self::new(
            CommandKind::SwitchAccessory {
                value,
                switch_time_ms,
            },
            address,
            protocol,
        )
    }

    /// Poll a feedback module.
    pub fn poll_feedback(module: u32) -> Self {
        Self::new(CommandKind::PollFeedback, module, None)
    }

    /// Track power on or off.
    pub fn power(on: bool) -> Self {
        Self::new(CommandKind::Power(on), 0, None)
    }

    /// Read a measurement channel.
    pub fn query_measurement(channel: u8) -> Self {
        Self::new(CommandKind::QueryMeasurement { channel }, 0, None)
    }

    /// Request device description data from the device with this UID.
    pub fn query_device(uid: u32, index: u8) -> Self {
        Self::new(CommandKind::QueryDevice { index }, uid, None)
    }

    /// Protocol tag, defaulting to Motorola.
    #[inline]
    pub fn protocol_or_default(&self) -> DecoderProtocol {
        self.protocol.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_toggle() {
        assert_eq!(Direction::Forward.toggled(), Direction::Backward);
        assert_eq!(Direction::Backward.toggled(), Direction::Forward);
    }

    #[test]
    fn direction_from_text_variants() {
        assert_eq!(Direction::from_text("forward"), Some(Direction::Forward));
        assert_eq!(Direction::from_text("1"), Some(Direction::Forward));
        assert_eq!(Direction::from_text("rev"), Some(Direction::Backward));
        assert_eq!(Direction::from_text("0"), Some(Direction::Backward));
        assert_eq!(Direction::from_text(""), None);
    }

    #[test]
    fn accessory_from_text() {
        assert_eq!(AccessoryValue::from_text("straight"), Some(AccessoryValue::Green));
        assert_eq!(AccessoryValue::from_text("RED"), Some(AccessoryValue::Red));
        assert_eq!(AccessoryValue::from_text("yellow"), None);
    }

    #[test]
    fn protocol_default_is_motorola() {
        let cmd = Command::set_speed(3, None, 5);
        assert_eq!(cmd.protocol_or_default(), DecoderProtocol::Mm);
        let cmd = Command::set_speed(3, Some(DecoderProtocol::Dcc), 5);
        assert_eq!(cmd.protocol_or_default(), DecoderProtocol::Dcc);
    }

    #[test]
    fn command_names() {
        assert_eq!(Command::power(true).kind.name(), "power_on");
        assert_eq!(Command::power(false).kind.name(), "power_off");
        assert_eq!(Command::poll_feedback(1).kind.name(), "poll_feedback");
        assert_eq!(
            Command::switch_accessory(1, None, AccessoryValue::Red, 0)
                .kind
                .name(),
            "switch_accessory"
        );
    }

    #[test]
    fn only_accessories_energize_coils() {
        assert!(Command::switch_accessory(1, None, AccessoryValue::Green, 0)
            .kind
            .energizes_coil());
        assert!(!Command::set_speed(1, None, 3).kind.energizes_coil());
        assert!(!Command::power(true).kind.energizes_coil());
    }
}
