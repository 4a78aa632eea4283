//! Wire codecs for the three backend families.
//!
//! | Codec | Frame | Backend |
//! |-------|-------|---------|
//! | [`SerialCodec`] | [`SerialFrame`]: command byte + optional address byte | 6050-style RS-232 box |
//! | [`CanCodec`] | [`CanFrame`]: 13-byte CAN packet | CAN central stations over TCP/UDP |
//! | [`TextCodec`] | [`TextFrame`]: one `<...>` line | DCC-EX style text devices |
//!
//! All codecs implement [`Codec`](crate::traits::Codec) and decode into the
//! shared [`Decoded`] vocabulary; backends turn that into events, sensor
//! commits, measurements and device records.

pub mod can;
pub mod serial;
pub mod text;

pub use can::{CanCodec, CanFrame};
pub use serial::{SerialCodec, SerialFrame};
pub use text::{TextCodec, TextFrame};

use crate::events::BridgeEvent;

/// Result of decoding one frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Decoded {
    /// Normalized domain events.
    Events(Vec<BridgeEvent>),
    /// Legacy reverse pulse for a locomotive (the box only toggles).
    Reverse {
        /// Locomotive address.
        address: u32,
    },
    /// Solenoid power cut for all accessories.
    CoilOff,
    /// Raw reply of one legacy feedback module; bit 15 is contact 1.
    Feedback {
        /// Module number.
        module: u16,
        /// Contact bits.
        bits: u16,
    },
    /// A single contact reported by a feedback bus device.
    Contact {
        /// Bus device id.
        device_id: u16,
        /// Contact number.
        contact: u16,
        /// New state.
        active: bool,
    },
    /// Raw measurement value.
    Measurement {
        /// Channel number.
        channel: u8,
        /// Raw reading.
        raw: u16,
    },
    /// Validity flag of a measurement channel.
    Validity {
        /// Channel number.
        channel: u8,
        /// Whether the channel is valid.
        valid: bool,
    },
    /// Ping reply identifying a module.
    Ping {
        /// Module UID.
        uid: u32,
        /// Firmware major version.
        major: u8,
        /// Firmware minor version.
        minor: u8,
        /// Device type code.
        type_code: u16,
    },
    /// One numbered packet of a multi-packet config dump.
    ConfigPacket {
        /// Package number, 1-based.
        number: u16,
        /// Packet payload.
        data: [u8; 8],
    },
    /// Terminator of a config dump.
    ConfigEnd {
        /// Responding module.
        uid: u32,
        /// Config index that was dumped.
        index: u8,
        /// Number of packets sent.
        count: u16,
    },
    /// Free-form status line (station identification).
    Status(String),
    /// The station rejected the last command.
    Error(String),
    /// Well-formed frame without domain content.
    Ack,
    /// Unknown or malformed frame; it is discarded.
    Unrecognized,
}

impl Decoded {
    /// True for [`Decoded::Unrecognized`].
    pub fn is_unrecognized(&self) -> bool {
        matches!(self, Decoded::Unrecognized)
    }
}
