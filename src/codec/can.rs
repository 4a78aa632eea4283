//! Codec for CAN-bus central stations (CS2/CS3 family) over TCP or UDP.
//!
//! # Frame Layout
//!
//! Every frame is 13 bytes on the wire:
//!
//! ```text
//! ┌──────┬─────────┬──────┬──────┬─────┬──────────────────┐
//! │ prio │ command │ hash │ hash │ dlc │ d0 .. d7         │
//! │      │ + resp  │  hi  │  lo  │ 0-8 │ (zero padded)    │
//! └──────┴─────────┴──────┴──────┴─────┴──────────────────┘
//! ```
//!
//! The command byte carries the command code in its upper seven bits and the
//! response flag in bit 0, so a reply always has `command == request + 1`.
//! Frames are matched by that adjacency and compared by value, never by
//! identity.
//!
//! # Addressing
//!
//! Decoders are addressed by a 32-bit UID: a per-protocol base plus the
//! address. Accessories use their own bases and count from zero.

use crate::codec::Decoded;
use crate::commands::{AccessoryValue, Command, CommandKind, DecoderProtocol, Direction};
use crate::error::{BridgeError, Result};
use crate::events::{
    AccessoryEvent, BridgeEvent, LocomotiveDirectionEvent, LocomotiveFunctionEvent,
    LocomotiveSpeedEvent, PowerEvent,
};
use crate::state::LocoState;
use crate::traits::Codec;

/// Size of one frame on the wire.
pub const FRAME_LEN: usize = 13;

/// Maximum speed value.
pub const SPEED_MAX: u16 = 1000;

// ============================================================================
// Command Codes
// ============================================================================

/// System commands (power, halt, status).
pub const CMD_SYSTEM: u8 = 0x00;
/// Locomotive velocity.
pub const CMD_LOCO_VELOCITY: u8 = 0x08;
/// Locomotive direction.
pub const CMD_LOCO_DIRECTION: u8 = 0x0A;
/// Locomotive function.
pub const CMD_LOCO_FUNCTION: u8 = 0x0C;
/// Accessory switching.
pub const CMD_ACCESSORY: u8 = 0x16;
/// S88 feedback module poll.
pub const CMD_S88_POLL: u8 = 0x20;
/// S88 contact event.
pub const CMD_S88_EVENT: u8 = 0x22;
/// Bus participant ping.
pub const CMD_PING: u8 = 0x30;
/// Status and config data request.
pub const CMD_STATUS_CONFIG: u8 = 0x3A;

/// System sub-command: track power off.
pub const SUB_STOP: u8 = 0x00;
/// System sub-command: track power on.
pub const SUB_GO: u8 = 0x01;
/// System sub-command: halt all locomotives.
pub const SUB_HALT: u8 = 0x02;
/// System sub-command: emergency stop one locomotive.
pub const SUB_LOCO_EMERGENCY: u8 = 0x03;
/// System sub-command: overload reported.
pub const SUB_OVERLOAD: u8 = 0x0A;
/// System sub-command: read a measurement channel.
pub const SUB_STATUS: u8 = 0x0B;

/// Data length codes each command code may carry. Anything else is discarded.
fn allowed_dlc(code: u8) -> Option<&'static [u8]> {
    match code {
        CMD_SYSTEM => Some(&[5, 6, 7, 8]),
        CMD_LOCO_VELOCITY => Some(&[4, 6]),
        CMD_LOCO_DIRECTION => Some(&[4, 5]),
        CMD_LOCO_FUNCTION => Some(&[5, 6, 8]),
        CMD_ACCESSORY => Some(&[6, 8]),
        CMD_S88_POLL => Some(&[5, 7]),
        CMD_S88_EVENT => Some(&[4, 5, 8]),
        CMD_PING => Some(&[0, 8]),
        CMD_STATUS_CONFIG => Some(&[5, 6, 8]),
        _ => None,
    }
}

// ============================================================================
// UIDs
// ============================================================================

const LOCO_BASES: [(DecoderProtocol, u32, u32); 4] = [
    (DecoderProtocol::Mm, 0x0000, 0x03FF),
    (DecoderProtocol::Sx1, 0x0800, 0x0BFF),
    (DecoderProtocol::Mfx, 0x4000, 0x7FFF),
    (DecoderProtocol::Dcc, 0xC000, 0xFFFF),
];

const ACCESSORY_MM_BASE: u32 = 0x3000;
const ACCESSORY_DCC_BASE: u32 = 0x3800;
const ACCESSORY_RANGE: u32 = 0x07FF;

/// UID of a locomotive decoder.
pub fn loco_uid(protocol: DecoderProtocol, address: u32) -> u32 {
    let base = LOCO_BASES
        .iter()
        .find(|(p, _, _)| *p == protocol)
        .map_or(0, |(_, base, _)| *base);
    base + address
}

/// Protocol and address of a locomotive UID.
pub fn loco_from_uid(uid: u32) -> Option<(DecoderProtocol, u32)> {
    LOCO_BASES
        .iter()
        .find(|(_, base, end)| (*base..=*end).contains(&uid))
        .map(|(protocol, base, _)| (*protocol, uid - base))
}

/// UID of an accessory decoder. Addresses start at 1.
pub fn accessory_uid(protocol: DecoderProtocol, address: u32) -> u32 {
    let base = match protocol {
        DecoderProtocol::Dcc => ACCESSORY_DCC_BASE,
        _ => ACCESSORY_MM_BASE,
    };
    base + address.saturating_sub(1)
}

/// Protocol and address of an accessory UID.
pub fn accessory_from_uid(uid: u32) -> Option<(DecoderProtocol, u32)> {
    [
        (DecoderProtocol::Mm, ACCESSORY_MM_BASE),
        (DecoderProtocol::Dcc, ACCESSORY_DCC_BASE),
    ]
    .into_iter()
    .find(|(_, base)| (*base..=*base + ACCESSORY_RANGE).contains(&uid))
    .map(|(protocol, base)| (protocol, uid - base + 1))
}

/// Collision-avoidance hash derived from a sender UID.
///
/// ```
/// use rs_trainz_bridge::codec::can::uid_hash;
///
/// assert_eq!(uid_hash(0), 0x0300);
/// assert_eq!(uid_hash(0x0000_1234), 0x9334);
/// ```
pub fn uid_hash(uid: u32) -> u16 {
    let h = ((uid >> 16) as u16) ^ (uid as u16);
    ((h << 3) & 0xFF00) | 0x0300 | (h & 0x007F)
}

// ============================================================================
// Frame
// ============================================================================

/// One CAN packet.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CanFrame {
    /// Priority bits.
    pub priority: u8,
    /// Command code with response flag in bit 0.
    pub command: u8,
    /// Sender hash, or package number in multi-packet replies.
    pub hash: u16,
    /// Payload; its length is the DLC.
    pub data: heapless::Vec<u8, 8>,
}

impl CanFrame {
    /// Build a frame. Payload beyond eight bytes is cut off.
    pub fn new(command: u8, hash: u16, data: &[u8]) -> Self {
        let len = data.len().min(8);
        Self {
            priority: 0,
            command,
            hash,
            data: heapless::Vec::from_slice(&data[..len]).unwrap_or_default(),
        }
    }

    /// Data length code.
    #[inline]
    pub fn dlc(&self) -> u8 {
        self.data.len() as u8
    }

    /// Command code without the response flag.
    #[inline]
    pub fn code(&self) -> u8 {
        self.command & !1
    }

    /// True if the response flag is set.
    #[inline]
    pub fn is_response(&self) -> bool {
        self.command & 1 == 1
    }

    /// True iff this frame answers `request`.
    ///
    /// Only the command codes are compared. The hash of a reply is the
    /// responder's own, and config dump packets reuse the field for their
    /// package number, so it never equals the request's hash.
    ///
    /// ```
    /// use rs_trainz_bridge::codec::CanFrame;
    ///
    /// let request = CanFrame::new(0x30, 0x0300, &[]);
    /// assert!(CanFrame::new(0x31, 0x4711, &[0; 8]).is_response_for(&request));
    /// assert!(!CanFrame::new(0x30, 0x0300, &[]).is_response_for(&request));
    /// ```
    pub fn is_response_for(&self, request: &CanFrame) -> bool {
        request.command.checked_add(1) == Some(self.command)
    }

    /// The 32-bit UID in the first four data bytes.
    pub fn uid(&self) -> Option<u32> {
        self.data
            .get(..4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u16_at(&self, index: usize) -> Option<u16> {
        self.data
            .get(index..index + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    /// Serialize to the 13-byte wire form.
    pub fn to_bytes(&self) -> [u8; FRAME_LEN] {
        let mut bytes = [0u8; FRAME_LEN];
        bytes[0] = self.priority;
        bytes[1] = self.command;
        bytes[2..4].copy_from_slice(&self.hash.to_be_bytes());
        bytes[4] = self.dlc();
        bytes[5..5 + self.data.len()].copy_from_slice(&self.data);
        bytes
    }

    /// Parse the 13-byte wire form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != FRAME_LEN {
            return Err(BridgeError::Decode(format!(
                "CAN frame of {} bytes",
                bytes.len()
            )));
        }
        let dlc = usize::from(bytes[4]);
        if dlc > 8 {
            return Err(BridgeError::Decode(format!("CAN frame with DLC {dlc}")));
        }
        let mut frame = Self::new(
            bytes[1],
            u16::from_be_bytes([bytes[2], bytes[3]]),
            &bytes[5..5 + dlc],
        );
        frame.priority = bytes[0];
        Ok(frame)
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Sender UID used when none is configured.
pub const DEFAULT_SENDER_UID: u32 = 0x5254_5A42;

/// Codec for CAN central stations.
#[derive(Clone, Copy, Debug)]
pub struct CanCodec {
    hash: u16,
}

impl Default for CanCodec {
    fn default() -> Self {
        Self::new(DEFAULT_SENDER_UID)
    }
}

impl CanCodec {
    /// Codec sending as `sender_uid`.
    pub fn new(sender_uid: u32) -> Self {
        Self {
            hash: uid_hash(sender_uid),
        }
    }

    /// Hash stamped on outgoing frames.
    pub fn hash(&self) -> u16 {
        self.hash
    }

    fn frame(&self, command: u8, data: &[u8]) -> CanFrame {
        CanFrame::new(command, self.hash, data)
    }

    /// Ping every bus participant; used as liveness probe and for discovery.
    pub fn ping(&self) -> CanFrame {
        self.frame(CMD_PING, &[])
    }

    fn accessory(&self, uid: u32, value: AccessoryValue, power: bool, time: Option<u16>) -> CanFrame {
        let mut data = [0u8; 8];
        data[..4].copy_from_slice(&uid.to_be_bytes());
        data[4] = match value {
            AccessoryValue::Red => 0,
            AccessoryValue::Green => 1,
        };
        data[5] = u8::from(power);
        match time {
            Some(t) => {
                data[6..8].copy_from_slice(&t.to_be_bytes());
                self.frame(CMD_ACCESSORY, &data)
            }
            None => self.frame(CMD_ACCESSORY, &data[..6]),
        }
    }

    fn decode_system(frame: &CanFrame) -> Decoded {
        let uid = frame.uid().unwrap_or(0);
        match (frame.data[4], frame.dlc()) {
            (SUB_STOP, 5) => Decoded::Events(vec![PowerEvent { on: false }.into()]),
            (SUB_GO, 5) => Decoded::Events(vec![PowerEvent { on: true }.into()]),
            (SUB_HALT, 5) => Decoded::Ack,
            (SUB_LOCO_EMERGENCY, 5) => match loco_from_uid(uid) {
                Some((protocol, address)) => Decoded::Events(vec![LocomotiveSpeedEvent {
                    address,
                    protocol: Some(protocol),
                    speed: 0,
                }
                .into()]),
                None => Decoded::Unrecognized,
            },
            (SUB_OVERLOAD, 6) => Decoded::Error(format!("overload on channel {}", frame.data[5])),
            (SUB_STATUS, 6) => Decoded::Ack,
            (SUB_STATUS, 7) => Decoded::Validity {
                channel: frame.data[5],
                valid: frame.data[6] != 0,
            },
            (SUB_STATUS, 8) => Decoded::Measurement {
                channel: frame.data[5],
                raw: frame.u16_at(6).unwrap_or(0),
            },
            _ => Decoded::Unrecognized,
        }
    }

    fn decode_loco(frame: &CanFrame) -> Decoded {
        let Some((protocol, address)) = frame.uid().and_then(loco_from_uid) else {
            return Decoded::Unrecognized;
        };
        let protocol = Some(protocol);
        let event: BridgeEvent = match (frame.code(), frame.dlc()) {
            (_, 4) => return Decoded::Ack,
            (CMD_LOCO_VELOCITY, 6) => LocomotiveSpeedEvent {
                address,
                protocol,
                speed: frame.u16_at(4).unwrap_or(0).min(SPEED_MAX),
            }
            .into(),
            (CMD_LOCO_DIRECTION, 5) => {
                let direction = match frame.data[4] {
                    1 => Direction::Forward,
                    2 => Direction::Backward,
                    _ => return Decoded::Ack,
                };
                LocomotiveDirectionEvent {
                    address,
                    protocol,
                    direction,
                }
                .into()
            }
            (CMD_LOCO_FUNCTION, 6 | 8) => LocomotiveFunctionEvent {
                address,
                protocol,
                number: frame.data[4],
                on: frame.data[5] != 0,
            }
            .into(),
            _ => return Decoded::Ack,
        };
        Decoded::Events(vec![event])
    }

    fn decode_accessory(frame: &CanFrame) -> Decoded {
        let Some((protocol, address)) = frame.uid().and_then(accessory_from_uid) else {
            return Decoded::Unrecognized;
        };
        if frame.data[5] == 0 {
            return Decoded::CoilOff;
        }
        let value = match frame.data[4] {
            0 => AccessoryValue::Red,
            1 => AccessoryValue::Green,
            _ => return Decoded::Unrecognized,
        };
        Decoded::Events(vec![AccessoryEvent {
            address,
            protocol: Some(protocol),
            value,
        }
        .into()])
    }
}

impl Codec for CanCodec {
    type Frame = CanFrame;

    const BACKEND: &'static str = "marklin-can";

    fn encode(&self, command: &Command, _loco: &LocoState) -> Result<Vec<CanFrame>> {
        let protocol = command.protocol_or_default();
        let frame = match command.kind {
            CommandKind::SetSpeed { speed } => {
                let mut data = [0u8; 6];
                data[..4].copy_from_slice(&loco_uid(protocol, command.address).to_be_bytes());
                data[4..].copy_from_slice(&speed.min(SPEED_MAX).to_be_bytes());
                self.frame(CMD_LOCO_VELOCITY, &data)
            }
            CommandKind::ChangeDirection(direction) => {
                let mut data = [0u8; 5];
                data[..4].copy_from_slice(&loco_uid(protocol, command.address).to_be_bytes());
                data[4] = match direction {
                    Direction::Forward => 1,
                    Direction::Backward => 2,
                };
                self.frame(CMD_LOCO_DIRECTION, &data)
            }
            CommandKind::SetFunction { number, on } => {
                let mut data = [0u8; 6];
                data[..4].copy_from_slice(&loco_uid(protocol, command.address).to_be_bytes());
                data[4] = number;
                data[5] = u8::from(on);
                self.frame(CMD_LOCO_FUNCTION, &data)
            }
            CommandKind::SwitchAccessory {
                value,
                switch_time_ms,
            } => {
                let uid = accessory_uid(protocol, command.address);
                let time = (switch_time_ms > 0)
                    .then(|| u16::try_from(switch_time_ms / 10).unwrap_or(u16::MAX));
                self.accessory(uid, value, true, time)
            }
            CommandKind::PollFeedback => {
                let module = u8::try_from(command.address).map_err(|_| {
                    BridgeError::unsupported(
                        Self::BACKEND,
                        format!("feedback module {}", command.address),
                    )
                })?;
                let mut data = [0u8; 5];
                data[..4].copy_from_slice(&DEFAULT_SENDER_UID.to_be_bytes());
                data[4] = module;
                self.frame(CMD_S88_POLL, &data)
            }
            CommandKind::Power(on) => {
                let sub = if on { SUB_GO } else { SUB_STOP };
                self.frame(CMD_SYSTEM, &[0, 0, 0, 0, sub])
            }
            CommandKind::QueryMeasurement { channel } => {
                let mut data = [0u8; 6];
                data[..4].copy_from_slice(&command.address.to_be_bytes());
                data[4] = SUB_STATUS;
                data[5] = channel;
                self.frame(CMD_SYSTEM, &data)
            }
            CommandKind::QueryDevice { index } => {
                let mut data = [0u8; 5];
                data[..4].copy_from_slice(&command.address.to_be_bytes());
                data[4] = index;
                self.frame(CMD_STATUS_CONFIG, &data)
            }
        };
        Ok(vec![frame])
    }

    fn cutoff(
        &self,
        address: u32,
        protocol: DecoderProtocol,
        value: AccessoryValue,
    ) -> Option<CanFrame> {
        Some(self.accessory(accessory_uid(protocol, address), value, false, None))
    }

    fn decode(&self, frame: &CanFrame) -> Decoded {
        let code = frame.code();
        let dlc = frame.dlc();
        let Some(allowed) = allowed_dlc(code) else {
            tracing::debug!(command = code, dlc, "unrecognized CAN command");
            return Decoded::Unrecognized;
        };
        if !allowed.contains(&dlc) {
            tracing::warn!(command = code, dlc, "discarding CAN frame with bad DLC");
            return Decoded::Unrecognized;
        }

        match code {
            CMD_SYSTEM => Self::decode_system(frame),
            CMD_LOCO_VELOCITY | CMD_LOCO_DIRECTION | CMD_LOCO_FUNCTION => Self::decode_loco(frame),
            CMD_ACCESSORY => Self::decode_accessory(frame),
            CMD_S88_POLL if dlc == 7 => Decoded::Feedback {
                module: u16::from(frame.data[4]),
                bits: frame.u16_at(5).unwrap_or(0),
            },
            CMD_S88_EVENT if dlc == 8 => Decoded::Contact {
                device_id: frame.u16_at(0).unwrap_or(0),
                contact: frame.u16_at(2).unwrap_or(0),
                active: frame.data[5] != 0,
            },
            CMD_PING if dlc == 8 => Decoded::Ping {
                uid: frame.uid().unwrap_or(0),
                major: frame.data[4],
                minor: frame.data[5],
                type_code: frame.u16_at(6).unwrap_or(0),
            },
            CMD_STATUS_CONFIG if dlc == 8 => {
                let mut data = [0u8; 8];
                data.copy_from_slice(&frame.data);
                Decoded::ConfigPacket {
                    number: frame.hash,
                    data,
                }
            }
            CMD_STATUS_CONFIG if dlc == 6 => Decoded::ConfigEnd {
                uid: frame.uid().unwrap_or(0),
                index: frame.data[4],
                count: u16::from(frame.data[5]),
            },
            _ => Decoded::Ack,
        }
    }

    fn to_wire(&self, frame: &CanFrame) -> Vec<u8> {
        frame.to_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> CanCodec {
        CanCodec::new(0)
    }

    fn encode_one(cmd: Command) -> CanFrame {
        codec().encode(&cmd, &LocoState::default()).unwrap().remove(0)
    }

    fn reply(frame: &CanFrame) -> CanFrame {
        let mut r = frame.clone();
        r.command += 1;
        r
    }

    #[test]
    fn hash_combines_both_halves() {
        assert_eq!(uid_hash(1), 0x0301);
        assert_eq!(uid_hash(0x0001_0000), 0x0301);
        assert_eq!(codec().hash(), 0x0300);
    }

    #[test]
    fn velocity_frame_layout() {
        let frame = encode_one(Command::set_speed(3, Some(DecoderProtocol::Dcc), 400));
        assert_eq!(
            frame.to_bytes(),
            [0, 0x08, 0x03, 0x00, 6, 0x00, 0x00, 0xC0, 0x03, 0x01, 0x90, 0, 0]
        );
    }

    #[test]
    fn speed_clamped_to_1000() {
        let frame = encode_one(Command::set_speed(3, None, 5000));
        assert_eq!(frame.u16_at(4), Some(1000));
    }

    #[test]
    fn bytes_round_trip() {
        let frame = encode_one(Command::set_function(10, Some(DecoderProtocol::Mfx), 4, true));
        let parsed = CanFrame::from_bytes(&frame.to_bytes()).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn from_bytes_rejects_bad_lengths() {
        assert!(CanFrame::from_bytes(&[0; 12]).is_err());
        let mut bytes = [0u8; 13];
        bytes[4] = 9;
        assert!(CanFrame::from_bytes(&bytes).is_err());
    }

    #[test]
    fn response_adjacency_only() {
        let request = encode_one(Command::power(true));
        assert!(reply(&request).is_response_for(&request));
        assert!(!request.is_response_for(&request));
        assert!(!request.is_response_for(&reply(&request)));
    }

    #[test]
    fn response_hash_is_not_compared() {
        let request = encode_one(Command::power(true));
        let mut from_station = reply(&request);
        from_station.hash = 0x4711;
        assert!(from_station.is_response_for(&request));

        let packet = CanFrame::new(CMD_STATUS_CONFIG + 1, 3, &[0; 8]);
        assert!(packet.is_response_for(&CanFrame::new(CMD_STATUS_CONFIG, 0x0300, &[0; 5])));
    }

    #[test]
    fn uid_mapping_round_trip() {
        for protocol in [
            DecoderProtocol::Mm,
            DecoderProtocol::Sx1,
            DecoderProtocol::Mfx,
            DecoderProtocol::Dcc,
        ] {
            assert_eq!(loco_from_uid(loco_uid(protocol, 42)), Some((protocol, 42)));
        }
        assert_eq!(accessory_uid(DecoderProtocol::Dcc, 1), 0x3800);
        assert_eq!(
            accessory_from_uid(0x3004),
            Some((DecoderProtocol::Mm, 5))
        );
    }

    #[test]
    fn locomotive_commands_round_trip() {
        let c = codec();
        let p = Some(DecoderProtocol::Mfx);
        let cases: [(Command, BridgeEvent); 3] = [
            (
                Command::set_speed(7, p, 250),
                LocomotiveSpeedEvent { address: 7, protocol: p, speed: 250 }.into(),
            ),
            (
                Command::change_direction(7, p, Direction::Backward),
                LocomotiveDirectionEvent { address: 7, protocol: p, direction: Direction::Backward }.into(),
            ),
            (
                Command::set_function(7, p, 12, true),
                LocomotiveFunctionEvent { address: 7, protocol: p, number: 12, on: true }.into(),
            ),
        ];
        for (cmd, expected) in cases {
            let frame = encode_one(cmd);
            assert_eq!(c.decode(&reply(&frame)), Decoded::Events(vec![expected]));
        }
    }

    #[test]
    fn accessory_round_trip_and_idempotence() {
        let cmd = Command::switch_accessory(5, Some(DecoderProtocol::Mm), AccessoryValue::Red, 0);
        let a = encode_one(cmd.clone());
        let b = encode_one(cmd);
        assert_eq!(a, b);
        assert_eq!(a.dlc(), 6);
        assert_eq!(
            codec().decode(&a),
            Decoded::Events(vec![AccessoryEvent {
                address: 5,
                protocol: Some(DecoderProtocol::Mm),
                value: AccessoryValue::Red
            }
            .into()])
        );
    }

    #[test]
    fn accessory_switch_time_in_ten_ms_units() {
        let frame = encode_one(Command::switch_accessory(1, None, AccessoryValue::Green, 250));
        assert_eq!(frame.dlc(), 8);
        assert_eq!(frame.u16_at(6), Some(25));
    }

    #[test]
    fn cutoff_has_power_zero() {
        let c = codec();
        let frame = c
            .cutoff(5, DecoderProtocol::Dcc, AccessoryValue::Green)
            .unwrap();
        assert_eq!(frame.dlc(), 6);
        assert_eq!(&frame.data[..], &[0, 0, 0x38, 0x04, 1, 0]);
        assert_eq!(c.decode(&frame), Decoded::CoilOff);
    }

    #[test]
    fn power_round_trip() {
        let c = codec();
        for on in [true, false] {
            let frame = encode_one(Command::power(on));
            assert_eq!(
                c.decode(&reply(&frame)),
                Decoded::Events(vec![PowerEvent { on }.into()])
            );
        }
    }

    #[test]
    fn bad_dlc_is_discarded() {
        let c = codec();
        assert!(c.decode(&CanFrame::new(0x09, 0, &[0, 0, 0, 1, 0])).is_unrecognized());
        assert!(c.decode(&CanFrame::new(0x16, 0, &[0, 0, 0x30, 0])).is_unrecognized());
        assert!(c.decode(&CanFrame::new(0x7E, 0, &[])).is_unrecognized());
    }

    #[test]
    fn status_replies_split_value_and_validity() {
        let c = codec();
        let request = encode_one(Command::new(
            CommandKind::QueryMeasurement { channel: 1 },
            0x4711,
            None,
        ));
        assert_eq!(request.dlc(), 6);

        let validity = CanFrame::new(0x01, 0, &[0, 0, 0x47, 0x11, 0x0B, 1, 1]);
        let value = CanFrame::new(0x01, 0, &[0, 0, 0x47, 0x11, 0x0B, 1, 0x01, 0x2C]);
        assert!(validity.is_response_for(&request));
        assert_eq!(
            c.decode(&validity),
            Decoded::Validity {
                channel: 1,
                valid: true
            }
        );
        assert_eq!(
            c.decode(&value),
            Decoded::Measurement {
                channel: 1,
                raw: 300
            }
        );
    }

    #[test]
    fn config_dump_packets_and_terminator() {
        let c = codec();
        let packet = CanFrame::new(0x3B, 2, b"60226\0\0\0");
        match c.decode(&packet) {
            Decoded::ConfigPacket { number, data } => {
                assert_eq!(number, 2);
                assert_eq!(&data[..5], b"60226");
            }
            other => panic!("unexpected {other:?}"),
        }
        let end = CanFrame::new(0x3B, 0x0300, &[0, 0, 0x47, 0x11, 0, 4]);
        assert_eq!(
            c.decode(&end),
            Decoded::ConfigEnd {
                uid: 0x4711,
                index: 0,
                count: 4
            }
        );
    }

    #[test]
    fn ping_reply_identifies_device() {
        let reply = CanFrame::new(0x31, 0x1234, &[0x63, 0x73, 0x45, 0x8C, 4, 2, 0xFF, 0xFF]);
        assert_eq!(
            codec().decode(&reply),
            Decoded::Ping {
                uid: 0x6373_458C,
                major: 4,
                minor: 2,
                type_code: 0xFFFF
            }
        );
        assert!(reply.is_response_for(&codec().ping()));
    }

    #[test]
    fn s88_event_reports_contact() {
        let event = CanFrame::new(0x23, 0, &[0, 1, 0, 2, 0, 1, 0, 10]);
        assert_eq!(
            codec().decode(&event),
            Decoded::Contact {
                device_id: 1,
                contact: 2,
                active: true
            }
        );
    }
}
