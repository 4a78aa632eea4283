//! Codec for the legacy 6050-style RS-232 interface.
//!
//! Every command is one command byte, optionally followed by one address
//! byte. Only feedback reads produce a reply: two bytes per module.
//!
//! | Byte | Meaning | Address byte |
//! |------|---------|--------------|
//! | `0..=14` (+16 with f0) | speed step | locomotive |
//! | `15` (+16 with f0) | reverse pulse | locomotive |
//! | `32` | solenoid power off | none |
//! | `33` / `34` | accessory green / red | accessory |
//! | `64..=79` | functions f1..f4 as bit mask | locomotive |
//! | `96` / `97` | GO / STOP | none |
//! | `192 + n` | read feedback module n | none |
//!
//! # Example
//!
//! ```rust
//! use rs_trainz_bridge::codec::SerialCodec;
//! use rs_trainz_bridge::state::LocoState;
//! use rs_trainz_bridge::traits::Codec;
//! use rs_trainz_bridge::Command;
//!
//! let codec = SerialCodec::new();
//! let loco = LocoState::default().with_function(0, true);
//! let frames = codec.encode(&Command::set_speed(12, None, 11), &loco).unwrap();
//! assert_eq!(codec.to_wire(&frames[0]), vec![27, 12]);
//! ```

use core::ops::RangeInclusive;

use crate::codec::Decoded;
use crate::commands::{AccessoryValue, Command, CommandKind, DecoderProtocol};
use crate::error::{BridgeError, Result};
use crate::events::{
    AccessoryEvent, BridgeEvent, LocomotiveFunctionEvent, LocomotiveSpeedEvent, PowerEvent,
};
use crate::state::LocoState;
use crate::traits::Codec;

// ============================================================================
// Command Bytes
// ============================================================================

/// Highest speed step.
pub const SPEED_MAX: u16 = 14;
/// Speed nibble value that toggles direction.
pub const REVERSE: u8 = 15;
/// Bit folded into speed bytes when f0 is on.
pub const FUNCTION_BIT: u8 = 16;
/// Base of the f1..f4 function bytes.
pub const FUNCTION_BASE: u8 = 64;
/// Switch off the solenoid power of all accessories.
pub const ACCESSORY_OFF: u8 = 32;
/// Energize the green coil.
pub const ACCESSORY_GREEN: u8 = 33;
/// Energize the red coil.
pub const ACCESSORY_RED: u8 = 34;
/// Track power on.
pub const GO: u8 = 96;
/// Track power off.
pub const STOP: u8 = 97;
/// Base of the single-module feedback read.
pub const FEEDBACK_SINGLE_BASE: u8 = 192;

/// Command bytes whose reply carries feedback contacts.
///
/// `129..=159` are the multi-module reads, `193..=223` the single-module
/// reads. These boundaries come from observed hardware behaviour and are kept
/// as data; they still await confirmation against interface documentation.
pub const FEEDBACK_RANGES: [RangeInclusive<u8>; 2] = [129..=159, 193..=223];

/// Highest locomotive address.
pub const MAX_LOCO_ADDRESS: u32 = 80;
/// Highest accessory address (sent as address byte 0).
pub const MAX_ACCESSORY_ADDRESS: u32 = 256;
/// Highest feedback module.
pub const MAX_MODULE: u32 = 31;

/// Returns true if a reply to `command` carries feedback contacts.
pub fn is_feedback_command(command: u8) -> bool {
    FEEDBACK_RANGES.iter().any(|range| range.contains(&command))
}

/// Module addressed by a feedback command byte.
fn feedback_module(command: u8) -> u16 {
    FEEDBACK_RANGES
        .iter()
        .find(|range| range.contains(&command))
        .map(|range| u16::from(command - range.start() + 1))
        .unwrap_or(0)
}

/// Pack a speed step and the f0 flag into one byte.
///
/// ```
/// use rs_trainz_bridge::codec::serial::speed_byte;
///
/// assert_eq!(speed_byte(11, true), 27);
/// assert_eq!(speed_byte(11, false), 11);
/// assert_eq!(speed_byte(99, false), 14);
/// ```
pub fn speed_byte(speed: u16, f0: bool) -> u8 {
    let step = speed.min(SPEED_MAX) as u8;
    if f0 {
        step | FUNCTION_BIT
    } else {
        step
    }
}

// ============================================================================
// Frame
// ============================================================================

/// One legacy command: command byte, optional address byte and reply buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerialFrame {
    /// Command byte.
    pub command: u8,
    /// Address byte, if the command takes one.
    pub address: Option<u8>,
    /// Reply bytes received so far.
    pub response: [u8; 2],
    /// Number of reply bytes received (0, 1 or 2).
    pub received: u8,
}

impl SerialFrame {
    /// Frame without address byte.
    pub const fn single(command: u8) -> Self {
        Self {
            command,
            address: None,
            response: [0; 2],
            received: 0,
        }
    }

    /// Frame with an address byte.
    pub const fn addressed(command: u8, address: u8) -> Self {
        Self {
            command,
            address: Some(address),
            response: [0; 2],
            received: 0,
        }
    }

    /// Returns true if the interface answers this command.
    pub fn expects_reply(&self) -> bool {
        is_feedback_command(self.command)
    }

    /// Store one reply byte. Returns true once the reply is complete.
    pub fn push_response(&mut self, byte: u8) -> bool {
        if usize::from(self.received) < self.response.len() {
            self.response[usize::from(self.received)] = byte;
            self.received += 1;
        }
        self.is_complete()
    }

    /// True when no further reply bytes are expected.
    pub fn is_complete(&self) -> bool {
        !self.expects_reply() || usize::from(self.received) == self.response.len()
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Stateless codec for the 6050 interface. Only speaks Motorola.
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialCodec;

impl SerialCodec {
    /// Create the codec.
    pub const fn new() -> Self {
        Self
    }

    fn loco_address(address: u32) -> Result<u8> {
        if (1..=MAX_LOCO_ADDRESS).contains(&address) {
            Ok(address as u8)
        } else {
            Err(BridgeError::unsupported(
                Self::BACKEND,
                format!("locomotive address {address}"),
            ))
        }
    }

    fn accessory_address(address: u32) -> Result<u8> {
        match address {
            MAX_ACCESSORY_ADDRESS => Ok(0),
            1..=255 => Ok(address as u8),
            _ => Err(BridgeError::unsupported(
                Self::BACKEND,
                format!("accessory address {address}"),
            )),
        }
    }

    fn function_frame(address: u8, functions: u64) -> SerialFrame {
        SerialFrame::addressed(FUNCTION_BASE + ((functions >> 1) & 0x0F) as u8, address)
    }
}

impl Codec for SerialCodec {
    type Frame = SerialFrame;

    const BACKEND: &'static str = "legacy-serial";

    fn encode(&self, command: &Command, loco: &LocoState) -> Result<Vec<SerialFrame>> {
        let f0 = loco.function(0);
        match command.kind {
            CommandKind::SetSpeed { speed } => {
                let address = Self::loco_address(command.address)?;
                Ok(vec![SerialFrame::addressed(speed_byte(speed, f0), address)])
            }
            CommandKind::ChangeDirection(direction) => {
                let address = Self::loco_address(command.address)?;
                if direction == loco.direction {
                    return Ok(Vec::new());
                }
                let reverse = if f0 { REVERSE | FUNCTION_BIT } else { REVERSE };
                let mut frames = vec![
                    SerialFrame::addressed(reverse, address),
                    SerialFrame::addressed(speed_byte(loco.speed, f0), address),
                ];
                // the reverse pulse resets f1..f4 on some decoders
                if loco.functions & 0b1_1110 != 0 {
                    frames.push(Self::function_frame(address, loco.functions));
                }
                Ok(frames)
            }
            CommandKind::SetFunction { number: 0, on } => {
                let address = Self::loco_address(command.address)?;
                Ok(vec![SerialFrame::addressed(speed_byte(loco.speed, on), address)])
            }
            CommandKind::SetFunction { number, on } if number <= 4 => {
                let address = Self::loco_address(command.address)?;
                let functions = loco.with_function(number, on).functions;
                Ok(vec![Self::function_frame(address, functions)])
            }
            CommandKind::SetFunction { number, .. } => Err(BridgeError::unsupported(
                Self::BACKEND,
                format!("function f{number}"),
            )),
            CommandKind::SwitchAccessory { value, .. } => {
                let address = Self::accessory_address(command.address)?;
                let byte = match value {
                    AccessoryValue::Green => ACCESSORY_GREEN,
                    AccessoryValue::Red => ACCESSORY_RED,
                };
                Ok(vec![SerialFrame::addressed(byte, address)])
            }
            CommandKind::PollFeedback => {
                if !(1..=MAX_MODULE).contains(&command.address) {
                    return Err(BridgeError::unsupported(
                        Self::BACKEND,
                        format!("feedback module {}", command.address),
                    ));
                }
                Ok(vec![SerialFrame::single(
                    FEEDBACK_SINGLE_BASE + command.address as u8,
                )])
            }
            CommandKind::Power(on) => Ok(vec![SerialFrame::single(if on { GO } else { STOP })]),
            CommandKind::QueryMeasurement { .. } | CommandKind::QueryDevice { .. } => Err(
                BridgeError::unsupported(Self::BACKEND, command.kind.name()),
            ),
        }
    }

    fn cutoff(
        &self,
        _address: u32,
        _protocol: DecoderProtocol,
        _value: AccessoryValue,
    ) -> Option<SerialFrame> {
        Some(SerialFrame::single(ACCESSORY_OFF))
    }

    fn decode(&self, frame: &SerialFrame) -> Decoded {
        let command = frame.command;
        if is_feedback_command(command) {
            if !frame.is_complete() {
                return Decoded::Unrecognized;
            }
            return Decoded::Feedback {
                module: feedback_module(command),
                bits: u16::from_be_bytes(frame.response),
            };
        }

        let protocol = Some(DecoderProtocol::Mm);
        match (command, frame.address) {
            (0..=31, Some(address)) => {
                let address = u32::from(address);
                let step = command & 0x0F;
                if step == REVERSE {
                    return Decoded::Reverse { address };
                }
                Decoded::Events(vec![
                    BridgeEvent::Speed(LocomotiveSpeedEvent {
                        address,
                        protocol,
                        speed: u16::from(step),
                    }),
                    BridgeEvent::Function(LocomotiveFunctionEvent {
                        address,
                        protocol,
                        number: 0,
                        on: command & FUNCTION_BIT != 0,
                    }),
                ])
            }
            (ACCESSORY_OFF, None) => Decoded::CoilOff,
            (ACCESSORY_GREEN | ACCESSORY_RED, Some(address)) => {
                let address = if address == 0 {
                    MAX_ACCESSORY_ADDRESS
                } else {
                    u32::from(address)
                };
                let value = if command == ACCESSORY_GREEN {
                    AccessoryValue::Green
                } else {
                    AccessoryValue::Red
                };
                Decoded::Events(vec![BridgeEvent::Accessory(AccessoryEvent {
                    address,
                    protocol,
                    value,
                })])
            }
            (64..=79, Some(address)) => {
                let bits = command - FUNCTION_BASE;
                Decoded::Events(
                    (1..=4u8)
                        .map(|number| {
                            BridgeEvent::Function(LocomotiveFunctionEvent {
                                address: u32::from(address),
                                protocol,
                                number,
                                on: bits & (1 << (number - 1)) != 0,
                            })
                        })
                        .collect(),
                )
            }
            (GO, None) => Decoded::Events(vec![BridgeEvent::Power(PowerEvent { on: true })]),
            (STOP, None) => Decoded::Events(vec![BridgeEvent::Power(PowerEvent { on: false })]),
            _ => Decoded::Unrecognized,
        }
    }

    fn to_wire(&self, frame: &SerialFrame) -> Vec<u8> {
        let mut bytes = vec![frame.command];
        bytes.extend(frame.address);
        bytes
    }
}
