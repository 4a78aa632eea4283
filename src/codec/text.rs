//! Codec for DCC-EX style text command stations.
//!
//! Commands and replies are ASCII lines wrapped in angle brackets. A reply is
//! complete once its terminal `>` has arrived; length carries no meaning.
//!
//! | Command | Meaning |
//! |---------|---------|
//! | `<1>` / `<0>` | track power on / off |
//! | `<t cab speed dir>` | throttle, speed 0..=126, dir 1 = forward |
//! | `<F cab fn state>` | decoder function |
//! | `<a addr state>` | accessory, 1 = green, 0 = red |
//! | `<Q>` | list sensor states |
//! | `<s>` | station status |
//! | `<c>` | track current |
//!
//! The station times accessory pulses itself, so there is no cutoff frame.

use core::fmt;

use crate::codec::Decoded;
use crate::commands::{AccessoryValue, Command, CommandKind, DecoderProtocol, Direction};
use crate::error::{BridgeError, Result};
use crate::events::{
    AccessoryEvent, BridgeEvent, LocomotiveDirectionEvent, LocomotiveFunctionEvent,
    LocomotiveSpeedEvent, PowerEvent,
};
use crate::state::LocoState;
use crate::traits::Codec;

/// Highest speed step.
pub const SPEED_MAX: u16 = 126;
/// Highest function number.
pub const MAX_FUNCTION: u8 = 68;
/// Highest function reported in a loco state broadcast.
const BROADCAST_FUNCTIONS: u8 = 28;
/// Highest long DCC address.
pub const MAX_CAB: u32 = 10239;
/// Marker that ends every reply.
pub const TERMINATOR: char = '>';
/// Measurement channel used for the main track current.
pub const CURRENT_CHANNEL: u8 = 1;

/// One command or reply line, without line break.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TextFrame(pub String);

impl TextFrame {
    /// Wrap a line.
    pub fn new(line: impl Into<String>) -> Self {
        Self(line.into())
    }

    /// The line text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True once the terminal marker has been received.
    pub fn is_complete(&self) -> bool {
        self.0.trim_end().ends_with(TERMINATOR)
    }
}

impl fmt::Display for TextFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stateless codec for the text protocol. Only speaks DCC.
#[derive(Clone, Copy, Debug, Default)]
pub struct TextCodec;

impl TextCodec {
    /// Create the codec.
    pub const fn new() -> Self {
        Self
    }

    fn cab(address: u32) -> Result<u32> {
        if (1..=MAX_CAB).contains(&address) {
            Ok(address)
        } else {
            Err(BridgeError::unsupported(Self::BACKEND, format!("cab {address}")))
        }
    }

    fn throttle(cab: u32, speed: u16, direction: Direction) -> TextFrame {
        let dir = u8::from(direction == Direction::Forward);
        TextFrame(format!("<t {cab} {} {dir}>", speed.min(SPEED_MAX)))
    }

    fn loco_broadcast(fields: &[&str]) -> Option<Vec<BridgeEvent>> {
        let [cab, _reg, speed_byte, functions, ..] = fields else {
            return None;
        };
        let address: u32 = cab.parse().ok()?;
        let speed_byte: u8 = speed_byte.parse().ok()?;
        let functions: u32 = functions.parse().ok()?;
        let protocol = Some(DecoderProtocol::Dcc);

        let step = speed_byte & 0x7F;
        let direction = if speed_byte & 0x80 != 0 {
            Direction::Forward
        } else {
            Direction::Backward
        };
        let mut events = vec![
            BridgeEvent::Speed(LocomotiveSpeedEvent {
                address,
                protocol,
                // 0 = stop, 1 = emergency stop, n = step n-1
                speed: u16::from(step.saturating_sub(1)),
            }),
            BridgeEvent::Direction(LocomotiveDirectionEvent {
                address,
                protocol,
                direction,
            }),
        ];
        events.extend((0..=BROADCAST_FUNCTIONS).map(|number| {
            BridgeEvent::Function(LocomotiveFunctionEvent {
                address,
                protocol,
                number,
                on: functions & (1 << number) != 0,
            })
        }));
        Some(events)
    }
}

impl Codec for TextCodec {
    type Frame = TextFrame;

    const BACKEND: &'static str = "dcc-ex";

    fn encode(&self, command: &Command, loco: &LocoState) -> Result<Vec<TextFrame>> {
        let frame = match command.kind {
            CommandKind::Power(on) => TextFrame::new(if on { "<1>" } else { "<0>" }),
            CommandKind::SetSpeed { speed } => {
                Self::throttle(Self::cab(command.address)?, speed, loco.direction)
            }
            CommandKind::ChangeDirection(direction) => {
                Self::throttle(Self::cab(command.address)?, loco.speed, direction)
            }
            CommandKind::SetFunction { number, on } => {
                if number > MAX_FUNCTION {
                    return Err(BridgeError::unsupported(
                        Self::BACKEND,
                        format!("function f{number}"),
                    ));
                }
                let cab = Self::cab(command.address)?;
                TextFrame(format!("<F {cab} {number} {}>", u8::from(on)))
            }
            CommandKind::SwitchAccessory { value, .. } => {
                let state = u8::from(value == AccessoryValue::Green);
                TextFrame(format!("<a {} {state}>", command.address))
            }
            CommandKind::PollFeedback => TextFrame::new("<Q>"),
            CommandKind::QueryMeasurement { .. } => TextFrame::new("<c>"),
            CommandKind::QueryDevice { .. } => TextFrame::new("<s>"),
        };
        Ok(vec![frame])
    }

    fn cutoff(&self, _: u32, _: DecoderProtocol, _: AccessoryValue) -> Option<TextFrame> {
        None
    }

    fn decode(&self, frame: &TextFrame) -> Decoded {
        let line = frame.as_str().trim();
        let Some(inner) = line
            .strip_prefix('<')
            .and_then(|rest| rest.strip_suffix(TERMINATOR))
        else {
            tracing::debug!(line, "discarding malformed text reply");
            return Decoded::Unrecognized;
        };
        let inner = inner.trim();
        let mut chars = inner.chars();
        let Some(op) = chars.next() else {
            return Decoded::Unrecognized;
        };
        let fields: Vec<&str> = chars.as_str().split_whitespace().collect();

        match op {
            'p' => match fields.first().and_then(|f| f.chars().next()) {
                Some('0') => Decoded::Events(vec![PowerEvent { on: false }.into()]),
                Some('1') => Decoded::Events(vec![PowerEvent { on: true }.into()]),
                _ => Decoded::Unrecognized,
            },
            'l' => Self::loco_broadcast(&fields).map_or(Decoded::Unrecognized, Decoded::Events),
            'H' => match (fields.first(), fields.get(1)) {
                (Some(id), Some(state)) => match (id.parse::<u32>(), *state) {
                    (Ok(address), "1" | "0") => Decoded::Events(vec![AccessoryEvent {
                        address,
                        protocol: Some(DecoderProtocol::Dcc),
                        value: if *state == "1" {
                            AccessoryValue::Green
                        } else {
                            AccessoryValue::Red
                        },
                    }
                    .into()]),
                    _ => Decoded::Unrecognized,
                },
                _ => Decoded::Unrecognized,
            },
            'Q' | 'q' => match fields.first().map(|f| f.parse::<u16>()) {
                Some(Ok(contact)) => Decoded::Contact {
                    device_id: 0,
                    contact,
                    active: op == 'Q',
                },
                _ => Decoded::Unrecognized,
            },
            'i' => Decoded::Status(inner[1..].trim().to_string()),
            'c' => match fields.get(1).map(|f| f.parse::<u16>()) {
                Some(Ok(raw)) if fields.first() == Some(&"\"CurrentMAIN\"") => {
                    Decoded::Measurement {
                        channel: CURRENT_CHANNEL,
                        raw,
                    }
                }
                _ => Decoded::Unrecognized,
            },
            'X' => Decoded::Error(line.to_string()),
            'O' => Decoded::Ack,
            _ => Decoded::Unrecognized,
        }
    }

    fn to_wire(&self, frame: &TextFrame) -> Vec<u8> {
        let mut bytes = frame.0.clone().into_bytes();
        bytes.push(b'\n');
        bytes
    }
}
