//! Per-backend executors.
//!
//! A [`Backend`] owns one codec, one physical channel and one correlator and
//! knows how to turn a single [`Command`] into writes and awaited replies.
//! Queueing, pacing, coil supervision and reconnects are not its business:
//! the [`CommandDispatcher`](crate::dispatcher::CommandDispatcher) and the
//! [`ConnectionManager`](crate::connection::ConnectionManager) are generic
//! over this trait and supply those for every hardware family.
//!
//! | Backend | Codec | Probe | Offline policy |
//! |---------|-------|-------|----------------|
//! | [`LegacyBackend`] | [`SerialCodec`](crate::codec::SerialCodec) | GO write accepted | hold, auto-restart |
//! | [`CanBackend`] | [`CanCodec`](crate::codec::CanCodec) | ping reply within 500 ms | drop |
//! | [`TextBackend`] | [`TextCodec`](crate::codec::TextCodec) | status reply | hold |
//!
//! [`VirtualStation`] has no wire at all and implements the upstream
//! contract directly.

pub mod can;
pub mod legacy;
pub mod text;
pub mod virtual_cs;

pub use can::{CanBackend, CanSettings};
pub use legacy::{LegacyBackend, LegacySettings};
pub use text::{TextBackend, TextSettings};
pub use virtual_cs::VirtualStation;

use std::io;
use std::sync::{Arc, Weak};

use crate::commands::{Command, CommandKind};
use crate::device::Measurement;
use crate::dispatcher::DispatchSettings;
use crate::error::{BridgeError, Result};
use crate::events::{
    AccessoryEvent, BridgeEvent, LocomotiveDirectionEvent, LocomotiveFunctionEvent,
    LocomotiveSpeedEvent, PowerEvent,
};
use crate::safety::EnergizedCoil;
use crate::state::{LocoTable, Session};
use crate::traits::{InboundHandler, PhysicalChannel};

/// Outcome of one executed command.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    /// Written; nothing to report.
    Done,
    /// Raw reply of a feedback module.
    Feedback([u8; 2]),
    /// Scaled measurement readings.
    Measurements(Vec<Measurement>),
}

/// One hardware family behind the shared dispatch machinery.
pub trait Backend: Send + Sync + 'static {
    /// Backend name used in logs.
    fn name(&self) -> &'static str;

    /// Pacing, tick and offline behaviour for the dispatcher.
    fn dispatch_settings(&self) -> DispatchSettings;

    /// Layout state of the current connection.
    fn session(&self) -> &Session;

    /// Open the channel and start delivering inbound units to this backend.
    fn open(self: Arc<Self>) -> Result<()>;

    /// Close the channel and stop its reader.
    fn close(&self);

    /// True while the channel is open.
    fn is_open(&self) -> bool;

    /// Liveness probe run right after opening.
    fn probe(&self) -> bool;

    /// Called once the probe passed, before the dispatcher starts.
    fn on_connected(&self) {}

    /// Encode, write and (where the command has a reply) await one command.
    fn execute(&self, command: &Command) -> Result<Reply>;

    /// True if accessory coils stay energized until a cutoff frame is sent.
    fn tracks_coils(&self) -> bool;

    /// Write the cutoff frame for one coil.
    fn cutoff(&self, coil: &EnergizedCoil) -> Result<()>;

    /// Idle hook on the dispatcher thread (periodic polling).
    fn idle(&self) {}
}

/// Handler that forwards inbound units to `on_unit` while the backend lives.
///
/// Holds only a weak reference so the channel reader never keeps its owner
/// alive.
pub(crate) fn forward_to<B>(backend: &Arc<B>, on_unit: fn(&B, &[u8])) -> InboundHandler
where
    B: Send + Sync + 'static,
{
    let weak: Weak<B> = Arc::downgrade(backend);
    Arc::new(move |unit: &[u8]| {
        if let Some(backend) = weak.upgrade() {
            on_unit(&backend, unit);
        }
    })
}

/// Write one unit; a refused write counts as a transport failure.
pub(crate) fn write_unit(channel: &dyn PhysicalChannel, bytes: &[u8]) -> Result<()> {
    if channel.write(bytes)? {
        Ok(())
    } else {
        Err(BridgeError::Transport(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("{} refused the write", channel.describe()),
        )))
    }
}

/// Events a successfully written command implies.
///
/// Stations that do not echo commands still report what they were asked to
/// do; [`Session::publish`] filters out anything that changes nothing.
pub(crate) fn intent_events(command: &Command, speed_max: u16) -> Vec<BridgeEvent> {
    let address = command.address;
    let protocol = Some(command.protocol_or_default());
    match command.kind {
        CommandKind::SetSpeed { speed } => vec![LocomotiveSpeedEvent {
            address,
            protocol,
            speed: speed.min(speed_max),
        }
        .into()],
        CommandKind::ChangeDirection(direction) => vec![LocomotiveDirectionEvent {
            address,
            protocol,
            direction,
        }
        .into()],
        CommandKind::SetFunction { number, on } => vec![LocomotiveFunctionEvent {
            address,
            protocol,
            number,
            on,
        }
        .into()],
        CommandKind::SwitchAccessory { value, .. } => vec![AccessoryEvent {
            address,
            protocol,
            value,
        }
        .into()],
        CommandKind::Power(on) => vec![PowerEvent { on }.into()],
        CommandKind::PollFeedback
        | CommandKind::QueryMeasurement { .. }
        | CommandKind::QueryDevice { .. } => Vec::new(),
    }
}

/// Speed-0 events for every locomotive last known to be running.
pub(crate) fn halt_events(locos: &LocoTable) -> Vec<BridgeEvent> {
    locos
        .moving()
        .into_iter()
        .map(|(protocol, address)| {
            LocomotiveSpeedEvent {
                address,
                protocol: Some(protocol),
                speed: 0,
            }
            .into()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{AccessoryValue, DecoderProtocol, Direction};
    use crate::hal::MockChannel;

    #[test]
    fn intent_events_clamp_speed_and_keep_protocol() {
        let events = intent_events(&Command::set_speed(3, Some(DecoderProtocol::Dcc), 500), 126);
        assert_eq!(
            events,
            vec![BridgeEvent::Speed(LocomotiveSpeedEvent {
                address: 3,
                protocol: Some(DecoderProtocol::Dcc),
                speed: 126,
            })]
        );
    }

    #[test]
    fn intent_events_default_to_motorola() {
        let events = intent_events(&Command::change_direction(7, None, Direction::Backward), 14);
        assert!(matches!(
            events[0],
            BridgeEvent::Direction(LocomotiveDirectionEvent {
                protocol: Some(DecoderProtocol::Mm),
                direction: Direction::Backward,
                ..
            })
        ));
        let events = intent_events(
            &Command::switch_accessory(5, None, AccessoryValue::Red, 0),
            14,
        );
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn queries_imply_no_events() {
        assert!(intent_events(&Command::poll_feedback(1), 14).is_empty());
        assert!(intent_events(&Command::query_measurement(1), 14).is_empty());
    }

    #[test]
    fn halt_events_cover_only_running_locos() {
        let locos = LocoTable::new();
        locos.apply(&intent_events(&Command::set_speed(3, None, 5), 14)[0]);
        locos.apply(&intent_events(&Command::set_speed(4, None, 0), 14)[0]);
        let events = halt_events(&locos);
        assert_eq!(
            events,
            vec![BridgeEvent::Speed(LocomotiveSpeedEvent {
                address: 3,
                protocol: Some(DecoderProtocol::Mm),
                speed: 0,
            })]
        );
    }

    #[test]
    fn refused_write_is_a_transport_error() {
        let channel = MockChannel::new("mock0");
        channel.open(Arc::new(|_: &[u8]| {})).unwrap();
        channel.set_reject_writes(true);
        let err = write_unit(&channel, &[96]).unwrap_err();
        assert!(err.is_transport());
    }

    #[test]
    fn forwarder_stops_once_owner_is_dropped() {
        struct Owner(parking_lot::Mutex<Vec<u8>>);
        let owner = Arc::new(Owner(parking_lot::Mutex::new(Vec::new())));
        let handler = forward_to(&owner, |o: &Owner, unit: &[u8]| o.0.lock().extend_from_slice(unit));
        handler(&[1, 2]);
        assert_eq!(*owner.0.lock(), vec![1, 2]);
        drop(owner);
        handler(&[3]);
    }
}
