//! The configured command station.
//!
//! [`CommandStation`] closes the set of supported hardware families into one
//! enum so callers can hold a concrete type while every variant still answers
//! the same [`CommandStationController`] contract.

use std::sync::Arc;

use crate::backend::{CanBackend, LegacyBackend, TextBackend, VirtualStation};
use crate::commands::{AccessoryValue, DecoderProtocol, Direction};
use crate::config::{BackendKind, BridgeConfig, CanTransport, TextTransport};
use crate::connection::ConnectionManager;
use crate::device::{Device, Measurement};
use crate::error::Result;
use crate::fanout::EventFanout;
use crate::hal::{Framing, TcpChannel, UdpChannel};
use crate::state::SensorState;
use crate::traits::{Clock, CommandStationController, PhysicalChannel, SystemClock};

/// One command station of any supported family.
pub enum CommandStation {
    /// 6050-style serial interface.
    LegacySerial(ConnectionManager<LegacyBackend>),
    /// CAN central station.
    MarklinCan(ConnectionManager<CanBackend>),
    /// Text-protocol station.
    DccEx(ConnectionManager<TextBackend>),
    /// Software station.
    Virtual(VirtualStation),
}

impl CommandStation {
    /// Build the station `config` selects. Nothing is opened yet.
    ///
    /// ```
    /// use std::sync::Arc;
    /// use rs_trainz_bridge::config::BridgeConfig;
    /// use rs_trainz_bridge::fanout::EventFanout;
    /// use rs_trainz_bridge::station::CommandStation;
    /// use rs_trainz_bridge::CommandStationController;
    ///
    /// let station = CommandStation::from_config(&BridgeConfig::default(), Arc::new(EventFanout::new())).unwrap();
    /// assert_eq!(station.name(), "virtual");
    /// assert!(!station.is_connected());
    /// ```
    pub fn from_config(config: &BridgeConfig, fanout: Arc<EventFanout>) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let connection = config.connection_settings();

        let station = match config.backend {
            BackendKind::LegacySerial => {
                let channel = legacy_channel(config)?;
                let backend =
                    LegacyBackend::new(channel, Arc::clone(&clock), fanout, config.legacy_settings());
                Self::LegacySerial(ConnectionManager::new(backend, clock, connection))
            }
            BackendKind::MarklinCan => {
                let can = &config.can;
                let framing = Framing::Fixed(crate::codec::can::FRAME_LEN);
                let channel: Arc<dyn PhysicalChannel> = match can.transport {
                    CanTransport::Tcp => Arc::new(TcpChannel::new(&can.host, can.port, framing)),
                    CanTransport::Udp => Arc::new(UdpChannel::new(
                        &can.host,
                        can.port,
                        can.receive_port,
                        framing,
                    )),
                };
                let backend =
                    CanBackend::new(channel, Arc::clone(&clock), fanout, config.can_settings());
                Self::MarklinCan(ConnectionManager::new(backend, clock, connection))
            }
            BackendKind::DccEx => {
                let channel = text_channel(config)?;
                let backend =
                    TextBackend::new(channel, Arc::clone(&clock), fanout, config.text_settings());
                Self::DccEx(ConnectionManager::new(backend, clock, connection))
            }
            BackendKind::Virtual => Self::Virtual(
                VirtualStation::new(fanout, clock)
                    .with_address_offset(config.feedback.address_offset),
            ),
        };
        tracing::debug!(backend = station.name(), "command station configured");
        Ok(station)
    }

    /// Which family this station belongs to.
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::LegacySerial(_) => BackendKind::LegacySerial,
            Self::MarklinCan(_) => BackendKind::MarklinCan,
            Self::DccEx(_) => BackendKind::DccEx,
            Self::Virtual(_) => BackendKind::Virtual,
        }
    }

    fn inner(&self) -> &dyn CommandStationController {
        match self {
            Self::LegacySerial(s) => s,
            Self::MarklinCan(s) => s,
            Self::DccEx(s) => s,
            Self::Virtual(s) => s,
        }
    }
}

#[cfg(feature = "serial")]
fn legacy_channel(config: &BridgeConfig) -> Result<Arc<dyn PhysicalChannel>> {
    use std::time::Duration;

    use crate::hal::{SerialChannel, SerialSettings};

    let serial = &config.serial;
    let mut settings = SerialSettings::legacy(&serial.port);
    settings.byte_pause = Duration::from_millis(serial.byte_pause_ms.into());
    settings.cts_timeout = Duration::from_millis(serial.cts_timeout_ms.into());
    Ok(Arc::new(SerialChannel::new(settings)))
}

#[cfg(not(feature = "serial"))]
fn legacy_channel(_: &BridgeConfig) -> Result<Arc<dyn PhysicalChannel>> {
    Err(crate::error::BridgeError::Config(
        "legacy backend needs the `serial` feature".to_string(),
    ))
}

fn text_channel(config: &BridgeConfig) -> Result<Arc<dyn PhysicalChannel>> {
    let text = &config.text;
    match text.transport {
        TextTransport::Tcp => {
            let framing = Framing::Lines { terminator: b'>' };
            Ok(Arc::new(TcpChannel::new(&text.host, text.port, framing)))
        }
        #[cfg(feature = "serial")]
        TextTransport::Serial => Ok(Arc::new(crate::hal::SerialChannel::new(
            crate::hal::SerialSettings::text(&text.serial_port),
        ))),
        #[cfg(not(feature = "serial"))]
        TextTransport::Serial => Err(crate::error::BridgeError::Config(
            "text backend over serial needs the `serial` feature".to_string(),
        )),
    }
}

impl CommandStationController for CommandStation {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn connect(&self) -> bool {
        self.inner().connect()
    }

    fn disconnect(&self) {
        self.inner().disconnect()
    }

    fn is_connected(&self) -> bool {
        self.inner().is_connected()
    }

    fn power(&self, on: bool) -> bool {
        self.inner().power(on)
    }

    fn change_direction(&self, address: u32, protocol: DecoderProtocol, direction: Direction) {
        self.inner().change_direction(address, protocol, direction)
    }

    fn change_velocity(&self, address: u32, protocol: DecoderProtocol, speed: u16) {
        self.inner().change_velocity(address, protocol, speed)
    }

    fn change_function_value(&self, address: u32, protocol: DecoderProtocol, number: u8, on: bool) {
        self.inner().change_function_value(address, protocol, number, on)
    }

    fn switch_accessory(
        &self,
        address: u32,
        protocol: DecoderProtocol,
        value: AccessoryValue,
        switch_time_ms: u32,
    ) {
        self.inner()
            .switch_accessory(address, protocol, value, switch_time_ms)
    }

    fn get_feedback(&self, module: u16) -> Option<[u8; 2]> {
        self.inner().get_feedback(module)
    }

    fn sensor_state(&self, id: u32) -> Option<SensorState> {
        self.inner().sensor_state(id)
    }

    fn measurements(&self) -> Vec<Measurement> {
        self.inner().measurements()
    }

    fn devices(&self) -> Vec<Device> {
        self.inner().devices()
    }

    fn events(&self) -> &EventFanout {
        self.inner().events()
    }

    fn emergency_stop(&self) -> bool {
        self.inner().emergency_stop()
    }
}
