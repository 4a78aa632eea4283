//! CAN central stations (CS2/CS3 family) over TCP or UDP.
//!
//! The bus is shared: other throttles, the station itself and feedback link
//! modules all talk on it. Every inbound frame is therefore offered to the
//! correlator first and then treated as unsolicited traffic, so a station
//! echo of our own command and a change made on a handheld both end up as
//! the same deduplicated events.
//!
//! # Queries
//!
//! | Command | Request | Completes on |
//! |---------|---------|--------------|
//! | `PollFeedback` | `0x20`, DLC 5 | DLC 7 reply |
//! | `QueryMeasurement` | `0x00/0x0B`, DLC 6 | DLC 8 reply for that channel |
//! | `QueryDevice` | `0x3A`, DLC 5 | DLC 6 terminator |
//!
//! A measurement query for channel 0 reads every known channel in turn.

use std::sync::Arc;
use std::time::Duration;

use super::{forward_to, intent_events, write_unit, Backend, Reply};
use crate::codec::can::{CanCodec, CanFrame, DEFAULT_SENDER_UID, SPEED_MAX, SUB_STATUS};
use crate::codec::Decoded;
use crate::commands::{Command, CommandKind};
use crate::correlator::Correlator;
use crate::device::{default_channels, DeviceAssembler, DeviceKind, Measurement, MeasurementChannel};
use crate::dispatcher::{DispatchSettings, OfflinePolicy};
use crate::error::{BridgeError, Result};
use crate::fanout::EventFanout;
use crate::safety::{EnergizedCoil, DEFAULT_MAX_DWELL_MS};
use crate::state::{ContactKey, Session};
use crate::traits::{Clock, Codec, PhysicalChannel};

/// Timing and identity of the CAN backend.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CanSettings {
    /// Delay between commands.
    pub pacing: Duration,
    /// Dispatcher idle tick.
    pub tick: Duration,
    /// Deadline for query replies.
    pub reply_timeout: Duration,
    /// Deadline for the ping probe.
    pub probe_timeout: Duration,
    /// Maximum coil dwell in milliseconds.
    pub max_dwell_ms: u64,
    /// UID the bridge sends as (determines the frame hash).
    pub sender_uid: u32,
    /// Sensor id offset for feedback bus contacts.
    pub address_offset: u32,
    /// Read device and channel descriptions after connecting.
    pub describe_devices: bool,
}

impl Default for CanSettings {
    fn default() -> Self {
        Self {
            pacing: Duration::from_millis(10),
            tick: Duration::from_millis(50),
            reply_timeout: Duration::from_millis(1000),
            probe_timeout: Duration::from_millis(500),
            max_dwell_ms: DEFAULT_MAX_DWELL_MS,
            sender_uid: DEFAULT_SENDER_UID,
            address_offset: 0,
            describe_devices: true,
        }
    }
}

impl CanSettings {
    /// Set the pacing delay.
    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    /// Set the idle tick.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Set the query deadline.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Set the probe deadline.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Set the sender UID.
    pub fn with_sender_uid(mut self, uid: u32) -> Self {
        self.sender_uid = uid;
        self
    }

    /// Set the longest time an accessory coil may stay energized.
    pub fn with_max_dwell_ms(mut self, max_dwell_ms: u64) -> Self {
        self.max_dwell_ms = max_dwell_ms;
        self
    }

    /// Set the sensor id offset.
    pub fn with_address_offset(mut self, offset: u32) -> Self {
        self.address_offset = offset;
        self
    }

    /// Enable or disable reading device descriptions on connect.
    pub fn with_describe_devices(mut self, describe: bool) -> Self {
        self.describe_devices = describe;
        self
    }
}

/// Executor for CAN central stations.
pub struct CanBackend {
    codec: CanCodec,
    channel: Arc<dyn PhysicalChannel>,
    correlator: Correlator<CanFrame>,
    session: Session,
    settings: CanSettings,
}

impl CanBackend {
    /// Backend writing to `channel`.
    pub fn new(
        channel: Arc<dyn PhysicalChannel>,
        clock: Arc<dyn Clock>,
        fanout: Arc<EventFanout>,
        settings: CanSettings,
    ) -> Self {
        Self {
            codec: CanCodec::new(settings.sender_uid),
            channel,
            correlator: Correlator::new(),
            session: Session::new(fanout, clock),
            settings,
        }
    }

    /// Effective settings.
    pub fn settings(&self) -> &CanSettings {
        &self.settings
    }

    fn on_unit(&self, unit: &[u8]) {
        let frame = match CanFrame::from_bytes(unit) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "discarding CAN unit");
                return;
            }
        };
        self.correlator.offer(&frame);

        match self.codec.decode(&frame) {
            Decoded::Events(events) => {
                self.session.publish(events);
            }
            Decoded::Contact {
                device_id,
                contact,
                active,
            } => {
                let key = ContactKey {
                    id: self.settings.address_offset + u32::from(contact),
                    device_id,
                    contact,
                };
                self.session.commit_contact(key, active);
            }
            Decoded::Ping {
                uid,
                major,
                minor,
                type_code,
            } => self
                .session
                .update_device(uid, |d| d.apply_ping(major, minor, type_code)),
            Decoded::Validity { channel, valid } => {
                self.session.set_channel_validity(channel, valid)
            }
            Decoded::Error(message) => tracing::warn!(%message, "station reported error"),
            other => tracing::trace!(command = frame.command, decoded = ?other, "inbound frame"),
        }
    }

    fn send(&self, frame: &CanFrame) -> Result<()> {
        tracing::trace!(command = frame.command, dlc = frame.dlc(), "write");
        write_unit(self.channel.as_ref(), &self.codec.to_wire(frame))
    }

    /// Write `frame` and wait for the replies `accepts` lets through until
    /// `is_complete` holds.
    fn request(
        &self,
        frame: &CanFrame,
        accepts: impl Fn(&CanFrame) -> bool + Send + 'static,
        is_complete: impl Fn(&[CanFrame]) -> bool + Send + 'static,
        timeout: Duration,
    ) -> Result<Vec<CanFrame>> {
        let mut ticket = self.correlator.register_matching(accepts, is_complete)?;
        if let Err(e) = self.send(frame) {
            self.correlator.cancel(ticket);
            return Err(e);
        }
        ticket.mark_sent();
        self.correlator.wait(ticket, timeout)
    }

    fn encode_one(&self, command: &Command) -> Result<CanFrame> {
        let loco = self
            .session
            .locos
            .get(command.protocol_or_default(), command.address);
        self.codec
            .encode(command, &loco)?
            .into_iter()
            .next()
            .ok_or_else(|| BridgeError::unsupported(CanCodec::BACKEND, command.kind.name()))
    }

    fn station_uid(&self) -> u32 {
        self.session
            .devices()
            .iter()
            .find(|d| d.kind == DeviceKind::CentralStation)
            .map_or(0, |d| d.uid)
    }

    fn poll_feedback(&self, command: &Command) -> Result<Reply> {
        let frame = self.encode_one(command)?;
        let request = frame.clone();
        let replies = self.request(
            &frame,
            move |f| f.is_response_for(&request) && f.dlc() == 7,
            |r| !r.is_empty(),
            self.settings.reply_timeout,
        )?;
        let reply = replies
            .first()
            .ok_or(BridgeError::Timeout { elapsed_ms: 0 })?;
        match self.codec.decode(reply) {
            Decoded::Feedback { module, bits } => {
                self.session
                    .commit_module(module, bits, self.settings.address_offset, 16);
                Ok(Reply::Feedback(bits.to_be_bytes()))
            }
            other => Err(BridgeError::Decode(format!("unexpected feedback reply {other:?}"))),
        }
    }

    fn read_channel(&self, uid: u32, channel: u8) -> Result<Option<Measurement>> {
        let frame = self.encode_one(&Command::new(
            CommandKind::QueryMeasurement { channel },
            uid,
            None,
        ))?;
        let request = frame.clone();
        let replies = self.request(
            &frame,
            move |f| {
                f.is_response_for(&request)
                    && f.data.get(4) == Some(&SUB_STATUS)
                    && f.data.get(5) == Some(&channel)
            },
            |r| r.iter().any(|f| f.dlc() == 8),
            self.settings.reply_timeout,
        )?;

        Ok(replies.iter().find_map(|reply| match self.codec.decode(reply) {
            Decoded::Measurement { channel, raw } => {
                Some(self.session.measure(channel, raw).unwrap_or(Measurement {
                    channel,
                    raw,
                    value: f64::from(raw),
                    unit: String::new(),
                    valid: true,
                }))
            }
            _ => None,
        }))
    }

    fn query_measurements(&self, command: &Command) -> Result<Reply> {
        let CommandKind::QueryMeasurement { channel } = command.kind else {
            return Ok(Reply::Done);
        };
        let uid = match command.address {
            0 => self.station_uid(),
            uid => uid,
        };
        let channels: Vec<u8> = match channel {
            0 => self.session.channels().iter().map(|c| c.number).collect(),
            n => vec![n],
        };

        let mut readings = Vec::with_capacity(channels.len());
        for number in channels {
            match self.read_channel(uid, number) {
                Ok(Some(reading)) => readings.push(reading),
                Ok(None) => {}
                Err(e) if e.is_transport() => return Err(e),
                Err(e) => tracing::debug!(channel = number, error = %e, "measurement unavailable"),
            }
        }
        Ok(Reply::Measurements(readings))
    }

    /// Read one status-config dump and fold it into the session.
    fn describe(&self, uid: u32, index: u8) -> Result<()> {
        let frame = self.encode_one(&Command::query_device(uid, index))?;
        let request = frame.clone();
        let replies = self.request(
            &frame,
            move |f| f.is_response_for(&request) && matches!(f.dlc(), 6 | 8),
            |r| r.last().is_some_and(|f| f.dlc() == 6),
            self.settings.reply_timeout,
        )?;

        let mut dump = DeviceAssembler::new();
        for reply in &replies {
            match self.codec.decode(reply) {
                Decoded::ConfigPacket { number, data } => dump.add_packet(number, data),
                Decoded::ConfigEnd { count, .. } => dump.finish(count),
                _ => {}
            }
        }
        if !dump.is_complete() {
            return Err(BridgeError::Decode(format!(
                "incomplete config dump {index} from {uid:#010x}: {} packets",
                dump.received()
            )));
        }

        let bytes = dump.bytes();
        if index == 0 {
            let complete = self.session.update_device(uid, |d| {
                d.apply_description(&bytes);
                d.is_complete()
            });
            if !complete {
                return Err(BridgeError::Decode(format!(
                    "implausible description from {uid:#010x}"
                )));
            }
        } else if let Some(channel) = MeasurementChannel::from_description(&bytes) {
            self.session.upsert_channel(channel);
        }
        Ok(())
    }
}

impl Backend for CanBackend {
    fn name(&self) -> &'static str {
        CanCodec::BACKEND
    }

    fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings::default()
            .with_pacing(self.settings.pacing)
            .with_tick(self.settings.tick)
            .with_max_dwell_ms(self.settings.max_dwell_ms)
            .with_offline(OfflinePolicy::Drop)
    }

    fn session(&self) -> &Session {
        &self.session
    }

    fn open(self: Arc<Self>) -> Result<()> {
        self.channel.open(forward_to(&self, Self::on_unit))
    }

    fn close(&self) {
        self.channel.close();
    }

    fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    fn probe(&self) -> bool {
        let ping = self.codec.ping();
        let request = ping.clone();
        match self.request(
            &ping,
            move |f| f.is_response_for(&request) && f.dlc() == 8,
            |r| !r.is_empty(),
            self.settings.probe_timeout,
        ) {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(error = %e, "ping probe failed");
                false
            }
        }
    }

    fn on_connected(&self) {
        self.session.set_channels(default_channels());
        if !self.settings.describe_devices {
            return;
        }
        for device in self.session.devices() {
            if let Err(e) = self.describe(device.uid, 0) {
                tracing::debug!(uid = device.uid, error = %e, "no device description");
                continue;
            }
            let declared = self
                .session
                .devices()
                .iter()
                .find(|d| d.uid == device.uid)
                .map_or(0, |d| d.measurement_channels);
            for index in 1..=declared {
                if let Err(e) = self.describe(device.uid, index) {
                    tracing::debug!(uid = device.uid, index, error = %e, "no channel description");
                }
            }
        }
    }

    fn execute(&self, command: &Command) -> Result<Reply> {
        match command.kind {
            CommandKind::PollFeedback => self.poll_feedback(command),
            CommandKind::QueryMeasurement { .. } => self.query_measurements(command),
            CommandKind::QueryDevice { index } => {
                self.describe(command.address, index)?;
                Ok(Reply::Done)
            }
            _ => {
                let frame = self.encode_one(command)?;
                self.send(&frame)?;
                self.session.publish(intent_events(command, SPEED_MAX));
                Ok(Reply::Done)
            }
        }
    }

    fn tracks_coils(&self) -> bool {
        true
    }

    fn cutoff(&self, coil: &EnergizedCoil) -> Result<()> {
        match self.codec.cutoff(coil.address, coil.protocol, coil.value) {
            Some(frame) => self.send(&frame),
            None => Ok(()),
        }
    }
}
