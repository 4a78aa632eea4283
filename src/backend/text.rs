//! Text-protocol stations (DCC-EX style) over TCP or serial.
//!
//! Commands are single lines and most of them are answered, if at all, by
//! broadcast lines that every connected throttle also receives. The backend
//! therefore waits a short grace period after each write and only looks at
//! the lines that arrived in that window for an error reply.
//!
//! Sensor state is reported as `<Q id>` / `<q id>` lines, both unsolicited
//! and in response to `<Q>`; feedback reads collect them for a fixed window.

use std::sync::Arc;
use std::time::Duration;

use super::{forward_to, intent_events, write_unit, Backend, Reply};
use crate::codec::text::{TextCodec, TextFrame, CURRENT_CHANNEL, SPEED_MAX};
use crate::codec::Decoded;
use crate::commands::{Command, CommandKind, DecoderProtocol};
use crate::correlator::Correlator;
use crate::device::{Measurement, MeasurementChannel};
use crate::dispatcher::{DispatchSettings, OfflinePolicy};
use crate::error::{BridgeError, Result};
use crate::fanout::EventFanout;
use crate::safety::{EnergizedCoil, DEFAULT_MAX_DWELL_MS};
use crate::state::{ContactKey, Session};
use crate::traits::{Clock, Codec, PhysicalChannel};

/// Device id used for the station in the device table.
const STATION_UID: u32 = 0;

/// Timing of the text backend.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TextSettings {
    /// Delay between commands.
    pub pacing: Duration,
    /// Dispatcher idle tick.
    pub tick: Duration,
    /// Deadline for status and current replies.
    pub reply_timeout: Duration,
    /// Time after a write during which replies are attributed to it.
    pub grace: Duration,
    /// Collection window for sensor list replies.
    pub sensor_window: Duration,
    /// Sensor id offset.
    pub address_offset: u32,
}

impl Default for TextSettings {
    fn default() -> Self {
        Self {
            pacing: Duration::from_millis(20),
            tick: Duration::from_millis(50),
            reply_timeout: Duration::from_millis(1000),
            grace: Duration::from_millis(50),
            sensor_window: Duration::from_millis(200),
            address_offset: 0,
        }
    }
}

impl TextSettings {
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

    /// Set the reply deadline.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Set the post-write grace period.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Set the sensor collection window.
    pub fn with_sensor_window(mut self, window: Duration) -> Self {
        self.sensor_window = window;
        self
    }

    /// Set the sensor id offset.
    pub fn with_address_offset(mut self, offset: u32) -> Self {
        self.address_offset = offset;
        self
    }
}

/// Executor for text-protocol stations.
pub struct TextBackend {
    codec: TextCodec,
    channel: Arc<dyn PhysicalChannel>,
    correlator: Correlator<TextFrame>,
    session: Session,
    settings: TextSettings,
}

impl TextBackend {
    /// Backend writing to `channel`.
    pub fn new(
        channel: Arc<dyn PhysicalChannel>,
        clock: Arc<dyn Clock>,
        fanout: Arc<EventFanout>,
        settings: TextSettings,
    ) -> Self {
        Self {
            codec: TextCodec::new(),
            channel,
            correlator: Correlator::new(),
            session: Session::new(fanout, clock),
            settings,
        }
    }

    /// Effective settings.
    pub fn settings(&self) -> &TextSettings {
        &self.settings
    }

    fn on_unit(&self, unit: &[u8]) {
        let line = String::from_utf8_lossy(unit);
        let frame = TextFrame::new(line.trim());
        if !frame.is_complete() {
            tracing::warn!(line = %frame, "discarding unterminated line");
            return;
        }
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
            Decoded::Status(status) => {
                tracing::info!(%status, "station identified");
                self.session.update_device(STATION_UID, |d| d.name = status);
            }
            Decoded::Error(line) => tracing::warn!(%line, "station reported error"),
            other => tracing::trace!(line = %frame, decoded = ?other, "inbound line"),
        }
    }

    fn send(&self, frame: &TextFrame) -> Result<()> {
        tracing::trace!(line = %frame, "write");
        write_unit(self.channel.as_ref(), &self.codec.to_wire(frame))
    }

    /// Write `frame` and wait for the first reply `accepts` lets through.
    fn request(
        &self,
        frame: &TextFrame,
        accepts: impl Fn(&TextFrame) -> bool + Send + 'static,
        timeout: Duration,
    ) -> Result<TextFrame> {
        let mut ticket = self
            .correlator
            .register_matching(accepts, |r: &[TextFrame]| !r.is_empty())?;
        if let Err(e) = self.send(frame) {
            self.correlator.cancel(ticket);
            return Err(e);
        }
        ticket.mark_sent();
        self.correlator
            .wait(ticket, timeout)?
            .into_iter()
            .next()
            .ok_or(BridgeError::Timeout { elapsed_ms: 0 })
    }

    /// Write `frame` and gather every reply `accepts` lets through in `window`.
    fn gather(
        &self,
        frame: &TextFrame,
        accepts: impl Fn(&TextFrame) -> bool + Send + 'static,
        window: Duration,
    ) -> Result<Vec<TextFrame>> {
        let mut ticket = self.correlator.register_matching(accepts, |_: &[TextFrame]| false)?;
        if let Err(e) = self.send(frame) {
            self.correlator.cancel(ticket);
            return Err(e);
        }
        ticket.mark_sent();
        Ok(self.correlator.collect(ticket, window))
    }

    fn encode_one(&self, command: &Command) -> Result<TextFrame> {
        let loco = self.session.locos.get(DecoderProtocol::Dcc, command.address);
        self.codec
            .encode(command, &loco)?
            .into_iter()
            .next()
            .ok_or_else(|| BridgeError::unsupported(TextCodec::BACKEND, command.kind.name()))
    }

    fn read_current(&self, frame: &TextFrame) -> Result<Reply> {
        let codec = self.codec;
        let reply = self.request(
            frame,
            move |f| matches!(codec.decode(f), Decoded::Measurement { .. }),
            self.settings.reply_timeout,
        )?;
        let readings = match self.codec.decode(&reply) {
            Decoded::Measurement { channel, raw } => {
                vec![self.session.measure(channel, raw).unwrap_or(Measurement {
                    channel,
                    raw,
                    value: f64::from(raw),
                    unit: "mA".to_string(),
                    valid: true,
                })]
            }
            _ => Vec::new(),
        };
        Ok(Reply::Measurements(readings))
    }

    fn read_sensors(&self, module: u32, frame: &TextFrame) -> Result<Reply> {
        let codec = self.codec;
        let lines = self.gather(
            frame,
            move |f| matches!(codec.decode(f), Decoded::Contact { .. }),
            self.settings.sensor_window,
        )?;

        // module m covers contacts 16(m-1)+1 ..= 16m, MSB first
        let first = module.saturating_sub(1) * 16 + 1;
        let mut bits = 0u16;
        for line in &lines {
            if let Decoded::Contact {
                contact,
                active: true,
                ..
            } = self.codec.decode(line)
            {
                let contact = u32::from(contact);
                if (first..first + 16).contains(&contact) {
                    bits |= 0x8000 >> (contact - first);
                }
            }
        }
        Ok(Reply::Feedback(bits.to_be_bytes()))
    }

    fn read_status(&self, frame: &TextFrame) -> Result<Reply> {
        let codec = self.codec;
        self.request(
            frame,
            move |f| matches!(codec.decode(f), Decoded::Status(_)),
            self.settings.reply_timeout,
        )?;
        Ok(Reply::Done)
    }
}

impl Backend for TextBackend {
    fn name(&self) -> &'static str {
        TextCodec::BACKEND
    }

    fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings::default()
            .with_pacing(self.settings.pacing)
            .with_tick(self.settings.tick)
            .with_max_dwell_ms(DEFAULT_MAX_DWELL_MS)
            .with_offline(OfflinePolicy::Hold)
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
        match self.read_status(&TextFrame::new("<s>")) {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(error = %e, "status probe failed");
                false
            }
        }
    }

    fn on_connected(&self) {
        self.session.set_channels(vec![MeasurementChannel::new(
            CURRENT_CHANNEL,
            "CurrentMAIN",
            "mA",
            0.0,
            65535.0,
            0,
            u16::MAX,
        )]);
    }

    fn execute(&self, command: &Command) -> Result<Reply> {
        // the station addresses DCC decoders only
        let command = Command {
            protocol: Some(DecoderProtocol::Dcc),
            ..command.clone()
        };
        let frame = self.encode_one(&command)?;
        match command.kind {
            CommandKind::QueryMeasurement { .. } => return self.read_current(&frame),
            CommandKind::PollFeedback => return self.read_sensors(command.address, &frame),
            CommandKind::QueryDevice { .. } => return self.read_status(&frame),
            _ => {}
        }

        let codec = self.codec;
        let replies = self.gather(
            &frame,
            move |f| matches!(codec.decode(f), Decoded::Error(_)),
            self.settings.grace,
        )?;
        if let Some(rejection) = replies.first() {
            return Err(BridgeError::Rejected(format!("{frame} -> {rejection}")));
        }
        self.session.publish(intent_events(&command, SPEED_MAX));
        Ok(Reply::Done)
    }

    fn tracks_coils(&self) -> bool {
        false
    }

    fn cutoff(&self, coil: &EnergizedCoil) -> Result<()> {
        match self.codec.cutoff(coil.address, coil.protocol, coil.value) {
            Some(frame) => self.send(&frame),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{AccessoryValue, Direction};
    use crate::events::{BridgeEvent, SensorEvent};
    use crate::hal::{MockChannel, MockClock};
    use parking_lot::Mutex;

    fn backend() -> (Arc<MockChannel>, Arc<TextBackend>) {
        let channel = Arc::new(MockChannel::new("dccex:2560"));
        let settings = TextSettings::default()
            .with_grace(Duration::from_millis(5))
            .with_sensor_window(Duration::from_millis(20))
            .with_reply_timeout(Duration::from_millis(100));
        let backend = Arc::new(TextBackend::new(
            channel.clone(),
            Arc::new(MockClock::new()),
            Arc::new(EventFanout::new()),
            settings,
        ));
        Arc::clone(&backend).open().unwrap();
        (channel, backend)
    }

    fn lines(channel: &MockChannel) -> Vec<String> {
        channel
            .writes()
            .into_iter()
            .map(|w| String::from_utf8(w).unwrap())
            .collect()
    }

    #[test]
    fn throttle_then_direction_reuses_speed() {
        let (channel, backend) = backend();
        backend.execute(&Command::set_speed(3, None, 40)).unwrap();
        backend
            .execute(&Command::change_direction(3, None, Direction::Backward))
            .unwrap();
        assert_eq!(lines(&channel), vec!["<t 3 40 1>\n", "<t 3 40 0>\n"]);
    }

    #[test]
    fn error_reply_rejects_command() {
        let (channel, backend) = backend();
        channel.set_responder(|_: &[u8]| vec![b"<X>".to_vec()]);
        let err = backend
            .execute(&Command::switch_accessory(17, None, AccessoryValue::Green, 0))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Rejected(_)));
    }

    #[test]
    fn probe_waits_for_status_line() {
        let (channel, backend) = backend();
        assert!(!backend.probe());
        channel.set_responder(|bytes: &[u8]| {
            if bytes.starts_with(b"<s>") {
                vec![b"<p1>".to_vec(), b"<iDCC-EX V-5.0.0 / MEGA / STANDARD_MOTOR_SHIELD G-9db6d36>".to_vec()]
            } else {
                Vec::new()
            }
        });
        assert!(backend.probe());
        assert_eq!(backend.session().power(), Some(true));
        assert!(backend.session().devices()[0].name.starts_with("DCC-EX"));
    }

    #[test]
    fn current_reading_uses_current_channel() {
        let (channel, backend) = backend();
        backend.on_connected();
        channel.set_responder(|_: &[u8]| vec![b"<c \"CurrentMAIN\" 240 C Milli 0 2000 1 1800>".to_vec()]);
        let Reply::Measurements(readings) = backend.execute(&Command::query_measurement(0)).unwrap() else {
            panic!("expected measurements");
        };
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].channel, CURRENT_CHANNEL);
        assert_eq!(readings[0].raw, 240);
        assert_eq!(readings[0].unit, "mA");
    }

    #[test]
    fn sensor_list_fills_feedback_bits() {
        let (channel, backend) = backend();
        channel.set_responder(|bytes: &[u8]| {
            if bytes.starts_with(b"<Q>") {
                vec![b"<Q 2>".to_vec(), b"<q 3>".to_vec(), b"<Q 18>".to_vec()]
            } else {
                Vec::new()
            }
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        backend
            .session()
            .fanout()
            .add_sensor_listener(move |e: &SensorEvent| s.lock().push(e.id));

        let reply = backend.execute(&Command::poll_feedback(1)).unwrap();
        assert_eq!(reply, Reply::Feedback([0x40, 0x00]));
        assert_eq!(*seen.lock(), vec![2, 18]);
    }

    #[test]
    fn loco_broadcast_is_published_once() {
        let (channel, backend) = backend();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        backend
            .session()
            .fanout()
            .add_listener(move |e: &BridgeEvent| s.lock().push(e.name()));

        channel.inject(b"<l 3 0 130 1>");
        channel.inject(b"<l 3 0 130 1>");
        // speed 1, direction unchanged (forward), f0 on
        assert_eq!(*seen.lock(), vec!["speed", "function"]);
    }

    #[test]
    fn unterminated_line_is_dropped() {
        let (channel, backend) = backend();
        channel.inject(b"<p1");
        assert_eq!(backend.session().power(), None);
    }
}
