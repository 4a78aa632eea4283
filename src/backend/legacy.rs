//! Legacy 6050-style serial interface.
//!
//! The box is strictly half-duplex: it answers feedback reads with two bytes
//! and stays silent otherwise. Everything else is fire-and-forget, so the
//! only liveness probe available is a GO write that the port accepts.
//!
//! Feedback modules are not event-driven on this bus. When modules are
//! configured the backend reads them one after the other on the dispatcher's
//! idle tick, at most once per poll interval, and commits the replies to the
//! sensor bank.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{forward_to, intent_events, write_unit, Backend, Reply};
use crate::codec::serial::{SerialCodec, SerialFrame, GO, SPEED_MAX};
use crate::codec::Decoded;
use crate::commands::{Command, CommandKind, DecoderProtocol};
use crate::correlator::Correlator;
use crate::dispatcher::{DispatchSettings, OfflinePolicy};
use crate::error::{BridgeError, Result};
use crate::events::PowerEvent;
use crate::fanout::EventFanout;
use crate::safety::{EnergizedCoil, DEFAULT_MAX_DWELL_MS};
use crate::state::Session;
use crate::traits::{Clock, Codec, PhysicalChannel};

/// Timing and feedback layout of the serial interface.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LegacySettings {
    /// Delay between commands.
    pub pacing: Duration,
    /// Dispatcher idle tick.
    pub tick: Duration,
    /// Deadline for a feedback reply, counted from send.
    pub reply_timeout: Duration,
    /// Maximum coil dwell in milliseconds.
    pub max_dwell_ms: u64,
    /// Number of feedback modules to poll (0 disables polling).
    pub feedback_modules: u16,
    /// Sensor id of module 1 contact 0.
    pub address_offset: u32,
    /// Contacts per module.
    pub ports_per_module: u16,
    /// Minimum time between two polling rounds.
    pub poll_interval: Duration,
}

impl Default for LegacySettings {
    fn default() -> Self {
        Self {
            pacing: Duration::from_millis(50),
            tick: Duration::from_millis(50),
            reply_timeout: Duration::from_millis(2000),
            max_dwell_ms: DEFAULT_MAX_DWELL_MS,
            feedback_modules: 0,
            address_offset: 0,
            ports_per_module: 16,
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl LegacySettings {
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

    /// Set the feedback reply deadline.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Set the maximum coil dwell.
    pub fn with_max_dwell_ms(mut self, max_dwell_ms: u64) -> Self {
        self.max_dwell_ms = max_dwell_ms;
        self
    }

    /// Poll `modules` feedback modules, numbering sensors from `address_offset`.
    pub fn with_feedback(mut self, modules: u16, address_offset: u32) -> Self {
        self.feedback_modules = modules;
        self.address_offset = address_offset;
        self
    }

    /// Set the polling interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Executor for the legacy serial interface.
pub struct LegacyBackend {
    codec: SerialCodec,
    channel: Arc<dyn PhysicalChannel>,
    correlator: Correlator<u8>,
    session: Session,
    settings: LegacySettings,
    last_poll_ms: Mutex<Option<u64>>,
}

impl LegacyBackend {
    /// Backend writing to `channel`.
    pub fn new(
        channel: Arc<dyn PhysicalChannel>,
        clock: Arc<dyn Clock>,
        fanout: Arc<EventFanout>,
        settings: LegacySettings,
    ) -> Self {
        Self {
            codec: SerialCodec::new(),
            channel,
            correlator: Correlator::new(),
            session: Session::new(fanout, clock),
            settings,
            last_poll_ms: Mutex::new(None),
        }
    }

    /// Effective settings.
    pub fn settings(&self) -> &LegacySettings {
        &self.settings
    }

    fn on_unit(&self, unit: &[u8]) {
        for byte in unit {
            if !self.correlator.offer(byte) {
                tracing::debug!(byte, "unsolicited byte from serial interface");
            }
        }
    }

    fn send(&self, frame: &SerialFrame) -> Result<()> {
        tracing::trace!(command = frame.command, address = ?frame.address, "write");
        write_unit(self.channel.as_ref(), &self.codec.to_wire(frame))
    }

    /// Write a frame that the box answers and collect the two reply bytes.
    fn transact(&self, frame: &SerialFrame) -> Result<SerialFrame> {
        let mut ticket = self
            .correlator
            .register_matching(|_| true, |bytes: &[u8]| bytes.len() >= 2)?;
        if let Err(e) = self.send(frame) {
            self.correlator.cancel(ticket);
            return Err(e);
        }
        ticket.mark_sent();
        let bytes = self.correlator.wait(ticket, self.settings.reply_timeout)?;

        let mut reply = frame.clone();
        for byte in bytes {
            reply.push_response(byte);
        }
        Ok(reply)
    }

    fn read_feedback(&self, frame: &SerialFrame) -> Result<Reply> {
        let reply = self.transact(frame)?;
        match self.codec.decode(&reply) {
            Decoded::Feedback { module, bits } => {
                self.session.commit_module(
                    module,
                    bits,
                    self.settings.address_offset,
                    self.settings.ports_per_module,
                );
                Ok(Reply::Feedback(reply.response))
            }
            other => Err(BridgeError::Decode(format!(
                "unexpected feedback reply {other:?}"
            ))),
        }
    }

    fn poll_modules(&self) {
        for module in 1..=self.settings.feedback_modules {
            if let Err(e) = self.execute(&Command::poll_feedback(u32::from(module))) {
                tracing::debug!(module, error = %e, "feedback poll failed");
                if e.is_transport() {
                    break;
                }
            }
        }
    }
}

impl Backend for LegacyBackend {
    fn name(&self) -> &'static str {
        SerialCodec::BACKEND
    }

    fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings::default()
            .with_pacing(self.settings.pacing)
            .with_tick(self.settings.tick)
            .with_max_dwell_ms(self.settings.max_dwell_ms)
            .with_offline(OfflinePolicy::Hold)
            .with_auto_restart(true)
    }

    fn session(&self) -> &Session {
        &self.session
    }

    fn open(self: Arc<Self>) -> Result<()> {
        self.channel.open(forward_to(&self, Self::on_unit))
    }

    fn close(&self) {
        self.channel.close();
        *self.last_poll_ms.lock() = None;
    }

    fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    fn probe(&self) -> bool {
        match self.send(&SerialFrame::single(GO)) {
            Ok(()) => {
                self.session.publish([PowerEvent { on: true }.into()]);
                true
            }
            Err(e) => {
                tracing::debug!(port = %self.channel.describe(), error = %e, "GO probe not accepted");
                false
            }
        }
    }

    fn execute(&self, command: &Command) -> Result<Reply> {
        // the box only drives Motorola decoders
        let command = Command {
            protocol: Some(DecoderProtocol::Mm),
            ..command.clone()
        };
        let loco = self.session.locos.get(DecoderProtocol::Mm, command.address);
        let frames = self.codec.encode(&command, &loco)?;

        if command.kind == CommandKind::PollFeedback {
            return match frames.first() {
                Some(frame) => self.read_feedback(frame),
                None => Ok(Reply::Done),
            };
        }
        for frame in &frames {
            self.send(frame)?;
        }
        self.session.publish(intent_events(&command, SPEED_MAX));
        Ok(Reply::Done)
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

    fn idle(&self) {
        if self.settings.feedback_modules == 0 {
            return;
        }
        let now = self.session.now_ms();
        let interval = self.settings.poll_interval.as_millis() as u64;
        {
            let mut last = self.last_poll_ms.lock();
            if last.is_some_and(|at| now.saturating_sub(at) < interval) {
                return;
            }
            *last = Some(now);
        }
        self.poll_modules();
    }
}
