//! Connection manager: channel lifecycle, liveness probing and reconnects.
//!
//! # Lifecycle
//!
//! ```text
//! connect():     open channel ─▶ probe ─▶ live = true ─▶ on_connected ─▶ start dispatcher
//! operation:     ensure_live ─▶ (reconnect if wanted) ─▶ enqueue
//! disconnect():  quit dispatcher (coil cutoff) ─▶ close channel ─▶ clear session
//! ```
//!
//! Upstream operations never fail loudly. When the link is down and a
//! reconnect attempt also fails, the command is held or dropped according to
//! the backend's [`OfflinePolicy`] and the caller learns about it only
//! through [`is_connected`](ConnectionManager::is_connected).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::{halt_events, Backend, Reply};
use crate::commands::{AccessoryValue, Command, DecoderProtocol, Direction};
use crate::device::{Device, Measurement};
use crate::dispatcher::{CommandDispatcher, OfflinePolicy};
use crate::fanout::EventFanout;
use crate::state::SensorState;
use crate::traits::{Clock, CommandStationController};

/// Reconnect and query behaviour of a connection.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConnectionSettings {
    /// Reconnect transparently before an operation when the link is down.
    pub reconnect: bool,
    /// How long synchronous queries wait for the dispatcher.
    pub request_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            reconnect: true,
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl ConnectionSettings {
    /// Enable or disable transparent reconnects.
    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Set the query timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Owns one backend connection and exposes the upstream contract for it.
pub struct ConnectionManager<B: Backend> {
    backend: Arc<B>,
    dispatcher: CommandDispatcher<B>,
    live: Arc<AtomicBool>,
    wanted: AtomicBool,
    failed_probes: AtomicU32,
    settings: ConnectionSettings,
    lifecycle: Mutex<()>,
}

impl<B: Backend> ConnectionManager<B> {
    /// Manager for `backend`; nothing is opened until [`connect`](Self::connect).
    pub fn new(backend: B, clock: Arc<dyn Clock>, settings: ConnectionSettings) -> Self {
        let backend = Arc::new(backend);
        let live = Arc::new(AtomicBool::new(false));
        let dispatcher = CommandDispatcher::new(Arc::clone(&backend), Arc::clone(&live), clock);
        Self {
            backend,
            dispatcher,
            live,
            wanted: AtomicBool::new(false),
            failed_probes: AtomicU32::new(0),
            settings,
            lifecycle: Mutex::new(()),
        }
    }

    /// The backend.
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// The dispatcher of this connection.
    pub fn dispatcher(&self) -> &CommandDispatcher<B> {
        &self.dispatcher
    }

    /// Consecutive failed connection attempts.
    pub fn failed_probes(&self) -> u32 {
        self.failed_probes.load(Ordering::SeqCst)
    }

    fn connect_locked(&self) -> bool {
        let name = self.backend.name();
        self.live.store(false, Ordering::SeqCst);
        self.backend.close();
        self.backend.session().clear();

        if let Err(e) = Arc::clone(&self.backend).open() {
            let failures = self.failed_probes.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::warn!(backend = name, failures, error = %e, "cannot open channel");
            return false;
        }
        if !self.backend.probe() {
            let failures = self.failed_probes.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::warn!(backend = name, failures, "liveness probe failed");
            self.backend.close();
            return false;
        }

        self.failed_probes.store(0, Ordering::SeqCst);
        self.live.store(true, Ordering::SeqCst);
        tracing::info!(backend = name, "station connected");
        self.backend.on_connected();
        self.dispatcher.start()
    }

    /// Reconnect if the link is down and the caller still wants it up.
    pub fn ensure_live(&self) -> bool {
        if self.is_connected() {
            return true;
        }
        if !self.wanted.load(Ordering::SeqCst) || !self.settings.reconnect {
            return false;
        }
        let _guard = self.lifecycle.lock();
        if self.is_connected() {
            return true;
        }
        tracing::info!(backend = self.backend.name(), "reconnecting");
        self.connect_locked()
    }

    /// Queue a command, reconnecting first if needed.
    ///
    /// Returns true if the command was queued for dispatch (held commands
    /// count as queued).
    pub fn submit(&self, command: Command) -> bool {
        if self.ensure_live() {
            return self.dispatcher.enqueue(command);
        }
        match self.dispatcher.settings().offline {
            OfflinePolicy::Hold if self.wanted.load(Ordering::SeqCst) => {
                self.dispatcher.hold(command);
                true
            }
            _ => {
                tracing::warn!(
                    backend = self.backend.name(),
                    command = command.kind.name(),
                    "station offline, dropping command"
                );
                false
            }
        }
    }

    /// Run a query through the dispatcher and wait for its reply.
    pub fn request(&self, command: Command) -> Option<Reply> {
        if !self.ensure_live() {
            tracing::debug!(backend = self.backend.name(), command = command.kind.name(), "query while offline");
            return None;
        }
        self.dispatcher.request(command, self.settings.request_timeout)
    }
}

impl<B: Backend> CommandStationController for ConnectionManager<B> {
    fn name(&self) -> &'static str {
        self.backend.name()
    }

    fn connect(&self) -> bool {
        let _guard = self.lifecycle.lock();
        self.wanted.store(true, Ordering::SeqCst);
        if self.is_connected() {
            return true;
        }
        self.connect_locked()
    }

    fn disconnect(&self) {
        let _guard = self.lifecycle.lock();
        self.wanted.store(false, Ordering::SeqCst);
        self.dispatcher.quit();
        self.live.store(false, Ordering::SeqCst);
        self.backend.close();
        self.backend.session().clear();
        tracing::info!(backend = self.backend.name(), "station disconnected");
    }

    fn is_connected(&self) -> bool {
        self.live.load(Ordering::SeqCst) && self.backend.is_open()
    }

    fn power(&self, on: bool) -> bool {
        self.submit(Command::power(on))
    }

    fn change_direction(&self, address: u32, protocol: DecoderProtocol, direction: Direction) {
        self.submit(Command::change_direction(address, Some(protocol), direction));
    }

    fn change_velocity(&self, address: u32, protocol: DecoderProtocol, speed: u16) {
        self.submit(Command::set_speed(address, Some(protocol), speed));
    }

    fn change_function_value(&self, address: u32, protocol: DecoderProtocol, number: u8, on: bool) {
        self.submit(Command::set_function(address, Some(protocol), number, on));
    }

    fn switch_accessory(
        &self,
        address: u32,
        protocol: DecoderProtocol,
        value: AccessoryValue,
        switch_time_ms: u32,
    ) {
        self.submit(Command::switch_accessory(
            address,
            Some(protocol),
            value,
            switch_time_ms,
        ));
    }

    fn get_feedback(&self, module: u16) -> Option<[u8; 2]> {
        match self.request(Command::poll_feedback(u32::from(module)))? {
            Reply::Feedback(bytes) => Some(bytes),
            _ => None,
        }
    }

    fn sensor_state(&self, id: u32) -> Option<SensorState> {
        self.backend.session().sensors.get(id)
    }

    fn measurements(&self) -> Vec<Measurement> {
        match self.request(Command::query_measurement(0)) {
            Some(Reply::Measurements(readings)) => readings,
            _ => Vec::new(),
        }
    }

    fn devices(&self) -> Vec<Device> {
        self.backend.session().devices()
    }

    fn events(&self) -> &EventFanout {
        self.backend.session().fanout()
    }

    fn emergency_stop(&self) -> bool {
        let stopped = self.power(false);
        let session = self.backend.session();
        session.publish(halt_events(&session.locos));
        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{LegacyBackend, LegacySettings};
    use crate::hal::{MockChannel, MockClock};
    use crate::traits::channel::PhysicalChannel;

    fn legacy(channel: &Arc<MockChannel>) -> ConnectionManager<LegacyBackend> {
        let clock = Arc::new(MockClock::new());
        let settings = LegacySettings::default()
            .with_pacing(Duration::ZERO)
            .with_tick(Duration::from_millis(5));
        let backend = LegacyBackend::new(Arc::<MockChannel>::clone(channel), clock.clone(), Arc::new(EventFanout::new()), settings);
        ConnectionManager::new(backend, clock, ConnectionSettings::default())
    }

    #[test]
    fn connect_probes_with_go() {
        let channel = Arc::new(MockChannel::new("mock0"));
        let station = legacy(&channel);
        assert!(!station.is_connected());
        assert!(station.connect());
        assert!(station.is_connected());
        assert_eq!(channel.writes()[0], vec![96]);
        station.disconnect();
        assert!(!station.is_connected());
        assert!(!channel.is_open());
    }

    #[test]
    fn failed_open_counts_as_failed_probe() {
        let channel = Arc::new(MockChannel::new("mock0"));
        channel.set_fail_open(true);
        let station = legacy(&channel);
        assert!(!station.connect());
        assert!(!station.connect());
        assert_eq!(station.failed_probes(), 2);
        assert!(!station.is_connected());
    }

    #[test]
    fn operations_after_disconnect_do_not_reconnect() {
        let channel = Arc::new(MockChannel::new("mock0"));
        let station = legacy(&channel);
        assert!(station.connect());
        station.disconnect();
        let opens = channel.open_count();
        assert!(!station.power(true));
        assert_eq!(channel.open_count(), opens);
    }

    #[test]
    fn lost_link_is_reopened_by_next_operation() {
        let channel = Arc::new(MockChannel::new("mock0"));
        let station = legacy(&channel);
        assert!(station.connect());
        channel.drop_link();
        assert!(!station.is_connected());

        assert!(station.power(false));
        assert!(station.is_connected());
        assert_eq!(channel.open_count(), 2);
        assert!(channel.wait_for_writes(3, Duration::from_secs(1)));
        station.disconnect();
    }
}
