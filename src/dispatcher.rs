//! Command dispatcher: the single consumer of a connection's command queue.
//!
//! # State Machine
//!
//! ```text
//!            start()                 quit()
//! STOPPED ────────────▶ RUNNING ────────────▶ DRAINING ──▶ STOPPED
//!    ▲                     │                   (cutoff coils,
//!    └─────────────────────┘                    clear queue)
//!      link lost (auto-restart backends only)
//! ```
//!
//! In RUNNING the worker dequeues one command, lets the backend execute it,
//! records energized coils with the [`SafetyMonitor`], publishes nothing
//! itself (backends do) and sleeps the pacing delay. When the queue is empty
//! it wakes once per idle tick, or earlier when a coil falls due, to run the
//! safety check and the backend's idle hook.
//!
//! # Offline Behaviour
//!
//! While the connection is not live the worker never touches the channel.
//! With [`OfflinePolicy::Hold`] queued commands wait for the link to come
//! back; a command whose write failed goes back to the front of the queue.
//! With [`OfflinePolicy::Drop`] the queue is discarded with a warning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::{Backend, Reply};
use crate::commands::{Command, CommandKind};
use crate::queue::CommandQueue;
use crate::safety::{EnergizedCoil, SafetyMonitor, DEFAULT_MAX_DWELL_MS};
use crate::traits::Clock;

// ============================================================================
// Settings
// ============================================================================

/// Lifecycle state of a dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatcherState {
    /// No worker; commands are refused.
    Stopped,
    /// Worker draining the queue.
    Running,
    /// Shutting down: cutting off coils and clearing the queue.
    Draining,
}

/// What happens to queued commands while the link is down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum OfflinePolicy {
    /// Keep them until the connection is live again.
    Hold,
    /// Discard them with a warning.
    Drop,
}

/// Timing and policy of one dispatcher.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DispatchSettings {
    /// Delay after every command.
    pub pacing: Duration,
    /// Idle wake-up interval (safety check, polling).
    pub tick: Duration,
    /// Maximum coil dwell in milliseconds.
    pub max_dwell_ms: u64,
    /// Queue handling while offline.
    pub offline: OfflinePolicy,
    /// Restart a worker that stopped on link loss at the next enqueue.
    pub auto_restart: bool,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            pacing: Duration::from_millis(50),
            tick: Duration::from_millis(50),
            max_dwell_ms: DEFAULT_MAX_DWELL_MS,
            offline: OfflinePolicy::Hold,
            auto_restart: false,
        }
    }
}

impl DispatchSettings {
    /// Set the inter-command pacing.
    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    /// Set the idle tick.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Set the maximum coil dwell.
    pub fn with_max_dwell_ms(mut self, max_dwell_ms: u64) -> Self {
        self.max_dwell_ms = max_dwell_ms;
        self
    }

    /// Set the offline policy.
    pub fn with_offline(mut self, offline: OfflinePolicy) -> Self {
        self.offline = offline;
        self
    }

    /// Enable or disable auto-restart after link loss.
    pub fn with_auto_restart(mut self, auto_restart: bool) -> Self {
        self.auto_restart = auto_restart;
        self
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

struct Envelope {
    command: Command,
    reply: Option<SyncSender<Reply>>,
}

enum Exit {
    Quit,
    LinkLost,
}

struct Shared<B: Backend> {
    backend: Arc<B>,
    settings: DispatchSettings,
    queue: CommandQueue<Envelope>,
    safety: SafetyMonitor,
    state: Mutex<DispatcherState>,
    quit: AtomicBool,
    explicit_quit: AtomicBool,
    started: AtomicBool,
    live: Arc<AtomicBool>,
}

/// Queue plus worker thread for one connection.
pub struct CommandDispatcher<B: Backend> {
    shared: Arc<Shared<B>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<B: Backend> CommandDispatcher<B> {
    /// Dispatcher for `backend`. `live` is shared with the connection manager.
    pub fn new(backend: Arc<B>, live: Arc<AtomicBool>, clock: Arc<dyn Clock>) -> Self {
        let settings = backend.dispatch_settings();
        Self {
            shared: Arc::new(Shared {
                safety: SafetyMonitor::new(clock, settings.max_dwell_ms),
                backend,
                settings,
                queue: CommandQueue::new(),
                state: Mutex::new(DispatcherState::Stopped),
                quit: AtomicBool::new(false),
                explicit_quit: AtomicBool::new(false),
                started: AtomicBool::new(false),
                live,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DispatcherState {
        *self.shared.state.lock()
    }

    /// Number of queued commands.
    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }

    /// Coil supervision of this dispatcher.
    pub fn safety(&self) -> &SafetyMonitor {
        &self.shared.safety
    }

    /// Effective settings.
    pub fn settings(&self) -> DispatchSettings {
        self.shared.settings
    }

    /// Start the worker. Returns true if it is running afterwards.
    pub fn start(&self) -> bool {
        let mut worker = self.worker.lock();
        if self.state() != DispatcherState::Stopped {
            return true;
        }
        if let Some(old) = worker.take() {
            let _ = old.join();
        }

        self.shared.quit.store(false, Ordering::SeqCst);
        self.shared.explicit_quit.store(false, Ordering::SeqCst);
        *self.shared.state.lock() = DispatcherState::Running;

        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name(format!("dispatch-{}", self.shared.backend.name()))
            .spawn(move || run(shared));
        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                self.shared.started.store(true, Ordering::SeqCst);
                tracing::debug!(backend = self.shared.backend.name(), "dispatcher started");
                true
            }
            Err(e) => {
                *self.shared.state.lock() = DispatcherState::Stopped;
                tracing::error!(backend = self.shared.backend.name(), error = %e, "cannot spawn dispatcher");
                false
            }
        }
    }

    /// Stop the worker, cut off energized coils and clear the queue.
    pub fn quit(&self) {
        let mut worker = self.worker.lock();
        self.shared.explicit_quit.store(true, Ordering::SeqCst);
        self.shared.quit.store(true, Ordering::SeqCst);
        self.shared.queue.wake();
        if let Some(handle) = worker.take() {
            if handle.join().is_err() {
                tracing::error!(backend = self.shared.backend.name(), "dispatcher worker panicked");
            }
        }
        self.shared.drain();
    }

    /// Queue a command. Returns false if it was dropped.
    pub fn enqueue(&self, command: Command) -> bool {
        self.submit(Envelope {
            command,
            reply: None,
        })
    }

    /// Queue a command regardless of the worker state.
    ///
    /// Used while the link is down under [`OfflinePolicy::Hold`]: the command
    /// waits for the next [`start`](Self::start).
    pub fn hold(&self, command: Command) {
        tracing::debug!(command = command.kind.name(), "holding command until reconnect");
        self.shared.queue.push(Envelope {
            command,
            reply: None,
        });
    }

    /// Queue a command and wait up to `timeout` for its reply.
    pub fn request(&self, command: Command, timeout: Duration) -> Option<Reply> {
        let (tx, rx) = mpsc::sync_channel(1);
        if !self.submit(Envelope {
            command,
            reply: Some(tx),
        }) {
            return None;
        }
        rx.recv_timeout(timeout).ok()
    }

    fn submit(&self, envelope: Envelope) -> bool {
        match self.state() {
            DispatcherState::Running => {}
            DispatcherState::Stopped if self.may_restart() => {
                tracing::info!(backend = self.shared.backend.name(), "restarting dispatcher");
                if !self.start() {
                    return false;
                }
            }
            state => {
                tracing::warn!(
                    backend = self.shared.backend.name(),
                    command = envelope.command.kind.name(),
                    ?state,
                    "dispatcher not running, dropping command"
                );
                return false;
            }
        }
        self.shared.queue.push(envelope);
        true
    }

    fn may_restart(&self) -> bool {
        self.shared.settings.auto_restart
            && self.shared.started.load(Ordering::SeqCst)
            && !self.shared.explicit_quit.load(Ordering::SeqCst)
    }
}

impl<B: Backend> Drop for CommandDispatcher<B> {
    fn drop(&mut self) {
        if self.worker.lock().is_some() {
            self.quit();
        }
    }
}

// ============================================================================
// Worker
// ============================================================================

fn run<B: Backend>(shared: Arc<Shared<B>>) {
    let name = shared.backend.name();
    let exit = loop {
        if shared.quit.load(Ordering::SeqCst) {
            break Exit::Quit;
        }

        if !shared.link_usable() {
            if shared.settings.offline == OfflinePolicy::Drop {
                let dropped = shared.queue.drain();
                if !dropped.is_empty() {
                    tracing::warn!(backend = name, count = dropped.len(), "station offline, dropping queued commands");
                }
            }
            if shared.settings.auto_restart {
                break Exit::LinkLost;
            }
            std::thread::sleep(shared.settings.tick);
            continue;
        }

        match shared.queue.pop_timeout(shared.idle_wait()) {
            Some(envelope) => {
                shared.dispatch(envelope);
                shared.check_safety();
                if !shared.settings.pacing.is_zero() {
                    std::thread::sleep(shared.settings.pacing);
                }
            }
            None => {
                shared.check_safety();
                if !shared.quit.load(Ordering::SeqCst) && shared.link_usable() {
                    shared.backend.idle();
                }
            }
        }
    };

    if let Exit::LinkLost = exit {
        tracing::warn!(backend = name, pending = shared.queue.len(), "link lost, dispatcher stopped");
        *shared.state.lock() = DispatcherState::Stopped;
    }
}

impl<B: Backend> Shared<B> {
    fn link_usable(&self) -> bool {
        if !self.live.load(Ordering::SeqCst) {
            return false;
        }
        if !self.backend.is_open() {
            tracing::warn!(backend = self.backend.name(), "channel closed underneath the dispatcher");
            self.live.store(false, Ordering::SeqCst);
            return false;
        }
        true
    }

    fn idle_wait(&self) -> Duration {
        match self.safety.next_due_in_ms() {
            Some(ms) => self.settings.tick.min(Duration::from_millis(ms)),
            None => self.settings.tick,
        }
    }

    fn dispatch(&self, envelope: Envelope) {
        let Envelope { command, reply } = envelope;
        match self.backend.execute(&command) {
            Ok(result) => {
                if let CommandKind::SwitchAccessory {
                    value,
                    switch_time_ms,
                } = command.kind
                {
                    if self.backend.tracks_coils() {
                        self.safety.energize(
                            command.address,
                            command.protocol_or_default(),
                            value,
                            switch_time_ms,
                        );
                    }
                }
                if let Some(tx) = reply {
                    let _ = tx.try_send(result);
                }
            }
            Err(e) if e.is_transport() => {
                self.live.store(false, Ordering::SeqCst);
                match self.settings.offline {
                    OfflinePolicy::Hold => {
                        tracing::warn!(backend = self.backend.name(), command = command.kind.name(), error = %e, "link lost, holding command");
                        self.queue.push_front(Envelope { command, reply });
                    }
                    OfflinePolicy::Drop => {
                        tracing::warn!(backend = self.backend.name(), command = command.kind.name(), error = %e, "link lost, dropping command");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    backend = self.backend.name(),
                    command = command.kind.name(),
                    address = command.address,
                    error = %e,
                    "command failed"
                );
            }
        }
    }

    fn check_safety(&self) {
        for coil in self.safety.due() {
            self.cut_off(&coil);
        }
    }

    fn cut_off(&self, coil: &EnergizedCoil) {
        match self.backend.cutoff(coil) {
            Ok(()) => tracing::info!(
                backend = self.backend.name(),
                address = coil.address,
                held_ms = self.safety_age(coil),
                "safety cutoff"
            ),
            Err(e) => tracing::warn!(
                backend = self.backend.name(),
                address = coil.address,
                error = %e,
                "safety cutoff failed"
            ),
        }
    }

    fn safety_age(&self, coil: &EnergizedCoil) -> u64 {
        self.backend.session().now_ms().saturating_sub(coil.since_ms)
    }

    fn drain(&self) {
        *self.state.lock() = DispatcherState::Draining;
        for coil in self.safety.take_all() {
            self.cut_off(&coil);
        }
        let dropped = self.queue.drain();
        if !dropped.is_empty() {
            tracing::info!(backend = self.backend.name(), count = dropped.len(), "discarding queued commands");
        }
        *self.state.lock() = DispatcherState::Stopped;
        tracing::debug!(backend = self.backend.name(), "dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::AccessoryValue;
    use crate::error::{BridgeError, Result};
    use crate::fanout::EventFanout;
    use crate::hal::MockClock;
    use crate::state::Session;
    use std::time::Instant;

    /// Backend that records executed commands and cutoffs.
    struct Recorder {
        session: Session,
        settings: DispatchSettings,
        open: AtomicBool,
        fail_transport: AtomicBool,
        executed: Mutex<Vec<Command>>,
        cutoffs: Mutex<Vec<u32>>,
    }

    impl Recorder {
        fn new(clock: Arc<MockClock>, settings: DispatchSettings) -> Arc<Self> {
            Arc::new(Self {
                session: Session::new(Arc::new(EventFanout::new()), clock),
                settings,
                open: AtomicBool::new(true),
                fail_transport: AtomicBool::new(false),
                executed: Mutex::new(Vec::new()),
                cutoffs: Mutex::new(Vec::new()),
            })
        }

        fn executed(&self) -> usize {
            self.executed.lock().len()
        }
    }

    impl Backend for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }
        fn dispatch_settings(&self) -> DispatchSettings {
            self.settings
        }
        fn session(&self) -> &Session {
            &self.session
        }
        fn open(self: Arc<Self>) -> Result<()> {
            self.open.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn close(&self) {
            self.open.store(false, Ordering::SeqCst);
        }
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
        fn probe(&self) -> bool {
            true
        }
        fn execute(&self, command: &Command) -> Result<Reply> {
            if self.fail_transport.load(Ordering::SeqCst) {
                return Err(BridgeError::NotConnected);
            }
            self.executed.lock().push(command.clone());
            match command.kind {
                CommandKind::PollFeedback => Ok(Reply::Feedback([0x40, 0x00])),
                _ => Ok(Reply::Done),
            }
        }
        fn tracks_coils(&self) -> bool {
            true
        }
        fn cutoff(&self, coil: &EnergizedCoil) -> Result<()> {
            self.cutoffs.lock().push(coil.address);
            Ok(())
        }
    }

    fn fast() -> DispatchSettings {
        DispatchSettings::default()
            .with_pacing(Duration::ZERO)
            .with_tick(Duration::from_millis(5))
    }

    type Fixture = (
        Arc<MockClock>,
        Arc<Recorder>,
        CommandDispatcher<Recorder>,
        Arc<AtomicBool>,
    );

    fn dispatcher(settings: DispatchSettings) -> Fixture {
        let clock = Arc::new(MockClock::new());
        let backend = Recorder::new(Arc::clone(&clock), settings);
        let live = Arc::new(AtomicBool::new(true));
        let d = CommandDispatcher::new(Arc::clone(&backend), Arc::clone(&live), clock.clone());
        (clock, backend, d, live)
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn commands_run_in_fifo_order() {
        let (_, backend, d, _) = dispatcher(fast());
        assert!(d.start());
        for speed in 1..=5 {
            assert!(d.enqueue(Command::set_speed(3, None, speed)));
        }
        assert!(wait_until(|| backend.executed() == 5));
        let speeds: Vec<_> = backend
            .executed
            .lock()
            .iter()
            .map(|c| match c.kind {
                CommandKind::SetSpeed { speed } => speed,
                _ => 0,
            })
            .collect();
        assert_eq!(speeds, vec![1, 2, 3, 4, 5]);
        d.quit();
    }

    #[test]
    fn commands_are_dropped_before_start_and_after_quit() {
        let (_, backend, d, _) = dispatcher(fast());
        assert!(!d.enqueue(Command::power(true)));
        assert!(d.start());
        d.quit();
        assert_eq!(d.state(), DispatcherState::Stopped);
        assert!(!d.enqueue(Command::power(true)));
        assert_eq!(backend.executed(), 0);
    }

    #[test]
    fn request_returns_backend_reply() {
        let (_, _, d, _) = dispatcher(fast());
        d.start();
        let reply = d.request(Command::poll_feedback(1), Duration::from_secs(1));
        assert_eq!(reply, Some(Reply::Feedback([0x40, 0x00])));
        d.quit();
    }

    #[test]
    fn idle_tick_cuts_off_expired_coil() {
        let (clock, backend, d, _) = dispatcher(fast());
        d.start();
        d.enqueue(Command::switch_accessory(9, None, AccessoryValue::Green, 0));
        assert!(wait_until(|| d.safety().is_energized()));

        clock.set(1999);
        std::thread::sleep(Duration::from_millis(30));
        assert!(backend.cutoffs.lock().is_empty());

        clock.set(2000);
        assert!(wait_until(|| !backend.cutoffs.lock().is_empty()));
        assert_eq!(*backend.cutoffs.lock(), vec![9]);
        d.quit();
    }

    #[test]
    fn quit_cuts_off_energized_coils_and_clears_queue() {
        let (_, backend, d, live) = dispatcher(fast());
        d.start();
        d.enqueue(Command::switch_accessory(4, None, AccessoryValue::Red, 500));
        assert!(wait_until(|| d.safety().is_energized()));

        live.store(false, Ordering::SeqCst);
        d.enqueue(Command::power(false));
        d.quit();

        assert_eq!(*backend.cutoffs.lock(), vec![4]);
        assert_eq!(d.pending(), 0);
        assert_eq!(d.state(), DispatcherState::Stopped);
    }

    #[test]
    fn hold_policy_keeps_failed_command_at_front() {
        let (_, backend, d, live) = dispatcher(fast());
        d.start();
        backend.fail_transport.store(true, Ordering::SeqCst);
        d.enqueue(Command::power(true));
        assert!(wait_until(|| !live.load(Ordering::SeqCst)));
        d.enqueue(Command::power(false));
        assert!(wait_until(|| d.pending() == 2));

        backend.fail_transport.store(false, Ordering::SeqCst);
        live.store(true, Ordering::SeqCst);
        assert!(wait_until(|| backend.executed() == 2));
        assert_eq!(backend.executed.lock()[0], Command::power(true));
        d.quit();
    }

    #[test]
    fn drop_policy_discards_queue_while_offline() {
        let (_, backend, d, live) = dispatcher(fast().with_offline(OfflinePolicy::Drop));
        live.store(false, Ordering::SeqCst);
        d.start();
        d.enqueue(Command::power(true));
        assert!(wait_until(|| d.pending() == 0));
        live.store(true, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(backend.executed(), 0);
        d.quit();
    }

    #[test]
    fn auto_restart_revives_worker_after_link_loss() {
        let (_, backend, d, live) = dispatcher(fast().with_auto_restart(true));
        d.start();
        live.store(false, Ordering::SeqCst);
        assert!(wait_until(|| d.state() == DispatcherState::Stopped));

        live.store(true, Ordering::SeqCst);
        assert!(d.enqueue(Command::power(true)));
        assert!(wait_until(|| backend.executed() == 1));
        assert_eq!(d.state(), DispatcherState::Running);
        d.quit();
        assert!(!d.enqueue(Command::power(true)));
    }
}
