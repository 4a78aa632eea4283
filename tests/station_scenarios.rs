//! End-to-end behaviour of the backends behind a connection manager,
//! driven through the upstream controller API against mock channels.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use rs_trainz_bridge::backend::{CanBackend, CanSettings, LegacyBackend, LegacySettings};
use rs_trainz_bridge::codec::can::{CMD_PING, CMD_SYSTEM, SUB_STATUS};
use rs_trainz_bridge::codec::CanFrame;
use rs_trainz_bridge::connection::{ConnectionManager, ConnectionSettings};
use rs_trainz_bridge::dispatcher::DispatcherState;
use rs_trainz_bridge::events::{AccessoryEvent, SensorEvent};
use rs_trainz_bridge::fanout::EventFanout;
use rs_trainz_bridge::hal::{MockChannel, MockClock};
use rs_trainz_bridge::{AccessoryValue, CommandStationController, DecoderProtocol};

const STATION_UID: u32 = 0x6373_1A2B;

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

fn legacy(
    channel: &Arc<MockChannel>,
    clock: &Arc<MockClock>,
    settings: LegacySettings,
) -> ConnectionManager<LegacyBackend> {
    let backend = LegacyBackend::new(
        Arc::<MockChannel>::clone(channel),
        Arc::<MockClock>::clone(clock),
        Arc::new(EventFanout::new()),
        settings.with_tick(Duration::from_millis(5)),
    );
    ConnectionManager::new(backend, Arc::<MockClock>::clone(clock), ConnectionSettings::default())
}

fn can(channel: &Arc<MockChannel>) -> ConnectionManager<CanBackend> {
    let clock = Arc::new(MockClock::new());
    let settings = CanSettings::default()
        .with_pacing(Duration::ZERO)
        .with_tick(Duration::from_millis(5))
        .with_reply_timeout(Duration::from_millis(100))
        .with_probe_timeout(Duration::from_millis(50))
        .with_describe_devices(false);
    let backend = CanBackend::new(
        Arc::<MockChannel>::clone(channel),
        clock.clone(),
        Arc::new(EventFanout::new()),
        settings,
    );
    ConnectionManager::new(backend, clock, ConnectionSettings::default())
}

fn ping_reply() -> Vec<u8> {
    let mut data = [0u8; 8];
    data[..4].copy_from_slice(&STATION_UID.to_be_bytes());
    data[4] = 4;
    data[5] = 2;
    data[6..].copy_from_slice(&0xFFFFu16.to_be_bytes());
    CanFrame::new(CMD_PING + 1, 0x0300, &data).to_bytes().to_vec()
}

// ============================================================================
// Legacy serial
// ============================================================================

#[test]
fn legacy_speed_with_headlight_is_one_byte_then_idle() {
    let channel = Arc::new(MockChannel::new("ttyS0"));
    let clock = Arc::new(MockClock::new());
    let station = legacy(
        &channel,
        &clock,
        LegacySettings::default().with_pacing(Duration::from_millis(20)),
    );
    assert!(station.connect());

    station.change_function_value(12, DecoderProtocol::Mm, 0, true);
    station.change_velocity(12, DecoderProtocol::Mm, 11);

    assert!(channel.wait_for_writes(3, Duration::from_secs(2)));
    assert_eq!(channel.writes()[2], vec![16 + 11, 12]);
    assert!(wait_until(|| station.dispatcher().pending() == 0));
    assert_eq!(station.dispatcher().state(), DispatcherState::Running);
    station.disconnect();
}

#[test]
fn legacy_feedback_toggle_reports_both_edges() {
    let channel = Arc::new(MockChannel::new("ttyS0"));
    let clock = Arc::new(MockClock::new());
    let station = legacy(
        &channel,
        &clock,
        LegacySettings::default()
            .with_pacing(Duration::ZERO)
            .with_feedback(0, 1000),
    );

    let contact_two = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&contact_two);
    channel.set_responder(move |bytes: &[u8]| {
        if bytes == [193] {
            let high = if flag.load(Ordering::SeqCst) { 0x40 } else { 0x00 };
            vec![vec![high], vec![0x00]]
        } else {
            Vec::new()
        }
    });

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    station.events().add_sensor_listener(move |e: &SensorEvent| {
        sink.lock().push((e.id, e.active, e.previous_active))
    });

    assert!(station.connect());
    assert_eq!(station.get_feedback(1), Some([0x40, 0x00]));
    contact_two.store(false, Ordering::SeqCst);
    assert_eq!(station.get_feedback(1), Some([0x00, 0x00]));

    assert_eq!(*seen.lock(), vec![(1002, true, false), (1002, false, true)]);
    let state = station.sensor_state(1002).unwrap();
    assert!(!state.active);
    assert!(state.previous_active);
    station.disconnect();
}

#[test]
fn accessory_coil_is_cut_off_after_max_dwell() {
    let channel = Arc::new(MockChannel::new("ttyS0"));
    let clock = Arc::new(MockClock::new());
    let station = legacy(
        &channel,
        &clock,
        LegacySettings::default().with_pacing(Duration::ZERO),
    );
    assert!(station.connect());

    station.switch_accessory(5, DecoderProtocol::Mm, AccessoryValue::Green, 0);
    assert!(wait_until(|| station.dispatcher().safety().is_energized()));
    assert!(channel.writes().contains(&vec![33, 5]));

    clock.set(1999);
    std::thread::sleep(Duration::from_millis(30));
    assert!(!channel.writes().contains(&vec![32]));

    clock.set(2000);
    assert!(wait_until(|| channel.writes().contains(&vec![32])));
    assert!(!station.dispatcher().safety().is_energized());
    station.disconnect();
}

#[test]
fn legacy_holds_commands_while_probe_fails() {
    let channel = Arc::new(MockChannel::new("ttyS0"));
    let clock = Arc::new(MockClock::new());
    let station = legacy(
        &channel,
        &clock,
        LegacySettings::default().with_pacing(Duration::ZERO),
    );
    channel.set_reject_writes(true);

    for attempt in 1..=3 {
        assert!(!station.connect());
        assert!(!station.is_connected());
        assert_eq!(station.failed_probes(), attempt);
    }

    // queued, not lost, and nothing reaches the wire
    assert!(station.power(true));
    assert!(channel.writes().is_empty());
    assert_eq!(station.dispatcher().pending(), 1);

    channel.set_reject_writes(false);
    assert!(station.power(false));
    assert!(station.is_connected());
    assert!(channel.wait_for_writes(3, Duration::from_secs(2)));
    // probe GO, held GO, then STOP
    assert_eq!(channel.writes(), vec![vec![96], vec![96], vec![97]]);
    station.disconnect();
}

#[test]
fn disconnect_cuts_off_energized_coil() {
    let channel = Arc::new(MockChannel::new("ttyS0"));
    let clock = Arc::new(MockClock::new());
    let station = legacy(
        &channel,
        &clock,
        LegacySettings::default().with_pacing(Duration::ZERO),
    );
    assert!(station.connect());
    station.switch_accessory(9, DecoderProtocol::Mm, AccessoryValue::Red, 500);
    assert!(wait_until(|| station.dispatcher().safety().is_energized()));

    station.disconnect();
    assert_eq!(channel.writes().last(), Some(&vec![32]));
    assert!(!station.is_connected());
}

#[test]
fn panicking_listener_leaves_dispatcher_running() {
    let channel = Arc::new(MockChannel::new("ttyS0"));
    let clock = Arc::new(MockClock::new());
    let station = legacy(
        &channel,
        &clock,
        LegacySettings::default().with_pacing(Duration::ZERO),
    );
    station
        .events()
        .add_accessory_listener(|_: &AccessoryEvent| panic!("listener bug"));
    assert!(station.connect());

    station.switch_accessory(5, DecoderProtocol::Mm, AccessoryValue::Green, 0);
    assert!(wait_until(|| channel.writes().contains(&vec![33, 5])));

    assert!(station.power(false));
    assert!(wait_until(|| channel.writes().contains(&vec![97])));
    assert!(wait_until(|| station.dispatcher().pending() == 0));
    assert_eq!(station.dispatcher().state(), DispatcherState::Running);
    station.disconnect();
}

// ============================================================================
// CAN
// ============================================================================

#[test]
fn can_measurement_skips_validity_frame() {
    let channel = Arc::new(MockChannel::new("cs2:15731"));
    channel.set_responder(|bytes: &[u8]| {
        if bytes[1] == CMD_PING {
            return vec![ping_reply()];
        }
        // status request for channel 1 only
        if bytes[1] == CMD_SYSTEM && bytes[9] == SUB_STATUS && bytes[10] == 1 {
            let uid = &bytes[5..9];
            let mut validity = uid.to_vec();
            validity.extend_from_slice(&[SUB_STATUS, 1, 1]);
            let mut value = uid.to_vec();
            value.extend_from_slice(&[SUB_STATUS, 1, 0x01, 0xF4]);
            return vec![
                CanFrame::new(CMD_SYSTEM + 1, 0x0300, &validity).to_bytes().to_vec(),
                CanFrame::new(CMD_SYSTEM + 1, 0x0300, &value).to_bytes().to_vec(),
            ];
        }
        Vec::new()
    });

    let station = can(&channel);
    assert!(station.connect());
    let readings = station.measurements();
    assert_eq!(readings.len(), 1);
    assert_eq!(readings[0].channel, 1);
    assert_eq!(readings[0].raw, 500);
    assert_eq!(readings[0].unit, "A");
    assert!(readings[0].valid);
    station.disconnect();
}

#[test]
fn can_drops_commands_while_probe_fails() {
    let channel = Arc::new(MockChannel::new("cs2:15731"));
    let station = can(&channel);

    for attempt in 1..=3 {
        assert!(!station.connect());
        assert!(!station.is_connected());
        assert_eq!(station.failed_probes(), attempt);
    }

    assert!(!station.power(true));
    station.change_velocity(3, DecoderProtocol::Dcc, 400);
    assert_eq!(station.dispatcher().pending(), 0);
    assert!(channel.writes().iter().all(|w| w[1] == CMD_PING));
}

#[test]
fn can_probe_records_station_device() {
    let channel = Arc::new(MockChannel::new("cs2:15731"));
    channel.set_responder(|bytes: &[u8]| {
        if bytes[1] == CMD_PING {
            vec![ping_reply()]
        } else {
            Vec::new()
        }
    });
    let station = can(&channel);
    assert!(station.connect());
    let devices = station.devices();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].uid, STATION_UID);

    station.disconnect();
    assert!(station.devices().is_empty());
}
