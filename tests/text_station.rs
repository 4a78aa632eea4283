//! Text-protocol station behind a connection manager.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use rs_trainz_bridge::backend::{TextBackend, TextSettings};
use rs_trainz_bridge::connection::{ConnectionManager, ConnectionSettings};
use rs_trainz_bridge::events::{LocomotiveSpeedEvent, PowerEvent, SensorEvent};
use rs_trainz_bridge::fanout::EventFanout;
use rs_trainz_bridge::hal::{Deframer, Framing, MockChannel, MockClock};
use rs_trainz_bridge::{CommandStationController, DecoderProtocol};

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

fn station(channel: &Arc<MockChannel>) -> ConnectionManager<TextBackend> {
    channel.set_responder(|bytes: &[u8]| {
        if bytes.starts_with(b"<s>") {
            vec![
                b"<p0>".to_vec(),
                b"<iDCC-EX V-5.0.0 / MEGA / STANDARD_MOTOR_SHIELD G-9db6d36>".to_vec(),
            ]
        } else {
            Vec::new()
        }
    });
    let clock = Arc::new(MockClock::new());
    let settings = TextSettings::default()
        .with_pacing(Duration::ZERO)
        .with_tick(Duration::from_millis(5))
        .with_grace(Duration::from_millis(5))
        .with_reply_timeout(Duration::from_millis(100));
    let backend = TextBackend::new(
        Arc::<MockChannel>::clone(channel),
        clock.clone(),
        Arc::new(EventFanout::new()),
        settings,
    );
    ConnectionManager::new(backend, clock, ConnectionSettings::default())
}

fn lines(channel: &MockChannel) -> Vec<String> {
    channel
        .writes()
        .into_iter()
        .map(|w| String::from_utf8(w).unwrap())
        .collect()
}

#[test]
fn probe_then_throttle_lines() {
    let channel = Arc::new(MockChannel::new("dccex:2560"));
    let station = station(&channel);
    assert!(station.connect());
    assert_eq!(station.devices().len(), 1);

    station.power(true);
    station.change_velocity(3, DecoderProtocol::Dcc, 40);
    assert!(channel.wait_for_writes(3, Duration::from_secs(2)));
    assert_eq!(lines(&channel), vec!["<s>\n", "<1>\n", "<t 3 40 1>\n"]);
    station.disconnect();
}

#[test]
fn emergency_stop_cuts_power_and_zeroes_running_locos() {
    let channel = Arc::new(MockChannel::new("dccex:2560"));
    let station = station(&channel);
    let speeds = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&speeds);
    station
        .events()
        .add_speed_listener(move |e: &LocomotiveSpeedEvent| sink.lock().push((e.address, e.speed)));

    assert!(station.connect());
    station.change_velocity(3, DecoderProtocol::Dcc, 40);
    assert!(wait_until(|| speeds.lock().len() == 1));

    assert!(station.emergency_stop());
    assert!(channel.wait_for_writes(3, Duration::from_secs(2)));
    assert_eq!(lines(&channel)[2], "<0>\n");
    assert_eq!(*speeds.lock(), vec![(3, 40), (3, 0)]);
    station.disconnect();
}

#[test]
fn unsolicited_sensor_lines_become_events() {
    let channel = Arc::new(MockChannel::new("dccex:2560"));
    let station = station(&channel);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    station
        .events()
        .add_sensor_listener(move |e: &SensorEvent| sink.lock().push((e.id, e.active)));

    assert!(station.connect());
    channel.inject(b"<Q 5>");
    channel.inject(b"<Q 5>");
    channel.inject(b"<q 5>");

    assert_eq!(*seen.lock(), vec![(5, true), (5, false)]);
    assert!(!station.sensor_state(5).unwrap().active);
    station.disconnect();
}

#[test]
fn boot_banner_before_reply_is_discarded() {
    let channel = Arc::new(MockChannel::new("dccex:2560"));
    let station = station(&channel);
    let powers = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&powers);
    station
        .events()
        .add_power_listener(move |e: &PowerEvent| sink.lock().push(e.on));
    assert!(station.connect());

    let mut deframer = Deframer::new(Framing::Lines { terminator: b'>' });
    deframer.push(b"DCC-EX V-5.0 booting\r\n<p1 MAIN>\n", |unit| {
        channel.inject(unit);
    });

    assert_eq!(powers.lock().last(), Some(&true));
    station.disconnect();
}
