//! Playback mixing through the threaded orchestrator

use crossbeam_channel::Receiver;
use relay_mixer::error::SessionError;
use relay_mixer::{
    ChannelTransport, ControlCommand, ControlReply, Direction, Error, MixerConfig, MultiState,
    PcmFormat, PcmMulti, ReadError, SessionState, StreamParams, TransportSignal,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// 5 ms at 24 kHz stereo
const PERIOD_FRAMES: usize = 120;
const PERIOD_SAMPLES: usize = PERIOD_FRAMES * 2;
const PERIOD_BYTES: usize = PERIOD_SAMPLES * 2;

fn params() -> StreamParams {
    StreamParams::new(Direction::Playback, PcmFormat::S16Le, 2, 24_000)
}

fn config() -> MixerConfig {
    MixerConfig {
        period_ms: 5,
        buffer_periods: 8,
        mix_threshold_periods: 1,
        client_threshold_periods: 1,
        drain_timeout_ms: 20,
        ..Default::default()
    }
}

fn setup(config: MixerConfig) -> (PcmMulti, Receiver<TransportSignal>) {
    let (transport, signals) = ChannelTransport::new(2);
    let multi = PcmMulti::new(params(), config, transport).unwrap();
    multi.init().unwrap();
    (multi, signals)
}

fn wait_for_signal(signals: &Receiver<TransportSignal>, wanted: TransportSignal) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while let Ok(signal) = signals.recv_deadline(deadline) {
        if signal == wanted {
            return true;
        }
    }
    false
}

fn pcm(value: i16, samples: usize) -> Vec<u8> {
    std::iter::repeat(value.to_le_bytes())
        .take(samples)
        .flatten()
        .collect()
}

fn values(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

/// Read until `done` returns true for the samples collected so far
fn read_until(multi: &PcmMulti, done: impl Fn(&[i16]) -> bool) -> Vec<i16> {
    let mut out = vec![0u8; PERIOD_BYTES];
    let mut collected = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(3);
    while !done(&collected) && Instant::now() < deadline {
        match multi.read(&mut out, PERIOD_SAMPLES) {
            Ok(samples) => collected.extend(values(&out[..samples * 2])),
            Err(ReadError::WouldBlock) => thread::sleep(Duration::from_millis(1)),
            Err(e) => panic!("read failed: {}", e),
        }
    }
    collected
}

#[test]
fn test_read_before_any_client_is_closed() {
    let (multi, _signals) = setup(config());
    let mut out = vec![0u8; PERIOD_BYTES];
    assert_eq!(multi.read(&mut out, PERIOD_SAMPLES), Err(ReadError::Closed));
    assert_eq!(multi.state(), MultiState::Init);
}

#[test]
fn test_two_clients_are_summed() {
    let (multi, signals) = setup(config());
    let (_, a) = multi.add_session().unwrap();
    let (_, b) = multi.add_session().unwrap();
    assert!(wait_for_signal(&signals, TransportSignal::Open));

    a.send_pcm(pcm(1000, PERIOD_SAMPLES)).unwrap();
    b.send_pcm(pcm(2000, PERIOD_SAMPLES)).unwrap();

    let expected: i64 = PERIOD_SAMPLES as i64 * (1000 + 2000);
    let total = |samples: &[i16]| samples.iter().map(|&v| i64::from(v)).sum::<i64>();
    let collected = read_until(&multi, |samples| total(samples) >= expected);

    assert_eq!(total(&collected), expected);
    assert!(collected.iter().all(|v| [0, 1000, 2000, 3000].contains(v)));
}

#[test]
fn test_below_threshold_would_block() {
    let (multi, _signals) = setup(MixerConfig {
        client_threshold_periods: 2,
        ..config()
    });
    let (id, client) = multi.add_session().unwrap();
    client.send_pcm(pcm(100, PERIOD_SAMPLES / 2)).unwrap();

    let mut out = vec![0u8; PERIOD_BYTES];
    for _ in 0..20 {
        assert_eq!(multi.read(&mut out, PERIOD_SAMPLES), Err(ReadError::WouldBlock));
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(multi.state(), MultiState::Init);
    assert_eq!(multi.session_state(id), Some(SessionState::Idle));
}

#[test]
fn test_volume_applied_on_read() {
    let (transport, _signals) = ChannelTransport::new(2);
    transport.set_channel(1, 0.0, true);
    let multi = PcmMulti::new(params(), config(), transport).unwrap();
    multi.init().unwrap();

    let (_, client) = multi.add_session().unwrap();
    client.send_pcm(pcm(800, PERIOD_SAMPLES)).unwrap();

    let collected = read_until(&multi, |samples| samples.len() >= PERIOD_SAMPLES);
    assert_eq!(collected.len(), PERIOD_SAMPLES);
    for frame in collected.chunks_exact(2) {
        assert_eq!(frame, [800, 0]);
    }
}

#[test]
fn test_drain_acknowledged() {
    let (multi, signals) = setup(config());
    let (id, client) = multi.add_session().unwrap();
    for _ in 0..4 {
        client.send_pcm(pcm(500, PERIOD_SAMPLES)).unwrap();
    }
    assert!(wait_for_signal(&signals, TransportSignal::Resume));

    let stop = AtomicBool::new(false);
    let played = AtomicUsize::new(0);
    thread::scope(|s| {
        s.spawn(|| {
            let mut out = vec![0u8; PERIOD_BYTES];
            while !stop.load(Ordering::Relaxed) {
                if let Ok(samples) = multi.read(&mut out, PERIOD_SAMPLES) {
                    let count = values(&out[..samples * 2]).iter().filter(|&&v| v == 500).count();
                    played.fetch_add(count, Ordering::Relaxed);
                }
                thread::sleep(Duration::from_millis(2));
            }
        });

        let reply = client.request(ControlCommand::Drain, Duration::from_secs(3));
        assert_eq!(reply, Ok(ControlReply::Ok));

        let deadline = Instant::now() + Duration::from_secs(2);
        while played.load(Ordering::Relaxed) < 4 * PERIOD_SAMPLES && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        stop.store(true, Ordering::Relaxed);
    });

    assert_eq!(played.load(Ordering::Relaxed), 4 * PERIOD_SAMPLES);
    assert_eq!(multi.session_state(id), Some(SessionState::Idle));
}

#[test]
fn test_sole_client_drop_signals_transport() {
    let (multi, signals) = setup(config());
    let (_, client) = multi.add_session().unwrap();
    client.send_pcm(pcm(300, PERIOD_SAMPLES)).unwrap();
    assert!(wait_for_signal(&signals, TransportSignal::Resume));

    assert_eq!(
        client.request(ControlCommand::Drop, Duration::from_secs(1)),
        Ok(ControlReply::Ok)
    );
    assert!(wait_for_signal(&signals, TransportSignal::Drop));
    assert_eq!(multi.mix_stats().map(|stats| stats.available), Some(0));
}

#[test]
fn test_unknown_command_is_invalid() {
    let (multi, _signals) = setup(config());
    let (id, client) = multi.add_session().unwrap();
    client.send_text("Rewind").unwrap();
    assert_eq!(
        client.recv_reply_timeout(Duration::from_secs(1)),
        Ok(ControlReply::Invalid)
    );
    assert_eq!(multi.session_state(id), Some(SessionState::Idle));
}

#[test]
fn test_session_limit() {
    let (multi, _signals) = setup(MixerConfig {
        max_sessions: 2,
        ..config()
    });
    let _a = multi.add_session().unwrap();
    let _b = multi.add_session().unwrap();
    assert!(matches!(
        multi.add_session(),
        Err(Error::Session(SessionError::LimitReached(2)))
    ));
    assert_eq!(multi.session_count(), 2);
}

#[test]
fn test_remove_session() {
    let (multi, _signals) = setup(config());
    let (a, _client_a) = multi.add_session().unwrap();
    let (_b, _client_b) = multi.add_session().unwrap();

    assert!(multi.remove_session(a));
    assert!(!multi.remove_session(a));
    assert_eq!(multi.session_count(), 1);
    assert_eq!(multi.session_state(a), None);
}

#[test]
fn test_last_client_leaving_finishes_stream() {
    let (multi, signals) = setup(config());
    let (_, client) = multi.add_session().unwrap();
    assert!(wait_for_signal(&signals, TransportSignal::Open));

    drop(client);
    assert!(wait_for_signal(&signals, TransportSignal::Close));
    assert_eq!(multi.state(), MultiState::Finished);
    assert_eq!(multi.session_count(), 0);

    let mut out = vec![0u8; PERIOD_BYTES];
    assert_eq!(multi.read(&mut out, PERIOD_SAMPLES), Err(ReadError::Finished));
    assert_eq!(multi.read(&mut out, PERIOD_SAMPLES), Err(ReadError::Closed));
    assert!(!multi.is_stream_open());
}

#[test]
fn test_new_client_after_finish_reopens() {
    let (multi, signals) = setup(config());
    let (_, client) = multi.add_session().unwrap();
    drop(client);
    assert!(wait_for_signal(&signals, TransportSignal::Close));

    let (_, client) = multi.add_session().unwrap();
    assert!(wait_for_signal(&signals, TransportSignal::Open));
    assert_eq!(multi.state(), MultiState::Init);

    client.send_pcm(pcm(700, PERIOD_SAMPLES)).unwrap();
    let collected = read_until(&multi, |samples| samples.len() >= PERIOD_SAMPLES);
    assert!(collected.iter().all(|&v| v == 700));
}

#[test]
fn test_delay_includes_client_staging() {
    let (multi, _signals) = setup(config());
    assert_eq!(multi.delay(), Duration::from_millis(5));
    assert_eq!(multi.period_frames(), PERIOD_FRAMES);
    assert_eq!(multi.period_bytes(), PERIOD_BYTES);
}

#[test]
fn test_reset_then_reinit() {
    let (multi, _signals) = setup(config());
    let (_, client) = multi.add_session().unwrap();

    multi.reset();
    assert_eq!(multi.state(), MultiState::Init);
    assert_eq!(multi.session_count(), 0);
    assert!(multi.mix_stats().is_none());
    assert_eq!(client.send_pcm(pcm(1, 2)), Err(SessionError::Disconnected));

    multi.init().unwrap();
    let (_, client) = multi.add_session().unwrap();
    client.send_pcm(pcm(900, PERIOD_SAMPLES)).unwrap();
    let collected = read_until(&multi, |samples| samples.len() >= PERIOD_SAMPLES);
    assert_eq!(collected.len(), PERIOD_SAMPLES);
}
