//! Relay Simulator
//!
//! Drives a multi-client stream without Bluetooth hardware. In playback mode
//! several tone generators share one mixed stream that a simulated transport
//! drains every period; in capture mode a simulated transport produces audio
//! that is fanned out to several readers, one of them too slow to keep up.
//!
//! ```text
//! relay-sim [playback|capture] [config.toml]
//! ```

use anyhow::{bail, Result};
use crossbeam_channel::Receiver;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay_mixer::{
    ChannelTransport, ClientEndpoint, ControlCommand, Direction, MixerConfig, PcmFormat, PcmMulti,
    ReadError, StreamParams, TransportSignal,
};

const RATE: u32 = 48_000;
const CHANNELS: u8 = 2;
const CLIENTS: usize = 3;
const RUN_TIME: Duration = Duration::from_secs(3);

/// Interleaved S16 stereo sine generator
struct Tone {
    frequency: f64,
    phase: f64,
}

impl Tone {
    fn new(frequency: f64) -> Self {
        Self { frequency, phase: 0.0 }
    }

    fn period(&mut self, frames: usize) -> Vec<u8> {
        let step = 2.0 * std::f64::consts::PI * self.frequency / f64::from(RATE);
        let mut out = Vec::with_capacity(frames * 4);
        for _ in 0..frames {
            let sample = (self.phase.sin() * 6000.0) as i16;
            self.phase = (self.phase + step) % (2.0 * std::f64::consts::PI);
            for _ in 0..CHANNELS {
                out.extend_from_slice(&sample.to_le_bytes());
            }
        }
        out
    }
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let direction = match args.next().as_deref() {
        None | Some("playback") => Direction::Playback,
        Some("capture") => Direction::Capture,
        Some(other) => bail!("unknown mode '{}', expected playback or capture", other),
    };
    let config = match args.next() {
        Some(path) => MixerConfig::load(path)?,
        None => MixerConfig::load_or_default(),
    };

    if !config.multi_enabled(direction) {
        bail!("multi-client {} is disabled in the configuration", direction);
    }

    tracing::info!("Starting relay simulator ({})", direction);

    let params = StreamParams::new(direction, PcmFormat::S16Le, CHANNELS, RATE);
    let (transport, signals) = ChannelTransport::new(usize::from(CHANNELS));
    let multi = Arc::new(PcmMulti::new(params, config, transport)?);
    multi.init()?;

    let signal_log = spawn_signal_log(signals)?;

    match direction {
        Direction::Playback => run_playback(&multi)?,
        Direction::Capture => run_capture(&multi)?,
    }

    multi.reset();
    drop(multi);
    if signal_log.join().is_err() {
        tracing::error!("Signal log thread panicked");
    }

    tracing::info!("Simulator finished");
    Ok(())
}

fn spawn_signal_log(signals: Receiver<TransportSignal>) -> Result<thread::JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("transport-signals".into())
        .spawn(move || {
            for signal in signals {
                match signal {
                    TransportSignal::Ready => tracing::trace!("Transport signal: Ready"),
                    other => tracing::info!("Transport signal: {:?}", other),
                }
            }
        })?;
    Ok(handle)
}

fn run_playback(multi: &Arc<PcmMulti>) -> Result<()> {
    let period_frames = multi.period_frames();
    let period_samples = multi.period_samples();
    let period = multi.config().period_duration();

    let mut clients = Vec::with_capacity(CLIENTS);
    for n in 0..CLIENTS {
        let (id, endpoint) = multi.add_session()?;
        let frequency = 220.0 * (n + 1) as f64;
        let handle = thread::Builder::new()
            .name(format!("client-{}", id))
            .spawn(move || play_tone(endpoint, frequency, period_frames))?;
        clients.push(handle);
        // Stagger the joins so later clients are aligned to a running mix
        thread::sleep(period * 5);
    }

    let mut dest = vec![0u8; multi.period_bytes()];
    let mut played = 0u64;
    let mut underruns = 0u64;
    let mut last_stats = Instant::now();
    let mut next_tick = Instant::now();

    loop {
        next_tick += period;
        match multi.read(&mut dest, period_samples) {
            Ok(samples) => played += samples as u64,
            Err(ReadError::WouldBlock) => underruns += 1,
            Err(ReadError::Finished) => {
                tracing::info!("All clients gone");
                break;
            }
            Err(ReadError::Closed) => break,
        }

        if last_stats.elapsed() >= Duration::from_secs(1) {
            if let Some(stats) = multi.mix_stats() {
                tracing::info!(
                    "Mix: {} clients, {} frames played, {} empty reads, fill {:.0}%, {} clipped, delay {:?}",
                    multi.session_count(),
                    played / u64::from(CHANNELS),
                    underruns,
                    stats.fill_level() * 100.0,
                    stats.clipped,
                    multi.delay()
                );
            }
            last_stats = Instant::now();
        }

        if let Some(wait) = next_tick.checked_duration_since(Instant::now()) {
            thread::sleep(wait);
        }
    }

    for handle in clients {
        if handle.join().is_err() {
            tracing::error!("Client thread panicked");
        }
    }
    Ok(())
}

/// Play a tone for a while, drain it and hang up
fn play_tone(endpoint: ClientEndpoint, frequency: f64, period_frames: usize) {
    let mut tone = Tone::new(frequency);
    let started = Instant::now();

    while started.elapsed() < RUN_TIME {
        if let Err(e) = endpoint.send_pcm(tone.period(period_frames)) {
            tracing::warn!("Client {} stopped: {}", endpoint.id(), e);
            return;
        }
    }

    match endpoint.request(ControlCommand::Drain, Duration::from_secs(2)) {
        Ok(reply) => tracing::info!("Client {} drained: {}", endpoint.id(), reply),
        Err(e) => tracing::warn!("Client {} drain failed: {}", endpoint.id(), e),
    }
}

fn run_capture(multi: &Arc<PcmMulti>) -> Result<()> {
    let period = multi.config().period_duration();
    let period_samples = multi.period_samples();

    let mut readers = Vec::with_capacity(CLIENTS);
    for n in 0..CLIENTS {
        let (id, endpoint) = multi.add_session()?;
        // The last reader only wakes every few periods
        let pause = if n == CLIENTS - 1 { period * 4 } else { Duration::ZERO };
        let received = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&received);
        let handle = thread::Builder::new()
            .name(format!("reader-{}", id))
            .spawn(move || read_capture(endpoint, pause, &counter))?;
        readers.push((id, received, handle));
    }

    let mut tone = Tone::new(440.0);
    let mut next_tick = Instant::now();
    let mut written = 0u64;

    loop {
        next_tick += period;
        let data = tone.period(multi.period_frames());
        let samples = multi.write(&data, period_samples);
        if samples == 0 {
            tracing::info!("All readers gone");
            break;
        }
        written += samples as u64 * 2;

        if let Some(wait) = next_tick.checked_duration_since(Instant::now()) {
            thread::sleep(wait);
        }
    }

    for (id, received, handle) in readers {
        if handle.join().is_err() {
            tracing::error!("Reader thread panicked");
        }
        tracing::info!(
            "Reader {}: {} of {} bytes received",
            id,
            received.load(Ordering::Relaxed),
            written
        );
    }
    Ok(())
}

fn read_capture(endpoint: ClientEndpoint, pause: Duration, received: &AtomicU64) {
    let started = Instant::now();
    while started.elapsed() < RUN_TIME {
        match endpoint.recv_pcm_timeout(Duration::from_millis(100)) {
            Ok(Some(chunk)) => {
                received.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Reader {} stopped: {}", endpoint.id(), e);
                return;
            }
        }
        if !pause.is_zero() {
            thread::sleep(pause);
        }
    }
}
