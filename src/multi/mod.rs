//! Multi-client orchestrator
//!
//! One [`PcmMulti`] sits between a transport stream and its clients. On
//! playback it owns the mix accumulator: the transport calls
//! [`read`](PcmMulti::read) once per period, which asks the worker thread to
//! fold every session's staged audio and then drains one period of the sum.
//! On capture the transport calls [`write`](PcmMulti::write) and each period
//! is copied to every running session.
//!
//! Locks are always taken `mix` before `sessions`.

pub mod transport;
mod worker;

use bytes::Bytes;
use crossbeam::atomic::AtomicCell;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::MixerConfig;
use crate::constants::WAKE_CHANNEL_DEPTH;
use crate::error::{MixBufferError, ReadError, Result, SessionError};
use crate::mix::{Direction, MixBuffer, MixBufferStats, StreamParams};
use crate::session::{
    session_channels, ClientEndpoint, ClientSession, MixContext, SessionArena, SessionId,
    SessionState,
};

pub use transport::{ChannelTransport, ChannelVolume, Transport, TransportSignal, VolumeSnapshot};
pub(crate) use worker::Wake;

/// Orchestrator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MultiState {
    /// Waiting for enough audio (playback) or for initialisation
    Init,
    Running,
    /// Capture with no active client
    Paused,
    /// Every client has gone
    Finished,
}

pub(crate) struct MixState {
    pub(crate) buffer: Option<MixBuffer>,
    /// A mix pass completed since the transport last asked
    pub(crate) ready: bool,
}

/// State shared between the orchestrator handle and its worker thread
pub(crate) struct Shared {
    pub(crate) params: StreamParams,
    pub(crate) config: MixerConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) state: AtomicCell<MultiState>,
    period_frames: AtomicUsize,
    period_bytes: AtomicUsize,
    stream_open: AtomicBool,
    pub(crate) mix: Mutex<MixState>,
    pub(crate) cond: Condvar,
    pub(crate) sessions: Mutex<SessionArena>,
    wake_tx: Sender<Wake>,
    pub(crate) wake_rx: Receiver<Wake>,
}

impl Shared {
    pub(crate) fn period_bytes(&self) -> usize {
        self.period_bytes.load(Ordering::Acquire)
    }

    /// Nudge the worker. A full queue already guarantees a wake-up.
    pub(crate) fn wake(&self, wake: Wake) {
        let _ = self.wake_tx.try_send(wake);
    }

    fn release_stream(&self) {
        if self.stream_open.swap(false, Ordering::AcqRel) {
            tracing::debug!("Released {} stream", self.params.direction);
        }
    }

    fn gains(&self) -> Vec<f64> {
        self.transport.volume().gains(self.config.native_volume)
    }

    /// Run `f` on every session with a context borrowing `mix` and `arena`
    pub(crate) fn each_session(
        &self,
        mut mix: Option<&mut MixBuffer>,
        arena: &mut SessionArena,
        mut f: impl FnMut(&mut ClientSession, &mut MixContext<'_>),
    ) {
        let now = Instant::now();
        let period_bytes = self.period_bytes();
        let SessionArena { sessions, active_count, .. } = arena;
        for session in sessions.values_mut() {
            let mut ctx = MixContext {
                mix: mix.as_deref_mut(),
                active_count: &mut *active_count,
                config: &self.config,
                period_bytes,
                now,
            };
            f(session, &mut ctx);
        }
    }

    /// Run `f` on one session, if it still exists
    pub(crate) fn with_session(
        &self,
        id: SessionId,
        f: impl FnOnce(&mut ClientSession, &mut MixContext<'_>),
    ) {
        let mut mix = self.mix.lock();
        let mut arena = self.sessions.lock();
        let SessionArena { sessions, active_count, .. } = &mut *arena;
        if let Some(session) = sessions.get_mut(&id) {
            let mut ctx = MixContext {
                mix: mix.buffer.as_mut(),
                active_count,
                config: &self.config,
                period_bytes: self.period_bytes(),
                now: Instant::now(),
            };
            f(session, &mut ctx);
        }
    }

    fn underrun(&self) {
        let mut mix = self.mix.lock();
        let mut arena = self.sessions.lock();
        self.each_session(mix.buffer.as_mut(), &mut arena, |session, ctx| session.underrun(ctx));
    }
}

/// Multi-client mixer (playback) or fan-out (capture) for one transport stream
pub struct PcmMulti {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PcmMulti {
    /// Create an orchestrator for a negotiated stream. Call [`init`](Self::init)
    /// before the transport starts reading or writing.
    pub fn new(params: StreamParams, config: MixerConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        if params.channels == 0 || params.rate == 0 {
            return Err(MixBufferError::InvalidGeometry(format!(
                "{} channels at {} Hz",
                params.channels, params.rate
            ))
            .into());
        }

        let (wake_tx, wake_rx) = bounded(WAKE_CHANNEL_DEPTH);

        Ok(Self {
            shared: Arc::new(Shared {
                params,
                config,
                transport,
                state: AtomicCell::new(MultiState::Init),
                period_frames: AtomicUsize::new(0),
                period_bytes: AtomicUsize::new(0),
                stream_open: AtomicBool::new(false),
                mix: Mutex::new(MixState { buffer: None, ready: false }),
                cond: Condvar::new(),
                sessions: Mutex::new(SessionArena::new()),
                wake_tx,
                wake_rx,
            }),
            worker: Mutex::new(None),
        })
    }

    /// Size periods for the stream and allocate the accumulator.
    ///
    /// Sessions accepted before this call are started now. Called again after
    /// [`reset`](Self::reset) when the transport reconnects.
    pub fn init(&self) -> Result<()> {
        let shared = &self.shared;
        let params = shared.params;
        let period_frames = shared.config.period_frames(params.rate);
        let period_bytes = period_frames * params.frame_size();

        let has_sessions = {
            let mut mix = shared.mix.lock();
            let mut arena = shared.sessions.lock();

            shared.period_frames.store(period_frames, Ordering::Release);
            shared.period_bytes.store(period_bytes, Ordering::Release);
            mix.ready = false;

            if params.direction == Direction::Playback {
                let accumulator = MixBuffer::new(
                    params.format,
                    params.channels,
                    shared.config.buffer_periods * period_frames,
                    period_frames,
                    shared.config.mix_threshold_periods,
                )?;
                mix.buffer = Some(accumulator);
            }

            shared.each_session(mix.buffer.as_mut(), &mut arena, |session, ctx| {
                if let Err(e) = session.init(ctx) {
                    tracing::error!(session = %session.id(), "Session init failed: {}", e);
                    session.close(ctx);
                }
            });
            arena.reap_finished();

            let state = if params.direction == Direction::Capture && arena.active_count > 0 {
                MultiState::Running
            } else {
                MultiState::Init
            };
            shared.state.store(state);
            shared.cond.notify_all();

            !arena.is_empty()
        };

        if has_sessions {
            self.ensure_worker()?;
            shared.wake(Wake::Rescan);
        }

        tracing::info!(
            "{} stream initialised: {} {}ch {} Hz, {} frames per period",
            params.direction,
            params.format,
            params.channels,
            params.rate,
            period_frames
        );
        Ok(())
    }

    /// Accept a new client.
    ///
    /// Fails with [`SessionError::LimitReached`] once `max_sessions` clients
    /// are connected. The first client signals [`TransportSignal::Open`].
    pub fn add_session(&self) -> Result<(SessionId, ClientEndpoint)> {
        let shared = &self.shared;
        let direction = shared.params.direction;

        let (id, endpoint, count) = {
            let mut mix = shared.mix.lock();
            let mut arena = shared.sessions.lock();

            if arena.len() >= shared.config.max_sessions {
                tracing::warn!("Rejecting {} client: {} sessions connected", direction, arena.len());
                return Err(SessionError::LimitReached(shared.config.max_sessions).into());
            }

            let id = arena.next_id();
            let (io, endpoint) = session_channels(id, direction, shared.config.client_channel_depth);
            let mut session = ClientSession::new(id, io);

            let period_bytes = shared.period_bytes();
            if period_bytes > 0 {
                let SessionArena { active_count, .. } = &mut *arena;
                let mut ctx = MixContext {
                    mix: mix.buffer.as_mut(),
                    active_count,
                    config: &shared.config,
                    period_bytes,
                    now: Instant::now(),
                };
                session.init(&mut ctx)?;
            }
            arena.insert(session);

            match (direction, shared.state.load()) {
                (Direction::Playback, MultiState::Finished) => shared.state.store(MultiState::Init),
                (Direction::Capture, MultiState::Init | MultiState::Finished) if period_bytes > 0 => {
                    shared.state.store(MultiState::Running)
                }
                _ => {}
            }

            (id, endpoint, arena.len())
        };

        shared.stream_open.store(true, Ordering::Release);

        if let Err(e) = self.ensure_worker() {
            self.remove_session(id);
            return Err(e);
        }
        shared.wake(Wake::Rescan);

        tracing::info!(session = %id, "New {} client, {} connected", direction, count);
        if count == 1 {
            shared.transport.signal(TransportSignal::Open);
        }

        Ok((id, endpoint))
    }

    /// Disconnect a client. Returns `false` if it had already gone.
    pub fn remove_session(&self, id: SessionId) -> bool {
        let shared = &self.shared;
        let removed = {
            let mut mix = shared.mix.lock();
            let mut arena = shared.sessions.lock();
            match arena.remove(id) {
                Some(mut session) => {
                    let mut ctx = MixContext {
                        mix: mix.buffer.as_mut(),
                        active_count: &mut arena.active_count,
                        config: &shared.config,
                        period_bytes: shared.period_bytes(),
                        now: Instant::now(),
                    };
                    session.close(&mut ctx);
                    true
                }
                None => false,
            }
        };

        if removed {
            tracing::debug!(session = %id, "Session removed");
            shared.wake(Wake::Rescan);
        }
        removed
    }

    /// Read one period of mixed audio for the transport.
    ///
    /// Blocks until the worker has folded every session's staged audio.
    /// `max_samples` counts samples, not frames. Returns the number of
    /// samples written to `dest`.
    pub fn read(&self, dest: &mut [u8], max_samples: usize) -> std::result::Result<usize, ReadError> {
        let shared = &self.shared;
        if shared.params.direction != Direction::Playback
            || !shared.stream_open.load(Ordering::Acquire)
        {
            return Err(ReadError::Closed);
        }

        let gains = shared.gains();

        let mut mix = shared.mix.lock();
        mix.ready = false;
        shared.wake(Wake::Mix);

        let mut state = shared.state.load();
        while state == MultiState::Running && !mix.ready {
            shared.cond.wait(&mut mix);
            state = shared.state.load();
        }
        mix.ready = false;

        match state {
            MultiState::Running => {
                let samples = match mix.buffer.as_mut() {
                    Some(buffer) => buffer.read(dest, max_samples, &gains),
                    None => 0,
                };
                drop(mix);
                if samples == 0 {
                    shared.underrun();
                    return Err(ReadError::WouldBlock);
                }
                Ok(samples)
            }
            MultiState::Finished => {
                drop(mix);
                shared.release_stream();
                Err(ReadError::Finished)
            }
            MultiState::Init | MultiState::Paused => Err(ReadError::WouldBlock),
        }
    }

    /// Hand one captured buffer to every running client.
    ///
    /// Clients that cannot keep up lose this buffer; clients that have hung
    /// up are removed. Returns the number of samples consumed.
    pub fn write(&self, src: &[u8], samples: usize) -> usize {
        let shared = &self.shared;
        if shared.params.direction != Direction::Capture {
            return 0;
        }
        if shared.state.load() == MultiState::Finished {
            shared.release_stream();
            return 0;
        }

        let width = shared.params.format.bytes_per_sample();
        let bytes = samples.saturating_mul(width).min(src.len());
        let bytes = bytes - bytes % width;
        let chunk = Bytes::copy_from_slice(&src[..bytes]);

        let removed = {
            let mut arena = shared.sessions.lock();
            shared.each_session(None, &mut arena, |session, ctx| session.write(&chunk, ctx));
            arena.reap_finished()
        };
        if removed > 0 {
            shared.wake(Wake::Rescan);
        }

        bytes / width
    }

    /// Audio queued between a client and the transport: the mixed frames
    /// plus one client staging buffer
    pub fn delay(&self) -> Duration {
        let shared = &self.shared;
        let period_frames = self.period_frames();
        if shared.params.direction != Direction::Playback || period_frames == 0 {
            return Duration::ZERO;
        }

        let queued = shared
            .mix
            .lock()
            .buffer
            .as_ref()
            .map_or(0, |buffer| buffer.available() / buffer.channels());
        let frames = queued + shared.config.client_threshold_periods * period_frames;
        Duration::from_secs_f64(frames as f64 / f64::from(shared.params.rate))
    }

    /// Stop the worker, drop every session and release the accumulator.
    ///
    /// The orchestrator returns to `Init` and may be initialised again.
    pub fn reset(&self) {
        self.cleanup();
        self.shared.state.store(MultiState::Init);
        tracing::debug!("{} multi reset", self.shared.params.direction);
    }

    fn cleanup(&self) {
        self.stop_worker();

        let shared = &self.shared;
        let mut mix = shared.mix.lock();
        {
            let mut arena = shared.sessions.lock();
            shared.each_session(mix.buffer.as_mut(), &mut arena, |session, ctx| session.close(ctx));
            arena.sessions.clear();
            arena.active_count = 0;
        }
        mix.buffer = None;
        mix.ready = false;
        shared.cond.notify_all();
        drop(mix);

        shared.release_stream();
    }

    fn ensure_worker(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }
        if let Some(handle) = worker.take() {
            if handle.join().is_err() {
                tracing::error!("Previous worker thread panicked");
            }
        }

        // Wakes queued while no worker was running are stale
        while self.shared.wake_rx.try_recv().is_ok() {}

        let shared = Arc::clone(&self.shared);
        let name = match shared.params.direction {
            Direction::Playback => "pcm-mix",
            Direction::Capture => "pcm-snoop",
        };
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || worker::run(shared))?;
        *worker = Some(handle);
        Ok(())
    }

    fn stop_worker(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        if !handle.is_finished() {
            let _ = self
                .shared
                .wake_tx
                .send_timeout(Wake::Shutdown, Duration::from_secs(1));
        }
        if handle.join().is_err() {
            tracing::error!("Worker thread panicked");
        }
    }

    pub fn state(&self) -> MultiState {
        self.shared.state.load()
    }

    pub fn params(&self) -> StreamParams {
        self.shared.params
    }

    pub fn config(&self) -> &MixerConfig {
        &self.shared.config
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.lock().len()
    }

    /// Sessions currently feeding the stream
    pub fn active_count(&self) -> usize {
        self.shared.sessions.lock().active_count
    }

    pub fn session_state(&self, id: SessionId) -> Option<SessionState> {
        self.shared.sessions.lock().get(id).map(|session| session.state())
    }

    /// Bytes a capture client has lost by not reading fast enough
    pub fn dropped_bytes(&self, id: SessionId) -> Option<u64> {
        self.shared.sessions.lock().get(id).map(|session| session.dropped_bytes())
    }

    pub fn period_frames(&self) -> usize {
        self.shared.period_frames.load(Ordering::Acquire)
    }

    pub fn period_bytes(&self) -> usize {
        self.shared.period_bytes()
    }

    /// Samples per period across all channels
    pub fn period_samples(&self) -> usize {
        self.period_frames() * usize::from(self.shared.params.channels)
    }

    pub fn is_stream_open(&self) -> bool {
        self.shared.stream_open.load(Ordering::Acquire)
    }

    pub fn mix_stats(&self) -> Option<MixBufferStats> {
        self.shared.mix.lock().buffer.as_ref().map(|buffer| buffer.stats())
    }
}

impl Drop for PcmMulti {
    fn drop(&mut self) {
        self.cleanup();
    }
}
