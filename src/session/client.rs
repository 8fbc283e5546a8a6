//! Per-client session state machine
//!
//! A playback session stages the client's PCM in a private buffer of
//! `client_threshold_periods` periods. Once full it joins the mix at a
//! position aligned with the delay reported to the client, and from then on
//! every orchestrator pass folds as much staged audio into the accumulator as
//! the sync window allows.
//!
//! A capture session is a sink: every period the transport produces is
//! offered to it with `try_send`; a full queue drops the period.
//!
//! Sessions never reach back into the orchestrator. Everything they touch
//! beyond their own fields comes in through a [`MixContext`] for the duration
//! of one call.

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use std::time::Instant;

use super::control::{ControlCommand, ControlReply, PcmLink, SessionId, SessionIo};
use crate::config::MixerConfig;
use crate::error::SessionError;
use crate::mix::{Direction, MixBuffer, MixPosition};

/// Lifecycle state of a client session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Accepted, waiting for the stream to be initialised
    Init,
    /// Staging input, not contributing to the mix
    Idle,
    Running,
    Paused,
    /// Drain requested, staged audio still being folded
    Draining1,
    /// Contribution fully played, waiting out the drain timeout
    Draining2,
    Finished,
}

/// Orchestrator state lent to a session for one call
pub(crate) struct MixContext<'a> {
    /// Accumulator, playback only
    pub mix: Option<&'a mut MixBuffer>,
    /// Sessions currently feeding the stream
    pub active_count: &'a mut usize,
    pub config: &'a MixerConfig,
    pub period_bytes: usize,
    pub now: Instant,
}

enum Fill {
    Read(usize),
    Full,
    Empty,
    Closed,
}

pub(crate) struct ClientSession {
    id: SessionId,
    direction: Direction,
    state: SessionState,
    pcm: PcmLink,
    control_rx: Option<Receiver<String>>,
    reply_tx: Sender<ControlReply>,
    /// Staged playback bytes, never longer than `staging_limit`
    staging: Vec<u8>,
    staging_limit: usize,
    /// Tail of a chunk that did not fit in `staging`
    pending: Option<Bytes>,
    mix_position: MixPosition,
    drain_watermark: usize,
    drain_deadline: Option<Instant>,
    /// Drain requests to answer once the drain completes
    drain_waiters: usize,
    /// State restored by Resume
    resume_state: SessionState,
    /// Included in `active_count`
    counted: bool,
    drop_requested: bool,
    /// PCM channel is polled by the orchestrator
    watch: bool,
    overrun: bool,
    dropped_bytes: u64,
}

impl ClientSession {
    pub(crate) fn new(id: SessionId, io: SessionIo) -> Self {
        Self {
            id,
            direction: io.direction,
            state: SessionState::Init,
            pcm: io.pcm,
            control_rx: Some(io.control_rx),
            reply_tx: io.reply_tx,
            staging: Vec::new(),
            staging_limit: 0,
            pending: None,
            mix_position: MixPosition::default(),
            drain_watermark: usize::MAX,
            drain_deadline: None,
            drain_waiters: 0,
            resume_state: SessionState::Running,
            counted: false,
            drop_requested: false,
            watch: false,
            overrun: false,
            dropped_bytes: 0,
        }
    }

    /// Allocate the staging buffer and start I/O.
    ///
    /// Needs the stream's period size, so it runs once the orchestrator is
    /// initialised. Sessions past `Init` are left alone.
    pub(crate) fn init(&mut self, ctx: &mut MixContext<'_>) -> Result<(), SessionError> {
        if self.state != SessionState::Init {
            return Ok(());
        }

        match self.direction {
            Direction::Playback => {
                let bytes = ctx.config.client_threshold_periods * ctx.period_bytes;
                let mut staging = Vec::new();
                staging
                    .try_reserve_exact(bytes)
                    .map_err(|_| SessionError::Allocation { bytes })?;
                self.staging = staging;
                self.staging_limit = bytes;
                self.watch = true;
                self.set_state(SessionState::Idle, ctx);
            }
            Direction::Capture => self.set_state(SessionState::Running, ctx),
        }
        Ok(())
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state == SessionState::Finished
    }

    pub(crate) fn control_receiver(&self) -> Option<&Receiver<String>> {
        self.control_rx.as_ref()
    }

    /// Playback PCM channel, while the session wants input
    pub(crate) fn pcm_receiver(&self) -> Option<&Receiver<Bytes>> {
        match &self.pcm {
            PcmLink::Playback(rx) if self.watch && !self.is_finished() => Some(rx),
            _ => None,
        }
    }

    pub(crate) fn drain_deadline(&self) -> Option<Instant> {
        self.drain_deadline
    }

    pub(crate) fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }

    /// Report and clear a pending Drop request
    pub(crate) fn take_drop_request(&mut self) -> bool {
        std::mem::take(&mut self.drop_requested)
    }

    fn set_state(&mut self, new: SessionState, ctx: &mut MixContext<'_>) {
        use SessionState::*;

        let old = self.state;
        if old == new {
            return;
        }

        match new {
            Running => {
                // A drain in progress is never cancelled by new input
                if old == Draining1 {
                    return;
                }
                if !self.counted {
                    if self.direction == Direction::Playback {
                        self.mix_position = MixPosition::Relative(self.initial_offset(ctx));
                    }
                    self.counted = true;
                    *ctx.active_count += 1;
                }
            }
            Idle | Draining2 | Finished => self.uncount(ctx),
            Paused if self.direction == Direction::Capture => self.uncount(ctx),
            Init | Paused | Draining1 => {}
        }

        if new == Idle {
            self.drain_watermark = usize::MAX;
        }
        if matches!(new, Idle | Finished) && self.drain_waiters > 0 {
            tracing::debug!(session = %self.id, "Drain abandoned");
            self.drain_waiters = 0;
        }

        tracing::debug!(session = %self.id, "State {:?} -> {:?}", old, new);
        self.state = new;
    }

    fn uncount(&mut self, ctx: &mut MixContext<'_>) {
        if self.counted {
            self.counted = false;
            *ctx.active_count = ctx.active_count.saturating_sub(1);
        }
    }

    /// Samples ahead of the mix cursor where new audio should land so the
    /// delay reported to the client holds
    fn initial_offset(&self, ctx: &MixContext<'_>) -> usize {
        let Some(mix) = ctx.mix.as_deref() else {
            return 0;
        };
        let reported = mix.available() + ctx.config.client_threshold_periods * mix.period();
        let staged = self.staging.len() / mix.frame_size() * mix.channels();
        if reported >= staged {
            reported - staged
        } else {
            reported
        }
    }

    /// Move client input into the staging buffer
    fn fill_staging(&mut self) -> Fill {
        let PcmLink::Playback(rx) = &self.pcm else {
            return Fill::Closed;
        };

        let mut read = 0;
        loop {
            let space = self.staging_limit - self.staging.len();
            if space == 0 {
                return if read > 0 { Fill::Read(read) } else { Fill::Full };
            }

            let mut chunk = match self.pending.take() {
                Some(chunk) => chunk,
                None => match rx.try_recv() {
                    Ok(chunk) => chunk,
                    Err(TryRecvError::Empty) => {
                        return if read > 0 { Fill::Read(read) } else { Fill::Empty };
                    }
                    Err(TryRecvError::Disconnected) => {
                        return if read > 0 { Fill::Read(read) } else { Fill::Closed };
                    }
                },
            };

            let n = space.min(chunk.len());
            self.staging.extend_from_slice(&chunk.split_to(n));
            if !chunk.is_empty() {
                self.pending = Some(chunk);
            }
            read += n;
        }
    }

    fn maybe_start(&mut self, ctx: &mut MixContext<'_>) {
        if self.state == SessionState::Idle
            && self.staging_limit > 0
            && self.staging.len() >= self.staging_limit
        {
            self.set_state(SessionState::Running, ctx);
        }
    }

    /// PCM channel is readable
    pub(crate) fn handle_pcm(&mut self, ctx: &mut MixContext<'_>) {
        match self.fill_staging() {
            Fill::Closed => {
                tracing::debug!(session = %self.id, "PCM closed by client");
                self.close(ctx);
                return;
            }
            Fill::Full => self.watch = false,
            Fill::Read(_) | Fill::Empty => {}
        }
        self.maybe_start(ctx);
    }

    /// Fold staged audio into the mix. Called once per orchestrator pass.
    pub(crate) fn deliver(&mut self, ctx: &mut MixContext<'_>) {
        match self.state {
            SessionState::Running => {}
            SessionState::Draining1 => {
                if let Fill::Closed = self.fill_staging() {
                    self.close(ctx);
                    return;
                }
                if self.staging.is_empty() && self.pending.is_none() {
                    let Some(mix) = ctx.mix.as_deref() else {
                        return;
                    };
                    self.mix_position = mix.pin(self.mix_position);
                    let queued = mix.pending_for(self.mix_position);
                    // Zero, or wrapped past the cursor: all of it has been played
                    if queued == 0 || queued > self.drain_watermark {
                        self.set_state(SessionState::Draining2, ctx);
                        self.drain_deadline = Some(ctx.now + ctx.config.drain_timeout());
                        return;
                    }
                    self.drain_watermark = queued;
                }
            }
            _ => return,
        }

        if self.staging.is_empty() {
            return;
        }
        let Some(mix) = ctx.mix.as_deref_mut() else {
            return;
        };

        let consumed = mix.add(&mut self.mix_position, &self.staging);
        if consumed > 0 {
            self.staging.drain(..consumed);
            if self.state == SessionState::Running {
                self.watch = true;
            }
        }
    }

    /// The transport found the mix empty
    pub(crate) fn underrun(&mut self, ctx: &mut MixContext<'_>) {
        if self.state != SessionState::Running {
            return;
        }
        tracing::debug!(session = %self.id, "Underrun");
        self.set_state(SessionState::Idle, ctx);
        if self.direction == Direction::Playback {
            self.watch = true;
            // Rejoin at once if a full staging buffer is already waiting
            self.maybe_start(ctx);
        }
    }

    /// Control channel is readable
    pub(crate) fn handle_control(&mut self, ctx: &mut MixContext<'_>) {
        let Some(rx) = &self.control_rx else {
            return;
        };
        let text = match rx.try_recv() {
            Ok(text) => text,
            Err(TryRecvError::Empty) => return,
            Err(TryRecvError::Disconnected) => {
                tracing::debug!(session = %self.id, "Control closed by client");
                self.close(ctx);
                return;
            }
        };

        // A drain that has played out is acknowledged before the new command
        if self.state == SessionState::Draining2 {
            self.complete_drain(ctx);
        }

        match text.parse::<ControlCommand>() {
            Ok(ControlCommand::Drain) => self.drain(ctx),
            Ok(ControlCommand::Drop) => {
                self.drop_input(ctx);
                self.reply(ControlReply::Ok);
            }
            Ok(ControlCommand::Pause) => {
                self.pause(ctx);
                self.reply(ControlReply::Ok);
            }
            Ok(ControlCommand::Resume) => {
                self.resume(ctx);
                self.reply(ControlReply::Ok);
            }
            Err(e) => {
                tracing::warn!(session = %self.id, "{}", e);
                self.reply(ControlReply::Invalid);
            }
        }
    }

    /// Drain timer check; completes the drain once the deadline has passed
    pub(crate) fn handle_drain_timer(&mut self, ctx: &mut MixContext<'_>) {
        if self.state == SessionState::Draining2
            && self.drain_deadline.is_some_and(|deadline| deadline <= ctx.now)
        {
            self.complete_drain(ctx);
        }
    }

    fn drain(&mut self, ctx: &mut MixContext<'_>) {
        match self.state {
            SessionState::Running if self.direction == Direction::Playback => {
                self.watch = false;
                self.drain_waiters = 1;
                self.set_state(SessionState::Draining1, ctx);
            }
            // Answered together with the drain already in progress
            SessionState::Draining1 => self.drain_waiters += 1,
            SessionState::Paused if self.resume_state == SessionState::Draining1 => {
                self.drain_waiters += 1;
            }
            _ => self.reply(ControlReply::Ok),
        }
    }

    fn complete_drain(&mut self, ctx: &mut MixContext<'_>) {
        let waiters = std::mem::take(&mut self.drain_waiters);
        self.drain_deadline = None;
        self.staging.clear();
        self.watch = true;
        self.set_state(SessionState::Idle, ctx);
        for _ in 0..waiters {
            self.reply(ControlReply::Ok);
        }
    }

    fn drop_input(&mut self, ctx: &mut MixContext<'_>) {
        if self.direction == Direction::Capture || self.state == SessionState::Init {
            return;
        }

        self.drain_deadline = None;
        self.pending = None;
        let discarded = match &self.pcm {
            PcmLink::Playback(rx) => rx.try_iter().count(),
            _ => 0,
        };
        self.staging.clear();
        tracing::debug!(session = %self.id, "Dropped staged audio and {} queued chunks", discarded);

        self.set_state(SessionState::Idle, ctx);
        self.drop_requested = true;
    }

    fn pause(&mut self, ctx: &mut MixContext<'_>) {
        let pausable = match self.direction {
            Direction::Playback => matches!(
                self.state,
                SessionState::Running | SessionState::Idle | SessionState::Draining1
            ),
            Direction::Capture => matches!(self.state, SessionState::Running | SessionState::Idle),
        };
        if !pausable {
            return;
        }

        if self.direction == Direction::Playback {
            self.watch = false;
            if let (MixPosition::Absolute(index), Some(mix)) = (self.mix_position, ctx.mix.as_deref()) {
                self.mix_position = MixPosition::Relative(mix.delay(index));
            }
        }
        self.resume_state = self.state;
        self.set_state(SessionState::Paused, ctx);
    }

    fn resume(&mut self, ctx: &mut MixContext<'_>) {
        match (self.state, self.direction) {
            (SessionState::Idle, Direction::Playback) => {
                self.watch = true;
                self.drop_requested = false;
            }
            (SessionState::Paused, Direction::Playback) => {
                let resume = std::mem::replace(&mut self.resume_state, SessionState::Running);
                // A suspended drain carries on without new input
                self.watch = resume != SessionState::Draining1;
                self.set_state(resume, ctx);
                self.maybe_start(ctx);
            }
            (SessionState::Idle | SessionState::Paused, Direction::Capture) => {
                self.set_state(SessionState::Running, ctx);
            }
            _ => {}
        }
    }

    /// Offer one captured period to the client
    pub(crate) fn write(&mut self, chunk: &Bytes, ctx: &mut MixContext<'_>) {
        if self.state != SessionState::Running {
            return;
        }
        let PcmLink::Capture(tx) = &self.pcm else {
            return;
        };

        match tx.try_send(chunk.clone()) {
            Ok(()) => {
                if self.overrun {
                    self.overrun = false;
                    tracing::debug!(session = %self.id, "Client caught up, {} bytes dropped so far", self.dropped_bytes);
                }
            }
            Err(TrySendError::Full(_)) => {
                self.dropped_bytes += chunk.len() as u64;
                if !self.overrun {
                    self.overrun = true;
                    tracing::warn!(session = %self.id, "Dropping PCM frames: client not reading");
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::debug!(session = %self.id, "PCM closed by client");
                self.close(ctx);
            }
        }
    }

    /// Release I/O and finish
    pub(crate) fn close(&mut self, ctx: &mut MixContext<'_>) {
        self.pcm = PcmLink::Closed;
        self.control_rx = None;
        self.watch = false;
        self.pending = None;
        self.drain_deadline = None;
        self.set_state(SessionState::Finished, ctx);
    }

    fn reply(&self, reply: ControlReply) {
        match self.reply_tx.try_send(reply) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::error!(session = %self.id, "Control reply {} lost: queue full", reply);
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::debug!(session = %self.id, "Control reply {} lost: client gone", reply);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn staged(&self) -> usize {
        self.staging.len()
    }

    #[cfg(test)]
    pub(crate) fn mix_position(&self) -> MixPosition {
        self.mix_position
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mix::PcmFormat;
    use crate::session::control::{session_channels, ClientEndpoint};
    use std::time::Duration;

    const PERIOD_FRAMES: usize = 120;
    const PERIOD_BYTES: usize = PERIOD_FRAMES * 4;
    const PERIOD_SAMPLES: usize = PERIOD_FRAMES * 2;

    struct Harness {
        mix: MixBuffer,
        active: usize,
        config: MixerConfig,
        now: Instant,
    }

    impl Harness {
        fn new(client_threshold_periods: usize) -> Self {
            let config = MixerConfig { client_threshold_periods, ..Default::default() };
            let mix = MixBuffer::new(PcmFormat::S16Le, 2, 16 * PERIOD_FRAMES, PERIOD_FRAMES, 4).unwrap();
            Self { mix, active: 0, config, now: Instant::now() }
        }

        fn ctx(&mut self) -> MixContext<'_> {
            MixContext {
                mix: Some(&mut self.mix),
                active_count: &mut self.active,
                config: &self.config,
                period_bytes: PERIOD_BYTES,
                now: self.now,
            }
        }

        fn read_period(&mut self) -> usize {
            let mut out = vec![0u8; PERIOD_BYTES];
            self.mix.read(&mut out, PERIOD_SAMPLES, &[1.0, 1.0])
        }
    }

    fn pcm(value: i16, periods: usize) -> Vec<u8> {
        (0..periods * PERIOD_SAMPLES).flat_map(|_| value.to_le_bytes()).collect()
    }

    fn playback(h: &mut Harness) -> (ClientSession, ClientEndpoint) {
        let (io, client) = session_channels(SessionId(1), Direction::Playback, 8);
        let mut session = ClientSession::new(SessionId(1), io);
        session.init(&mut h.ctx()).unwrap();
        (session, client)
    }

    fn running(h: &mut Harness) -> (ClientSession, ClientEndpoint) {
        let (mut session, client) = playback(h);
        client.send_pcm(pcm(100, h.config.client_threshold_periods)).unwrap();
        session.handle_pcm(&mut h.ctx());
        assert_eq!(session.state(), SessionState::Running);
        (session, client)
    }

    fn command(session: &mut ClientSession, client: &ClientEndpoint, h: &mut Harness, command: ControlCommand) {
        client.send_command(command).unwrap();
        session.handle_control(&mut h.ctx());
    }

    #[test]
    fn test_playback_starts_at_threshold() {
        let mut h = Harness::new(2);
        let (mut session, client) = playback(&mut h);
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.pcm_receiver().is_some());

        client.send_pcm(pcm(100, 1)).unwrap();
        session.handle_pcm(&mut h.ctx());
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(h.active, 0);

        client.send_pcm(pcm(100, 1)).unwrap();
        session.handle_pcm(&mut h.ctx());
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(h.active, 1);
        assert_eq!(session.mix_position(), MixPosition::Relative(0));

        session.deliver(&mut h.ctx());
        assert_eq!(session.staged(), 0);
        assert_eq!(h.mix.available(), 2 * PERIOD_SAMPLES);
    }

    #[test]
    fn test_oversized_chunk_is_kept_pending() {
        let mut h = Harness::new(2);
        let (mut session, client) = playback(&mut h);
        client.send_pcm(pcm(100, 3)).unwrap();

        session.handle_pcm(&mut h.ctx());
        assert_eq!(session.staged(), 2 * PERIOD_BYTES);
        assert_eq!(session.state(), SessionState::Running);

        // Staging is full, so the next readiness event stops the watch
        session.handle_pcm(&mut h.ctx());
        assert!(session.pcm_receiver().is_none());

        session.deliver(&mut h.ctx());
        assert!(session.pcm_receiver().is_some());
        session.handle_pcm(&mut h.ctx());
        assert_eq!(session.staged(), PERIOD_BYTES);
    }

    #[test]
    fn test_late_joiner_aligned_to_reported_delay() {
        let mut h = Harness::new(2);
        let (mut first, _c1) = running(&mut h);
        first.deliver(&mut h.ctx());
        assert_eq!(h.mix.available(), 2 * PERIOD_SAMPLES);

        let (io, client) = session_channels(SessionId(2), Direction::Playback, 8);
        let mut second = ClientSession::new(SessionId(2), io);
        second.init(&mut h.ctx()).unwrap();
        client.send_pcm(pcm(5, 2)).unwrap();
        second.handle_pcm(&mut h.ctx());

        // Queued mix plus the staged client buffer, minus what is staged
        assert_eq!(second.mix_position(), MixPosition::Relative(2 * PERIOD_SAMPLES));
        assert_eq!(h.active, 2);
    }

    #[test]
    fn test_drain_acknowledged_after_playout_and_timeout() {
        let mut h = Harness::new(3);
        let (mut session, client) = running(&mut h);
        assert_eq!(session.staged(), 3 * PERIOD_BYTES);

        command(&mut session, &client, &mut h, ControlCommand::Drain);
        assert_eq!(session.state(), SessionState::Draining1);
        assert!(session.pcm_receiver().is_none());
        assert_eq!(client.try_recv_reply(), None);

        // First pass folds all three periods
        session.deliver(&mut h.ctx());
        assert_eq!(session.staged(), 0);
        assert_eq!(h.mix.available(), 3 * PERIOD_SAMPLES);

        for _ in 0..3 {
            session.deliver(&mut h.ctx());
            assert_eq!(session.state(), SessionState::Draining1);
            assert_eq!(client.try_recv_reply(), None);
            assert_eq!(h.read_period(), PERIOD_SAMPLES);
        }

        session.deliver(&mut h.ctx());
        assert_eq!(session.state(), SessionState::Draining2);
        assert_eq!(h.active, 0);
        assert_eq!(client.try_recv_reply(), None);

        h.now += Duration::from_millis(299);
        session.handle_drain_timer(&mut h.ctx());
        assert_eq!(client.try_recv_reply(), None);

        h.now += Duration::from_millis(1);
        session.handle_drain_timer(&mut h.ctx());
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(client.try_recv_reply(), Some(ControlReply::Ok));
        assert!(session.pcm_receiver().is_some());
    }

    #[test]
    fn test_pause_during_drain_keeps_staged_audio() {
        let mut h = Harness::new(3);
        let (mut session, client) = running(&mut h);
        command(&mut session, &client, &mut h, ControlCommand::Drain);
        command(&mut session, &client, &mut h, ControlCommand::Pause);

        // Only the Pause is answered; nothing reached the mix yet
        assert_eq!(client.try_recv_reply(), Some(ControlReply::Ok));
        assert_eq!(client.try_recv_reply(), None);
        assert_eq!(session.state(), SessionState::Paused);
        assert_eq!(session.staged(), 3 * PERIOD_BYTES);
        assert_eq!(h.mix.available(), 0);

        command(&mut session, &client, &mut h, ControlCommand::Resume);
        assert_eq!(client.try_recv_reply(), Some(ControlReply::Ok));
        assert_eq!(session.state(), SessionState::Draining1);
        assert!(session.pcm_receiver().is_none());

        session.deliver(&mut h.ctx());
        assert_eq!(session.staged(), 0);
        assert_eq!(h.mix.available(), 3 * PERIOD_SAMPLES);

        for _ in 0..3 {
            session.deliver(&mut h.ctx());
            assert_eq!(session.state(), SessionState::Draining1);
            assert_eq!(h.read_period(), PERIOD_SAMPLES);
        }
        session.deliver(&mut h.ctx());
        assert_eq!(session.state(), SessionState::Draining2);
        assert_eq!(client.try_recv_reply(), None);

        h.now += Duration::from_millis(300);
        session.handle_drain_timer(&mut h.ctx());
        assert_eq!(client.try_recv_reply(), Some(ControlReply::Ok));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_command_after_playout_completes_drain() {
        let mut h = Harness::new(1);
        let (mut session, client) = running(&mut h);
        command(&mut session, &client, &mut h, ControlCommand::Drain);
        session.deliver(&mut h.ctx());
        h.read_period();
        session.deliver(&mut h.ctx());
        assert_eq!(session.state(), SessionState::Draining2);

        command(&mut session, &client, &mut h, ControlCommand::Pause);
        assert_eq!(client.try_recv_reply(), Some(ControlReply::Ok));
        assert_eq!(client.try_recv_reply(), Some(ControlReply::Ok));
        assert_eq!(session.state(), SessionState::Paused);

        // Paused from Idle, so Resume goes back to Idle
        command(&mut session, &client, &mut h, ControlCommand::Resume);
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(h.active, 0);
    }

    #[test]
    fn test_repeated_drain_answered_after_playout() {
        let mut h = Harness::new(1);
        let (mut session, client) = running(&mut h);
        command(&mut session, &client, &mut h, ControlCommand::Drain);
        command(&mut session, &client, &mut h, ControlCommand::Drain);
        assert_eq!(client.try_recv_reply(), None);
        assert_eq!(session.state(), SessionState::Draining1);

        session.deliver(&mut h.ctx());
        h.read_period();
        session.deliver(&mut h.ctx());
        h.now += Duration::from_millis(300);
        session.handle_drain_timer(&mut h.ctx());

        assert_eq!(client.try_recv_reply(), Some(ControlReply::Ok));
        assert_eq!(client.try_recv_reply(), Some(ControlReply::Ok));
        assert_eq!(client.try_recv_reply(), None);
    }

    #[test]
    fn test_drop_abandons_drain() {
        let mut h = Harness::new(2);
        let (mut session, client) = running(&mut h);
        command(&mut session, &client, &mut h, ControlCommand::Drain);
        command(&mut session, &client, &mut h, ControlCommand::Drop);

        assert_eq!(client.try_recv_reply(), Some(ControlReply::Ok));
        assert_eq!(client.try_recv_reply(), None);
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.staged(), 0);
        assert_eq!(h.active, 0);
    }

    #[test]
    fn test_resume_returns_to_state_before_pause() {
        let mut h = Harness::new(2);
        let (mut session, client) = playback(&mut h);
        command(&mut session, &client, &mut h, ControlCommand::Pause);
        assert_eq!(session.state(), SessionState::Paused);
        assert!(session.pcm_receiver().is_none());

        command(&mut session, &client, &mut h, ControlCommand::Resume);
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.staged(), 0);
        assert_eq!(h.active, 0);
        assert!(session.pcm_receiver().is_some());
        assert_eq!(client.try_recv_reply(), Some(ControlReply::Ok));
        assert_eq!(client.try_recv_reply(), Some(ControlReply::Ok));
    }

    #[test]
    fn test_drain_when_not_running_replies_immediately() {
        let mut h = Harness::new(2);
        let (mut session, client) = playback(&mut h);
        command(&mut session, &client, &mut h, ControlCommand::Drain);
        assert_eq!(client.try_recv_reply(), Some(ControlReply::Ok));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_pause_snapshots_delay() {
        let mut h = Harness::new(2);
        let (mut session, client) = running(&mut h);
        session.deliver(&mut h.ctx());
        h.read_period();

        command(&mut session, &client, &mut h, ControlCommand::Pause);
        assert_eq!(session.state(), SessionState::Paused);
        assert_eq!(session.mix_position(), MixPosition::Relative(PERIOD_SAMPLES));
        assert!(session.pcm_receiver().is_none());
        // Paused playback still holds its place in the stream
        assert_eq!(h.active, 1);

        command(&mut session, &client, &mut h, ControlCommand::Resume);
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(session.mix_position(), MixPosition::Relative(PERIOD_SAMPLES));
        assert_eq!(h.active, 1);
        assert!(session.pcm_receiver().is_some());
    }

    #[test]
    fn test_drop_discards_input() {
        let mut h = Harness::new(2);
        let (mut session, client) = running(&mut h);
        client.send_pcm(pcm(1, 1)).unwrap();
        client.send_pcm(pcm(1, 1)).unwrap();

        command(&mut session, &client, &mut h, ControlCommand::Drop);
        assert_eq!(client.try_recv_reply(), Some(ControlReply::Ok));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.staged(), 0);
        assert_eq!(h.active, 0);

        session.handle_pcm(&mut h.ctx());
        assert_eq!(session.staged(), 0);

        assert!(session.take_drop_request());
        assert!(!session.take_drop_request());
    }

    #[test]
    fn test_resume_clears_drop_flag() {
        let mut h = Harness::new(2);
        let (mut session, client) = running(&mut h);
        command(&mut session, &client, &mut h, ControlCommand::Drop);
        command(&mut session, &client, &mut h, ControlCommand::Resume);
        assert!(!session.take_drop_request());
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_invalid_command() {
        let mut h = Harness::new(2);
        let (mut session, client) = running(&mut h);
        client.send_text("Rewind").unwrap();
        session.handle_control(&mut h.ctx());
        assert_eq!(client.try_recv_reply(), Some(ControlReply::Invalid));
        assert_eq!(session.state(), SessionState::Running);
    }

    #[test]
    fn test_underrun_returns_to_idle() {
        let mut h = Harness::new(2);
        let (mut session, _client) = running(&mut h);
        session.deliver(&mut h.ctx());

        session.underrun(&mut h.ctx());
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(h.active, 0);
    }

    #[test]
    fn test_underrun_with_full_staging_rejoins() {
        let mut h = Harness::new(2);
        let (mut session, _client) = running(&mut h);

        session.underrun(&mut h.ctx());
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(h.active, 1);
    }

    #[test]
    fn test_disconnect_finishes() {
        let mut h = Harness::new(2);
        let (mut session, client) = running(&mut h);
        session.deliver(&mut h.ctx());
        drop(client);
        session.handle_pcm(&mut h.ctx());
        assert!(session.is_finished());
        assert_eq!(h.active, 0);
        assert!(session.control_receiver().is_none());
    }

    #[test]
    fn test_control_hangup_finishes() {
        let mut h = Harness::new(2);
        let (mut session, mut client) = playback(&mut h);
        client.close_control();
        session.handle_control(&mut h.ctx());
        assert!(session.is_finished());
    }

    fn capture(h: &mut Harness, depth: usize) -> (ClientSession, ClientEndpoint) {
        let (io, client) = session_channels(SessionId(7), Direction::Capture, depth);
        let mut session = ClientSession::new(SessionId(7), io);
        let mut ctx = MixContext {
            mix: None,
            active_count: &mut h.active,
            config: &h.config,
            period_bytes: PERIOD_BYTES,
            now: h.now,
        };
        session.init(&mut ctx).unwrap();
        (session, client)
    }

    #[test]
    fn test_capture_drop_and_continue() {
        let mut h = Harness::new(2);
        let (mut session, client) = capture(&mut h, 1);
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(h.active, 1);

        let chunk = Bytes::from(pcm(3, 1));
        session.write(&chunk, &mut h.ctx());
        session.write(&chunk, &mut h.ctx());
        assert_eq!(session.dropped_bytes(), PERIOD_BYTES as u64);
        assert_eq!(session.state(), SessionState::Running);

        assert_eq!(client.try_recv_pcm().unwrap(), Some(chunk.clone()));
        session.write(&chunk, &mut h.ctx());
        assert_eq!(client.try_recv_pcm().unwrap(), Some(chunk));
    }

    #[test]
    fn test_capture_disconnect() {
        let mut h = Harness::new(2);
        let (mut session, client) = capture(&mut h, 1);
        drop(client);
        session.write(&Bytes::from_static(&[0, 0]), &mut h.ctx());
        assert!(session.is_finished());
        assert_eq!(h.active, 0);
    }

    #[test]
    fn test_capture_pause_resume() {
        let mut h = Harness::new(2);
        let (mut session, client) = capture(&mut h, 1);

        command(&mut session, &client, &mut h, ControlCommand::Pause);
        assert_eq!(session.state(), SessionState::Paused);
        assert_eq!(h.active, 0);

        // Paused sessions receive nothing
        session.write(&Bytes::from_static(&[1, 2]), &mut h.ctx());
        assert_eq!(client.try_recv_pcm().unwrap(), None);

        command(&mut session, &client, &mut h, ControlCommand::Resume);
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(h.active, 1);
    }

    #[test]
    fn test_every_command_in_every_state() {
        let commands = ["Drain", "Drop", "Pause", "Resume", "bogus"];
        for first in commands {
            for second in commands {
                let mut h = Harness::new(2);
                let (mut session, client) = running(&mut h);
                for text in [first, second] {
                    client.send_text(text).unwrap();
                    session.handle_control(&mut h.ctx());
                    session.deliver(&mut h.ctx());
                    session.underrun(&mut h.ctx());
                    session.handle_drain_timer(&mut h.ctx());
                }
                assert!(h.active <= 1);
                assert!(!session.is_finished());
            }
        }
    }
}
