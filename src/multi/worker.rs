//! Orchestrator worker thread
//!
//! Waits on every session's control channel, the PCM channel of each
//! playback session that wants input, and the internal wake channel, all in
//! one `Select`. Drain timers are handled through the select deadline.

use bytes::Bytes;
use crossbeam_channel::{Receiver, Select};
use std::sync::Arc;
use std::time::Instant;

use super::{MixState, MultiState, Shared, TransportSignal};
use crate::mix::Direction;
use crate::session::{SessionId, SessionState};

/// Requests to the worker thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    /// The transport wants a mix pass
    Mix,
    /// Session set changed, rebuild the wait set
    Rescan,
    Shutdown,
}

enum Watched {
    Control(SessionId, Receiver<String>),
    Pcm(SessionId, Receiver<Bytes>),
}

enum Event {
    Wake,
    Control(SessionId),
    Pcm(SessionId),
    Timeout,
}

pub(crate) fn run(shared: Arc<Shared>) {
    let direction = shared.params.direction;
    tracing::debug!("{} worker started", direction);

    loop {
        let (watched, deadline) = shared.watch_list();

        match wait(&shared.wake_rx, &watched, deadline) {
            Event::Wake => {
                let mut mix_requested = false;
                let mut shutdown = false;
                for wake in shared.wake_rx.try_iter() {
                    match wake {
                        Wake::Mix => mix_requested = true,
                        Wake::Rescan => {}
                        Wake::Shutdown => shutdown = true,
                    }
                }
                if shutdown {
                    break;
                }
                if mix_requested && direction == Direction::Playback {
                    shared.mix_pass();
                }
            }
            Event::Control(id) => shared.with_session(id, |session, ctx| session.handle_control(ctx)),
            Event::Pcm(id) => shared.with_session(id, |session, ctx| session.handle_pcm(ctx)),
            Event::Timeout => {}
        }

        shared.expire_drain_timers();

        let signal = match direction {
            Direction::Playback => shared.update_playback(),
            Direction::Capture => shared.update_capture(),
        };
        if let Some(signal) = signal {
            tracing::debug!("Signalling transport: {:?}", signal);
            shared.transport.signal(signal);
        }
    }

    shared.terminate();
    tracing::debug!("{} worker stopped", direction);
}

fn wait(wake_rx: &Receiver<Wake>, watched: &[Watched], deadline: Option<Instant>) -> Event {
    let mut select = Select::new();
    select.recv(wake_rx);
    for entry in watched {
        match entry {
            Watched::Control(_, rx) => select.recv(rx),
            Watched::Pcm(_, rx) => select.recv(rx),
        };
    }

    let index = match deadline {
        Some(deadline) => match select.ready_deadline(deadline) {
            Ok(index) => index,
            Err(_) => return Event::Timeout,
        },
        None => select.ready(),
    };

    match index.checked_sub(1).and_then(|i| watched.get(i)) {
        None => Event::Wake,
        Some(Watched::Control(id, _)) => Event::Control(*id),
        Some(Watched::Pcm(id, _)) => Event::Pcm(*id),
    }
}

impl Shared {
    /// Channels to wait on and the earliest timer
    fn watch_list(&self) -> (Vec<Watched>, Option<Instant>) {
        let arena = self.sessions.lock();
        let now = Instant::now();
        let mut watched = Vec::with_capacity(arena.len() * 2);
        let mut deadline: Option<Instant> = None;

        for (id, session) in &arena.sessions {
            if let Some(rx) = session.control_receiver() {
                watched.push(Watched::Control(*id, rx.clone()));
            }
            if let Some(rx) = session.pcm_receiver() {
                watched.push(Watched::Pcm(*id, rx.clone()));
            }

            // Draining sessions are polled each period even when the
            // transport is not pulling
            let next = match session.state() {
                SessionState::Draining1 => Some(now + self.config.period_duration()),
                SessionState::Draining2 => session.drain_deadline(),
                _ => None,
            };
            if let Some(next) = next {
                deadline = Some(deadline.map_or(next, |d| d.min(next)));
            }
        }

        (watched, deadline)
    }

    /// Fold every session into the mix and release a waiting reader
    fn mix_pass(&self) {
        let mut mix = self.mix.lock();
        {
            let mut arena = self.sessions.lock();
            self.each_session(mix.buffer.as_mut(), &mut arena, |session, ctx| session.deliver(ctx));
        }
        mix.ready = true;
        self.cond.notify_all();
    }

    fn expire_drain_timers(&self) {
        let now = Instant::now();
        let mut mix = self.mix.lock();
        let mut arena = self.sessions.lock();
        let expired = arena
            .sessions
            .values()
            .any(|session| session.drain_deadline().is_some_and(|deadline| deadline <= now));
        if expired {
            self.each_session(mix.buffer.as_mut(), &mut arena, |session, ctx| {
                session.handle_drain_timer(ctx)
            });
        }
    }

    fn update_playback(&self) -> Option<TransportSignal> {
        let mut mix = self.mix.lock();
        let mut arena = self.sessions.lock();
        arena.reap_finished();

        if arena.is_empty() {
            if self.state.load() == MultiState::Finished {
                return None;
            }
            tracing::info!("Last playback client gone");
            self.state.store(MultiState::Finished);
            if let Some(buffer) = mix.buffer.as_mut() {
                buffer.clear();
            }
            self.cond.notify_all();
            return Some(TransportSignal::Close);
        }

        if let Some(session) = arena.sole_session_mut() {
            if session.take_drop_request() {
                if let Some(buffer) = mix.buffer.as_mut() {
                    buffer.clear();
                }
                self.state.store(MultiState::Init);
                self.cond.notify_all();
                return Some(TransportSignal::Drop);
            }
        }

        match self.state.load() {
            MultiState::Init if arena.active_count > 0 => {
                let MixState { buffer, .. } = &mut *mix;
                self.each_session(buffer.as_mut(), &mut arena, |session, ctx| session.deliver(ctx));

                let start = buffer.as_ref().is_some_and(|buffer| {
                    buffer.at_threshold() || (!buffer.is_empty() && arena.any_draining())
                });
                if start {
                    self.state.store(MultiState::Running);
                    return Some(TransportSignal::Resume);
                }
                None
            }
            MultiState::Running => {
                if mix.buffer.as_ref().map_or(true, |buffer| buffer.is_empty()) {
                    self.state.store(MultiState::Init);
                    self.cond.notify_all();
                    None
                } else {
                    Some(TransportSignal::Ready)
                }
            }
            _ => None,
        }
    }

    fn update_capture(&self) -> Option<TransportSignal> {
        let mut arena = self.sessions.lock();
        arena.reap_finished();

        let state = self.state.load();
        if arena.is_empty() {
            if state == MultiState::Finished {
                return None;
            }
            tracing::info!("Last capture client gone");
            self.state.store(MultiState::Finished);
            return Some(TransportSignal::Close);
        }

        match state {
            MultiState::Paused if arena.active_count > 0 => {
                self.state.store(MultiState::Running);
                Some(TransportSignal::Resume)
            }
            MultiState::Running if arena.active_count == 0 => {
                self.state.store(MultiState::Paused);
                Some(TransportSignal::Pause)
            }
            _ => None,
        }
    }

    /// Worker exit: no more passes will run, so wake the transport
    fn terminate(&self) {
        {
            let _mix = self.mix.lock();
            self.state.store(MultiState::Finished);
            self.cond.notify_all();
        }
        self.transport.signal(TransportSignal::Ready);
    }
}
