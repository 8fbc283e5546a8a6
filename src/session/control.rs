//! Session identifiers, control protocol and the client's end of a session
//!
//! Each session is three channels: PCM chunks (client to mixer on playback,
//! mixer to client on capture), text commands from the client, and replies
//! back to it. Dropping either half disconnects the session.

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::constants::CONTROL_CHANNEL_DEPTH;
use crate::error::SessionError;
use crate::mix::Direction;

/// Stable handle of a session within one orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub(crate) u64);

impl SessionId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Commands a client may send on its control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Wait until everything written so far has been played
    Drain,
    /// Discard buffered audio
    Drop,
    Pause,
    Resume,
}

impl ControlCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlCommand::Drain => "Drain",
            ControlCommand::Drop => "Drop",
            ControlCommand::Pause => "Pause",
            ControlCommand::Resume => "Resume",
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Control text that is not a known command
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown control command: {0:?}")]
pub struct UnknownCommand(pub String);

impl FromStr for ControlCommand {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Drain" => Ok(ControlCommand::Drain),
            "Drop" => Ok(ControlCommand::Drop),
            "Pause" => Ok(ControlCommand::Pause),
            "Resume" => Ok(ControlCommand::Resume),
            other => Err(UnknownCommand(other.to_string())),
        }
    }
}

/// Reply to a control command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlReply {
    Ok,
    Invalid,
}

impl fmt::Display for ControlReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlReply::Ok => f.write_str("OK"),
            ControlReply::Invalid => f.write_str("Invalid"),
        }
    }
}

/// Mixer side of the PCM channel
pub(crate) enum PcmLink {
    Playback(Receiver<Bytes>),
    Capture(Sender<Bytes>),
    Closed,
}

/// Mixer side of a new session, consumed by `ClientSession::new`
pub(crate) struct SessionIo {
    pub(crate) direction: Direction,
    pub(crate) pcm: PcmLink,
    pub(crate) control_rx: Receiver<String>,
    pub(crate) reply_tx: Sender<ControlReply>,
}

enum ClientPcm {
    Playback(Sender<Bytes>),
    Capture(Receiver<Bytes>),
    Closed,
}

/// Create both ends of a session
pub(crate) fn session_channels(
    id: SessionId,
    direction: Direction,
    depth: usize,
) -> (SessionIo, ClientEndpoint) {
    let (control_tx, control_rx) = bounded(CONTROL_CHANNEL_DEPTH);
    let (reply_tx, reply_rx) = bounded(CONTROL_CHANNEL_DEPTH);
    let (pcm_tx, pcm_rx) = bounded::<Bytes>(depth.max(1));

    let (pcm, client_pcm) = match direction {
        Direction::Playback => (PcmLink::Playback(pcm_rx), ClientPcm::Playback(pcm_tx)),
        Direction::Capture => (PcmLink::Capture(pcm_tx), ClientPcm::Capture(pcm_rx)),
    };

    let io = SessionIo { direction, pcm, control_rx, reply_tx };
    let endpoint = ClientEndpoint {
        id,
        direction,
        pcm: client_pcm,
        control_tx: Some(control_tx),
        reply_rx,
    };
    (io, endpoint)
}

/// The client application's end of a session
pub struct ClientEndpoint {
    id: SessionId,
    direction: Direction,
    pcm: ClientPcm,
    control_tx: Option<Sender<String>>,
    reply_rx: Receiver<ControlReply>,
}

impl ClientEndpoint {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    fn playback_tx(&self) -> Result<&Sender<Bytes>, SessionError> {
        match &self.pcm {
            ClientPcm::Playback(tx) => Ok(tx),
            ClientPcm::Capture(_) => Err(SessionError::DirectionMismatch {
                expected: Direction::Playback,
                found: Direction::Capture,
            }),
            ClientPcm::Closed => Err(SessionError::Disconnected),
        }
    }

    fn capture_rx(&self) -> Result<&Receiver<Bytes>, SessionError> {
        match &self.pcm {
            ClientPcm::Capture(rx) => Ok(rx),
            ClientPcm::Playback(_) => Err(SessionError::DirectionMismatch {
                expected: Direction::Capture,
                found: Direction::Playback,
            }),
            ClientPcm::Closed => Err(SessionError::Disconnected),
        }
    }

    /// Queue PCM for playback, blocking while the session's queue is full
    pub fn send_pcm(&self, chunk: impl Into<Bytes>) -> Result<(), SessionError> {
        self.playback_tx()?
            .send(chunk.into())
            .map_err(|_| SessionError::Disconnected)
    }

    /// Queue PCM without blocking. Returns `false` if the queue is full.
    pub fn try_send_pcm(&self, chunk: impl Into<Bytes>) -> Result<bool, SessionError> {
        match self.playback_tx()?.try_send(chunk.into()) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Disconnected(_)) => Err(SessionError::Disconnected),
        }
    }

    /// Next captured chunk, if one arrives within `timeout`
    pub fn recv_pcm_timeout(&self, timeout: Duration) -> Result<Option<Bytes>, SessionError> {
        match self.capture_rx()?.recv_timeout(timeout) {
            Ok(chunk) => Ok(Some(chunk)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(SessionError::Disconnected),
        }
    }

    pub fn try_recv_pcm(&self) -> Result<Option<Bytes>, SessionError> {
        match self.capture_rx()?.try_recv() {
            Ok(chunk) => Ok(Some(chunk)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(SessionError::Disconnected),
        }
    }

    /// Hang up the PCM channel, leaving control open
    pub fn close_pcm(&mut self) {
        self.pcm = ClientPcm::Closed;
    }

    /// Send raw control text. Unknown text is answered with `Invalid`.
    pub fn send_text(&self, text: &str) -> Result<(), SessionError> {
        self.control_tx
            .as_ref()
            .ok_or(SessionError::Disconnected)?
            .send(text.to_string())
            .map_err(|_| SessionError::Disconnected)
    }

    pub fn send_command(&self, command: ControlCommand) -> Result<(), SessionError> {
        self.send_text(command.as_str())
    }

    pub fn try_recv_reply(&self) -> Option<ControlReply> {
        self.reply_rx.try_recv().ok()
    }

    pub fn recv_reply_timeout(&self, timeout: Duration) -> Result<ControlReply, SessionError> {
        self.reply_rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => SessionError::Timeout,
            RecvTimeoutError::Disconnected => SessionError::Disconnected,
        })
    }

    /// Send a command and wait for its reply
    pub fn request(&self, command: ControlCommand, timeout: Duration) -> Result<ControlReply, SessionError> {
        self.send_command(command)?;
        self.recv_reply_timeout(timeout)
    }

    /// Hang up the control channel, leaving PCM open
    pub fn close_control(&mut self) {
        self.control_tx = None;
    }
}

impl fmt::Debug for ClientEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientEndpoint")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .finish()
    }
}
