//! Client sessions: control protocol, endpoints and the per-client state machine

pub(crate) mod arena;
pub(crate) mod client;
pub mod control;

pub use client::SessionState;
pub use control::{ClientEndpoint, ControlCommand, ControlReply, SessionId, UnknownCommand};

pub(crate) use arena::SessionArena;
pub(crate) use client::{ClientSession, MixContext};
pub(crate) use control::session_channels;
