//! # Relay Mixer
//!
//! Multi-client PCM mixing and fan-out for a Bluetooth audio relay daemon.
//!
//! Many client applications share one transport stream. Playback clients are
//! summed into a shared accumulator that the transport thread drains one
//! period at a time; on capture, every period the transport produces is
//! copied to each connected reader.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌────────────────────────────────── PLAYBACK ──────────────────────────────────┐
//! │  ┌──────────┐   ┌──────────┐   ┌──────────┐                                  │
//! │  │ Client A │   │ Client B │   │ Client C │   (ClientEndpoint, Bytes chunks) │
//! │  └────┬─────┘   └────┬─────┘   └────┬─────┘                                  │
//! │       ▼              ▼              ▼                                        │
//! │  ┌───────────────────────────────────────────────────────────────────────┐   │
//! │  │                  PcmMulti worker thread (multi::worker)               │   │
//! │  │   Session A       Session B       Session C                           │   │
//! │  │  ┌─────────┐     ┌─────────┐     ┌─────────┐                          │   │
//! │  │  │ Staging │     │ Staging │     │ Staging │ (session::ClientSession) │   │
//! │  │  └────┬────┘     └────┬────┘     └────┬────┘                          │   │
//! │  └───────┼───────────────┼───────────────┼───────────────────────────────┘   │
//! │          └───────────────┼───────────────┘                                   │
//! │                          ▼                                                   │
//! │  ┌───────────────────────────────────────────────────────────────────────┐   │
//! │  │           MixBuffer (mix::buffer) - widened, summed samples           │   │
//! │  └───────────────────────────────────────────────────────────────────────┘   │
//! │                          │ PcmMulti::read()                                  │
//! │                          ▼                                                   │
//! │                  Transport thread (encoder)                                  │
//! └──────────────────────────────────────────────────────────────────────────────┘
//!
//! ┌────────────────────────────────── CAPTURE ───────────────────────────────────┐
//! │                  Transport thread (decoder)                                  │
//! │                          │ PcmMulti::write()                                 │
//! │          ┌───────────────┼───────────────┐                                   │
//! │          ▼               ▼               ▼                                   │
//! │     Session A       Session B       Session C   (try_send, drop on overrun)  │
//! └──────────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod mix;
pub mod multi;
pub mod session;

pub use config::MixerConfig;
pub use error::{Error, ReadError, Result};
pub use mix::{Direction, MixBuffer, MixPosition, PcmFormat, StreamParams};
pub use multi::{ChannelTransport, MultiState, PcmMulti, Transport, TransportSignal, VolumeSnapshot};
pub use session::{ClientEndpoint, ControlCommand, ControlReply, SessionId, SessionState};

/// Application-wide constants
pub mod constants {
    /// Default period length in milliseconds
    pub const DEFAULT_PERIOD_MS: u32 = 20;

    /// Number of periods held by the mix buffer
    pub const DEFAULT_BUFFER_PERIODS: usize = 16;

    /// Periods buffered before the mix starts running.
    /// Also the furthest a client may write ahead of the read cursor.
    pub const DEFAULT_MIX_THRESHOLD_PERIODS: usize = 4;

    /// Periods a client must stage before it joins the mix
    pub const DEFAULT_CLIENT_THRESHOLD_PERIODS: usize = 2;

    /// Maximum number of concurrent client sessions
    pub const MAX_SESSIONS: usize = 32;

    /// Grace period between a drained client and its Drain acknowledgement
    pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 300;

    /// Gain applied when the transport uses pass-through volume
    pub const DEFAULT_NATIVE_VOLUME: f64 = 1.0;

    /// PCM chunks queued per client channel
    pub const DEFAULT_CLIENT_CHANNEL_DEPTH: usize = 8;

    /// Control messages queued per client
    pub const CONTROL_CHANNEL_DEPTH: usize = 4;

    /// Pending wake requests for the worker thread
    pub const WAKE_CHANNEL_DEPTH: usize = 16;
}
