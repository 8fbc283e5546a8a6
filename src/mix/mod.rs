//! Sample formats and the playback mix accumulator

pub mod buffer;
pub mod format;

pub use buffer::{MixBuffer, MixBufferStats, MixPosition};
pub use format::{Direction, PcmFormat, StreamParams};
