//! Error types for the mixing engine

use thiserror::Error;

use crate::mix::Direction;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Mix buffer error: {0}")]
    MixBuffer(#[from] MixBufferError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Mix accumulator errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MixBufferError {
    #[error("Out of memory allocating {samples} mix samples")]
    Allocation { samples: usize },

    #[error("Invalid mix geometry: {0}")]
    InvalidGeometry(String),
}

/// Client session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Maximum sessions reached: {0}")]
    LimitReached(usize),

    #[error("Out of memory allocating {bytes} byte staging buffer")]
    Allocation { bytes: usize },

    #[error("Session is {found:?}, expected {expected:?}")]
    DirectionMismatch { expected: Direction, found: Direction },

    #[error("Client disconnected")]
    Disconnected,

    #[error("Timed out waiting for control reply")]
    Timeout,
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Outcome of a transport read that produced no audio
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    /// Nothing mixed yet, try again next period
    #[error("No audio available")]
    WouldBlock,

    /// All clients have gone; the stream has been released
    #[error("Stream finished")]
    Finished,

    /// The stream is not open
    #[error("Stream closed")]
    Closed,
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
