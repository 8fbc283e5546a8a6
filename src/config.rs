//! Mixer configuration
//!
//! Values are normally compiled-in defaults (see [`crate::constants`]) and can
//! be overridden from a TOML file:
//!
//! ```toml
//! period_ms = 10
//! mix_threshold_periods = 3
//! drain_timeout_ms = 200
//! ```

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{ConfigError, Result};
use crate::mix::Direction;

/// Tunables for the multi-client engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerConfig {
    /// Period length in milliseconds
    pub period_ms: u32,
    /// Mix buffer capacity in periods
    pub buffer_periods: usize,
    /// Periods mixed before the transport is resumed; also the sync window
    pub mix_threshold_periods: usize,
    /// Periods a client stages before joining the mix
    pub client_threshold_periods: usize,
    /// Maximum concurrent sessions per stream
    pub max_sessions: usize,
    /// Delay before a completed drain is acknowledged
    pub drain_timeout_ms: u64,
    /// Gain used for pass-through volume
    pub native_volume: f64,
    /// Use the mixer for playback streams
    pub mix_enabled: bool,
    /// Use fan-out for capture streams
    pub snoop_enabled: bool,
    /// PCM chunks queued per client channel
    pub client_channel_depth: usize,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            period_ms: DEFAULT_PERIOD_MS,
            buffer_periods: DEFAULT_BUFFER_PERIODS,
            mix_threshold_periods: DEFAULT_MIX_THRESHOLD_PERIODS,
            client_threshold_periods: DEFAULT_CLIENT_THRESHOLD_PERIODS,
            max_sessions: MAX_SESSIONS,
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT_MS,
            native_volume: DEFAULT_NATIVE_VOLUME,
            mix_enabled: true,
            snoop_enabled: true,
            client_channel_depth: DEFAULT_CLIENT_CHANNEL_DEPTH,
        }
    }
}

impl MixerConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        tracing::info!("Loaded mixer config from {}", path.display());
        Ok(config)
    }

    /// Serialize to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self).map_err(ConfigError::from)?)
    }

    /// Platform config file location, if a home directory is known
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "relay", "relay-mixer")
            .map(|dirs| dirs.config_dir().join("mixer.toml"))
    }

    /// Load from [`default_path`](Self::default_path), falling back to defaults
    pub fn load_or_default() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Ignoring config {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Check ranges and the relationship between thresholds and buffer size
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        fn nonzero(field: &'static str, value: usize) -> std::result::Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::Invalid { field, reason: "must be greater than zero".into() });
            }
            Ok(())
        }

        nonzero("period_ms", self.period_ms as usize)?;
        nonzero("buffer_periods", self.buffer_periods)?;
        nonzero("mix_threshold_periods", self.mix_threshold_periods)?;
        nonzero("client_threshold_periods", self.client_threshold_periods)?;
        nonzero("max_sessions", self.max_sessions)?;
        nonzero("client_channel_depth", self.client_channel_depth)?;

        if self.buffer_periods < 2 * self.mix_threshold_periods {
            return Err(ConfigError::Invalid {
                field: "buffer_periods",
                reason: format!(
                    "{} periods cannot hold two sync windows of {} periods",
                    self.buffer_periods, self.mix_threshold_periods
                ),
            });
        }

        if !self.native_volume.is_finite() || self.native_volume < 0.0 {
            return Err(ConfigError::Invalid {
                field: "native_volume",
                reason: format!("{} is not a usable gain", self.native_volume),
            });
        }

        Ok(())
    }

    /// Whether the multi-client engine handles streams in this direction
    pub fn multi_enabled(&self, direction: Direction) -> bool {
        match direction {
            Direction::Playback => self.mix_enabled,
            Direction::Capture => self.snoop_enabled,
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn period_duration(&self) -> Duration {
        Duration::from_millis(u64::from(self.period_ms))
    }

    /// Frames per period at the given sample rate, never less than one
    pub fn period_frames(&self, rate: u32) -> usize {
        let frames = u64::from(self.period_ms) * u64::from(rate) / 1000;
        (frames as usize).max(1)
    }
}
