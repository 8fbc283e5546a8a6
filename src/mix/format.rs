//! PCM sample formats and stream parameters

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stream direction as seen from the Bluetooth device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Clients write, the transport reads the mix (sink)
    Playback,
    /// The transport writes, clients read copies (source)
    Capture,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Playback => write!(f, "playback"),
            Direction::Capture => write!(f, "capture"),
        }
    }
}

/// Supported interleaved PCM sample formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PcmFormat {
    /// Unsigned 8-bit, offset binary (0x80 is silence)
    U8,
    /// Signed 16-bit little endian
    S16Le,
    /// Signed 24-bit little endian in the low bytes of a 32-bit container
    S24In32Le,
    /// Signed 32-bit little endian
    S32Le,
}

impl PcmFormat {
    /// Bytes per sample in the client/transport representation
    pub fn bytes_per_sample(self) -> usize {
        match self {
            PcmFormat::U8 => 1,
            PcmFormat::S16Le => 2,
            PcmFormat::S24In32Le | PcmFormat::S32Le => 4,
        }
    }

    /// Bytes per interleaved frame
    pub fn frame_size(self, channels: u8) -> usize {
        self.bytes_per_sample() * usize::from(channels)
    }

    /// Valid output range as signed values
    pub fn sample_range(self) -> (i64, i64) {
        match self {
            PcmFormat::U8 => (i64::from(i8::MIN), i64::from(i8::MAX)),
            PcmFormat::S16Le => (i64::from(i16::MIN), i64::from(i16::MAX)),
            PcmFormat::S24In32Le => (-(1 << 23), (1 << 23) - 1),
            PcmFormat::S32Le => (i64::from(i32::MIN), i64::from(i32::MAX)),
        }
    }

    /// Decode one sample to a signed value centred on zero.
    ///
    /// `raw` must hold at least [`bytes_per_sample`](Self::bytes_per_sample) bytes.
    #[inline]
    pub fn widen(self, raw: &[u8]) -> i64 {
        match self {
            PcmFormat::U8 => i64::from(raw[0]) - 0x80,
            PcmFormat::S16Le => i64::from(i16::from_le_bytes([raw[0], raw[1]])),
            PcmFormat::S24In32Le => {
                let word = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                // Sign-extend from bit 23, ignoring the container's top byte
                i64::from(((word << 8) as i32) >> 8)
            }
            PcmFormat::S32Le => i64::from(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
        }
    }

    /// Clamp a signed value to this format's range and encode it into `out`
    #[inline]
    pub fn narrow(self, value: i64, out: &mut [u8]) {
        let (min, max) = self.sample_range();
        let value = value.clamp(min, max);
        match self {
            PcmFormat::U8 => out[0] = (value + 0x80) as u8,
            PcmFormat::S16Le => out[..2].copy_from_slice(&(value as i16).to_le_bytes()),
            PcmFormat::S24In32Le => {
                let word = (value as i32 as u32) & 0x00FF_FFFF;
                out[..4].copy_from_slice(&word.to_le_bytes());
            }
            PcmFormat::S32Le => out[..4].copy_from_slice(&(value as i32).to_le_bytes()),
        }
    }

    /// Byte pattern of one silent sample
    pub fn silence(self) -> u8 {
        match self {
            PcmFormat::U8 => 0x80,
            _ => 0,
        }
    }
}

impl fmt::Display for PcmFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PcmFormat::U8 => "U8",
            PcmFormat::S16Le => "S16_LE",
            PcmFormat::S24In32Le => "S24_LE",
            PcmFormat::S32Le => "S32_LE",
        };
        f.write_str(name)
    }
}

/// Negotiated transport stream parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamParams {
    pub direction: Direction,
    pub format: PcmFormat,
    pub channels: u8,
    pub rate: u32,
}

impl StreamParams {
    pub fn new(direction: Direction, format: PcmFormat, channels: u8, rate: u32) -> Self {
        Self { direction, format, channels, rate }
    }

    pub fn frame_size(&self) -> usize {
        self.format.frame_size(self.channels)
    }
}
