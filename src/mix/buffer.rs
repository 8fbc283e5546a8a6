//! Mix accumulator
//!
//! A fixed-capacity circular buffer of widened samples. Every client adds its
//! PCM at its own position; the transport reads one period at a time and each
//! slot it consumes is zeroed, so later adds to that slot start from silence.
//!
//! Samples are stored one size up from the wire format (U8 in `i16`, S16 and
//! S24 in `i32`, S32 in `i64`) so summing every session never wraps. Clamping
//! to the wire range happens once, on read.
//!
//! The buffer does no locking of its own; its owner serializes access.

use super::format::PcmFormat;
use crate::error::MixBufferError;

/// Where a client's next sample lands in the mix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixPosition {
    /// Samples ahead of the read cursor, resolved on the next add
    Relative(usize),
    /// Slot index in the circular buffer
    Absolute(usize),
}

impl Default for MixPosition {
    fn default() -> Self {
        MixPosition::Relative(0)
    }
}

/// Integer type wide enough to hold the sum of every session
trait WideSample: Copy + Default {
    fn from_wide(value: i64) -> Self;
    fn to_wide(self) -> i64;
    fn add_saturating(self, other: Self) -> Self;
}

macro_rules! impl_wide_sample {
    ($($t:ty),*) => {$(
        impl WideSample for $t {
            #[inline]
            fn from_wide(value: i64) -> Self {
                value as $t
            }

            #[inline]
            fn to_wide(self) -> i64 {
                i64::from(self)
            }

            #[inline]
            fn add_saturating(self, other: Self) -> Self {
                self.saturating_add(other)
            }
        }
    )*};
}

impl_wide_sample!(i16, i32, i64);

enum Storage {
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

impl Storage {
    fn allocate(format: PcmFormat, samples: usize) -> Result<Self, MixBufferError> {
        Ok(match format {
            PcmFormat::U8 => Storage::I16(zeroed(samples)?),
            PcmFormat::S16Le | PcmFormat::S24In32Le => Storage::I32(zeroed(samples)?),
            PcmFormat::S32Le => Storage::I64(zeroed(samples)?),
        })
    }

    fn clear(&mut self) {
        match self {
            Storage::I16(buf) => buf.fill(0),
            Storage::I32(buf) => buf.fill(0),
            Storage::I64(buf) => buf.fill(0),
        }
    }

    #[cfg(test)]
    fn get(&self, index: usize) -> i64 {
        match self {
            Storage::I16(buf) => i64::from(buf[index]),
            Storage::I32(buf) => i64::from(buf[index]),
            Storage::I64(buf) => buf[index],
        }
    }
}

fn zeroed<T: Default + Clone>(samples: usize) -> Result<Vec<T>, MixBufferError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(samples)
        .map_err(|_| MixBufferError::Allocation { samples })?;
    buf.resize(samples, T::default());
    Ok(buf)
}

fn accumulate<W: WideSample>(
    buf: &mut [W],
    start: usize,
    data: &[u8],
    samples: usize,
    format: PcmFormat,
) {
    let len = buf.len();
    let mut index = start % len;
    for raw in data.chunks_exact(format.bytes_per_sample()).take(samples) {
        let slot = &mut buf[index];
        *slot = slot.add_saturating(W::from_wide(format.widen(raw)));
        index += 1;
        if index == len {
            index = 0;
        }
    }
}

/// Scale, narrow and zero `samples` slots. Returns how many were clamped.
fn drain<W: WideSample>(
    buf: &mut [W],
    start: usize,
    dest: &mut [u8],
    samples: usize,
    channels: usize,
    gains: &[f64],
    format: PcmFormat,
) -> usize {
    let len = buf.len();
    let (min, max) = format.sample_range();
    let mut clipped = 0;
    let mut index = start % len;
    for (n, out) in dest
        .chunks_exact_mut(format.bytes_per_sample())
        .take(samples)
        .enumerate()
    {
        let gain = gains.get(n % channels).copied().unwrap_or(1.0);
        let value = std::mem::take(&mut buf[index]).to_wide();
        let value = if gain == 0.0 {
            0
        } else if gain == 1.0 {
            value
        } else {
            // float to int conversion truncates toward zero
            (value as f64 * gain) as i64
        };
        if value < min || value > max {
            clipped += 1;
        }
        format.narrow(value, out);
        index += 1;
        if index == len {
            index = 0;
        }
    }
    clipped
}

/// Shared accumulator for playback mixing
pub struct MixBuffer {
    format: PcmFormat,
    channels: usize,
    frame_size: usize,
    storage: Storage,
    /// Capacity in samples
    capacity: usize,
    /// Samples per read
    period: usize,
    /// Furthest a client may write ahead of the cursor, in samples
    sync_window: usize,
    mix_cursor: usize,
    write_boundary: usize,
    clipped: u64,
}

impl MixBuffer {
    /// Allocate a zeroed accumulator.
    ///
    /// `threshold_periods` is both the sync window and the fill level reported
    /// by [`at_threshold`](Self::at_threshold).
    pub fn new(
        format: PcmFormat,
        channels: u8,
        capacity_frames: usize,
        period_frames: usize,
        threshold_periods: usize,
    ) -> Result<Self, MixBufferError> {
        if channels == 0 {
            return Err(MixBufferError::InvalidGeometry("zero channels".into()));
        }
        if period_frames == 0 || threshold_periods == 0 {
            return Err(MixBufferError::InvalidGeometry("zero length period".into()));
        }

        let channels = usize::from(channels);
        let overflow = || MixBufferError::InvalidGeometry("buffer size overflows".into());
        let capacity = capacity_frames.checked_mul(channels).ok_or_else(overflow)?;
        let period = period_frames.checked_mul(channels).ok_or_else(overflow)?;
        let sync_window = period.checked_mul(threshold_periods).ok_or_else(overflow)?;

        if capacity <= sync_window {
            return Err(MixBufferError::InvalidGeometry(format!(
                "capacity of {} frames does not exceed the sync window of {} frames",
                capacity_frames,
                sync_window / channels
            )));
        }

        let storage = Storage::allocate(format, capacity)?;

        Ok(Self {
            format,
            channels,
            frame_size: format.frame_size(channels as u8),
            storage,
            capacity,
            period,
            sync_window,
            mix_cursor: 0,
            write_boundary: 0,
            clipped: 0,
        })
    }

    /// Sum whole frames of `data` into the mix at `position`.
    ///
    /// A relative position is resolved against the current cursor first.
    /// Writing stops at the sync window, so fewer bytes than offered may be
    /// consumed (possibly none). `position` is left one past the last sample
    /// written. Returns the number of bytes consumed.
    pub fn add(&mut self, position: &mut MixPosition, data: &[u8]) -> usize {
        let cursor = self.mix_cursor;
        let before = self.available();

        let resolved = self.resolve(*position);
        *position = MixPosition::Absolute(resolved);

        let mut start = resolved;
        if start < cursor {
            start += self.capacity;
        }

        let limit = cursor + self.sync_window;
        if start >= limit {
            return 0;
        }

        let offered = data.len() / self.frame_size * self.channels;
        let samples = offered.min(limit - start);
        if samples == 0 {
            return 0;
        }

        let format = self.format;
        match &mut self.storage {
            Storage::I16(buf) => accumulate(buf, start, data, samples, format),
            Storage::I32(buf) => accumulate(buf, start, data, samples, format),
            Storage::I64(buf) => accumulate(buf, start, data, samples, format),
        }

        let end = (start + samples) % self.capacity;
        *position = MixPosition::Absolute(end);

        if self.calc_available(cursor, end) > before {
            self.write_boundary = end;
        }

        samples / self.channels * self.frame_size
    }

    /// Move at most one period of mixed audio into `dest`.
    ///
    /// `gains` holds one multiplier per channel; missing entries are unity.
    /// Consumed slots are zeroed. Returns the number of samples written.
    pub fn read(&mut self, dest: &mut [u8], max_samples: usize, gains: &[f64]) -> usize {
        let fits = dest.len() / self.format.bytes_per_sample();
        let mut samples = max_samples.min(fits);
        samples -= samples % self.channels;
        samples = samples.min(self.period).min(self.available());
        if samples == 0 {
            return 0;
        }

        let start = self.mix_cursor;
        let (format, channels) = (self.format, self.channels);
        let clipped = match &mut self.storage {
            Storage::I16(buf) => drain(buf, start, dest, samples, channels, gains, format),
            Storage::I32(buf) => drain(buf, start, dest, samples, channels, gains, format),
            Storage::I64(buf) => drain(buf, start, dest, samples, channels, gains, format),
        };

        if clipped > 0 {
            self.clipped += clipped as u64;
        }
        self.mix_cursor = (start + samples) % self.capacity;
        samples
    }

    fn resolve(&self, position: MixPosition) -> usize {
        match position {
            MixPosition::Absolute(index) => index % self.capacity,
            // Further than the buffer can hold: one frame behind the cursor
            MixPosition::Relative(ahead) if ahead > self.capacity => {
                (self.mix_cursor + self.capacity - self.channels) % self.capacity
            }
            MixPosition::Relative(ahead) => {
                let ahead = ahead - ahead % self.channels;
                (self.mix_cursor + ahead) % self.capacity
            }
        }
    }

    /// Samples from `start` up to `end`, going round the buffer
    pub fn calc_available(&self, start: usize, end: usize) -> usize {
        if end >= start {
            end - start
        } else {
            self.capacity - start + end
        }
    }

    /// Samples between the read cursor and `position`
    pub fn delay(&self, position: usize) -> usize {
        self.calc_available(self.mix_cursor, position)
    }

    /// Samples a client at `position` still has queued in the mix
    pub fn pending_for(&self, position: MixPosition) -> usize {
        match position {
            MixPosition::Absolute(index) => self.delay(index % self.capacity),
            MixPosition::Relative(_) => 0,
        }
    }

    /// Fix a relative position to a slot, no further ahead than the mixed
    /// audio. Absolute positions are returned unchanged.
    pub fn pin(&self, position: MixPosition) -> MixPosition {
        match position {
            MixPosition::Relative(ahead) => {
                let ahead = ahead.min(self.available());
                MixPosition::Absolute((self.mix_cursor + ahead) % self.capacity)
            }
            absolute => absolute,
        }
    }

    /// Mixed samples ready to be read
    pub fn available(&self) -> usize {
        self.calc_available(self.mix_cursor, self.write_boundary)
    }

    pub fn is_empty(&self) -> bool {
        self.mix_cursor == self.write_boundary
    }

    /// Whether enough audio is mixed for the transport to start
    pub fn at_threshold(&self) -> bool {
        self.available() >= self.sync_window
    }

    /// Discard everything and rewind both cursors
    pub fn clear(&mut self) {
        self.storage.clear();
        self.mix_cursor = 0;
        self.write_boundary = 0;
    }

    pub fn format(&self) -> PcmFormat {
        self.format
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Capacity in samples
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Period in samples
    pub fn period(&self) -> usize {
        self.period
    }

    pub fn sync_window(&self) -> usize {
        self.sync_window
    }

    pub fn mix_cursor(&self) -> usize {
        self.mix_cursor
    }

    pub fn write_boundary(&self) -> usize {
        self.write_boundary
    }

    /// Get statistics
    pub fn stats(&self) -> MixBufferStats {
        MixBufferStats {
            capacity: self.capacity,
            period: self.period,
            available: self.available(),
            clipped: self.clipped,
        }
    }
}

/// Mix buffer statistics
#[derive(Debug, Clone)]
pub struct MixBufferStats {
    pub capacity: usize,
    pub period: usize,
    pub available: usize,
    /// Output samples clamped since creation
    pub clipped: u64,
}

impl MixBufferStats {
    pub fn fill_level(&self) -> f32 {
        self.available as f32 / self.capacity as f32
    }
}
