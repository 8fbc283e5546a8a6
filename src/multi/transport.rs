//! Interface to the Bluetooth transport that owns the stream

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use std::sync::Arc;

/// Notifications from the orchestrator to the transport's I/O thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportSignal {
    /// First client connected
    Open,
    /// Last client gone, stream released
    Close,
    /// Enough audio mixed (playback) or a client resumed (capture)
    Resume,
    /// No capture client wants data
    Pause,
    /// The sole client dropped its audio; flush encoder buffers
    Drop,
    /// A mixed period is ready to read
    Ready,
}

/// Volume of one channel as set on the transport
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelVolume {
    /// Linear scale, 1.0 is unity
    pub scale: f64,
    pub muted: bool,
}

impl Default for ChannelVolume {
    fn default() -> Self {
        Self { scale: 1.0, muted: false }
    }
}

/// Transport volume at the time of a read
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeSnapshot {
    /// Volume is applied here in software rather than by the remote device
    pub soft_volume: bool,
    pub channels: Vec<ChannelVolume>,
}

impl VolumeSnapshot {
    pub fn unity(channels: usize) -> Self {
        Self {
            soft_volume: true,
            channels: vec![ChannelVolume::default(); channels],
        }
    }

    /// Per-channel gain for the mix read.
    ///
    /// With pass-through volume the remote device scales the audio, so the
    /// mix only applies mute and `native_volume`.
    pub fn gains(&self, native_volume: f64) -> Vec<f64> {
        self.channels
            .iter()
            .map(|ch| {
                if self.soft_volume {
                    if ch.muted {
                        0.0
                    } else {
                        ch.scale
                    }
                } else if ch.muted || ch.scale == 0.0 {
                    0.0
                } else {
                    native_volume
                }
            })
            .collect()
    }
}

/// The transport side of a multi-client stream.
///
/// Both methods are called with orchestrator locks released and must not
/// block.
pub trait Transport: Send + Sync {
    fn volume(&self) -> VolumeSnapshot;

    fn signal(&self, signal: TransportSignal);
}

/// [`Transport`] that forwards signals over a channel.
///
/// Used by the simulator and tests in place of a real Bluetooth link.
pub struct ChannelTransport {
    volume: RwLock<VolumeSnapshot>,
    signal_tx: Sender<TransportSignal>,
}

impl ChannelTransport {
    /// Capacity of the signal queue. `Ready` signals beyond it are dropped.
    pub const SIGNAL_QUEUE: usize = 256;

    pub fn new(channels: usize) -> (Arc<Self>, Receiver<TransportSignal>) {
        let (signal_tx, signal_rx) = bounded(Self::SIGNAL_QUEUE);
        let transport = Arc::new(Self {
            volume: RwLock::new(VolumeSnapshot::unity(channels)),
            signal_tx,
        });
        (transport, signal_rx)
    }

    pub fn set_volume(&self, volume: VolumeSnapshot) {
        *self.volume.write() = volume;
    }

    pub fn set_channel(&self, channel: usize, scale: f64, muted: bool) {
        if let Some(ch) = self.volume.write().channels.get_mut(channel) {
            *ch = ChannelVolume { scale, muted };
        }
    }
}

impl Transport for ChannelTransport {
    fn volume(&self) -> VolumeSnapshot {
        self.volume.read().clone()
    }

    fn signal(&self, signal: TransportSignal) {
        match self.signal_tx.try_send(signal) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if signal != TransportSignal::Ready {
                    tracing::warn!("Transport signal queue full, lost {:?}", signal);
                }
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}
