//! Playback sink abstraction.
//!
//! A sink owns the output device for the lifetime of the process. Writes are
//! blocking and unbuffered beyond the device's own ring, so a slow device pushes
//! back on the broker rather than growing local memory.

use thiserror::Error;

use crate::config::Backend;

/// Failure to open or configure the output device. Always fatal at startup.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("output device {device:?} unavailable: {reason}")]
    DeviceUnavailable { device: String, reason: String },
    #[error("backend {0:?} is not supported on this platform")]
    UnsupportedBackend(Backend),
}

impl SinkError {
    pub(crate) fn unavailable(device: &str, reason: impl std::fmt::Display) -> Self {
        SinkError::DeviceUnavailable {
            device: device.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Transient write failure reported by the device.
///
/// The buffer that triggered it is dropped; the caller recovers and moves on to
/// the next buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkFault {
    #[error("buffer underrun/overrun (xrun)")]
    Xrun,
    #[error("device suspended")]
    Suspended,
    #[error("device write error: {0}")]
    Device(String),
}

/// Frames that must be queued before the device starts playing.
///
/// The whole buffer, rounded down to a whole number of periods (at least one), so
/// playback begins with a full latency cushion after open and after every recovery.
pub fn start_threshold(buffer_frames: usize, period_frames: usize) -> usize {
    let buffer = buffer_frames.max(1);
    let period = period_frames.clamp(1, buffer);
    (buffer / period) * period
}

/// Output device accepting interleaved `f32` frames.
pub trait PlaybackSink {
    /// Write non-empty interleaved samples to the device.
    ///
    /// Returns the number of frames accepted.
    fn write_frames(&mut self, samples: &[f32]) -> Result<usize, SinkFault>;

    /// Reset the device after a fault so the next write can succeed.
    ///
    /// Best-effort: failures are logged, never returned.
    fn recover(&mut self, fault: &SinkFault);

    /// Write a sample buffer; empty buffers succeed with zero frames and never
    /// reach the device.
    fn write(&mut self, samples: &[f32]) -> Result<usize, SinkFault> {
        if samples.is_empty() {
            return Ok(0);
        }
        self.write_frames(samples)
    }

    /// Let queued audio play out before the handle is dropped.
    fn close(&mut self) {}
}

impl<S: PlaybackSink + ?Sized> PlaybackSink for Box<S> {
    fn write_frames(&mut self, samples: &[f32]) -> Result<usize, SinkFault> {
        (**self).write_frames(samples)
    }

    fn recover(&mut self, fault: &SinkFault) {
        (**self).recover(fault)
    }

    fn write(&mut self, samples: &[f32]) -> Result<usize, SinkFault> {
        (**self).write(samples)
    }

    fn close(&mut self) {
        (**self).close()
    }
}
