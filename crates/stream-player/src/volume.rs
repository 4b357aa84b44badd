//! Logical volume (0..=100) mapped onto a device's native playback range.
//!
//! The controller never caches a range: every apply re-queries the control, computes
//! `native = percent * max / 100` (clamped into `[min, max]`) and releases the handle.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("mixer {card:?} unavailable: {reason}")]
    MixerUnavailable { card: String, reason: String },
    #[error("mixer control {control:?} not found on {card:?}")]
    ControlNotFound { card: String, control: String },
    #[error("setting volume on {control:?} failed: {reason}")]
    Apply { control: String, reason: String },
}

/// What to do when the mixer or its control cannot be used at startup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MixerPolicy {
    /// Abort startup.
    #[default]
    Fatal,
    /// Log a warning and keep playing at the current device volume.
    Warn,
}

impl std::str::FromStr for MixerPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fatal" => Ok(MixerPolicy::Fatal),
            "warn" => Ok(MixerPolicy::Warn),
            other => Err(format!("unknown mixer policy: {other} (expected fatal or warn)")),
        }
    }
}

/// Map a logical percent onto `[min, max]`.
///
/// `0` maps to `0` (or `min` when the range does not include zero), `100` to `max`,
/// and everything in between to `floor(percent * max / 100)`.
pub fn map_volume(percent: u8, min: i64, max: i64) -> i64 {
    let percent = i64::from(percent.min(100));
    let native = percent * max / 100;
    native.clamp(min, max.max(min))
}

/// A device control exposing a native playback volume range.
pub trait VolumeControl {
    /// Query the current native `[min, max]` range.
    fn playback_range(&mut self) -> Result<(i64, i64), VolumeError>;
    /// Apply `native` to every playback channel.
    fn apply(&mut self, native: i64) -> Result<(), VolumeError>;
}

/// Opens a transient control handle per `set_volume` call.
pub struct VolumeController<F> {
    open: F,
}

impl<F, C> VolumeController<F>
where
    F: FnMut() -> Result<C, VolumeError>,
    C: VolumeControl,
{
    pub fn new(open: F) -> Self {
        Self { open }
    }

    /// Apply a logical volume; returns the native value written.
    pub fn set_volume(&mut self, percent: u8) -> Result<i64, VolumeError> {
        let mut control = (self.open)()?;
        let (min, max) = control.playback_range()?;
        let native = map_volume(percent, min, max);
        control.apply(native)?;
        tracing::info!(percent = percent.min(100), native, min, max, "volume applied");
        Ok(native)
    }
}

/// Software gain for backends without a hardware mixer; native range is the percent.
pub struct SoftwareGain {
    percent: Arc<AtomicU8>,
}

impl SoftwareGain {
    pub fn new(percent: Arc<AtomicU8>) -> Self {
        Self { percent }
    }
}

impl VolumeControl for SoftwareGain {
    fn playback_range(&mut self) -> Result<(i64, i64), VolumeError> {
        Ok((0, 100))
    }

    fn apply(&mut self, native: i64) -> Result<(), VolumeError> {
        self.percent.store(native.clamp(0, 100) as u8, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(target_os = "linux")]
pub use alsa_mixer::AlsaMixer;

#[cfg(target_os = "linux")]
mod alsa_mixer {
    use alsa::mixer::{Mixer, SelemId};

    use super::{VolumeControl, VolumeError};

    /// Simple mixer element on an ALSA card; dropped (detached) after each use.
    pub struct AlsaMixer {
        mixer: Mixer,
        card: String,
        control: String,
    }

    impl AlsaMixer {
        /// Open, attach and load `card`, checking that `control` exists.
        pub fn open(card: &str, control: &str) -> Result<Self, VolumeError> {
            let mixer = Mixer::new(card, false).map_err(|e| VolumeError::MixerUnavailable {
                card: card.to_string(),
                reason: e.to_string(),
            })?;
            let this = Self {
                mixer,
                card: card.to_string(),
                control: control.to_string(),
            };
            this.selem()?;
            Ok(this)
        }

        fn selem(&self) -> Result<alsa::mixer::Selem<'_>, VolumeError> {
            let sid = SelemId::new(&self.control, 0);
            self.mixer
                .find_selem(&sid)
                .filter(|s| s.has_playback_volume())
                .ok_or_else(|| VolumeError::ControlNotFound {
                    card: self.card.clone(),
                    control: self.control.clone(),
                })
        }
    }

    impl VolumeControl for AlsaMixer {
        fn playback_range(&mut self) -> Result<(i64, i64), VolumeError> {
            Ok(self.selem()?.get_playback_volume_range())
        }

        fn apply(&mut self, native: i64) -> Result<(), VolumeError> {
            self.selem()?
                .set_playback_volume_all(native)
                .map_err(|e| VolumeError::Apply {
                    control: self.control.clone(),
                    reason: e.to_string(),
                })
        }
    }
}
