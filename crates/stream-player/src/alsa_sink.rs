//! ALSA playback sink.
//!
//! Opens a PCM by name, fixes the hardware params once (f32 LE, interleaved,
//! configured channels/rate/buffer) and performs blocking `writei` calls. The
//! software params hold playback until the buffer is full, so the device starts
//! with the whole buffer as its cushion, after open and after each recovery.
//! An xrun surfaces as a [`SinkFault`]; `recover` hands the ALSA error from the
//! failed write to `snd_pcm_recover` and falls back to re-preparing the stream.

use std::fmt;

use alsa::pcm::{Access, Format, Frames, HwParams, PCM, State};
use alsa::{Direction, ValueOr};

use crate::config::PlaybackConfig;
use crate::sink::{self, PlaybackSink, SinkError, SinkFault};

pub struct AlsaSink {
    pcm: PCM,
    device: String,
    /// Error from the last failed write, consumed by `recover`.
    pending: Option<alsa::Error>,
}

impl AlsaSink {
    /// Open and configure `config.device` for playback.
    ///
    /// Fails if the device is busy, missing, or cannot run at the exact
    /// configured sample rate.
    pub fn open(config: &PlaybackConfig) -> Result<Self, SinkError> {
        let unavailable = |e: alsa::Error| SinkError::unavailable(&config.device, e);

        let pcm = PCM::new(&config.device, Direction::Playback, false).map_err(unavailable)?;
        {
            let hwp = HwParams::any(&pcm).map_err(unavailable)?;
            hwp.set_channels(u32::from(config.channels))
                .map_err(unavailable)?;
            hwp.set_rate(config.sample_rate, ValueOr::Nearest)
                .map_err(unavailable)?;
            hwp.set_format(Format::FloatLE).map_err(unavailable)?;
            hwp.set_access(Access::RWInterleaved).map_err(unavailable)?;
            hwp.set_buffer_size_near(config.buffer_frames as Frames)
                .map_err(unavailable)?;
            pcm.hw_params(&hwp).map_err(unavailable)?;
        }

        let (rate, buffer_frames, period_frames) = {
            let hwp = pcm.hw_params_current().map_err(unavailable)?;
            (
                hwp.get_rate().map_err(unavailable)?,
                hwp.get_buffer_size().map_err(unavailable)?,
                hwp.get_period_size().map_err(unavailable)?,
            )
        };
        if rate != config.sample_rate {
            return Err(SinkError::unavailable(
                &config.device,
                format!(
                    "sample rate {} Hz not supported (device offers {rate} Hz)",
                    config.sample_rate
                ),
            ));
        }

        let start_frames = sink::start_threshold(buffer_frames as usize, period_frames as usize);
        {
            let swp = pcm.sw_params_current().map_err(unavailable)?;
            swp.set_start_threshold(start_frames as Frames)
                .map_err(unavailable)?;
            swp.set_avail_min(period_frames).map_err(unavailable)?;
            pcm.sw_params(&swp).map_err(unavailable)?;
        }

        tracing::info!(
            device = %config.device,
            rate_hz = rate,
            channels = config.channels,
            buffer_frames,
            period_frames,
            start_frames,
            "alsa output opened"
        );

        Ok(Self {
            pcm,
            device: config.device.clone(),
            pending: None,
        })
    }
}

impl PlaybackSink for AlsaSink {
    fn write_frames(&mut self, samples: &[f32]) -> Result<usize, SinkFault> {
        let result = self.pcm.io_f32().and_then(|io| io.writei(samples));
        match result {
            Ok(frames) => Ok(frames),
            Err(e) => {
                let fault = classify_fault(self.pcm.state(), &e);
                self.pending = Some(e);
                Err(fault)
            }
        }
    }

    fn recover(&mut self, fault: &SinkFault) {
        let recovered = match self.pending.take() {
            Some(err) => self.pcm.try_recover(err, true),
            None => self.pcm.prepare(),
        };
        if let Err(e) = recovered {
            tracing::warn!(device = %self.device, fault = %fault, error = %e, "alsa recover failed; re-preparing");
            if let Err(e) = self.pcm.prepare() {
                tracing::warn!(device = %self.device, error = %e, "alsa prepare failed");
            }
        }
    }

    fn close(&mut self) {
        if let Err(e) = self.pcm.drain() {
            tracing::debug!(device = %self.device, error = %e, "alsa drain failed");
        }
    }
}

/// Map the PCM state observed after a failed write onto a fault kind.
fn classify_fault(state: State, err: impl fmt::Display) -> SinkFault {
    match state {
        State::XRun => SinkFault::Xrun,
        State::Suspended => SinkFault::Suspended,
        _ => SinkFault::Device(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xrun_state_is_xrun_fault() {
        assert_eq!(classify_fault(State::XRun, "Broken pipe"), SinkFault::Xrun);
    }

    #[test]
    fn suspended_state_is_suspended_fault() {
        assert_eq!(
            classify_fault(State::Suspended, "Streams pipe error"),
            SinkFault::Suspended
        );
    }

    #[test]
    fn other_states_carry_the_error_text() {
        assert_eq!(
            classify_fault(State::Disconnected, "No such device"),
            SinkFault::Device("No such device".to_string())
        );
        assert_eq!(
            classify_fault(State::Running, "Input/output error"),
            SinkFault::Device("Input/output error".to_string())
        );
    }
}
