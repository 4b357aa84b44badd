//! CPAL playback sink.
//!
//! CPAL is callback driven, so this sink keeps a [`SampleRing`] sized to the
//! configured buffer depth and lets the output callback drain it:
//! - `write` blocks while the ring is full, like a blocking device write
//! - the callback plays silence until the ring holds a full buffer, then drains it
//! - a dry ring after that latches an underrun
//! - the next `write` after an underrun reports [`SinkFault::Xrun`] and `recover`
//!   empties the ring, which re-arms the full-buffer start
//!
//! The callback also maps the mono source onto wider device layouts and applies
//! the software gain set through [`CpalSink::gain_handle`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use cpal::traits::{DeviceTrait, StreamTrait};

use crate::config::PlaybackConfig;
use crate::device;
use crate::ring::SampleRing;
use crate::sink::{self, PlaybackSink, SinkError, SinkFault};

pub struct CpalSink {
    // Held for its Drop: dropping the stream stops the callback.
    _stream: cpal::Stream,
    ring: Arc<SampleRing>,
    gain_percent: Arc<AtomicU8>,
    drain_timeout: Duration,
}

impl CpalSink {
    /// Open the device named by `config.device` and start the output stream.
    pub fn open(config: &PlaybackConfig) -> Result<Self, SinkError> {
        let unavailable = |e: anyhow::Error| SinkError::unavailable(&config.device, format!("{e:#}"));

        let host = cpal::default_host();
        let device = device::pick_device(&host, Some(&config.device)).map_err(unavailable)?;
        let supported = device::pick_output_config(&device, config.sample_rate, config.channels)
            .map_err(unavailable)?;
        let mut stream_config: cpal::StreamConfig = supported.clone().into();
        if let Some(buf) = device::pick_buffer_size(&supported, config.buffer_frames) {
            stream_config.buffer_size = buf;
        }

        let period_frames = match stream_config.buffer_size {
            cpal::BufferSize::Fixed(frames) => frames as usize,
            _ => 1,
        };
        let start_frames = sink::start_threshold(config.buffer_frames as usize, period_frames);
        let ring = Arc::new(
            SampleRing::new(usize::from(config.channels), config.buffer_frames as usize)
                .with_start_threshold(start_frames),
        );
        let gain_percent = Arc::new(AtomicU8::new(100));

        let stream = build_output_stream(
            &device,
            &stream_config,
            supported.sample_format(),
            &ring,
            &gain_percent,
        )
        .map_err(unavailable)?;
        stream
            .play()
            .map_err(|e| SinkError::unavailable(&config.device, e))?;

        tracing::info!(
            device = %device.description().map(|d| d.to_string()).unwrap_or_default(),
            rate_hz = stream_config.sample_rate,
            device_channels = stream_config.channels,
            source_channels = config.channels,
            buffer_size = ?stream_config.buffer_size,
            ring_frames = ring.capacity_frames(),
            start_frames,
            "cpal output opened"
        );

        Ok(Self {
            _stream: stream,
            ring,
            gain_percent,
            drain_timeout: config.buffer_duration() + Duration::from_millis(100),
        })
    }

    /// Shared software gain (0..=100) applied by the output callback.
    pub fn gain_handle(&self) -> Arc<AtomicU8> {
        self.gain_percent.clone()
    }
}

impl PlaybackSink for CpalSink {
    fn write_frames(&mut self, samples: &[f32]) -> Result<usize, SinkFault> {
        push_or_fault(&self.ring, samples)
    }

    fn recover(&mut self, _fault: &SinkFault) {
        self.ring.clear();
    }

    fn close(&mut self) {
        self.ring.close();
        if !self.ring.wait_drained(self.drain_timeout) {
            tracing::debug!(frames = self.ring.len_frames(), "cpal ring not drained before close");
        }
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.ring.close();
    }
}

/// Queue `samples`, or report the underrun latched since the last write.
///
/// The faulted buffer is not queued.
fn push_or_fault(ring: &SampleRing, samples: &[f32]) -> Result<usize, SinkFault> {
    if ring.take_underrun() {
        return Err(SinkFault::Xrun);
    }
    Ok(ring.push_blocking(samples))
}

/// Build a CPAL output stream that drains `ring` in the device sample format.
fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    ring: &Arc<SampleRing>,
    gain_percent: &Arc<AtomicU8>,
) -> anyhow::Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, ring, gain_percent),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, ring, gain_percent),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, ring, gain_percent),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, ring, gain_percent),
        other => Err(anyhow::anyhow!("Unsupported sample format: {other:?}")),
    }
}

/// Type-specialized stream builder for CPAL sample formats.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    ring: &Arc<SampleRing>,
    gain_percent: &Arc<AtomicU8>,
) -> anyhow::Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let dst_channels = usize::from(config.channels).max(1);
    let src_channels = ring.channels();
    let ring_cb = ring.clone();
    let gain_cb = gain_percent.clone();
    let mut scratch: Vec<f32> = Vec::new();

    let err_fn = |err| tracing::warn!("stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let frames = data.len() / dst_channels;
            scratch.clear();
            scratch.resize(frames * src_channels, 0.0);
            let filled = ring_cb.drain_into(&mut scratch);
            scratch[filled..].fill(0.0);

            let gain = f32::from(gain_cb.load(Ordering::Relaxed).min(100)) / 100.0;
            for frame in 0..frames {
                let src = &scratch[frame * src_channels..(frame + 1) * src_channels];
                for ch in 0..dst_channels {
                    let sample = map_channel(src, dst_channels, ch) * gain;
                    data[frame * dst_channels + ch] = <T as cpal::Sample>::from_sample::<f32>(sample);
                }
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

/// Read one output sample for `dst_ch` from a source frame.
///
/// Mono duplicates into every output channel; matching layouts pass through; anything
/// else clamps to the last available source channel.
fn map_channel(src: &[f32], dst_channels: usize, dst_ch: usize) -> f32 {
    match (src.len(), dst_channels) {
        (0, _) => 0.0,
        (1, _) => src[0],
        (n, m) if n == m => src[dst_ch],
        (2, 1) => 0.5 * (src[0] + src[1]),
        (n, _) => src[dst_ch.min(n - 1)],
    }
}
