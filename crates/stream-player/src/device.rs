//! Output device discovery and selection.
//!
//! Thin wrappers around CPAL for:
//! - listing available output devices
//! - selecting either the default device or a device by substring match
//! - choosing a stream config that runs at the exact playback rate

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};

/// Device name that selects the host default output.
pub const DEFAULT_DEVICE: &str = "default";

/// Pick the first output device matching `needle` (case-insensitive), or the default device.
///
/// `None`, an empty needle, and `"default"` all select the host default.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    let needle = needle
        .map(str::trim)
        .filter(|n| !n.is_empty() && !n.eq_ignore_ascii_case(DEFAULT_DEVICE));

    if let Some(needle) = needle {
        let mut devices: Vec<cpal::Device> = host
            .output_devices()
            .context("No output devices")?
            .collect();
        if let Some(d) = devices.drain(..).find(|d| {
            d.description()
                .ok()
                .map(|n| matches_device_name(&n.name(), needle))
                .unwrap_or(false)
        }) {
            return Ok(d);
        }
        return Err(anyhow!("No output device matched: {needle}"));
    }

    host.default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))
}

/// Choose an output config running at exactly `rate`.
///
/// Among ranges that support the rate, prefers `f32` and then the smallest channel
/// count that can carry `channels`.
pub fn pick_output_config(
    device: &cpal::Device,
    rate: u32,
    channels: u16,
) -> Result<cpal::SupportedStreamConfig> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> =
        device.supported_output_configs()?.collect();
    if ranges.is_empty() {
        return Err(anyhow!("No supported output configs"));
    }

    let best = ranges
        .into_iter()
        .filter(|r| r.min_sample_rate() <= rate && rate <= r.max_sample_rate())
        .filter(|r| sample_format_rank(r.sample_format()) < UNSUPPORTED_RANK)
        .min_by_key(|r| {
            (
                sample_format_rank(r.sample_format()),
                channel_rank(r.channels(), channels),
            )
        })
        .ok_or_else(|| anyhow!("No output config supports {rate} Hz"))?;

    Ok(best.with_sample_rate(rate))
}

/// Pick a fixed callback buffer size close to `target_frames`.
///
/// Returns `None` when the device does not advertise a range, so CPAL uses its default.
pub fn pick_buffer_size(
    config: &cpal::SupportedStreamConfig,
    target_frames: u32,
) -> Option<cpal::BufferSize> {
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            Some(cpal::BufferSize::Fixed(clamp_buffer_frames(*min, *max, target_frames)))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

/// Callback period aims at a quarter of the ring so the writer can stay ahead.
fn clamp_buffer_frames(min: u32, max: u32, target_frames: u32) -> u32 {
    (target_frames / 4).max(1).clamp(min, max.max(min))
}

const UNSUPPORTED_RANK: u8 = 10;

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => UNSUPPORTED_RANK,
    }
}

/// Exact channel match first, then the smallest layout wider than the source.
fn channel_rank(available: u16, wanted: u16) -> u32 {
    if available == wanted {
        0
    } else if available > wanted {
        u32::from(available)
    } else {
        u32::MAX
    }
}

/// Print available output devices to stdout.
///
/// This is intended for CLI UX (`--list-devices`) rather than structured output.
pub fn list_devices(host: &cpal::Host) -> Result<()> {
    for (i, name) in list_device_names(host)?.into_iter().enumerate() {
        println!("#{i}: {name}");
    }
    Ok(())
}

/// Return available output device names.
pub fn list_device_names(host: &cpal::Host) -> Result<Vec<String>> {
    let devices = host.output_devices().context("No output devices")?;
    let mut out = Vec::new();
    for d in devices {
        out.push(d.description()?.to_string());
    }
    Ok(out)
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_device_name_is_case_insensitive() {
        assert!(matches_device_name("USB DAC", "dac"));
        assert!(matches_device_name("usb dac", "USB"));
        assert!(!matches_device_name("USB DAC", "speaker"));
        assert!(!matches_device_name("USB DAC", ""));
    }

    #[test]
    fn f32_ranks_first() {
        assert!(sample_format_rank(cpal::SampleFormat::F32) < sample_format_rank(cpal::SampleFormat::I16));
        assert_eq!(sample_format_rank(cpal::SampleFormat::U8), UNSUPPORTED_RANK);
    }

    #[test]
    fn channel_rank_prefers_exact_then_narrowest_wider() {
        assert_eq!(channel_rank(1, 1), 0);
        assert!(channel_rank(2, 1) < channel_rank(6, 1));
        assert_eq!(channel_rank(1, 2), u32::MAX);
    }

    #[test]
    fn buffer_frames_clamped_to_device_range() {
        assert_eq!(clamp_buffer_frames(64, 8192, 12_000), 3_000);
        assert_eq!(clamp_buffer_frames(64, 1024, 12_000), 1024);
        assert_eq!(clamp_buffer_frames(4096, 8192, 12_000), 4096);
        assert_eq!(clamp_buffer_frames(16, 8192, 0), 16);
    }
}
