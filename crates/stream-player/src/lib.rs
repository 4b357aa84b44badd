//! Stream-to-speaker playback: broker intake, PCM decode and device output.

#[cfg(target_os = "linux")]
pub mod alsa_sink;
pub mod broker;
pub mod config;
pub mod cpal_sink;
pub mod cursor;
pub mod decode;
pub mod device;
pub mod entry;
pub mod handoff;
pub mod pipeline;
pub mod ring;
pub mod sink;
pub mod stats;
pub mod volume;
