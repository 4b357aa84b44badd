//! Configuration types shared by the sink, cursor and loop stages.
//!
//! Every struct here is built once at startup and never mutated afterwards.

use std::time::Duration;

/// Output backend used to open the playback sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    /// Blocking ALSA PCM writes with xrun recovery (Linux only).
    Alsa,
    /// Callback-driven CPAL stream fed from a ring sized to the device buffer.
    Cpal,
}

impl Default for Backend {
    fn default() -> Self {
        if cfg!(target_os = "linux") {
            Backend::Alsa
        } else {
            Backend::Cpal
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "alsa" => Ok(Backend::Alsa),
            "cpal" => Ok(Backend::Cpal),
            other => Err(format!("unknown backend: {other} (expected alsa or cpal)")),
        }
    }
}

/// Device format fixed at open time.
#[derive(Clone, Debug)]
pub struct PlaybackConfig {
    /// Device name (ALSA PCM name or CPAL substring match).
    pub device: String,
    /// Output sample rate in Hz.
    pub sample_rate: u32,
    /// Interleaved channel count. One sample is one frame when this is 1.
    pub channels: u16,
    /// Target device buffer depth in frames.
    pub buffer_frames: u32,
}

impl Default for PlaybackConfig {
    /// f32 LE mono at 30 kHz with roughly 0.4 s of device buffer.
    fn default() -> Self {
        Self {
            device: "default".to_string(),
            sample_rate: 30_000,
            channels: 1,
            buffer_frames: 12_000,
        }
    }
}

impl PlaybackConfig {
    /// Buffer depth expressed as wall-clock time.
    pub fn buffer_duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.buffer_frames as f64 / self.sample_rate as f64)
    }

    /// Number of frames covering `interval` at the configured rate (at least one).
    pub fn frames_for(&self, interval: Duration) -> usize {
        let frames = (self.sample_rate as f64 * interval.as_secs_f64()).round() as usize;
        frames.max(1)
    }
}

/// Broker connection target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BrokerAddress {
    Tcp { host: String, port: u16 },
    Unix { path: String },
}

impl BrokerAddress {
    /// Connection URL understood by the redis client.
    pub fn url(&self) -> String {
        match self {
            BrokerAddress::Tcp { host, port } => format!("redis://{host}:{port}/"),
            BrokerAddress::Unix { path } => format!("redis+unix://{path}"),
        }
    }
}

impl std::fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerAddress::Tcp { host, port } => write!(f, "{host}:{port}"),
            BrokerAddress::Unix { path } => write!(f, "unix:{path}"),
        }
    }
}

/// Stream schema and connection settings.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub address: BrokerAddress,
    /// Stream key to read.
    pub stream: String,
    /// Field holding the PCM payload within each entry.
    pub payload_field: String,
    /// Timeout for establishing the connection.
    pub connect_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: BrokerAddress::Tcp {
                host: "localhost".to_string(),
                port: 6379,
            },
            stream: "audio".to_string(),
            payload_field: "audio".to_string(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Playback loop behaviour.
#[derive(Clone, Debug)]
pub struct LoopConfig {
    /// Divide samples by this and clamp to [-1, 1] before playback.
    pub normalize_scale: Option<f32>,
    /// Key holding the task state; when set, only the GO state plays stream data.
    pub task_state_key: Option<String>,
    /// Duration of silence written per iteration while gated.
    pub silence_interval: Duration,
    /// Delay before reconnecting after the broker connection drops.
    pub reconnect_backoff: Duration,
    /// Period of the stats log line; zero disables it.
    pub stats_interval: Duration,
}

/// Task state value that enables playback.
pub const TASK_STATE_GO: i64 = 1;

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            normalize_scale: None,
            task_state_key: None,
            silence_interval: Duration::from_millis(10),
            reconnect_backoff: Duration::from_millis(500),
            stats_interval: Duration::from_secs(10),
        }
    }
}
