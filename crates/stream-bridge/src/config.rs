//! Configuration loading and resolution.
//!
//! Values come from three layers, highest precedence first:
//! - CLI flags
//! - the optional TOML file given with `--config`
//! - library defaults

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use stream_player::config::{Backend, BrokerAddress, BrokerConfig, LoopConfig, PlaybackConfig};
use stream_player::cursor::{CursorConfig, CursorPolicy};
use stream_player::volume::MixerPolicy;

use crate::cli::{Args, Command};

/// Nickname used when neither the CLI nor the file names the node.
pub const DEFAULT_NICKNAME: &str = "stream-bridge";

/// Scale applied to samples in monitor mode.
pub const MONITOR_NORMALIZE_SCALE: f32 = 50_000.0;

/// Top-level config file schema.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub nickname: Option<String>,
    pub broker: Option<BrokerSection>,
    pub stream: Option<StreamSection>,
    pub output: Option<OutputSection>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BrokerSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Unix socket path; wins over host/port.
    pub socket: Option<String>,
    pub connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamSection {
    pub name: Option<String>,
    pub field: Option<String>,
    pub normalize_scale: Option<f32>,
    pub task_state_key: Option<String>,
    pub follow_latest: Option<bool>,
    pub heartbeat_ms: Option<u64>,
    pub silence_interval_ms: Option<u64>,
    pub reconnect_backoff_ms: Option<u64>,
    pub stats_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OutputSection {
    pub backend: Option<String>,
    pub device: Option<String>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub buffer_frames: Option<u32>,
    pub volume: Option<u8>,
    pub mixer_card: Option<String>,
    pub mixer_control: Option<String>,
    pub mixer_policy: Option<String>,
    pub split: Option<bool>,
    pub realtime_priority: Option<u8>,
}

impl FileConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        let cfg = toml::from_str::<FileConfig>(&raw)
            .with_context(|| format!("parse config {:?}", path))?;
        Ok(cfg)
    }
}

/// Startup volume request.
#[derive(Clone, Debug, PartialEq)]
pub struct VolumeSettings {
    pub percent: u8,
    pub card: String,
    pub control: String,
    pub policy: MixerPolicy,
}

/// Everything the runtime needs, with all layers merged.
#[derive(Clone, Debug)]
pub struct ResolvedConfig {
    pub nickname: String,
    pub command: Command,
    pub broker: BrokerConfig,
    pub playback: PlaybackConfig,
    pub loop_config: LoopConfig,
    pub cursor: CursorConfig,
    pub backend: Backend,
    pub volume: Option<VolumeSettings>,
    pub split: bool,
    pub realtime_priority: Option<u8>,
}

impl ResolvedConfig {
    /// Read the file named by `--config` (if any) and merge it with `args`.
    pub fn from_args(args: &Args) -> Result<Self> {
        let file = match &args.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        resolve(args, file)
    }
}

/// Merge CLI flags over file values over defaults.
pub fn resolve(args: &Args, file: FileConfig) -> Result<ResolvedConfig> {
    let command = args.cmd.unwrap_or(Command::Play);
    let broker_file = file.broker.unwrap_or_default();
    let stream_file = file.stream.unwrap_or_default();
    let output_file = file.output.unwrap_or_default();

    let mut broker = BrokerConfig::default();
    let socket = args.redis_socket.clone().or(broker_file.socket);
    broker.address = match socket {
        Some(path) => BrokerAddress::Unix { path },
        None => BrokerAddress::Tcp {
            host: args
                .redis_host
                .clone()
                .or(broker_file.host)
                .unwrap_or_else(|| "localhost".to_string()),
            port: args.redis_port.or(broker_file.port).unwrap_or(6379),
        },
    };
    if let Some(ms) = broker_file.connect_timeout_ms {
        broker.connect_timeout = Duration::from_millis(ms);
    }
    if let Some(stream) = args.stream.stream.clone().or(stream_file.name) {
        broker.stream = stream;
    }
    if let Some(field) = args.stream.field.clone().or(stream_file.field) {
        broker.payload_field = field;
    }

    let mut playback = PlaybackConfig::default();
    if let Some(device) = args.output.device.clone().or(output_file.device) {
        playback.device = device;
    }
    if let Some(rate) = output_file.sample_rate {
        playback.sample_rate = rate;
    }
    if let Some(channels) = output_file.channels {
        if channels == 0 {
            return Err(anyhow!("output.channels must be at least 1"));
        }
        playback.channels = channels;
    }
    if let Some(frames) = output_file.buffer_frames {
        playback.buffer_frames = frames;
    }

    let mut loop_config = LoopConfig::default();
    loop_config.normalize_scale = args.stream.normalize_scale.or(stream_file.normalize_scale);
    if command == Command::Monitor && loop_config.normalize_scale.is_none() {
        loop_config.normalize_scale = Some(MONITOR_NORMALIZE_SCALE);
    }
    if let Some(scale) = loop_config.normalize_scale {
        if !(scale.is_finite() && scale > 0.0) {
            return Err(anyhow!("normalize scale must be a positive number, got {scale}"));
        }
    }
    loop_config.task_state_key = args
        .stream
        .task_state_key
        .clone()
        .or(stream_file.task_state_key);
    if let Some(ms) = stream_file.silence_interval_ms {
        loop_config.silence_interval = Duration::from_millis(ms);
    }
    if let Some(ms) = stream_file.reconnect_backoff_ms {
        loop_config.reconnect_backoff = Duration::from_millis(ms);
    }
    if let Some(secs) = args
        .stream
        .stats_interval_secs
        .or(stream_file.stats_interval_secs)
    {
        loop_config.stats_interval = Duration::from_secs(secs);
    }

    let mut cursor = match command {
        Command::Play => CursorConfig::playback(),
        Command::Monitor => CursorConfig::monitoring(),
    };
    if args.stream.follow_latest || stream_file.follow_latest.unwrap_or(false) {
        cursor.policy = CursorPolicy::Latest;
    }
    if let Some(ms) = args.stream.heartbeat_ms.or(stream_file.heartbeat_ms) {
        if ms == 0 {
            return Err(anyhow!("heartbeat must be at least 1 ms"));
        }
        cursor.heartbeat = Duration::from_millis(ms);
    }

    let backend = match (args.output.backend, output_file.backend) {
        (Some(b), _) => b,
        (None, Some(raw)) => raw.parse().map_err(|e: String| anyhow!(e))?,
        (None, None) => Backend::default(),
    };

    let policy = match (args.output.mixer_policy, output_file.mixer_policy) {
        (Some(p), _) => p,
        (None, Some(raw)) => raw.parse().map_err(|e: String| anyhow!(e))?,
        (None, None) => MixerPolicy::default(),
    };
    let volume = match args.output.volume.or(output_file.volume) {
        Some(percent) if percent > 100 => {
            return Err(anyhow!("volume must be within 0..=100, got {percent}"));
        }
        Some(percent) => Some(VolumeSettings {
            percent,
            card: args
                .output
                .mixer_card
                .clone()
                .or(output_file.mixer_card)
                .unwrap_or_else(|| "default".to_string()),
            control: args
                .output
                .mixer_control
                .clone()
                .or(output_file.mixer_control)
                .unwrap_or_else(|| "Master".to_string()),
            policy,
        }),
        None => None,
    };

    Ok(ResolvedConfig {
        nickname: args
            .nickname
            .clone()
            .or(file.nickname)
            .unwrap_or_else(|| DEFAULT_NICKNAME.to_string()),
        command,
        broker,
        playback,
        loop_config,
        cursor,
        backend,
        volume,
        split: args.output.split || output_file.split.unwrap_or(false),
        realtime_priority: args.output.realtime_priority.or(output_file.realtime_priority),
    })
}
