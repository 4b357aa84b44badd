use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};
use stream_player::config::Backend;
use stream_player::volume::MixerPolicy;

#[derive(Parser, Debug)]
#[command(name = "stream-bridge", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// Node nickname, used to tag log output
    #[arg(short = 'n', long)]
    pub nickname: Option<String>,

    /// Broker host
    #[arg(short = 'i', long = "redis-host")]
    pub redis_host: Option<String>,

    /// Broker port
    #[arg(short = 'p', long = "redis-port")]
    pub redis_port: Option<u16>,

    /// Broker unix socket path (takes precedence over host/port)
    #[arg(short = 's', long = "redis-socket")]
    pub redis_socket: Option<String>,

    /// Log filter used when RUST_LOG is not set (e.g. info, debug)
    #[arg(short = 'l', long = "log-level", default_value = "info")]
    pub log_level: String,

    /// TOML config file; CLI flags override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    #[command(flatten)]
    pub stream: StreamArgs,

    #[command(flatten)]
    pub output: OutputArgs,
}

/// Stream selection and loop behaviour.
#[derive(ClapArgs, Debug, Default)]
pub struct StreamArgs {
    /// Stream key to read
    #[arg(long)]
    pub stream: Option<String>,

    /// Entry field holding the PCM payload
    #[arg(long)]
    pub field: Option<String>,

    /// Divide samples by this and clamp to [-1, 1] before output
    #[arg(long)]
    pub normalize_scale: Option<f32>,

    /// Key holding the task state; only state 1 plays stream data
    #[arg(long)]
    pub task_state_key: Option<String>,

    /// Always read from the newest entry instead of the last consumed one
    #[arg(long)]
    pub follow_latest: bool,

    /// Slice length for unbounded waits, in milliseconds
    #[arg(long)]
    pub heartbeat_ms: Option<u64>,

    /// Stats log period in seconds (0 disables)
    #[arg(long)]
    pub stats_interval_secs: Option<u64>,
}

/// Output device and scheduling.
#[derive(ClapArgs, Debug, Default)]
pub struct OutputArgs {
    /// Output backend: alsa or cpal
    #[arg(long)]
    pub backend: Option<Backend>,

    /// Output device name
    #[arg(long)]
    pub device: Option<String>,

    /// Logical volume 0..=100
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
    pub volume: Option<u8>,

    /// Mixer card for hardware volume
    #[arg(long)]
    pub mixer_card: Option<String>,

    /// Mixer control for hardware volume
    #[arg(long)]
    pub mixer_control: Option<String>,

    /// What to do when the mixer control is missing: fatal or warn
    #[arg(long)]
    pub mixer_policy: Option<MixerPolicy>,

    /// Receive and play on separate threads, dropping stale chunks
    #[arg(long)]
    pub split: bool,

    /// SCHED_FIFO priority for the playback thread (1..=99)
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=99))]
    pub realtime_priority: Option<u8>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Play stream entries on the output device (default)
    Play,

    /// Print decoded, normalized samples to stdout instead of playing them
    Monitor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_flags_match_node_conventions() {
        let args = Args::try_parse_from([
            "stream-bridge",
            "-n",
            "speaker",
            "-i",
            "10.0.0.2",
            "-p",
            "6380",
            "-l",
            "debug",
            "monitor",
        ])
        .unwrap();
        assert_eq!(args.nickname.as_deref(), Some("speaker"));
        assert_eq!(args.redis_host.as_deref(), Some("10.0.0.2"));
        assert_eq!(args.redis_port, Some(6380));
        assert_eq!(args.log_level, "debug");
        assert_eq!(args.cmd, Some(Command::Monitor));
    }

    #[test]
    fn subcommand_is_optional() {
        let args = Args::try_parse_from(["stream-bridge", "--backend", "cpal", "--split"]).unwrap();
        assert_eq!(args.cmd, None);
        assert_eq!(args.output.backend, Some(Backend::Cpal));
        assert!(args.output.split);
    }

    #[test]
    fn volume_out_of_range_rejected() {
        assert!(Args::try_parse_from(["stream-bridge", "--volume", "101"]).is_err());
        assert!(Args::try_parse_from(["stream-bridge", "--mixer-policy", "loud"]).is_err());
    }
}
