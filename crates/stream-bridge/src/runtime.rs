//! Runtime wiring: broker, output device, volume and the playback loop.
//!
//! Startup failures are reported as [`FatalError`] so `main` can map them to a
//! process exit code. Once the loop runs, only unrecoverable broker errors end it.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use stream_player::broker::{BrokerError, EntrySource, RedisSource};
use stream_player::config::Backend;
use stream_player::cpal_sink::CpalSink;
use stream_player::cursor::StreamCursor;
use stream_player::decode;
use stream_player::pipeline::{PlaybackLoop, run_split};
use stream_player::sink::{PlaybackSink, SinkError};
use stream_player::stats::LoopStats;
use stream_player::volume::{
    MixerPolicy, SoftwareGain, VolumeControl, VolumeController, VolumeError,
};
use thiserror::Error;

use crate::cli::Command;
use crate::config::{ResolvedConfig, VolumeSettings};
use crate::priority;

/// Conditions that stop the process, each with its own exit code.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("broker unavailable")]
    Broker(#[source] BrokerError),
    #[error("output device unavailable")]
    Device(#[source] SinkError),
    #[error("volume control unavailable")]
    Mixer(#[source] VolumeError),
    #[error("broker protocol violation")]
    Protocol(#[source] BrokerError),
}

impl FatalError {
    pub fn exit_code(&self) -> u8 {
        match self {
            FatalError::Broker(_) => 1,
            FatalError::Device(_) => 2,
            FatalError::Mixer(_) => 3,
            FatalError::Protocol(_) => 4,
        }
    }

    fn from_broker(err: BrokerError) -> Self {
        match err {
            BrokerError::Protocol(_) => FatalError::Protocol(err),
            other => FatalError::Broker(other),
        }
    }
}

/// Exit code for an error returned by [`run`]; anything unclassified is 1.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<FatalError>()
        .map(FatalError::exit_code)
        .unwrap_or(1)
}

/// Print output devices to stdout.
pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    stream_player::device::list_devices(&host)
}

/// Run the configured subcommand until shutdown.
pub fn run(config: &ResolvedConfig, shutdown: Arc<AtomicBool>) -> Result<()> {
    match config.command {
        Command::Play => run_play(config, shutdown),
        Command::Monitor => run_monitor(config, shutdown),
    }
}

fn connect(config: &ResolvedConfig) -> Result<RedisSource, FatalError> {
    RedisSource::connect(config.broker.clone()).map_err(FatalError::Broker)
}

/// Consume the stream and play it on the output device.
pub fn run_play(config: &ResolvedConfig, shutdown: Arc<AtomicBool>) -> Result<()> {
    let source = connect(config)?;
    let sink = open_output(config)?;
    if let Some(priority) = config.realtime_priority {
        priority::elevate(priority);
    }

    let stats = LoopStats::shared();
    let cursor = StreamCursor::new(config.cursor.clone())
        .with_shutdown(shutdown.clone())
        .with_stats(stats.clone());
    tracing::info!(
        backend = ?config.backend,
        device = %config.playback.device,
        stream = %config.broker.stream,
        split = config.split,
        policy = ?config.cursor.policy,
        normalize_scale = ?config.loop_config.normalize_scale,
        "playback starting"
    );

    if config.split {
        run_split(
            source,
            sink,
            cursor,
            config.loop_config.clone(),
            &config.playback,
            stats,
            shutdown,
        )
        .map_err(|e| match e.downcast::<BrokerError>() {
            Ok(broker) => FatalError::from_broker(broker).into(),
            Err(other) => other,
        })
    } else {
        PlaybackLoop::new(
            source,
            sink,
            cursor,
            config.loop_config.clone(),
            &config.playback,
            stats,
            shutdown,
        )
        .run()
        .map_err(|e| FatalError::from_broker(e).into())
    }
}

/// Open the configured backend and apply the startup volume.
fn open_output(config: &ResolvedConfig) -> Result<Box<dyn PlaybackSink>, FatalError> {
    match config.backend {
        #[cfg(target_os = "linux")]
        Backend::Alsa => {
            let sink = stream_player::alsa_sink::AlsaSink::open(&config.playback)
                .map_err(FatalError::Device)?;
            if let Some(volume) = &config.volume {
                apply_volume(volume, || {
                    stream_player::volume::AlsaMixer::open(&volume.card, &volume.control)
                })?;
            }
            Ok(Box::new(sink))
        }
        #[cfg(not(target_os = "linux"))]
        Backend::Alsa => Err(FatalError::Device(SinkError::UnsupportedBackend(
            Backend::Alsa,
        ))),
        Backend::Cpal => {
            let sink = CpalSink::open(&config.playback).map_err(FatalError::Device)?;
            if let Some(volume) = &config.volume {
                let gain = sink.gain_handle();
                apply_volume(volume, || Ok(SoftwareGain::new(gain.clone())))?;
            }
            Ok(Box::new(sink))
        }
    }
}

/// Apply the startup volume, honouring the mixer policy on failure.
fn apply_volume<F, C>(settings: &VolumeSettings, open: F) -> Result<(), FatalError>
where
    F: FnMut() -> Result<C, VolumeError>,
    C: VolumeControl,
{
    let mut controller = VolumeController::new(open);
    match controller.set_volume(settings.percent) {
        Ok(_) => Ok(()),
        Err(e) if settings.policy == MixerPolicy::Warn => {
            tracing::warn!(error = %e, card = %settings.card, "volume not applied; keeping device volume");
            Ok(())
        }
        Err(e) => Err(FatalError::Mixer(e)),
    }
}

/// Print decoded chunks as comma-separated samples, one line per entry.
pub fn run_monitor(config: &ResolvedConfig, shutdown: Arc<AtomicBool>) -> Result<()> {
    let mut source = connect(config)?;
    let stats = LoopStats::shared();
    let mut cursor = StreamCursor::new(config.cursor.clone())
        .with_shutdown(shutdown.clone())
        .with_stats(stats.clone());
    let scale = config.loop_config.normalize_scale;
    let stdout = std::io::stdout();
    let mut connected = true;

    while !shutdown.load(Ordering::Relaxed) {
        let batch = match cursor.next_batch(&mut source) {
            Ok(batch) => {
                if !connected {
                    tracing::info!("broker connection re-established");
                    connected = true;
                }
                batch.unwrap_or_default()
            }
            Err(e) if e.is_connection_lost() => {
                if connected {
                    tracing::warn!(error = %e, "lost connection to broker");
                    connected = false;
                }
                std::thread::sleep(config.loop_config.reconnect_backoff);
                if source.reconnect().is_ok() {
                    stats.record_reconnect();
                }
                continue;
            }
            Err(e) => return Err(FatalError::from_broker(e).into()),
        };

        let mut out = stdout.lock();
        for entry in batch {
            let samples = decode::decode(&entry.payload, scale);
            stats.record_entry(samples.is_empty());
            if let Err(e) = writeln!(out, "{}", format_samples(&samples)) {
                if e.kind() == std::io::ErrorKind::BrokenPipe {
                    return Ok(());
                }
                return Err(e).context("write monitor output");
            }
        }
        out.flush().context("flush monitor output")?;
    }
    tracing::info!(stats = ?stats.snapshot(), "monitor stopped");
    Ok(())
}

fn format_samples(samples: &[f32]) -> String {
    samples
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
