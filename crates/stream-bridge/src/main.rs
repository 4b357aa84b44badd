//! Stream Bridge: plays raw PCM chunks published on a Redis stream.
//!
//! ## Pipeline
//! 1. **Intake**: blocking `XREAD` against the stream, one entry at a time, resuming
//!    after the last consumed entry.
//! 2. **Decode**: the entry payload is reinterpreted as little-endian `f32` samples,
//!    optionally normalized.
//! 3. **Playback**: samples are written to the output device; xruns are recovered
//!    in place and the failed chunk is dropped.
//!
//! With `--split`, intake and playback run on separate threads joined by a
//! single-slot handoff that drops stale chunks.
//!
//! ## Modes
//! - `play` (default): play the stream on the output device.
//! - `monitor`: print normalized samples to stdout.

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use stream_bridge::cli::Args;
use stream_bridge::config::ResolvedConfig;
use stream_bridge::runtime;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(&args.log_level))
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if args.list_devices {
        return match runtime::list_devices() {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!("listing devices failed: {e:#}");
                ExitCode::FAILURE
            }
        };
    }

    let config = match ResolvedConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("invalid configuration: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let span = tracing::info_span!("node", name = %config.nickname);
    let _enter = span.enter();

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        eprintln!("shutting down (press Ctrl-C again to exit immediately)");
    }) {
        tracing::warn!("signal handler not installed: {e}");
    }

    match runtime::run(&config, shutdown) {
        Ok(()) => {
            tracing::info!("stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(runtime::exit_code(&e))
        }
    }
}
