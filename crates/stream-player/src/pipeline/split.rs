//! Two-thread variant of the playback loop.
//!
//! Intake (broker reads + decode) runs on its own thread and hands buffers to the
//! output stage through a single-slot [`handoff`](crate::handoff). A slow device
//! therefore costs dropped chunks instead of growing latency. Silence written while
//! the task state is not GO is never dropped; the intake waits for the slot, so the
//! device write paces it as in the sequential loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use crossbeam_channel::RecvTimeoutError;

use super::{Intake, Output};
use crate::broker::EntrySource;
use crate::config::{LoopConfig, PlaybackConfig};
use crate::cursor::StreamCursor;
use crate::handoff::{HandoffSender, handoff};
use crate::sink::PlaybackSink;
use crate::stats::{LogThrottle, LoopStats, StatsReporter};

const OUTPUT_POLL: Duration = Duration::from_millis(100);
const SILENCE_POLL: Duration = Duration::from_millis(50);
const DROP_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Run intake on a worker thread and output on the calling thread.
///
/// Returns when shutdown is requested or the intake stops on a fatal broker error.
pub fn run_split<S, K>(
    source: S,
    sink: K,
    cursor: StreamCursor,
    config: LoopConfig,
    playback: &PlaybackConfig,
    stats: Arc<LoopStats>,
    shutdown: Arc<AtomicBool>,
) -> Result<()>
where
    S: EntrySource + Send,
    K: PlaybackSink,
{
    let mut reporter = StatsReporter::new(config.stats_interval);
    let intake = Intake::new(source, cursor, config, playback, stats.clone());
    let mut output = Output::new(sink, stats.clone());
    let (tx, rx) = handoff();

    thread::scope(|scope| {
        let worker = thread::Builder::new()
            .name("stream-intake".to_string())
            .spawn_scoped(scope, {
                let shutdown = shutdown.clone();
                move || intake_loop(intake, tx, &shutdown)
            })?;

        while !shutdown.load(Ordering::Relaxed) {
            match rx.recv_timeout(OUTPUT_POLL) {
                Ok(samples) => output.play(samples),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            reporter.tick(&stats);
        }
        drop(rx);
        output.close();

        let result = worker
            .join()
            .map_err(|_| anyhow!("intake thread panicked"))?;
        tracing::info!(stats = ?stats.snapshot(), "split playback stopped");
        result
    })
}

fn intake_loop<S: EntrySource>(
    mut intake: Intake<S>,
    tx: HandoffSender<Vec<f32>>,
    shutdown: &AtomicBool,
) -> Result<()> {
    let mut drop_log = LogThrottle::new(DROP_LOG_INTERVAL);
    while !shutdown.load(Ordering::Relaxed) {
        let Some(samples) = intake.next_buffer()? else {
            continue;
        };
        // Gated silence waits for the slot instead of evicting.
        if intake.is_gated() {
            if tx.send_when_free(samples, SILENCE_POLL).is_err() {
                break;
            }
            continue;
        }
        match tx.offer(samples) {
            Ok(0) => {}
            Ok(evicted) => {
                intake.stats().record_dropped(evicted);
                if let Some(suppressed) = drop_log.allow() {
                    tracing::warn!(suppressed, "output busy; dropped pending chunk");
                }
            }
            Err(_) => break,
        }
    }
    Ok(())
}
