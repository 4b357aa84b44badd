//! Playback loop: stream intake → decode → sink, with xrun recovery.
//!
//! The loop is a small state machine:
//!
//! ```text
//! AwaitingData ──entry──▶ Writing ──ok──▶ AwaitingData
//!      ▲                     │
//!      │                   fault
//!      │                     ▼
//!      └─────────────── Recovering
//! ```
//!
//! A buffer whose write faults is dropped after recovery; the next write always
//! carries the next entry. Only stream reads that reconnecting cannot fix
//! (protocol violations, rejected commands) end the loop; an unreadable task-state
//! key counts as "not GO" and keeps the device fed with silence.

mod split;

pub use split::run_split;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::broker::{BrokerError, EntrySource};
use crate::config::{LoopConfig, PlaybackConfig, TASK_STATE_GO};
use crate::cursor::StreamCursor;
use crate::decode::{self, SampleBuffer};
use crate::sink::{PlaybackSink, SinkFault};
use crate::stats::{LogThrottle, LoopStats, StatsReporter};

const FAULT_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Current position of the playback state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopState {
    AwaitingData,
    Writing(SampleBuffer),
    Recovering(SinkFault),
}

/// Receiving half: broker reads, task-state gating, reconnects, decode.
pub(crate) struct Intake<S> {
    source: S,
    cursor: StreamCursor,
    config: LoopConfig,
    silence_frames: usize,
    stats: Arc<LoopStats>,
    gate_open: bool,
    connected: bool,
    state_log: LogThrottle,
}

impl<S: EntrySource> Intake<S> {
    pub(crate) fn new(
        source: S,
        cursor: StreamCursor,
        config: LoopConfig,
        playback: &PlaybackConfig,
        stats: Arc<LoopStats>,
    ) -> Self {
        let silence_frames = playback.frames_for(config.silence_interval) * usize::from(playback.channels);
        Self {
            source,
            cursor,
            config,
            silence_frames,
            stats,
            gate_open: false,
            connected: true,
            state_log: LogThrottle::new(FAULT_LOG_INTERVAL),
        }
    }

    /// Produce the next buffer to play.
    ///
    /// `Ok(None)` means nothing is ready yet (wait elapsed, or the connection dropped
    /// and a reconnect was attempted).
    pub(crate) fn next_buffer(&mut self) -> Result<Option<SampleBuffer>, BrokerError> {
        if let Some(key) = self.config.task_state_key.clone() {
            let go = match self.source.task_state(&key) {
                Ok(state) => state == Some(TASK_STATE_GO),
                Err(e) if e.is_connection_lost() => {
                    self.connection_lost(&e);
                    return Ok(None);
                }
                Err(e) => {
                    if let Some(suppressed) = self.state_log.allow() {
                        tracing::warn!(key = %key, error = %e, suppressed, "task state unreadable; holding silence");
                    }
                    false
                }
            };
            if let Some(silence) = self.update_gate(go) {
                return Ok(Some(silence));
            }
        }

        match self.cursor.next(&mut self.source) {
            Ok(Some(entry)) => {
                self.mark_connected();
                let partial = decode::trailing_bytes(&entry.payload);
                if partial > 0 {
                    tracing::debug!(token = %entry.token, partial, "payload ends mid-sample; tail dropped");
                }
                let samples = decode::decode(&entry.payload, self.config.normalize_scale);
                self.stats.record_entry(samples.is_empty());
                tracing::trace!(token = %entry.token, samples = samples.len(), "entry decoded");
                Ok(Some(samples))
            }
            Ok(None) => {
                self.mark_connected();
                Ok(None)
            }
            Err(e) if e.is_connection_lost() => {
                self.connection_lost(&e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Track GO/not-GO transitions; returns a silence buffer while gated.
    fn update_gate(&mut self, go: bool) -> Option<SampleBuffer> {
        if go {
            if !self.gate_open {
                self.gate_open = true;
                self.cursor.reset_to_latest();
                tracing::info!("playback started");
            }
            None
        } else {
            if self.gate_open {
                self.gate_open = false;
                tracing::info!("playback ended");
            }
            self.stats.record_silence(self.silence_frames);
            Some(vec![0.0; self.silence_frames])
        }
    }

    /// Whether playback is held by the task-state key.
    pub(crate) fn is_gated(&self) -> bool {
        self.config.task_state_key.is_some() && !self.gate_open
    }

    fn connection_lost(&mut self, err: &BrokerError) {
        if self.connected {
            tracing::warn!(error = %err, "lost connection to broker");
            self.connected = false;
        }
        std::thread::sleep(self.config.reconnect_backoff);
        match self.source.reconnect() {
            Ok(()) => {
                self.stats.record_reconnect();
                self.mark_connected();
            }
            Err(e) => tracing::debug!(error = %e, "broker reconnect failed"),
        }
    }

    fn mark_connected(&mut self) {
        if !self.connected {
            tracing::info!("broker connection re-established");
            self.connected = true;
        }
    }

    pub(crate) fn stats(&self) -> &Arc<LoopStats> {
        &self.stats
    }
}

/// Writing half: device writes and fault recovery.
pub(crate) struct Output<K> {
    sink: K,
    stats: Arc<LoopStats>,
    fault_log: LogThrottle,
}

impl<K: PlaybackSink> Output<K> {
    pub(crate) fn new(sink: K, stats: Arc<LoopStats>) -> Self {
        Self {
            sink,
            stats,
            fault_log: LogThrottle::new(FAULT_LOG_INTERVAL),
        }
    }

    /// Write one buffer; the buffer is consumed whether or not the write succeeds.
    pub(crate) fn write(&mut self, samples: SampleBuffer) -> Result<usize, SinkFault> {
        match self.sink.write(&samples) {
            Ok(frames) => {
                self.stats.record_written(frames);
                Ok(frames)
            }
            Err(fault) => {
                self.stats.record_xrun();
                if let Some(suppressed) = self.fault_log.allow() {
                    tracing::warn!(fault = %fault, suppressed, dropped_samples = samples.len(), "device write failed; recovering");
                }
                Err(fault)
            }
        }
    }

    pub(crate) fn recover(&mut self, fault: &SinkFault) {
        self.sink.recover(fault);
        self.stats.record_recovery();
    }

    /// Write, recovering in place on fault. Used by the split pipeline.
    pub(crate) fn play(&mut self, samples: SampleBuffer) {
        if let Err(fault) = self.write(samples) {
            self.recover(&fault);
        }
    }

    pub(crate) fn close(&mut self) {
        self.sink.close();
    }
}

/// Sequential consume → decode → play loop owning its broker source and sink.
///
/// Both resources are released when the loop is dropped, on every exit path.
pub struct PlaybackLoop<S, K> {
    intake: Intake<S>,
    output: Output<K>,
    state: LoopState,
    shutdown: Arc<AtomicBool>,
    reporter: StatsReporter,
}

impl<S: EntrySource, K: PlaybackSink> PlaybackLoop<S, K> {
    pub fn new(
        source: S,
        sink: K,
        cursor: StreamCursor,
        config: LoopConfig,
        playback: &PlaybackConfig,
        stats: Arc<LoopStats>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let reporter = StatsReporter::new(config.stats_interval);
        Self {
            intake: Intake::new(source, cursor, config, playback, stats.clone()),
            output: Output::new(sink, stats),
            state: LoopState::AwaitingData,
            shutdown,
            reporter,
        }
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    pub fn stats(&self) -> &Arc<LoopStats> {
        self.intake.stats()
    }

    /// Perform one transition.
    pub fn step(&mut self) -> Result<(), BrokerError> {
        let state = std::mem::replace(&mut self.state, LoopState::AwaitingData);
        self.state = match state {
            LoopState::AwaitingData => match self.intake.next_buffer()? {
                Some(samples) => LoopState::Writing(samples),
                None => LoopState::AwaitingData,
            },
            LoopState::Writing(samples) => match self.output.write(samples) {
                Ok(_) => LoopState::AwaitingData,
                Err(fault) => LoopState::Recovering(fault),
            },
            LoopState::Recovering(fault) => {
                self.output.recover(&fault);
                LoopState::AwaitingData
            }
        };
        Ok(())
    }

    /// Run until shutdown is requested or a fatal broker error occurs.
    pub fn run(mut self) -> Result<(), BrokerError> {
        let result = loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break Ok(());
            }
            if let Err(e) = self.step() {
                break Err(e);
            }
            self.reporter.tick(self.intake.stats());
        };
        self.output.close();
        tracing::info!(stats = ?self.intake.stats().snapshot(), "playback loop stopped");
        result
    }
}
