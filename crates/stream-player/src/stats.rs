//! Run counters shared between the intake and output stages.
//!
//! Counters are relaxed atomics: they feed log lines, not control flow.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct LoopStats {
    entries: AtomicU64,
    empty_payloads: AtomicU64,
    stale_skipped: AtomicU64,
    frames_written: AtomicU64,
    silence_frames: AtomicU64,
    xruns: AtomicU64,
    recoveries: AtomicU64,
    handoff_dropped: AtomicU64,
    reconnects: AtomicU64,
}

/// Point-in-time copy of [`LoopStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub entries: u64,
    pub empty_payloads: u64,
    pub stale_skipped: u64,
    pub frames_written: u64,
    pub silence_frames: u64,
    pub xruns: u64,
    pub recoveries: u64,
    pub handoff_dropped: u64,
    pub reconnects: u64,
}

impl LoopStats {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_entry(&self, empty: bool) {
        self.entries.fetch_add(1, Ordering::Relaxed);
        if empty {
            self.empty_payloads.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_stale(&self, count: u64) {
        self.stale_skipped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_written(&self, frames: usize) {
        self.frames_written.fetch_add(frames as u64, Ordering::Relaxed);
    }

    pub fn record_silence(&self, frames: usize) {
        self.silence_frames.fetch_add(frames as u64, Ordering::Relaxed);
    }

    pub fn record_xrun(&self) {
        self.xruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovery(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, count: usize) {
        self.handoff_dropped.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            entries: self.entries.load(Ordering::Relaxed),
            empty_payloads: self.empty_payloads.load(Ordering::Relaxed),
            stale_skipped: self.stale_skipped.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            silence_frames: self.silence_frames.load(Ordering::Relaxed),
            xruns: self.xruns.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            handoff_dropped: self.handoff_dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Emits a stats line every `interval` with totals and per-interval deltas.
pub struct StatsReporter {
    interval: Duration,
    last: Instant,
    prev: StatsSnapshot,
}

impl StatsReporter {
    /// A zero interval disables reporting.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Instant::now(),
            prev: StatsSnapshot::default(),
        }
    }

    pub fn tick(&mut self, stats: &LoopStats) {
        if self.interval.is_zero() || self.last.elapsed() < self.interval {
            return;
        }
        self.last = Instant::now();
        let now = stats.snapshot();
        tracing::info!(
            entries = now.entries,
            entries_delta = now.entries - self.prev.entries,
            frames_written = now.frames_written,
            silence_frames = now.silence_frames,
            empty_payloads = now.empty_payloads,
            xruns = now.xruns,
            xruns_delta = now.xruns - self.prev.xruns,
            recoveries = now.recoveries,
            handoff_dropped = now.handoff_dropped,
            stale_skipped = now.stale_skipped,
            reconnects = now.reconnects,
            "playback stats"
        );
        self.prev = now;
    }
}

/// Lets one log line through per interval and counts what it held back.
pub struct LogThrottle {
    interval: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            suppressed: 0,
        }
    }

    /// Returns `Some(suppressed_since_last)` when a line may be logged now.
    pub fn allow(&mut self) -> Option<u64> {
        self.allow_at(Instant::now())
    }

    fn allow_at(&mut self, now: Instant) -> Option<u64> {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.last = Some(now);
                Some(std::mem::take(&mut self.suppressed))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_records() {
        let stats = LoopStats::default();
        stats.record_entry(false);
        stats.record_entry(true);
        stats.record_written(300);
        stats.record_silence(10);
        stats.record_xrun();
        stats.record_recovery();
        stats.record_dropped(2);
        stats.record_stale(1);
        stats.record_reconnect();
        let snap = stats.snapshot();
        assert_eq!(
            snap,
            StatsSnapshot {
                entries: 2,
                empty_payloads: 1,
                stale_skipped: 1,
                frames_written: 300,
                silence_frames: 10,
                xruns: 1,
                recoveries: 1,
                handoff_dropped: 2,
                reconnects: 1,
            }
        );
    }

    #[test]
    fn throttle_counts_suppressed_lines() {
        let mut t = LogThrottle::new(Duration::from_secs(1));
        let start = Instant::now();
        assert_eq!(t.allow_at(start), Some(0));
        assert_eq!(t.allow_at(start + Duration::from_millis(10)), None);
        assert_eq!(t.allow_at(start + Duration::from_millis(20)), None);
        assert_eq!(t.allow_at(start + Duration::from_millis(1500)), Some(2));
    }

    #[test]
    fn zero_interval_reporter_is_silent() {
        let mut reporter = StatsReporter::new(Duration::ZERO);
        reporter.tick(&LoopStats::default());
        assert_eq!(reporter.prev, StatsSnapshot::default());
    }
}
