//! Bounded sample ring between the blocking writer and a CPAL output callback.
//!
//! The ring plays the role of the device buffer for callback-driven backends:
//! - the writer blocks while the ring is full (backpressure toward the broker)
//! - the callback drains without ever waiting
//! - a drain that runs dry after audio was flowing latches an underrun, which the
//!   next write reports as an xrun
//!
//! With a start threshold the callback plays silence until that many frames are
//! queued, both at startup and after every underrun or `clear`. A closed ring plays
//! out whatever is left regardless.
//!
//! A `closed` flag lives under the same mutex as the samples so shutdown cannot race
//! a blocked writer.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Bounded queue of interleaved `f32` samples.
pub struct SampleRing {
    channels: usize,
    capacity_samples: usize,
    start_samples: usize,
    inner: Mutex<RingInner>,
    cv: Condvar,
}

struct RingInner {
    queue: VecDeque<f32>,
    closed: bool,
    /// Set when the callback found the ring empty after it had carried audio.
    underrun: bool,
    /// Whether any audio has been drained since the last underrun/clear.
    flowing: bool,
}

impl SampleRing {
    /// Create a ring holding at most `capacity_frames` frames.
    pub fn new(channels: usize, capacity_frames: usize) -> Self {
        let channels = channels.max(1);
        let capacity_samples = capacity_frames.max(1).saturating_mul(channels);
        Self {
            channels,
            capacity_samples,
            start_samples: 0,
            inner: Mutex::new(RingInner {
                queue: VecDeque::with_capacity(capacity_samples),
                closed: false,
                underrun: false,
                flowing: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Hold the callback off until `frames` are queued (capped at the capacity).
    pub fn with_start_threshold(mut self, frames: usize) -> Self {
        self.start_samples = frames.saturating_mul(self.channels).min(self.capacity_samples);
        self
    }

    fn lock(&self) -> MutexGuard<'_, RingInner> {
        // A panicking callback must not take the writer down with it.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Channel count of the interleaved samples.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Capacity in frames.
    pub fn capacity_frames(&self) -> usize {
        self.capacity_samples / self.channels
    }

    /// Buffered frames (snapshot).
    pub fn len_frames(&self) -> usize {
        self.lock().queue.len() / self.channels
    }

    /// Push samples, blocking while the ring is full.
    ///
    /// Returns the number of whole frames accepted. Returns early with a short
    /// count if the ring is closed while waiting.
    pub fn push_blocking(&self, samples: &[f32]) -> usize {
        let mut offset = 0;

        while offset < samples.len() {
            let mut g = self.lock();
            while g.queue.len() >= self.capacity_samples && !g.closed {
                g = self.cv.wait(g).unwrap_or_else(|poisoned| poisoned.into_inner());
            }
            if g.closed {
                break;
            }

            let room = self.capacity_samples - g.queue.len();
            let take = room.min(samples.len() - offset);
            g.queue.extend(&samples[offset..offset + take]);
            offset += take;
            drop(g);
            self.cv.notify_all();
        }

        offset / self.channels
    }

    /// Drain up to `out.len()` samples into `out` without blocking.
    ///
    /// Returns the number of samples written; the rest of `out` is untouched.
    pub fn drain_into(&self, out: &mut [f32]) -> usize {
        let mut g = self.lock();
        if !g.flowing && !g.closed && g.queue.len() < self.start_samples {
            return 0;
        }
        let take = g.queue.len().min(out.len());
        for (dst, src) in out.iter_mut().zip(g.queue.drain(..take)) {
            *dst = src;
        }

        if take > 0 {
            g.flowing = true;
        }
        if take < out.len() && g.flowing && !g.closed {
            g.underrun = true;
            g.flowing = false;
        }
        drop(g);

        if take > 0 {
            self.cv.notify_all();
        }
        take
    }

    /// Return and clear the latched underrun flag.
    pub fn take_underrun(&self) -> bool {
        let mut g = self.lock();
        std::mem::replace(&mut g.underrun, false)
    }

    /// Drop all buffered samples and clear the underrun latch.
    pub fn clear(&self) {
        let mut g = self.lock();
        g.queue.clear();
        g.underrun = false;
        g.flowing = false;
        drop(g);
        self.cv.notify_all();
    }

    /// Close the ring and wake any blocked writer. Idempotent.
    pub fn close(&self) {
        let mut g = self.lock();
        g.closed = true;
        drop(g);
        self.cv.notify_all();
    }

    /// Wait until the ring is empty or `timeout` elapses.
    ///
    /// Returns `true` if the ring drained in time. Close first when the tail may sit
    /// below the start threshold.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let g = self.lock();
        let (g, _timeout) = self
            .cv
            .wait_timeout_while(g, timeout, |inner| !inner.queue.is_empty())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        g.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn capacity_is_in_frames() {
        let ring = SampleRing::new(2, 8);
        assert_eq!(ring.capacity_frames(), 8);
        assert_eq!(ring.channels(), 2);
    }

    #[test]
    fn drain_returns_pushed_samples_in_order() {
        let ring = SampleRing::new(1, 16);
        assert_eq!(ring.push_blocking(&[1.0, 2.0, 3.0]), 3);
        let mut out = [0.0f32; 2];
        assert_eq!(ring.drain_into(&mut out), 2);
        assert_eq!(out, [1.0, 2.0]);
        assert_eq!(ring.len_frames(), 1);
    }

    #[test]
    fn idle_ring_does_not_latch_underrun() {
        let ring = SampleRing::new(1, 4);
        let mut out = [0.0f32; 4];
        assert_eq!(ring.drain_into(&mut out), 0);
        assert!(!ring.take_underrun());
    }

    #[test]
    fn running_dry_after_audio_latches_underrun_once() {
        let ring = SampleRing::new(1, 4);
        ring.push_blocking(&[0.5, 0.5]);
        let mut out = [0.0f32; 4];
        assert_eq!(ring.drain_into(&mut out), 2);
        assert!(ring.take_underrun());
        assert!(!ring.take_underrun());
        assert_eq!(ring.drain_into(&mut out), 0);
        assert!(!ring.take_underrun());
    }

    #[test]
    fn clear_resets_queue_and_latch() {
        let ring = SampleRing::new(1, 4);
        ring.push_blocking(&[0.1]);
        let mut out = [0.0f32; 2];
        ring.drain_into(&mut out);
        ring.push_blocking(&[0.2, 0.3]);
        ring.clear();
        assert_eq!(ring.len_frames(), 0);
        assert!(!ring.take_underrun());
    }

    #[test]
    fn start_threshold_holds_playback_until_filled() {
        let ring = SampleRing::new(1, 4).with_start_threshold(3);
        ring.push_blocking(&[0.1, 0.2]);
        let mut out = [0.0f32; 2];
        assert_eq!(ring.drain_into(&mut out), 0);
        assert!(!ring.take_underrun());

        ring.push_blocking(&[0.3]);
        assert_eq!(ring.drain_into(&mut out), 2);
        assert_eq!(out, [0.1, 0.2]);
        // once started, the queue plays down below the threshold
        assert_eq!(ring.drain_into(&mut out[..1]), 1);
        assert!(!ring.take_underrun());
    }

    #[test]
    fn underrun_rearms_start_threshold() {
        let ring = SampleRing::new(1, 4).with_start_threshold(2);
        ring.push_blocking(&[0.1, 0.2]);
        let mut out = [0.0f32; 4];
        assert_eq!(ring.drain_into(&mut out), 2);
        assert!(ring.take_underrun());

        ring.push_blocking(&[0.3]);
        assert_eq!(ring.drain_into(&mut out), 0);
        ring.push_blocking(&[0.4]);
        assert_eq!(ring.drain_into(&mut out[..2]), 2);
        assert_eq!(&out[..2], &[0.3, 0.4]);
    }

    #[test]
    fn closed_ring_plays_out_tail_below_threshold() {
        let ring = SampleRing::new(1, 8).with_start_threshold(8);
        ring.push_blocking(&[0.1, 0.2]);
        ring.close();
        let mut out = [0.0f32; 4];
        assert_eq!(ring.drain_into(&mut out), 2);
        assert!(ring.wait_drained(Duration::from_millis(1)));
        assert!(!ring.take_underrun());
    }

    #[test]
    fn threshold_is_capped_at_capacity() {
        let ring = SampleRing::new(2, 4).with_start_threshold(100);
        ring.push_blocking(&[0.0; 8]);
        let mut out = [0.0f32; 8];
        assert_eq!(ring.drain_into(&mut out), 8);
    }

    #[test]
    fn push_blocks_until_drained() {
        let ring = Arc::new(SampleRing::new(1, 2));
        let writer = ring.clone();
        let handle = thread::spawn(move || writer.push_blocking(&[1.0, 2.0, 3.0, 4.0]));

        let mut seen = Vec::new();
        while seen.len() < 4 {
            let mut out = [0.0f32; 1];
            if ring.drain_into(&mut out) == 1 {
                seen.push(out[0]);
            } else {
                thread::yield_now();
            }
        }
        assert_eq!(handle.join().unwrap(), 4);
        assert_eq!(seen, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn close_releases_blocked_writer() {
        let ring = Arc::new(SampleRing::new(1, 1));
        ring.push_blocking(&[0.0]);
        let writer = ring.clone();
        let barrier = Arc::new(std::sync::Barrier::new(2));
        let start = barrier.clone();
        let handle = thread::spawn(move || {
            start.wait();
            writer.push_blocking(&[1.0, 2.0])
        });
        barrier.wait();
        ring.close();
        assert_eq!(handle.join().unwrap(), 0);
    }

    #[test]
    fn wait_drained_reports_empty() {
        let ring = SampleRing::new(1, 4);
        assert!(ring.wait_drained(Duration::from_millis(1)));
        ring.push_blocking(&[1.0]);
        assert!(!ring.wait_drained(Duration::from_millis(5)));
    }
}
