//! Stream cursor: remembers the last consumed token and issues bounded reads.
//!
//! Two read shapes are used:
//! - monitoring: short wait, up to ten entries per call
//! - playback: unbounded wait, one entry per call
//!
//! An unbounded wait is served as a series of `heartbeat` sized blocking reads so a
//! shutdown request is noticed between them. Callers never see those slices: `next`
//! only returns `None` on shutdown.
//!
//! Under [`CursorPolicy::Advance`] a cursor at "latest" is first anchored on the
//! newest id in the stream (or `0-0` when it is empty), so every slice after that
//! reads from a fixed position and nothing published between slices is skipped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::broker::{BrokerError, EntrySource};
use crate::entry::{StreamEntry, StreamToken};
use crate::stats::LoopStats;

/// How long a single cursor call may wait for new entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitBudget {
    /// Return immediately.
    Immediate,
    /// Wait up to the given duration.
    Bounded(Duration),
    /// Wait until an entry arrives (or shutdown).
    Unbounded,
}

/// Which token each read is issued against.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CursorPolicy {
    /// Read strictly after the last consumed token; nothing produced between calls is lost.
    #[default]
    Advance,
    /// Read strictly after whatever is newest at call time; entries produced between
    /// calls are skipped.
    Latest,
}

#[derive(Clone, Debug)]
pub struct CursorConfig {
    pub wait: WaitBudget,
    /// Maximum entries returned by `next_batch`.
    pub batch: usize,
    pub policy: CursorPolicy,
    /// Slice length used to serve unbounded waits.
    pub heartbeat: Duration,
}

impl CursorConfig {
    /// Unbounded wait, one entry per call.
    pub fn playback() -> Self {
        Self {
            wait: WaitBudget::Unbounded,
            batch: 1,
            policy: CursorPolicy::Advance,
            heartbeat: Duration::from_secs(1),
        }
    }

    /// 1 ms wait, up to ten entries per call.
    pub fn monitoring() -> Self {
        Self {
            wait: WaitBudget::Bounded(Duration::from_millis(1)),
            batch: 10,
            policy: CursorPolicy::Advance,
            heartbeat: Duration::from_secs(1),
        }
    }
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self::playback()
    }
}

pub struct StreamCursor {
    last: StreamToken,
    config: CursorConfig,
    shutdown: Option<Arc<AtomicBool>>,
    stats: Option<Arc<LoopStats>>,
}

impl StreamCursor {
    /// Start at "latest": only entries produced after the first read are returned.
    pub fn new(config: CursorConfig) -> Self {
        Self {
            last: StreamToken::Latest,
            config,
            shutdown: None,
            stats: None,
        }
    }

    /// Stop unbounded waits once `flag` is set.
    pub fn with_shutdown(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = Some(flag);
        self
    }

    pub fn with_stats(mut self, stats: Arc<LoopStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Last consumed token.
    pub fn last_token(&self) -> &StreamToken {
        &self.last
    }

    /// Forget the consumed position; the next read only sees entries produced after it.
    pub fn reset_to_latest(&mut self) {
        self.last = StreamToken::Latest;
    }

    /// Next single entry, or `None` when the wait budget elapsed (or shutdown).
    pub fn next<S: EntrySource + ?Sized>(
        &mut self,
        source: &mut S,
    ) -> Result<Option<StreamEntry>, BrokerError> {
        Ok(self.poll(source, 1)?.and_then(|batch| batch.into_iter().next()))
    }

    /// Up to `batch` entries, or `None` when the wait budget elapsed (or shutdown).
    pub fn next_batch<S: EntrySource + ?Sized>(
        &mut self,
        source: &mut S,
    ) -> Result<Option<Vec<StreamEntry>>, BrokerError> {
        let batch = self.config.batch.max(1);
        self.poll(source, batch)
    }

    fn poll<S: EntrySource + ?Sized>(
        &mut self,
        source: &mut S,
        count: usize,
    ) -> Result<Option<Vec<StreamEntry>>, BrokerError> {
        if self.config.policy == CursorPolicy::Advance && self.last.is_latest() {
            self.last = source
                .newest_token()?
                .unwrap_or_else(|| StreamToken::id(0, 0));
            tracing::debug!(start = %self.last, "cursor anchored");
        }

        loop {
            let block = match self.config.wait {
                WaitBudget::Immediate => None,
                WaitBudget::Bounded(d) => Some(d),
                WaitBudget::Unbounded => Some(self.config.heartbeat),
            };
            let after = match self.config.policy {
                CursorPolicy::Advance => self.last.clone(),
                CursorPolicy::Latest => StreamToken::Latest,
            };

            let entries = source.read(&after, block, count)?;
            let fresh = self.accept(entries);
            if !fresh.is_empty() {
                return Ok(Some(fresh));
            }

            if self.config.wait != WaitBudget::Unbounded || self.shutdown_requested() {
                return Ok(None);
            }
        }
    }

    /// Keep only entries strictly newer than the cursor and advance past them.
    fn accept(&mut self, entries: Vec<StreamEntry>) -> Vec<StreamEntry> {
        let mut fresh = Vec::with_capacity(entries.len());
        let mut stale = 0u64;
        for entry in entries {
            if entry.token > self.last {
                self.last = entry.token.clone();
                fresh.push(entry);
            } else {
                stale += 1;
            }
        }
        if stale > 0 {
            tracing::debug!(stale, last = %self.last, "skipped entries at or before cursor");
            if let Some(stats) = &self.stats {
                stats.record_stale(stale);
            }
        }
        fresh
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown
            .as_ref()
            .map(|f| f.load(Ordering::Relaxed))
            .unwrap_or(false)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted broker: each `read` pops the next reply and records the request.
    #[derive(Default)]
    pub(crate) struct ScriptedSource {
        pub replies: VecDeque<Result<Vec<StreamEntry>, BrokerError>>,
        pub requests: Vec<(StreamToken, Option<Duration>, usize)>,
        pub states: VecDeque<Result<Option<i64>, BrokerError>>,
        /// Answer to `newest_token`; `None` is an empty stream.
        pub newest: Option<StreamToken>,
        pub newest_calls: usize,
        pub reconnects: usize,
    }

    impl ScriptedSource {
        pub(crate) fn with_replies(
            replies: impl IntoIterator<Item = Result<Vec<StreamEntry>, BrokerError>>,
        ) -> Self {
            Self {
                replies: replies.into_iter().collect(),
                ..Self::default()
            }
        }
    }

    impl EntrySource for ScriptedSource {
        fn read(
            &mut self,
            after: &StreamToken,
            block: Option<Duration>,
            count: usize,
        ) -> Result<Vec<StreamEntry>, BrokerError> {
            self.requests.push((after.clone(), block, count));
            self.replies.pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }

        fn newest_token(&mut self) -> Result<Option<StreamToken>, BrokerError> {
            self.newest_calls += 1;
            Ok(self.newest.clone())
        }

        fn task_state(&mut self, _key: &str) -> Result<Option<i64>, BrokerError> {
            self.states.pop_front().unwrap_or(Ok(None))
        }

        fn reconnect(&mut self) -> Result<(), BrokerError> {
            self.reconnects += 1;
            Ok(())
        }
    }

    pub(crate) fn entry(millis: u64, payload: &[u8]) -> StreamEntry {
        StreamEntry::new(StreamToken::id(millis, 0), payload.to_vec())
    }

    #[test]
    fn advance_policy_reissues_last_token() {
        let mut src = ScriptedSource::with_replies([
            Ok(vec![entry(1, b"a")]),
            Ok(vec![entry(2, b"b")]),
        ]);
        let mut cursor = StreamCursor::new(CursorConfig::playback());
        assert_eq!(cursor.next(&mut src).unwrap().unwrap().token, StreamToken::id(1, 0));
        assert_eq!(cursor.next(&mut src).unwrap().unwrap().token, StreamToken::id(2, 0));
        assert_eq!(src.requests[0].0, StreamToken::id(0, 0));
        assert_eq!(src.requests[1].0, StreamToken::id(1, 0));
        assert_eq!(src.requests[0].2, 1);
        assert_eq!(src.requests[0].1, Some(Duration::from_secs(1)));
    }

    #[test]
    fn latest_policy_always_reads_from_latest() {
        let mut src = ScriptedSource::with_replies([Ok(vec![entry(1, b"a")]), Ok(vec![entry(5, b"b")])]);
        let mut cfg = CursorConfig::playback();
        cfg.policy = CursorPolicy::Latest;
        let mut cursor = StreamCursor::new(cfg);
        cursor.next(&mut src).unwrap();
        cursor.next(&mut src).unwrap();
        assert!(src.requests.iter().all(|r| r.0 == StreamToken::Latest));
        assert_eq!(cursor.last_token(), &StreamToken::id(5, 0));
        assert_eq!(src.newest_calls, 0);
    }

    #[test]
    fn bounded_wait_returns_none_on_timeout() {
        let mut src = ScriptedSource::with_replies([Ok(vec![])]);
        let mut cursor = StreamCursor::new(CursorConfig::monitoring());
        assert!(cursor.next_batch(&mut src).unwrap().is_none());
        assert_eq!(src.requests.len(), 1);
        assert_eq!(src.requests[0].1, Some(Duration::from_millis(1)));
        assert_eq!(src.requests[0].2, 10);
    }

    #[test]
    fn unbounded_wait_retries_until_data() {
        let mut src = ScriptedSource::with_replies([Ok(vec![]), Ok(vec![]), Ok(vec![entry(7, b"x")])]);
        let mut cursor = StreamCursor::new(CursorConfig::playback());
        let got = cursor.next(&mut src).unwrap().unwrap();
        assert_eq!(got.token, StreamToken::id(7, 0));
        assert_eq!(src.requests.len(), 3);
    }

    #[test]
    fn heartbeat_slices_read_from_anchored_id() {
        let mut src = ScriptedSource::with_replies([Ok(vec![]), Ok(vec![]), Ok(vec![entry(6, b"x")])]);
        src.newest = Some(StreamToken::id(5, 0));
        let mut cursor = StreamCursor::new(CursorConfig::playback());
        let got = cursor.next(&mut src).unwrap().unwrap();
        assert_eq!(got.token, StreamToken::id(6, 0));
        assert_eq!(src.newest_calls, 1);
        assert!(src.requests.iter().all(|r| r.0 == StreamToken::id(5, 0)));
    }

    #[test]
    fn unbounded_wait_stops_on_shutdown() {
        let flag = Arc::new(AtomicBool::new(true));
        let mut src = ScriptedSource::with_replies([Ok(vec![])]);
        let mut cursor = StreamCursor::new(CursorConfig::playback()).with_shutdown(flag);
        assert!(cursor.next(&mut src).unwrap().is_none());
        assert_eq!(src.requests.len(), 1);
    }

    #[test]
    fn stale_entries_are_skipped_and_counted() {
        let stats = LoopStats::shared();
        let mut src = ScriptedSource::with_replies([
            Ok(vec![entry(3, b"a"), entry(4, b"b")]),
            Ok(vec![entry(4, b"dup"), entry(5, b"c")]),
        ]);
        let mut cursor = StreamCursor::new(CursorConfig::monitoring()).with_stats(stats.clone());
        let first = cursor.next_batch(&mut src).unwrap().unwrap();
        assert_eq!(first.len(), 2);
        let second = cursor.next_batch(&mut src).unwrap().unwrap();
        assert_eq!(second, vec![entry(5, b"c")]);
        assert_eq!(stats.snapshot().stale_skipped, 1);
    }

    #[test]
    fn reset_to_latest_forgets_position() {
        let mut src = ScriptedSource::with_replies([Ok(vec![entry(9, b"a")]), Ok(vec![])]);
        let mut cursor = StreamCursor::new(CursorConfig::monitoring());
        cursor.next(&mut src).unwrap();
        cursor.reset_to_latest();
        assert_eq!(cursor.last_token(), &StreamToken::Latest);
        src.newest = Some(StreamToken::id(12, 0));
        cursor.next(&mut src).unwrap();
        assert_eq!(src.requests[1].0, StreamToken::id(12, 0));
        assert_eq!(src.newest_calls, 2);
    }

    #[test]
    fn protocol_errors_propagate() {
        let mut src = ScriptedSource::with_replies([Err(BrokerError::Protocol("bad".to_string()))]);
        let mut cursor = StreamCursor::new(CursorConfig::playback());
        assert!(matches!(cursor.next(&mut src), Err(BrokerError::Protocol(_))));
    }
}
