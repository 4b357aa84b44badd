//! Single-slot handoff between the intake and output threads.
//!
//! At most one chunk waits between the stages. When the output is busy and a new
//! chunk arrives, the pending one is discarded so playback always resumes with the
//! freshest audio. Chunks that do get through keep their arrival order.
//!
//! Filler that has no freshness to lose (gated silence) goes through
//! [`HandoffSender::send_when_free`] instead, which waits for the slot and so paces
//! the producer to the consumer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};

/// Returned by [`HandoffSender::offer`] once the receiving side is gone.
#[derive(Debug, PartialEq, Eq)]
pub struct Closed;

pub struct HandoffSender<T> {
    tx: Sender<T>,
    /// Producer-side view of the slot, used to evict the pending item.
    evict: Receiver<T>,
    closed: Arc<AtomicBool>,
}

pub struct HandoffReceiver<T> {
    rx: Receiver<T>,
    closed: Arc<AtomicBool>,
}

/// Create a connected sender/receiver pair with a single pending slot.
pub fn handoff<T>() -> (HandoffSender<T>, HandoffReceiver<T>) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    let closed = Arc::new(AtomicBool::new(false));
    (
        HandoffSender {
            tx,
            evict: rx.clone(),
            closed: closed.clone(),
        },
        HandoffReceiver { rx, closed },
    )
}

impl<T> HandoffSender<T> {
    /// Place `item` in the slot, evicting a pending item if there is one.
    ///
    /// Returns the number of evicted items (0 or 1).
    pub fn offer(&self, item: T) -> Result<usize, Closed> {
        let mut item = item;
        let mut evicted = 0;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Closed);
            }
            match self.tx.try_send(item) {
                Ok(()) => return Ok(evicted),
                Err(TrySendError::Full(back)) => {
                    // The receiver may take the pending item first; then the retry fits.
                    if self.evict.try_recv().is_ok() {
                        evicted += 1;
                    }
                    item = back;
                }
                Err(TrySendError::Disconnected(_)) => return Err(Closed),
            }
        }
    }

    /// Place `item` once the slot is empty, never evicting.
    ///
    /// Waits in `poll` steps so a receiver that goes away is noticed.
    pub fn send_when_free(&self, item: T, poll: Duration) -> Result<(), Closed> {
        let mut item = item;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Closed);
            }
            match self.tx.send_timeout(item, poll) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(back)) => item = back,
                Err(SendTimeoutError::Disconnected(_)) => return Err(Closed),
            }
        }
    }
}

impl<T> HandoffReceiver<T> {
    /// Wait up to `timeout` for the next item.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }
}

impl<T> Drop for HandoffReceiver<T> {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}
