//! Per-connection sequence numbering for outbound frames.
//!
//! Each upstream connection owns one counter.  Receivers use the sequence
//! field only for diagnostics (gap detection in logs); ordering on the link
//! is guaranteed by TCP.

use std::sync::atomic::{AtomicU64, Ordering};

/// A lock-free, monotonically increasing counter for frame sequence numbers.
///
/// Starts at 0 and wraps at `u64::MAX` without panicking.
///
/// ```rust
/// use tablesync_core::protocol::SequenceCounter;
///
/// let counter = SequenceCounter::new();
/// assert_eq!(counter.next(), 0);
/// assert_eq!(counter.next(), 1);
/// ```
#[derive(Debug, Default)]
pub struct SequenceCounter {
    inner: AtomicU64,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next sequence number and advances the counter.
    pub fn next(&self) -> u64 {
        // Relaxed: the value orders frames, it does not publish memory.
        self.inner.fetch_add(1, Ordering::Relaxed)
    }

    /// The value the next call to [`next`](Self::next) will return.
    pub fn current(&self) -> u64 {
        self.inner.load(Ordering::Relaxed)
    }

    /// Starts numbering from 0 again (called on every new connection).
    pub fn reset(&self) {
        self.inner.store(0, Ordering::Relaxed);
    }
}
