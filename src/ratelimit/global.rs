//! Process-wide rate limit gate shared by every bucket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

/// The deadline before which no request may be sent on any route.
///
/// Stored as milliseconds past a fixed origin so it can live in a single
/// atomic. Zero means no global limit has been seen.
#[derive(Debug)]
pub struct GlobalLimit {
    origin: Instant,
    until_ms: AtomicU64,
}

impl GlobalLimit {
    /// Create a gate with no deadline.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            until_ms: AtomicU64::new(0),
        }
    }

    /// Push the deadline out to `deadline`. Never moves it earlier.
    pub fn extend_to(&self, deadline: Instant) {
        let ms = ceil_millis(deadline.saturating_duration_since(self.origin));
        self.until_ms.fetch_max(ms, Ordering::AcqRel);
    }

    /// Current deadline, if one was ever set and the clock can hold it.
    pub fn until(&self) -> Option<Instant> {
        match self.until_ms.load(Ordering::Acquire) {
            0 => None,
            ms => self.origin.checked_add(Duration::from_millis(ms)),
        }
    }

    /// How long a request issued at `now` must wait for the global limit.
    pub fn wait_time_at(&self, now: Instant) -> Duration {
        let until = Duration::from_millis(self.until_ms.load(Ordering::Acquire));
        until.saturating_sub(now.saturating_duration_since(self.origin))
    }
}

/// Whole milliseconds in `offset`, rounded up so a waiter never wakes before
/// the server's deadline. Saturates at `u64::MAX`.
fn ceil_millis(offset: Duration) -> u64 {
    let ms = u64::try_from(offset.as_millis()).unwrap_or(u64::MAX);
    if offset > Duration::from_millis(ms) {
        ms.saturating_add(1)
    } else {
        ms
    }
}

impl Default for GlobalLimit {
    fn default() -> Self {
        Self::new()
    }
}
