//! Timestamp oracle for transaction ordering.
//!
//! Hands out start, for-update and commit timestamps from a single totally
//! ordered sequence. Each timestamp is at least the current wall clock (in
//! milliseconds, shifted into the physical bits) and strictly greater than
//! every timestamp issued before it, across all threads.

use pessimist_common::Timestamp;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, or zero if the clock is before it.
fn physical_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}

/// Monotonic timestamp allocator.
pub struct TimestampOracle {
    last: AtomicU64,
}

impl TimestampOracle {
    /// Create a new oracle.
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// Allocate the next timestamp.
    ///
    /// Never returns the same value twice and never returns a value smaller
    /// than one already returned.
    pub fn next(&self) -> Timestamp {
        let floor = Timestamp::compose(physical_now_ms(), 0).as_u64();
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let candidate = floor.max(last + 1);
            match self.last.compare_exchange_weak(
                last,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Timestamp::new(candidate),
                Err(actual) => last = actual,
            }
        }
    }

    /// The most recently issued timestamp (zero before the first call).
    pub fn current(&self) -> Timestamp {
        Timestamp::new(self.last.load(Ordering::Acquire))
    }

    /// Advance past a timestamp observed elsewhere, so the next allocation
    /// is greater than `observed`.
    pub fn update(&self, observed: Timestamp) {
        let previous = self.last.fetch_max(observed.as_u64(), Ordering::AcqRel);
        if previous < observed.as_u64() {
            tracing::trace!(%observed, "timestamp oracle advanced");
        }
    }
}

impl Default for TimestampOracle {
    fn default() -> Self {
        Self::new()
    }
}

/// Oracle shared between sessions.
pub type SharedOracle = Arc<TimestampOracle>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_monotonic_single_thread() {
        let oracle = TimestampOracle::new();

        let ts1 = oracle.next();
        let ts2 = oracle.next();
        let ts3 = oracle.next();

        assert!(ts1 < ts2);
        assert!(ts2 < ts3);
        assert_eq!(oracle.current(), ts3);
    }

    #[test]
    fn test_tracks_wall_clock() {
        let oracle = TimestampOracle::new();
        let before = physical_now_ms();
        let ts = oracle.next();

        assert!(ts.physical_ms() >= before);
    }

    #[test]
    fn test_unique_across_threads() {
        let oracle = Arc::new(TimestampOracle::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let oracle = oracle.clone();
                thread::spawn(move || {
                    let mut issued = Vec::with_capacity(1000);
                    for _ in 0..1000 {
                        issued.push(oracle.next());
                    }
                    issued
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            let issued = handle.join().unwrap();
            // Each thread observes a strictly increasing sequence
            assert!(issued.windows(2).all(|w| w[0] < w[1]));
            all.extend(issued);
        }
        assert_eq!(all.len(), 8000);
    }

    #[test]
    fn test_update_moves_past_observed() {
        let oracle = TimestampOracle::new();
        let far_future = Timestamp::compose(physical_now_ms() + 60_000, 7);

        oracle.update(far_future);
        assert!(oracle.next() > far_future);

        // Updating backwards has no effect
        let current = oracle.current();
        oracle.update(Timestamp::new(1));
        assert_eq!(oracle.current(), current);
    }
}
