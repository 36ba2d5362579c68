//! Timestamp allocation
//!
//! A single monotone 64-bit clock orders every causally significant event
//! in the engine: transaction starts, commits, accumulator deltas and
//! page-dirty marks. Timestamps are tickets, not wall-clock times.

use std::sync::atomic::{AtomicI64, Ordering};

/// Reserved value marking an aborted transaction.
pub const ABORTED: i64 = i64::MIN;

/// Reserved value marking a transaction that has not committed yet.
pub const UNCOMMITTED: i64 = i64::MAX;

/// Monotone source of unique 64-bit timestamps.
#[derive(Debug)]
pub struct TimestampAllocator {
    counter: AtomicI64,
}

impl TimestampAllocator {
    pub fn new() -> Self {
        Self {
            counter: AtomicI64::new(0),
        }
    }

    /// Issue the next ticket. Strictly increasing and unique across
    /// concurrent callers.
    pub fn update_timestamp(&self) -> i64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Observe the most recently issued ticket without consuming one.
    pub fn current_timestamp(&self) -> i64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Raise the clock to at least `timestamp`. Recovery uses this so that
    /// tickets issued after a restart exceed every recovered commit.
    pub fn bump_to(&self, timestamp: i64) {
        let mut current = self.counter.load(Ordering::SeqCst);
        while current < timestamp {
            match self.counter.compare_exchange(
                current,
                timestamp,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

impl Default for TimestampAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_timestamps_strictly_increase() {
        let allocator = TimestampAllocator::new();
        let a = allocator.update_timestamp();
        let b = allocator.update_timestamp();
        assert!(b > a);
        assert_eq!(allocator.current_timestamp(), b);
    }

    #[test]
    fn test_bump_to_never_lowers_the_clock() {
        let allocator = TimestampAllocator::new();
        allocator.bump_to(100);
        assert_eq!(allocator.current_timestamp(), 100);
        allocator.bump_to(50);
        assert_eq!(allocator.current_timestamp(), 100);
        assert_eq!(allocator.update_timestamp(), 101);
    }

    #[test]
    fn test_concurrent_tickets_are_unique() {
        let allocator = Arc::new(TimestampAllocator::new());
        let mut handles = vec![];

        for _ in 0..8 {
            let allocator = allocator.clone();
            handles.push(std::thread::spawn(move || {
                (0..1000).map(|_| allocator.update_timestamp()).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for ts in handle.join().unwrap() {
                assert!(seen.insert(ts), "duplicate timestamp {}", ts);
            }
        }
        assert_eq!(seen.len(), 8000);
        assert_eq!(allocator.current_timestamp(), 8000);
    }
}
