//! Monotonic id allocation

use std::sync::atomic::{AtomicU64, Ordering};

/// Hands out ids strictly above everything it has seen.
///
/// Deleting an object never lowers the watermark, so ids are not reused by
/// the same store instance.
#[derive(Debug, Default)]
pub struct IdAllocator {
    watermark: AtomicU64,
}

impl IdAllocator {
    pub fn new(seed: u64) -> Self {
        Self {
            watermark: AtomicU64::new(seed),
        }
    }

    /// Record an id that is in use
    pub fn observe(&self, id: u64) {
        self.watermark.fetch_max(id, Ordering::SeqCst);
    }

    /// Allocate the next id above both the watermark and `highest_stored`.
    ///
    /// Returns `None` without moving the watermark when that id would
    /// exceed `limit`.
    pub fn next(&self, highest_stored: u64, limit: u64) -> Option<u64> {
        let candidate = |last: u64| {
            last.max(highest_stored)
                .checked_add(1)
                .filter(|id| *id <= limit)
        };
        self.watermark
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, candidate)
            .ok()
            .and_then(candidate)
    }

    pub fn watermark(&self) -> u64 {
        self.watermark.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: u64 = u64::MAX;

    #[test]
    fn test_allocation_is_strictly_increasing() {
        let ids = IdAllocator::new(0);
        assert_eq!(ids.next(0, MAX), Some(1));
        assert_eq!(ids.next(0, MAX), Some(2));
        // content on disk with a higher id pushes the watermark
        assert_eq!(ids.next(10, MAX), Some(11));
        // a lower highest-stored id (after deletions) never goes back
        assert_eq!(ids.next(3, MAX), Some(12));
    }

    #[test]
    fn test_observe() {
        let ids = IdAllocator::new(5);
        ids.observe(3);
        assert_eq!(ids.watermark(), 5);
        ids.observe(40);
        assert_eq!(ids.next(0, MAX), Some(41));
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let ids = std::sync::Arc::new(IdAllocator::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || (0..100).map(|_| ids.next(0, MAX).unwrap()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 800);
    }

    #[test]
    fn test_allocation_stops_at_limit() {
        let ids = IdAllocator::new(0);
        assert_eq!(ids.next(98, 99), Some(99));
        assert_eq!(ids.next(0, 99), None);
        assert_eq!(ids.watermark(), 99);
        // a wider limit continues where the watermark stopped
        assert_eq!(ids.next(0, 999), Some(100));
    }
}
