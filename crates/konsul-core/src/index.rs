//! Global monotonic index allocator (spec §4.1).
//!
//! A single process-wide counter feeds every CAS version across every
//! store, so it is handed around as a cheaply-clonable handle rather than
//! hidden as a private counter inside one store.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone, Debug, Default)]
pub struct IndexAllocator(Arc<AtomicU64>);

impl IndexAllocator {
    /// Create a fresh allocator. `start` is the value the *first* `next()`
    /// call returns; on boot this is `max(persisted indices) + 1`.
    pub fn starting_at(start: u64) -> Self {
        Self(Arc::new(AtomicU64::new(start)))
    }

    /// Allocate the next index. Must be called from inside the mutating
    /// store's writer-locked section so (index, state) stay coherent.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    /// Current value without allocating (last allocated + 1, i.e. the value
    /// the next call to `next()` would return).
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Advance the counter to at least `value`, used during mirror replay
    /// to seed the allocator from persisted indices. Never moves backwards.
    pub fn observe(&self, value: u64) {
        self.0.fetch_max(value, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_given_value_and_increments() {
        let idx = IndexAllocator::starting_at(1);
        assert_eq!(idx.next(), 1);
        assert_eq!(idx.next(), 2);
        assert_eq!(idx.current(), 3);
    }

    #[test]
    fn observe_never_moves_backwards() {
        let idx = IndexAllocator::starting_at(1);
        idx.observe(10);
        assert_eq!(idx.current(), 10);
        idx.observe(3);
        assert_eq!(idx.current(), 10);
    }

    #[test]
    fn concurrent_next_never_repeats() {
        use std::collections::HashSet;
        use std::thread;

        let idx = IndexAllocator::starting_at(1);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let idx = idx.clone();
                thread::spawn(move || (0..200).map(|_| idx.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut all = HashSet::new();
        for h in handles {
            for v in h.join().unwrap() {
                assert!(all.insert(v), "index {v} allocated twice");
            }
        }
        assert_eq!(all.len(), 8 * 200);
    }
}
